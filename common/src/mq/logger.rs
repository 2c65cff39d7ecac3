// Per-jobber log sink with size-based rotation

use crate::config::JobberLogConfig;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{dispatcher, warn, Dispatch};

/// Append-only file that rotates once it grows past `max_bytes`
///
/// On rotation `app.log` becomes `app.log.1`, `app.log.1` becomes
/// `app.log.2` and so on; anything past `max_backups` is discarded.
#[derive(Debug)]
pub struct RotatingFile {
    path: PathBuf,
    max_bytes: u64,
    max_backups: usize,
    file: File,
    written: u64,
}

impl RotatingFile {
    pub fn open(path: impl Into<PathBuf>, max_bytes: u64, max_backups: usize) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = Self::open_append(&path)?;
        let written = file.metadata()?.len();

        Ok(Self {
            path,
            max_bytes,
            max_backups,
            file,
            written,
        })
    }

    fn open_append(path: &Path) -> io::Result<File> {
        OpenOptions::new().create(true).append(true).open(path)
    }

    fn backup_path(&self, index: usize) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(format!(".{}", index));
        PathBuf::from(name)
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;

        if self.max_backups == 0 {
            self.file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&self.path)?;
            self.written = 0;
            return Ok(());
        }

        let oldest = self.backup_path(self.max_backups);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }
        for index in (1..self.max_backups).rev() {
            let from = self.backup_path(index);
            if from.exists() {
                fs::rename(&from, self.backup_path(index + 1))?;
            }
        }
        fs::rename(&self.path, self.backup_path(1))?;

        self.file = Self::open_append(&self.path)?;
        self.written = 0;
        Ok(())
    }
}

impl Write for RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written > 0 && self.written + buf.len() as u64 > self.max_bytes {
            self.rotate()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// Structured log sink scoped to one jobber
///
/// Events emitted inside [`JobberLogger::scope`] go to the jobber's own file
/// as JSON lines. Without a file the process-wide subscriber is used.
#[derive(Clone, Default)]
pub struct JobberLogger {
    dispatch: Option<Dispatch>,
    path: Option<PathBuf>,
}

impl JobberLogger {
    /// Log through the process-wide subscriber
    pub fn process() -> Self {
        Self::default()
    }

    /// Open a logger for `path`; falls back to the process subscriber when
    /// no path is given or the file cannot be opened
    pub fn open(jobber: &str, path: Option<&Path>, config: &JobberLogConfig) -> Self {
        let Some(path) = path else {
            return Self::process();
        };

        match RotatingFile::open(path, config.max_size_bytes(), config.max_backups) {
            Ok(writer) => {
                let subscriber = tracing_subscriber::fmt()
                    .json()
                    .with_writer(Mutex::new(writer))
                    .with_target(false)
                    .with_current_span(false)
                    .with_max_level(tracing::Level::DEBUG)
                    .finish();

                Self {
                    dispatch: Some(Dispatch::new(subscriber)),
                    path: Some(path.to_path_buf()),
                }
            }
            Err(e) => {
                warn!(
                    jobber = %jobber,
                    path = %path.display(),
                    error = %e,
                    "Failed to open jobber log file, using process log"
                );
                Self::process()
            }
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run `f` with this jobber's sink as the default subscriber
    pub fn scope<T>(&self, f: impl FnOnce() -> T) -> T {
        match &self.dispatch {
            Some(dispatch) => dispatcher::with_default(dispatch, f),
            None => f(),
        }
    }
}

impl std::fmt::Debug for JobberLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobberLogger")
            .field("path", &self.path)
            .finish()
    }
}
