// Jobber definitions loaded from one YAML file per jobber

use crate::errors::DefinitionError;
use globset::{GlobBuilder, GlobMatcher};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, error};
use walkdir::WalkDir;

/// Exchange a jobber's queue is bound to
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeDefinition {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default = "default_exchange_kind")]
    pub kind: String,
}

fn default_exchange_kind() -> String {
    "direct".to_string()
}

/// Where a definition was read from; used for change detection on reread
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefinitionSource {
    pub path: PathBuf,
    pub modified: SystemTime,
}

/// One consumer definition, replaced wholesale on reconfiguration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobberDefinition {
    pub name: String,
    pub queue: String,
    #[serde(default)]
    pub exchange: ExchangeDefinition,
    #[serde(rename = "bindkey", default)]
    pub binding_key: String,
    #[serde(rename = "consumer", default)]
    pub consumer_tag: String,
    #[serde(rename = "workernum")]
    pub worker_num: usize,
    #[serde(rename = "url")]
    pub target_url: String,
    #[serde(rename = "logpath", default)]
    pub log_path: Option<PathBuf>,
    #[serde(skip)]
    pub source: Option<DefinitionSource>,
}

impl JobberDefinition {
    /// Parse a definition from YAML text
    pub fn from_yaml(path: &Path, text: &str) -> Result<Self, DefinitionError> {
        let definition: JobberDefinition =
            serde_yaml::from_str(text).map_err(|e| DefinitionError::Parse {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        definition.validate(path)?;
        Ok(definition)
    }

    /// Read and parse a definition file, recording its modification time
    pub fn from_file(path: &Path) -> Result<Self, DefinitionError> {
        let io_err = |source| DefinitionError::Io {
            path: path.to_path_buf(),
            source,
        };

        let text = std::fs::read_to_string(path).map_err(io_err)?;
        let modified = std::fs::metadata(path)
            .and_then(|m| m.modified())
            .map_err(io_err)?;

        let mut definition = Self::from_yaml(path, &text)?;
        definition.source = Some(DefinitionSource {
            path: path.to_path_buf(),
            modified,
        });
        Ok(definition)
    }

    fn validate(&self, path: &Path) -> Result<(), DefinitionError> {
        let invalid = |reason: &str| DefinitionError::Invalid {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        };

        if self.name.trim().is_empty() {
            return Err(invalid("name cannot be empty"));
        }
        if self.queue.trim().is_empty() {
            return Err(invalid("queue cannot be empty"));
        }
        if self.target_url.trim().is_empty() {
            return Err(invalid("url cannot be empty"));
        }
        if self.worker_num == 0 {
            return Err(invalid("workernum must be greater than 0"));
        }
        if self.worker_num > u16::MAX as usize {
            return Err(invalid("workernum exceeds the broker prefetch limit"));
        }
        Ok(())
    }

    /// Last-modified time of the originating file, if any
    pub fn modified(&self) -> Option<SystemTime> {
        self.source.as_ref().map(|s| s.modified)
    }

    /// True when `self` was read from a file strictly newer than `current`'s
    pub fn is_newer_than(&self, current: &JobberDefinition) -> bool {
        match (self.modified(), current.modified()) {
            (Some(new), Some(old)) => new > old,
            (Some(_), None) => true,
            _ => false,
        }
    }
}

/// Discovers definition files matching the include glob
#[derive(Debug, Clone)]
pub struct DefinitionLoader {
    pattern: String,
}

impl DefinitionLoader {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
        }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Read every matching file, keyed by jobber name
    ///
    /// Files that fail to parse are logged and skipped. When two files declare
    /// the same name the one sorting last wins.
    pub fn load(&self) -> Result<BTreeMap<String, JobberDefinition>, DefinitionError> {
        let mut definitions = BTreeMap::new();

        for path in self.matching_files()? {
            match JobberDefinition::from_file(&path) {
                Ok(definition) => {
                    debug!(path = %path.display(), jobber = %definition.name, "Loaded jobber definition");
                    definitions.insert(definition.name.clone(), definition);
                }
                Err(e) => {
                    error!(path = %path.display(), error = %e, "Parse jobber config failed");
                }
            }
        }

        Ok(definitions)
    }

    /// Files matching the pattern, sorted by path
    pub fn matching_files(&self) -> Result<Vec<PathBuf>, DefinitionError> {
        if self.pattern.trim().is_empty() {
            return Err(DefinitionError::IncludeUnset);
        }

        let matcher = self.matcher()?;
        let base = glob_base(Path::new(&self.pattern));

        if !base.is_dir() {
            return Err(DefinitionError::Io {
                path: base.clone(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "include directory does not exist",
                ),
            });
        }

        let relative_to_cwd = base == Path::new(".");
        let mut files = Vec::new();
        for entry in WalkDir::new(&base).follow_links(true) {
            let entry = entry.map_err(|e| DefinitionError::Io {
                path: e.path().map(Path::to_path_buf).unwrap_or_else(|| base.clone()),
                source: e
                    .into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("directory walk failed")),
            })?;

            let candidate = if relative_to_cwd {
                entry.path().strip_prefix(".").unwrap_or(entry.path())
            } else {
                entry.path()
            };

            if entry.file_type().is_file() && matcher.is_match(candidate) {
                files.push(entry.into_path());
            }
        }

        files.sort();
        Ok(files)
    }

    fn matcher(&self) -> Result<GlobMatcher, DefinitionError> {
        GlobBuilder::new(&self.pattern)
            .literal_separator(true)
            .build()
            .map(|glob| glob.compile_matcher())
            .map_err(|e| DefinitionError::InvalidPattern {
                pattern: self.pattern.clone(),
                reason: e.to_string(),
            })
    }
}

/// Longest leading run of path components free of glob metacharacters
fn glob_base(pattern: &Path) -> PathBuf {
    let mut base = PathBuf::new();
    for component in pattern.components() {
        if let Component::Normal(part) = component {
            if part.to_string_lossy().contains(&['*', '?', '[', '{'][..]) {
                break;
            }
        }
        base.push(component);
    }

    if base == pattern {
        // No metacharacters: the pattern names a single file
        base.pop();
    }

    if base.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        base
    }
}
