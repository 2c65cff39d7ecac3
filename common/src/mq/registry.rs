// Jobber registry: lookup, batch control and reread/update reconciliation

use crate::config::JobberLogConfig;
use crate::errors::MqError;
use crate::forward::Forwarder;
use crate::mq::broker::ChannelSource;
use crate::mq::definition::{DefinitionLoader, JobberDefinition};
use crate::mq::jobber::{Jobber, JobberState, JobberStatus};
use futures::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{info, instrument, warn};

/// Names reported by the last reread
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileDiff {
    pub changes: Vec<String>,
    pub removes: Vec<String>,
}

impl ReconcileDiff {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && self.removes.is_empty()
    }
}

/// Scratch state between reread and update; only the latest diff is kept
#[derive(Default)]
struct PendingDiff {
    changed: BTreeMap<String, JobberDefinition>,
    removed: Vec<String>,
}

/// Authoritative set of jobbers keyed by name
pub struct JobberRegistry {
    jobbers: RwLock<HashMap<String, Arc<Jobber>>>,
    // Also serializes reread against update
    pending: tokio::sync::Mutex<PendingDiff>,
    loader: DefinitionLoader,
    channels: Arc<dyn ChannelSource>,
    forwarder: Arc<dyn Forwarder>,
    log_config: JobberLogConfig,
}

impl JobberRegistry {
    pub fn new(
        loader: DefinitionLoader,
        channels: Arc<dyn ChannelSource>,
        forwarder: Arc<dyn Forwarder>,
        log_config: JobberLogConfig,
    ) -> Self {
        Self {
            jobbers: RwLock::new(HashMap::new()),
            pending: tokio::sync::Mutex::new(PendingDiff::default()),
            loader,
            channels,
            forwarder,
            log_config,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<Jobber>>> {
        self.jobbers.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<Jobber>>> {
        self.jobbers.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Create a stopped jobber for every definition on disk not yet registered
    ///
    /// Returns how many jobbers were added. Known names are left to
    /// reread/update.
    #[instrument(skip(self), fields(include = %self.loader.pattern()))]
    pub fn load(&self) -> Result<usize, MqError> {
        let definitions = self.loader.load()?;
        let mut added = 0;
        for definition in definitions.into_values() {
            match self.insert(definition) {
                Ok(_) => added += 1,
                Err(e) => info!(reason = %e, "Skipping registered jobber"),
            }
        }
        info!(count = added, "Jobber definitions loaded");
        Ok(added)
    }

    /// Register a stopped jobber; refuses a name that is already registered
    pub fn insert(&self, definition: JobberDefinition) -> Result<Arc<Jobber>, MqError> {
        let mut jobbers = self.write();
        if jobbers.contains_key(&definition.name) {
            return Err(MqError::AlreadyExists(definition.name));
        }

        let jobber = Arc::new(Jobber::new(
            definition,
            Arc::clone(&self.channels),
            Arc::clone(&self.forwarder),
            self.log_config.clone(),
        ));
        jobbers.insert(jobber.name(), Arc::clone(&jobber));
        Ok(jobber)
    }

    pub fn get(&self, name: &str) -> Result<Arc<Jobber>, MqError> {
        self.read()
            .get(name)
            .cloned()
            .ok_or_else(|| MqError::NotFound(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Status of every jobber, sorted by name
    pub fn statuses(&self) -> Vec<JobberStatus> {
        let mut statuses: Vec<JobberStatus> = self.snapshot().iter().map(|j| j.status()).collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    fn snapshot(&self) -> Vec<Arc<Jobber>> {
        self.read().values().cloned().collect()
    }

    pub async fn start(&self, name: &str) -> Result<(), MqError> {
        self.get(name)?.start().await
    }

    pub async fn stop(&self, name: &str) -> Result<(), MqError> {
        self.get(name)?.stop().await;
        Ok(())
    }

    pub async fn restart(&self, name: &str) -> Result<(), MqError> {
        self.get(name)?.restart().await
    }

    /// Take the jobber out of the registry and wait for it to stop
    #[instrument(skip(self))]
    pub async fn remove(&self, name: &str) -> Result<(), MqError> {
        let jobber = self
            .write()
            .remove(name)
            .ok_or_else(|| MqError::NotFound(name.to_string()))?;
        jobber.stop().await;
        info!(jobber = %name, "Jobber removed");
        Ok(())
    }

    /// Start every jobber that is not already running
    pub async fn start_all(&self) -> Result<(), MqError> {
        self.start_where(|state| state != JobberState::Running).await
    }

    /// Start jobbers whose current state matches `predicate`; best-effort
    pub async fn start_where(
        &self,
        predicate: impl Fn(JobberState) -> bool,
    ) -> Result<(), MqError> {
        let targets: Vec<Arc<Jobber>> = self
            .snapshot()
            .into_iter()
            .filter(|j| predicate(j.state()))
            .collect();

        let results = join_all(targets.iter().map(|jobber| async move {
            jobber.start().await.map_err(|e| format!("{}: {}", jobber.name(), e))
        }))
        .await;
        collect_failures(results)
    }

    /// Stop every jobber, waiting for each to drain
    pub async fn stop_all(&self) {
        let targets = self.snapshot();
        join_all(targets.iter().map(|jobber| jobber.stop())).await;
    }

    pub async fn restart_all(&self) -> Result<(), MqError> {
        let targets = self.snapshot();
        let results = join_all(targets.iter().map(|jobber| async move {
            jobber.restart().await.map_err(|e| format!("{}: {}", jobber.name(), e))
        }))
        .await;
        collect_failures(results)
    }

    /// Compare definitions on disk with the live set and remember the diff
    ///
    /// Never touches live jobbers. A definition counts as changed when its
    /// name is unknown or its file is strictly newer than the loaded copy.
    #[instrument(skip(self))]
    pub async fn reread(&self) -> Result<ReconcileDiff, MqError> {
        let mut pending = self.pending.lock().await;
        let definitions = self.loader.load()?;

        let (changed, removed) = {
            let jobbers = self.read();
            let changed: BTreeMap<String, JobberDefinition> = definitions
                .iter()
                .filter(|(name, definition)| match jobbers.get(name.as_str()) {
                    None => true,
                    Some(jobber) => definition.is_newer_than(&jobber.definition()),
                })
                .map(|(name, definition)| (name.clone(), definition.clone()))
                .collect();

            let mut removed: Vec<String> = jobbers
                .keys()
                .filter(|name| !definitions.contains_key(name.as_str()))
                .cloned()
                .collect();
            removed.sort();

            (changed, removed)
        };

        let diff = ReconcileDiff {
            changes: changed.keys().cloned().collect(),
            removes: removed.clone(),
        };
        *pending = PendingDiff { changed, removed };

        info!(changes = ?diff.changes, removes = ?diff.removes, "Reread jobber definitions");
        Ok(diff)
    }

    /// Apply the diff computed by the last reread
    ///
    /// Removed jobbers are stopped and dropped. New jobbers are created and
    /// started. Known jobbers get their definition replaced in place and keep
    /// running as they are.
    #[instrument(skip(self))]
    pub async fn update(&self) -> Result<(), MqError> {
        let mut pending = self.pending.lock().await;
        let PendingDiff { changed, removed } = std::mem::take(&mut *pending);
        let mut failures = Vec::new();

        for name in removed {
            if let Err(e) = self.remove(&name).await {
                failures.push(format!("{}: {}", name, e));
            }
        }

        for (name, definition) in changed {
            let known = self.read().get(&name).cloned();
            match known {
                Some(jobber) => {
                    warn!(jobber = %name, state = %jobber.state(), "Replacing definition of a known jobber in place");
                    jobber.replace_definition(definition);
                }
                None => {
                    let started = match self.insert(definition) {
                        Ok(jobber) => jobber.start().await,
                        Err(e) => Err(e),
                    };
                    if let Err(e) = started {
                        failures.push(format!("{}: {}", name, e));
                    }
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(MqError::Partial(failures))
        }
    }
}

fn collect_failures(results: Vec<Result<(), String>>) -> Result<(), MqError> {
    let mut failures: Vec<String> = results.into_iter().filter_map(Result::err).collect();
    if failures.is_empty() {
        Ok(())
    } else {
        failures.sort();
        Err(MqError::Partial(failures))
    }
}

impl std::fmt::Debug for JobberRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobberRegistry")
            .field("include", &self.loader.pattern())
            .field("jobbers", &self.names())
            .finish()
    }
}
