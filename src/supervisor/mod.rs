//! Process Supervisor
//!
//! Ad-hoc runs keyed by their source string: fetch, build, exec, wait and
//! optionally restart, each run cancellable through its own token.

mod local;

pub use local::LocalProcessRuntime;

use crate::build::BuildArtifact;
use crate::cancel::CancelToken;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::platform::SourcePayload;
use crate::service::ServiceStatus;
use crate::source::SourceDescriptor;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Source ready to build.
#[derive(Debug, Clone)]
pub struct Fetched {
    pub source: SourceDescriptor,

    pub payload: SourcePayload,
}

#[async_trait]
pub trait RunningProcess: Send {
    /// Resolves when the process exits; non-zero exits are errors.
    async fn wait(&mut self) -> Result<()>;

    async fn kill(&mut self) -> Result<()>;
}

/// The steps a supervised run goes through.
#[async_trait]
pub trait ProcessRuntime: Send + Sync {
    /// `update` forces a fresh fetch instead of reusing an earlier one.
    async fn fetch(&self, source: &str, update: bool) -> Result<Fetched>;

    async fn build(&self, fetched: &Fetched) -> Result<BuildArtifact>;

    async fn exec(&self, artifact: &BuildArtifact) -> Result<Box<dyn RunningProcess>>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    pub restart: bool,

    pub update: bool,
}

/// A snapshot of one supervised run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunInfo {
    pub id: Uuid,

    pub source: String,

    pub status: ServiceStatus,

    pub restarts: u32,

    pub updated_at: DateTime<Utc>,
}

struct Entry {
    id: Uuid,

    status: watch::Sender<ServiceStatus>,

    cancel: CancelToken,

    restarts: u32,

    updated_at: DateTime<Utc>,

    touched: Instant,
}

impl Entry {
    fn info(&self, source: &str) -> RunInfo {
        RunInfo {
            id: self.id,
            source: source.to_string(),
            status: self.status.borrow().clone(),
            restarts: self.restarts,
            updated_at: self.updated_at,
        }
    }

    fn is_terminal(&self) -> bool {
        self.status.borrow().is_terminal()
    }
}

pub struct Supervisor {
    runtime: Arc<dyn ProcessRuntime>,

    entries: RwLock<HashMap<String, Entry>>,

    retention: Duration,

    restart_delay: Duration,
}

impl Supervisor {
    pub fn new(runtime: Arc<dyn ProcessRuntime>, config: &Config) -> Arc<Self> {
        Arc::new(Self {
            runtime,
            entries: RwLock::new(HashMap::new()),
            retention: config.retention(),
            restart_delay: config.restart_delay(),
        })
    }

    /// Start supervising `source`. Returns `None` without doing anything
    /// when a run for the same source is still active.
    pub fn run(self: &Arc<Self>, source: &str, options: RunOptions) -> Result<Option<Uuid>> {
        let key = source.trim();
        if key.is_empty() {
            return Err(Error::invalid_source(source, "empty source"));
        }

        let id = Uuid::new_v4();
        let cancel = CancelToken::new();
        {
            let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
            if entries.get(key).is_some_and(|entry| !entry.is_terminal()) {
                debug!(source = key, "run already active");
                return Ok(None);
            }
            let (status, _) = watch::channel(ServiceStatus::Pending);
            entries.insert(
                key.to_string(),
                Entry {
                    id,
                    status,
                    cancel: cancel.clone(),
                    restarts: 0,
                    updated_at: Utc::now(),
                    touched: Instant::now(),
                },
            );
        }

        info!(source = key, run = %id, restart = options.restart, update = options.update, "run started");
        let this = Arc::clone(self);
        let key = key.to_string();
        tokio::spawn(async move { this.work(key, id, options, cancel).await });
        Ok(Some(id))
    }

    pub fn status(&self, source: &str) -> Result<RunInfo> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .get(source)
            .map(|entry| entry.info(source))
            .ok_or_else(|| Error::NotFound(source.to_string()))
    }

    pub fn list(&self) -> Vec<RunInfo> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let mut runs: Vec<RunInfo> = entries
            .iter()
            .map(|(source, entry)| entry.info(source))
            .collect();
        runs.sort_by(|a, b| a.source.cmp(&b.source));
        runs
    }

    /// Ask a run to stop. Stopping a finished run is a no-op.
    pub fn stop(&self, source: &str) -> Result<()> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let entry = entries
            .get_mut(source)
            .ok_or_else(|| Error::NotFound(source.to_string()))?;
        if entry.is_terminal() {
            return Ok(());
        }
        if entry.cancel.cancel() {
            entry.status.send_replace(ServiceStatus::Stopping);
            entry.updated_at = Utc::now();
            entry.touched = Instant::now();
            info!(source, run = %entry.id, "stopping run");
        }
        Ok(())
    }

    /// Wait until the run for `source` reaches a terminal status.
    pub async fn wait(&self, source: &str) -> Result<RunInfo> {
        let mut rx = {
            let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
            entries
                .get(source)
                .map(|entry| entry.status.subscribe())
                .ok_or_else(|| Error::NotFound(source.to_string()))?
        };
        rx.wait_for(ServiceStatus::is_terminal)
            .await
            .map_err(|_| Error::NotFound(source.to_string()))?;
        self.status(source)
    }

    /// Drop finished runs older than the retention window.
    pub fn sweep(&self) -> usize {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_terminal() || entry.touched.elapsed() < self.retention);
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, "swept finished runs");
        }
        removed
    }

    pub fn start_sweeper(self: &Arc<Self>, every: Duration, shutdown: CancelToken) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        this.sweep();
                    }
                }
            }
        })
    }

    /// Update an entry, ignoring writes from a run that has been replaced.
    fn update(&self, source: &str, id: Uuid, change: impl FnOnce(&mut Entry)) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = entries.get_mut(source).filter(|entry| entry.id == id) {
            change(entry);
            entry.updated_at = Utc::now();
            entry.touched = Instant::now();
        }
    }

    fn set_status(&self, source: &str, id: Uuid, status: ServiceStatus) {
        debug!(source, run = %id, status = %status, "run status");
        self.update(source, id, |entry| {
            entry.status.send_replace(status);
        });
    }

    async fn work(self: Arc<Self>, source: String, id: Uuid, options: RunOptions, cancel: CancelToken) {
        let status = match self.supervise(&source, id, options, &cancel).await {
            Ok(()) => {
                info!(source = %source, run = %id, "run finished");
                ServiceStatus::Stopped
            }
            Err(Error::Cancelled(_)) => {
                info!(source = %source, run = %id, "run stopped");
                ServiceStatus::Stopped
            }
            Err(err) => {
                warn!(source = %source, run = %id, kind = err.kind(), error = %err, "run failed");
                ServiceStatus::error(err.to_string())
            }
        };
        self.set_status(&source, id, status);
    }

    async fn supervise(
        &self,
        source: &str,
        id: Uuid,
        options: RunOptions,
        cancel: &CancelToken,
    ) -> Result<()> {
        self.set_status(source, id, ServiceStatus::Fetching);
        let fetched = until_cancelled(cancel, self.runtime.fetch(source, options.update)).await?;

        self.set_status(source, id, ServiceStatus::Building);
        let artifact = until_cancelled(cancel, self.runtime.build(&fetched)).await?;

        loop {
            self.set_status(source, id, ServiceStatus::Starting);
            let mut process = until_cancelled(cancel, self.runtime.exec(&artifact)).await?;
            self.set_status(source, id, ServiceStatus::Running);

            let exit = tokio::select! {
                exit = process.wait() => exit,
                _ = cancel.cancelled() => {
                    if let Err(err) = process.kill().await {
                        warn!(source, run = %id, error = %err, "kill failed");
                    }
                    return Err(Error::Cancelled(source.to_string()));
                }
            };

            if !options.restart {
                return exit;
            }
            if let Err(err) = &exit {
                warn!(source, run = %id, error = %err, "process exited, restarting");
            }
            self.update(source, id, |entry| {
                entry.restarts += 1;
                entry.status.send_replace(ServiceStatus::Restarting);
            });
            until_cancelled(cancel, async {
                tokio::time::sleep(self.restart_delay).await;
                Ok(())
            })
            .await?;
        }
    }
}

/// Race `fut` against the token; the losing future is dropped.
async fn until_cancelled<T>(
    cancel: &CancelToken,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        result = fut => result,
        _ = cancel.cancelled() => Err(Error::Cancelled("run stopped".to_string())),
    }
}
