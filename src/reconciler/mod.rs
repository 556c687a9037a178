//! Desired-State Reconciler
//!
//! Persists declared services and, on every tick, drives the backend towards
//! them: missing services are checked out, built and created, orphans are
//! deleted and backend status flows back into the stored records.

mod diff;
mod env;

#[cfg(test)]
mod tests;

pub use diff::{Action, plan};
pub use env::{SECRET_AUTH_ID, SECRET_AUTH_SECRET, runtime_env};

use crate::auth::SCOPE_SERVICE;
use crate::build::BuildArtifact;
use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::platform::Platform;
use crate::runtime::{CreateOptions, RuntimeProcess};
use crate::service::{
    Ownership, ReadFilter, STORE_PREFIX, ServiceKey, ServiceRecord, ServiceSpec, ServiceStatus,
};
use crate::store::{build_blob_key, source_blob_key};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub created: usize,

    pub updated: usize,

    pub deleted: usize,

    pub synced: usize,

    pub failed: usize,
}

enum Outcome {
    Created,
    Updated,
    Deleted,
    Synced,
    Failed,
}

pub struct Reconciler {
    platform: Arc<Platform>,

    snapshot: RwLock<HashMap<ServiceKey, ServiceRecord>>,

    /// Serialises read-modify-write cycles on stored records.
    store_lock: tokio::sync::Mutex<()>,

    /// Held for the whole of a tick.
    tick_lock: tokio::sync::Mutex<()>,

    wake: Notify,

    shutdown: CancelToken,

    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Reconciler {
    pub fn new(platform: Arc<Platform>) -> Arc<Self> {
        Arc::new(Self {
            platform,
            snapshot: RwLock::new(HashMap::new()),
            store_lock: tokio::sync::Mutex::new(()),
            tick_lock: tokio::sync::Mutex::new(()),
            wake: Notify::new(),
            shutdown: CancelToken::new(),
            handle: Mutex::new(None),
        })
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    /// Spawn the control loop. Calling it twice is an error.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut handle = self.handle.lock().unwrap_or_else(|e| e.into_inner());
        if handle.is_some() {
            return Err(Error::other("reconciler already started"));
        }
        if self.shutdown.is_cancelled() {
            return Err(Error::Cancelled("reconciler was stopped".to_string()));
        }
        let this = Arc::clone(self);
        *handle = Some(tokio::spawn(this.run_loop()));
        info!(
            interval_secs = self.platform.config.reconciler.tick_interval_secs,
            backend = self.platform.backend.name(),
            "reconciler started"
        );
        Ok(())
    }

    /// Stop the loop and wait for the current tick to finish.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                error!(error = %err, "reconciler loop panicked");
            }
        }
    }

    async fn run_loop(self: Arc<Self>) {
        let watch = self.platform.config.reconciler.watch_store;
        let mut interval = tokio::time::interval(self.platform.config.tick_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => {}
                _ = self.wake.notified(), if watch => debug!("woken by store change"),
            }
            if let Err(err) = self.tick().await {
                warn!(error = %err, "tick skipped");
            }
        }
        info!("reconciler stopped");
    }

    fn notify_change(&self) {
        if self.platform.config.reconciler.watch_store {
            self.wake.notify_one();
        }
    }

    /// Run one reconciliation pass. Fails only when desired or actual state
    /// could not be listed, in which case nothing was changed.
    pub async fn tick(&self) -> Result<TickReport> {
        let _tick = self.tick_lock.lock().await;
        let start = Instant::now();

        let records = self.load_records().await?;
        let processes = self.platform.backend.list().await?;
        let actions = plan(&records, &processes);
        debug!(
            records = records.len(),
            processes = processes.len(),
            actions = actions.len(),
            "planned tick"
        );

        let workers = self.platform.config.reconciler.workers.max(1);
        let outcomes: Vec<Outcome> = futures::stream::iter(actions)
            .map(|action| self.apply(action))
            .buffer_unordered(workers)
            .collect()
            .await;

        let mut report = TickReport::default();
        for outcome in outcomes {
            match outcome {
                Outcome::Created => report.created += 1,
                Outcome::Updated => report.updated += 1,
                Outcome::Deleted => report.deleted += 1,
                Outcome::Synced => report.synced += 1,
                Outcome::Failed => report.failed += 1,
            }
        }

        match self.load_records().await {
            Ok(records) => {
                let fresh: HashMap<ServiceKey, ServiceRecord> =
                    records.into_iter().map(|r| (r.key(), r)).collect();
                *self.snapshot.write().unwrap_or_else(|e| e.into_inner()) = fresh;
            }
            Err(err) => warn!(error = %err, "keeping previous snapshot"),
        }

        if report != TickReport::default() {
            info!(
                created = report.created,
                updated = report.updated,
                deleted = report.deleted,
                synced = report.synced,
                failed = report.failed,
                duration_ms = start.elapsed().as_millis() as u64,
                "tick finished"
            );
        }
        Ok(report)
    }

    async fn apply(&self, action: Action) -> Outcome {
        match action {
            Action::Create { record, replace } => {
                let key = record.key();
                match self.start_service(record, replace, false).await {
                    Ok(()) => Outcome::Created,
                    Err(err) => self.record_failure(&key, err).await,
                }
            }
            Action::Update { record } => {
                let key = record.key();
                match self.start_service(record, false, true).await {
                    Ok(()) => Outcome::Updated,
                    Err(err) => self.record_failure(&key, err).await,
                }
            }
            Action::Delete { key } => match self.remove_service(&key).await {
                Ok(()) => Outcome::Deleted,
                Err(err) => {
                    warn!(service = %key, error = %err, "delete failed, retrying next tick");
                    Outcome::Failed
                }
            },
            Action::SyncStatus { key, status } => {
                let result = self
                    .modify_record(&key, |record| record.set_status(status.clone()))
                    .await;
                match result {
                    Ok(_) => Outcome::Synced,
                    Err(err) => {
                        warn!(service = %key, error = %err, "status sync failed");
                        Outcome::Failed
                    }
                }
            }
        }
    }

    async fn record_failure(&self, key: &ServiceKey, err: Error) -> Outcome {
        let retry = err.is_recoverable();
        warn!(service = %key, kind = err.kind(), retry, error = %err, "service failed to start");
        let status = ServiceStatus::from_error(&err);
        if let Err(store_err) = self
            .modify_record(key, |record| record.set_status(status.clone()))
            .await
        {
            error!(service = %key, error = %store_err, "could not persist failure");
        }
        Outcome::Failed
    }

    /// Check out, build and hand a service to the backend, bounded by the
    /// operation timeout.
    async fn start_service(&self, record: ServiceRecord, replace: bool, update: bool) -> Result<()> {
        let key = record.key();
        let limit = self.platform.config.operation_timeout();
        match tokio::time::timeout(limit, self.build_and_run(&record, replace, update)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout {
                operation: format!("starting {}", key),
                limit_ms: limit.as_millis() as u64,
            }),
        }
    }

    async fn build_and_run(&self, record: &ServiceRecord, replace: bool, update: bool) -> Result<()> {
        let key = record.key();
        let spec = &record.spec;
        let revision = record.metadata.revision;

        let artifact = if spec.source.is_empty() {
            None
        } else {
            if !self.set_status(&key, ServiceStatus::Fetching).await? {
                return Ok(());
            }
            let source = self.platform.resolve_source(&spec.source)?;
            let payload = self.platform.fetch_source(&source, &spec.secrets).await?;

            if !self.set_status(&key, ServiceStatus::Building).await? {
                return Ok(());
            }
            let artifact = self
                .platform
                .build(&source, &payload, spec.entrypoint.as_deref())
                .await?;
            Some(Arc::new(artifact))
        };

        if !self.set_status(&key, ServiceStatus::Starting).await? {
            return Ok(());
        }
        let options = self.create_options(spec, artifact.clone()).await?;

        let backend = &self.platform.backend;
        let process: RuntimeProcess = if update {
            backend.update(spec, options).await?
        } else {
            if replace {
                backend.delete(&key).await?;
            }
            backend.create(spec, options).await?
        };

        let build_info = artifact.as_deref().map(BuildArtifact::build_info);
        self.modify_record(&key, |stored| {
            stored.set_status(process.status.clone());
            stored.metadata.applied_revision = revision;
            if build_info.is_some() {
                stored.metadata.build_info = build_info.clone();
            }
        })
        .await?;
        info!(service = %key, process = %process.id, update, "service started");
        Ok(())
    }

    async fn create_options(
        &self,
        spec: &ServiceSpec,
        artifact: Option<Arc<BuildArtifact>>,
    ) -> Result<CreateOptions> {
        let mut secrets = spec.secrets.clone();
        let account = format!("{}-{}", spec.name, spec.version);
        if let Some(creds) = self
            .platform
            .issuer
            .generate(&account, &[SCOPE_SERVICE])
            .await?
        {
            secrets.insert(SECRET_AUTH_ID.to_string(), creds.id);
            secrets.insert(SECRET_AUTH_SECRET.to_string(), creds.secret);
        }

        let mut artifact_key = None;
        if let Some(artifact) = artifact.as_ref().filter(|_| !self.platform.backend.is_local()) {
            let key = build_blob_key(&spec.name, &spec.version);
            self.platform
                .blobs
                .write(&key, artifact.binary.clone())
                .await?;
            artifact_key = Some(key);
        }

        Ok(CreateOptions {
            env: runtime_env(spec, &self.platform.config.runtime.profile),
            secrets,
            artifact,
            artifact_key,
        })
    }

    async fn remove_service(&self, key: &ServiceKey) -> Result<()> {
        self.platform.backend.delete(key).await?;
        for blob in [
            source_blob_key(&key.name, &key.version),
            build_blob_key(&key.name, &key.version),
        ] {
            if let Err(err) = self.platform.blobs.delete(&blob).await {
                warn!(service = %key, blob = %blob, error = %err, "blob cleanup failed");
            }
        }
        info!(service = %key, "service removed");
        Ok(())
    }

    async fn load_records(&self) -> Result<Vec<ServiceRecord>> {
        let entries = self.platform.store.list(STORE_PREFIX).await?;
        let mut records = Vec::with_capacity(entries.len());
        for (key, bytes) in entries {
            match ServiceRecord::from_json(&bytes) {
                Ok(record) => records.push(record),
                Err(err) => warn!(key = %key, error = %err, "skipping unreadable record"),
            }
        }
        Ok(records)
    }

    async fn read_record(&self, key: &ServiceKey) -> Result<Option<ServiceRecord>> {
        match self.platform.store.read(&key.store_key()).await? {
            Some(bytes) => Ok(Some(ServiceRecord::from_json(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn write_record(&self, record: &ServiceRecord) -> Result<()> {
        self.platform
            .store
            .write(&record.key().store_key(), record.to_json()?)
            .await
    }

    /// Re-read, mutate and write back a record. Returns `false` when the
    /// record has been deleted in the meantime.
    async fn modify_record(
        &self,
        key: &ServiceKey,
        change: impl FnOnce(&mut ServiceRecord),
    ) -> Result<bool> {
        let _guard = self.store_lock.lock().await;
        let Some(mut record) = self.read_record(key).await? else {
            debug!(service = %key, "record gone, dropping write");
            return Ok(false);
        };
        change(&mut record);
        self.write_record(&record).await?;
        Ok(true)
    }

    async fn set_status(&self, key: &ServiceKey, status: ServiceStatus) -> Result<bool> {
        self.modify_record(key, |record| record.set_status(status))
            .await
    }

    pub async fn create(&self, spec: ServiceSpec) -> Result<ServiceRecord> {
        self.create_as(spec, Ownership::default()).await
    }

    pub async fn create_as(&self, spec: ServiceSpec, ownership: Ownership) -> Result<ServiceRecord> {
        let spec = self.validate(spec)?;
        let key = spec.key();
        let record = {
            let _guard = self.store_lock.lock().await;
            if self.read_record(&key).await?.is_some() {
                return Err(Error::AlreadyExists(key.to_string()));
            }
            let record = ServiceRecord::new(spec, ownership);
            self.write_record(&record).await?;
            record
        };
        info!(service = %key, source = %record.spec.source, "service created");
        self.notify_change();
        Ok(record)
    }

    pub async fn read(&self, filter: &ReadFilter) -> Result<Vec<ServiceRecord>> {
        let mut records = self.load_records().await?;
        records.retain(|r| filter.matches(&r.spec));
        records.sort_by_key(|r| r.key());
        Ok(records)
    }

    pub async fn update(&self, spec: ServiceSpec) -> Result<ServiceRecord> {
        let spec = self.validate(spec)?;
        let key = spec.key();
        let record = {
            let _guard = self.store_lock.lock().await;
            let mut record = self
                .read_record(&key)
                .await?
                .ok_or_else(|| Error::NotFound(key.to_string()))?;
            record.spec = spec;
            record.metadata.revision += 1;
            record.set_status(ServiceStatus::Started);
            self.write_record(&record).await?;
            record
        };
        info!(service = %key, revision = record.metadata.revision, "service updated");
        self.notify_change();
        Ok(record)
    }

    pub async fn delete(&self, key: &ServiceKey) -> Result<()> {
        {
            let _guard = self.store_lock.lock().await;
            if self.read_record(key).await?.is_none() {
                return Err(Error::NotFound(key.to_string()));
            }
            self.platform.store.delete(&key.store_key()).await?;
        }
        info!(service = %key, "service deleted");
        self.notify_change();
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<ServiceRecord>> {
        self.read(&ReadFilter::default()).await
    }

    /// Output of a declared service, as kept by the backend.
    pub async fn logs(&self, key: &ServiceKey, lines: Option<usize>) -> Result<Vec<String>> {
        if self.read_record(key).await?.is_none() {
            return Err(Error::NotFound(key.to_string()));
        }
        self.platform.backend.logs(key, lines).await
    }

    /// Store uploaded source and return the reference to put in a spec.
    pub async fn upload_source(&self, name: &str, version: &str, bytes: Vec<u8>) -> Result<String> {
        if name.trim().is_empty() {
            return Err(Error::InvalidSpec {
                reason: "service name must not be empty".to_string(),
            });
        }
        let version = if version.is_empty() {
            crate::service::DEFAULT_VERSION
        } else {
            version
        };
        let key = source_blob_key(name, version);
        let size = bytes.len();
        self.platform.blobs.write(&key, bytes).await?;
        info!(blob = %key, size, "source uploaded");
        Ok(key)
    }

    /// The reconciled set as of the last tick.
    pub(crate) fn snapshot(&self) -> Vec<ServiceRecord> {
        let snapshot = self.snapshot.read().unwrap_or_else(|e| e.into_inner());
        let mut records: Vec<ServiceRecord> = snapshot.values().cloned().collect();
        records.sort_by_key(|r| r.key());
        records
    }

    fn validate(&self, spec: ServiceSpec) -> Result<ServiceSpec> {
        let spec = spec.normalize()?;
        if !spec.source.is_empty() {
            self.platform.resolve_source(&spec.source)?;
        }
        Ok(spec)
    }
}
