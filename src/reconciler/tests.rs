use super::*;
use crate::auth::{CredentialIssuer, LocalIssuer, NoopIssuer};
use crate::build::{BuildOptions, Builder};
use crate::config::Config;
use crate::runtime::Backend;
use crate::source::{Checkout, CheckoutOptions, HttpFetcher};
use crate::store::{BlobStore, MemoryBlobStore, MemoryStore, Store};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[derive(Default)]
struct FakeBackend {
    processes: Mutex<BTreeMap<ServiceKey, (RuntimeProcess, CreateOptions)>>,

    fail_list: AtomicBool,

    creates: AtomicUsize,

    updates: AtomicUsize,

    deletes: AtomicUsize,
}

impl FakeBackend {
    fn process(spec: &ServiceSpec) -> RuntimeProcess {
        RuntimeProcess {
            id: format!("proc-{}", spec.key()),
            name: spec.name.clone(),
            version: spec.version.clone(),
            namespace: spec.namespace.clone(),
            reference: format!("/srv/{}", spec.name),
            started_at: Utc::now(),
            status: ServiceStatus::Running,
        }
    }

    fn options(&self, key: &ServiceKey) -> Option<CreateOptions> {
        let processes = self.processes.lock().unwrap();
        processes.get(key).map(|(_, options)| options.clone())
    }

    fn set_status(&self, key: &ServiceKey, status: ServiceStatus) {
        let mut processes = self.processes.lock().unwrap();
        if let Some((process, _)) = processes.get_mut(key) {
            process.status = status;
        }
    }

    fn insert_stray(&self, name: &str) {
        let spec = ServiceSpec::new(name, "github.com/stray/repo")
            .normalize()
            .unwrap();
        let mut processes = self.processes.lock().unwrap();
        processes.insert(spec.key(), (Self::process(&spec), CreateOptions::default()));
    }

    fn keys(&self) -> Vec<ServiceKey> {
        self.processes.lock().unwrap().keys().cloned().collect()
    }
}

#[async_trait]
impl Backend for FakeBackend {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn is_local(&self) -> bool {
        false
    }

    async fn create(&self, spec: &ServiceSpec, options: CreateOptions) -> Result<RuntimeProcess> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        let mut processes = self.processes.lock().unwrap();
        if processes.contains_key(&spec.key()) {
            return Err(Error::AlreadyExists(spec.key().to_string()));
        }
        let process = Self::process(spec);
        processes.insert(spec.key(), (process.clone(), options));
        Ok(process)
    }

    async fn update(&self, spec: &ServiceSpec, options: CreateOptions) -> Result<RuntimeProcess> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        let process = Self::process(spec);
        let mut processes = self.processes.lock().unwrap();
        processes.insert(spec.key(), (process.clone(), options));
        Ok(process)
    }

    async fn delete(&self, key: &ServiceKey) -> Result<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.processes.lock().unwrap().remove(key);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<RuntimeProcess>> {
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(Error::backend("*", "connection refused"));
        }
        let processes = self.processes.lock().unwrap();
        Ok(processes.values().map(|(p, _)| p.clone()).collect())
    }

    async fn logs(&self, key: &ServiceKey, lines: Option<usize>) -> Result<Vec<String>> {
        if !self.processes.lock().unwrap().contains_key(key) {
            return Err(Error::NotFound(key.to_string()));
        }
        let all = vec![format!("{} listening", key), format!("{} ready", key)];
        let skip = lines.map_or(0, |n| all.len().saturating_sub(n));
        Ok(all[skip..].to_vec())
    }
}

#[derive(Default)]
struct FakeBuilder {
    failing: Mutex<HashSet<String>>,

    builds: AtomicUsize,
}

impl FakeBuilder {
    fn fail(&self, key: &str) {
        self.failing.lock().unwrap().insert(key.to_string());
    }
}

#[async_trait]
impl Builder for FakeBuilder {
    async fn build(&self, source: &[u8], options: &BuildOptions) -> Result<BuildArtifact> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        let source_key = options.source.to_string();
        if self.failing.lock().unwrap().contains(&source_key) {
            return Err(Error::BuildFailed {
                output: "main.go:3: undefined: fmt.Prinln".to_string(),
            });
        }
        let mut binary = b"binary:".to_vec();
        binary.extend_from_slice(source);
        Ok(BuildArtifact::new(binary, options.source.clone(), "go"))
    }
}

struct Harness {
    reconciler: Arc<Reconciler>,

    backend: Arc<FakeBackend>,

    builder: Arc<FakeBuilder>,

    blobs: Arc<MemoryBlobStore>,

    store: Arc<MemoryStore>,
}

fn harness_with(issuer: Arc<dyn CredentialIssuer>, config: Config) -> Harness {
    let backend = Arc::new(FakeBackend::default());
    let builder = Arc::new(FakeBuilder::default());
    let blobs = Arc::new(MemoryBlobStore::new());
    let store = Arc::new(MemoryStore::new());
    let checkout = Arc::new(Checkout::new(
        Arc::new(HttpFetcher::new(5).unwrap()),
        CheckoutOptions::default(),
    ));

    let platform = Platform {
        config,
        store: store.clone(),
        blobs: blobs.clone(),
        backend: backend.clone(),
        issuer,
        checkout,
        builder: builder.clone(),
    };

    Harness {
        reconciler: Reconciler::new(Arc::new(platform)),
        backend,
        builder,
        blobs,
        store,
    }
}

fn harness() -> Harness {
    harness_with(Arc::new(NoopIssuer), Config::default())
}

impl Harness {
    /// Upload a source blob and declare a service running it.
    async fn declare(&self, name: &str) -> ServiceRecord {
        let source = self
            .reconciler
            .upload_source(name, "latest", format!("package main // {}", name).into_bytes())
            .await
            .unwrap();
        self.reconciler
            .create(ServiceSpec::new(name, &source))
            .await
            .unwrap()
    }

    async fn record(&self, name: &str) -> ServiceRecord {
        let records = self
            .reconciler
            .read(&ReadFilter::service(name))
            .await
            .unwrap();
        assert_eq!(records.len(), 1, "expected one record for {}", name);
        records.into_iter().next().unwrap()
    }
}

#[tokio::test]
async fn test_declared_services_converge() {
    let h = harness();
    h.declare("foo").await;
    h.declare("bar").await;

    let report = h.reconciler.tick().await.unwrap();
    assert_eq!(report.created, 2);
    assert_eq!(report.failed, 0);

    assert_eq!(
        h.backend.keys(),
        vec![ServiceKey::new("bar", "latest"), ServiceKey::new("foo", "latest")]
    );
    let foo = h.record("foo").await;
    assert_eq!(foo.status(), &ServiceStatus::Running);
    let info = foo.metadata.build_info.expect("build info recorded");
    assert_eq!(info.source, "source://foo:latest");
    assert_eq!(info.toolchain, "go");

    let second = h.reconciler.tick().await.unwrap();
    assert_eq!(second, TickReport::default());
    assert_eq!(h.backend.creates.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_build_failure_is_isolated() {
    let h = harness();
    h.builder.fail("source://broken:latest");
    h.declare("broken").await;
    h.declare("healthy").await;

    let report = h.reconciler.tick().await.unwrap();
    assert_eq!(report.created, 1);
    assert_eq!(report.failed, 1);

    let broken = h.record("broken").await;
    let message = broken.error().expect("error recorded");
    assert!(message.contains("undefined: fmt.Prinln"), "{}", message);
    assert_eq!(h.record("healthy").await.status(), &ServiceStatus::Running);
    assert_eq!(h.backend.keys(), vec![ServiceKey::new("healthy", "latest")]);

    // errored records are retried
    h.reconciler.tick().await.unwrap();
    assert_eq!(h.builder.builds.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_deleted_service_is_removed_next_tick() {
    let h = harness();
    h.declare("foo").await;
    h.declare("bar").await;
    h.reconciler.tick().await.unwrap();

    h.reconciler
        .delete(&ServiceKey::new("foo", "latest"))
        .await
        .unwrap();
    assert_eq!(h.backend.keys().len(), 2);

    let report = h.reconciler.tick().await.unwrap();
    assert_eq!(report.deleted, 1);
    assert_eq!(h.backend.keys(), vec![ServiceKey::new("bar", "latest")]);
    assert!(!h.blobs.contains("source://foo:latest"));
    assert!(!h.blobs.contains("build://foo:latest"));
    assert!(h.blobs.contains("build://bar:latest"));
}

#[tokio::test]
async fn test_unknown_backend_process_is_deleted() {
    let h = harness();
    h.backend.insert_stray("stray");
    let report = h.reconciler.tick().await.unwrap();
    assert_eq!(report.deleted, 1);
    assert!(h.backend.keys().is_empty());
}

#[tokio::test]
async fn test_update_pushes_new_revision() {
    let h = harness();
    let record = h.declare("foo").await;
    h.reconciler.tick().await.unwrap();

    let updated = h
        .reconciler
        .update(record.spec.clone().with_env("MODE=fast"))
        .await
        .unwrap();
    assert_eq!(updated.metadata.revision, 1);
    assert!(updated.needs_update());

    let report = h.reconciler.tick().await.unwrap();
    assert_eq!(report.updated, 1);
    assert_eq!(h.backend.updates.load(Ordering::SeqCst), 1);

    let stored = h.record("foo").await;
    assert_eq!(stored.metadata.applied_revision, 1);
    assert!(!stored.needs_update());
    let options = h.backend.options(&stored.key()).unwrap();
    assert!(options.env.contains(&"MODE=fast".to_string()));
}

#[tokio::test]
async fn test_dead_process_is_replaced() {
    let h = harness();
    h.declare("foo").await;
    h.reconciler.tick().await.unwrap();

    let key = ServiceKey::new("foo", "latest");
    h.backend.set_status(&key, ServiceStatus::error("exit status 2"));

    let report = h.reconciler.tick().await.unwrap();
    assert_eq!(report.created, 1);
    assert_eq!(h.backend.deletes.load(Ordering::SeqCst), 1);
    assert_eq!(h.record("foo").await.status(), &ServiceStatus::Running);
}

#[tokio::test]
async fn test_backend_status_is_synced() {
    let h = harness();
    h.declare("foo").await;
    h.reconciler.tick().await.unwrap();

    let key = ServiceKey::new("foo", "latest");
    h.backend.set_status(&key, ServiceStatus::Restarting);
    let report = h.reconciler.tick().await.unwrap();
    assert_eq!(report.synced, 1);
    assert_eq!(h.record("foo").await.status(), &ServiceStatus::Restarting);
}

#[tokio::test]
async fn test_list_failure_skips_tick() {
    let h = harness();
    h.declare("foo").await;
    h.backend.fail_list.store(true, Ordering::SeqCst);

    let err = h.reconciler.tick().await.unwrap_err();
    assert_eq!(err.kind(), "backend_error");
    assert_eq!(h.builder.builds.load(Ordering::SeqCst), 0);
    assert_eq!(h.record("foo").await.status(), &ServiceStatus::Started);

    h.backend.fail_list.store(false, Ordering::SeqCst);
    assert_eq!(h.reconciler.tick().await.unwrap().created, 1);
}

#[tokio::test]
async fn test_credentials_and_env_are_injected() {
    let issuer = Arc::new(LocalIssuer::new());
    let mut config = Config::default();
    config.runtime.profile = vec!["REGION=eu".to_string()];
    let h = harness_with(issuer.clone(), config);
    h.declare("foo").await;
    h.reconciler.tick().await.unwrap();

    let options = h
        .backend
        .options(&ServiceKey::new("foo", "latest"))
        .unwrap();
    assert_eq!(
        options.secrets.get(SECRET_AUTH_ID).map(String::as_str),
        Some("foo-latest")
    );
    let secret = options.secrets.get(SECRET_AUTH_SECRET).unwrap();
    assert!(issuer.verify("foo-latest", secret));
    assert_eq!(issuer.scopes("foo-latest"), Some(vec!["service".to_string()]));

    assert!(options.env.contains(&"SERVICE_NAME=foo".to_string()));
    assert!(options.env.contains(&"REGION=eu".to_string()));
    assert_eq!(options.env.last().unwrap(), "SERVICE_NAMESPACE=default");
    assert_eq!(options.artifact_key.as_deref(), Some("build://foo:latest"));
    assert!(options.artifact.is_some());
}

#[tokio::test]
async fn test_create_rejects_duplicates() {
    let h = harness();
    h.declare("foo").await;
    let err = h
        .reconciler
        .create(ServiceSpec::new("foo", "source://foo:latest"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyExists(_)));
}

#[tokio::test]
async fn test_create_rejects_bad_source() {
    let h = harness();
    let err = h
        .reconciler
        .create(ServiceSpec::new("foo", "github.com/a@b@c"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "invalid_source");
    assert!(h.store.list(STORE_PREFIX).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_update_and_delete_unknown_service() {
    let h = harness();
    let err = h
        .reconciler
        .update(ServiceSpec::new("ghost", "source://ghost:latest"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));

    let err = h
        .reconciler
        .delete(&ServiceKey::new("ghost", "latest"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn test_read_filters_and_snapshot() {
    let h = harness();
    h.declare("foo").await;
    h.declare("bar").await;

    assert_eq!(h.reconciler.list().await.unwrap().len(), 2);
    assert_eq!(
        h.reconciler
            .read(&ReadFilter::service("bar"))
            .await
            .unwrap()
            .len(),
        1
    );
    assert!(h.reconciler.snapshot().is_empty());

    h.reconciler.tick().await.unwrap();
    let names: Vec<String> = h
        .reconciler
        .snapshot()
        .into_iter()
        .map(|r| r.spec.name)
        .collect();
    assert_eq!(names, vec!["bar", "foo"]);
}

#[tokio::test]
async fn test_stopped_loop_does_not_restart() {
    let h = harness();
    h.reconciler.start().unwrap();
    assert!(h.reconciler.start().is_err());
    h.reconciler.stop().await;
    assert!(h.reconciler.start().is_err());
}

#[tokio::test]
async fn test_watch_store_wakes_loop() {
    let mut config = Config::default();
    config.reconciler.tick_interval_secs = 3600;
    config.reconciler.watch_store = true;
    let h = harness_with(Arc::new(NoopIssuer), config);
    h.reconciler.start().unwrap();
    // let the immediate first tick pass
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    h.declare("foo").await;
    let key = ServiceKey::new("foo", "latest");
    let converged = async {
        while !h.backend.keys().contains(&key) {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(std::time::Duration::from_secs(5), converged)
        .await
        .expect("woken tick created the service");
    h.reconciler.stop().await;
}

#[tokio::test]
async fn test_blob_store_holds_upload() {
    let h = harness();
    let key = h
        .reconciler
        .upload_source("foo", "", b"package main".to_vec())
        .await
        .unwrap();
    assert_eq!(key, "source://foo:latest");
    assert_eq!(h.blobs.read(&key).await.unwrap(), b"package main");
}

#[tokio::test]
async fn test_missing_blob_waits_for_update() {
    let h = harness();
    h.reconciler
        .create(ServiceSpec::new("ghost", "source://ghost:latest"))
        .await
        .unwrap();

    assert_eq!(h.reconciler.tick().await.unwrap().failed, 1);
    let ghost = h.record("ghost").await;
    assert!(ghost.status().is_held(), "{}", ghost.status());
    assert_eq!(ghost.error(), Some("Blob not found: source://ghost:latest"));

    assert_eq!(h.reconciler.tick().await.unwrap(), TickReport::default());
    assert_eq!(h.reconciler.tick().await.unwrap(), TickReport::default());
    assert_eq!(h.builder.builds.load(Ordering::SeqCst), 0);

    h.reconciler
        .upload_source("ghost", "latest", b"package main".to_vec())
        .await
        .unwrap();
    h.reconciler.update(ghost.spec.clone()).await.unwrap();
    let report = h.reconciler.tick().await.unwrap();
    assert_eq!(report.failed, 0, "{:?}", report);
    assert_eq!(h.record("ghost").await.status(), &ServiceStatus::Running);
    assert_eq!(h.backend.keys(), vec![ServiceKey::new("ghost", "latest")]);
}

#[tokio::test]
async fn test_logs_only_for_declared_services() {
    let h = harness();
    h.declare("foo").await;
    h.backend.insert_stray("stray");
    h.reconciler.tick().await.unwrap();

    let key = ServiceKey::new("foo", "latest");
    assert_eq!(
        h.reconciler.logs(&key, Some(1)).await.unwrap(),
        vec!["foo:latest ready"]
    );
    assert_eq!(h.reconciler.logs(&key, None).await.unwrap().len(), 2);

    let err = h
        .reconciler
        .logs(&ServiceKey::new("stray", "latest"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}
