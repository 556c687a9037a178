//! Local Backend
//!
//! Runs each service as a child process of the orchestrator. Output of every
//! service is appended to `<work_dir>/<name>-<version>.log`.

use super::{Backend, CreateOptions, RuntimeProcess, tail_lines};
use crate::error::{Error, Result};
use crate::service::{ServiceKey, ServiceSpec, ServiceStatus};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use tokio::process::{Child, Command};
use tracing::{info, warn};

struct LocalProcess {
    child: Child,

    info: RuntimeProcess,

    dir: PathBuf,
}

pub struct LocalBackend {
    work_dir: PathBuf,

    processes: Mutex<HashMap<ServiceKey, LocalProcess>>,
}

impl LocalBackend {
    pub fn new(work_dir: impl Into<PathBuf>) -> Result<Self> {
        let work_dir = work_dir.into();
        std::fs::create_dir_all(&work_dir)?;
        Ok(Self {
            work_dir,
            processes: Mutex::new(HashMap::new()),
        })
    }

    fn service_dir(&self, key: &ServiceKey) -> PathBuf {
        self.work_dir.join(format!("{}-{}", key.name, key.version))
    }

    fn log_path(&self, key: &ServiceKey) -> PathBuf {
        self.work_dir.join(format!("{}-{}.log", key.name, key.version))
    }

    async fn spawn(&self, spec: &ServiceSpec, options: &CreateOptions) -> Result<LocalProcess> {
        let key = spec.key();
        let artifact = options.artifact.as_ref().ok_or_else(|| {
            Error::backend(&key.to_string(), "local backend needs a built artifact")
        })?;

        let dir = self.service_dir(&key);
        let binary = write_executable(&dir, &spec.name, &artifact.binary)?;

        let mut cmd = match spec.command.split_first() {
            Some((program, rest)) => {
                let mut cmd = Command::new(program);
                cmd.args(rest);
                cmd
            }
            None => Command::new(&binary),
        };
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(&key))?;
        cmd.args(&spec.args)
            .envs(options.env_pairs())
            .current_dir(&dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log))
            .kill_on_drop(true);

        let child = spawn_retrying(&mut cmd)
            .await
            .map_err(|e| Error::backend(&key.to_string(), format!("spawn failed: {}", e)))?;

        let info = RuntimeProcess {
            id: child.id().map(|pid| pid.to_string()).unwrap_or_default(),
            name: spec.name.clone(),
            version: spec.version.clone(),
            namespace: spec.namespace.clone(),
            reference: binary.to_string_lossy().into_owned(),
            started_at: Utc::now(),
            status: ServiceStatus::Running,
        };
        info!(service = %key, pid = %info.id, "started local process");
        Ok(LocalProcess { child, info, dir })
    }

    fn take(&self, key: &ServiceKey) -> Option<LocalProcess> {
        let mut processes = self.processes.lock().unwrap_or_else(|e| e.into_inner());
        processes.remove(key)
    }

    async fn stop(key: &ServiceKey, mut process: LocalProcess) {
        if let Err(err) = process.child.kill().await {
            warn!(service = %key, error = %err, "kill failed");
        }
        if let Err(err) = tokio::fs::remove_dir_all(&process.dir).await {
            warn!(service = %key, error = %err, "failed to clean service dir");
        }
    }
}

/// Write `bytes` to `dir/name` and mark it executable.
pub(crate) fn write_executable(dir: &Path, name: &str, bytes: &[u8]) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let binary = dir.join(name);
    std::fs::write(&binary, bytes)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755))?;
    }
    Ok(binary)
}

/// A freshly written binary can briefly report ETXTBSY while another thread
/// forks with the write handle inherited.
pub(crate) async fn spawn_retrying(cmd: &mut Command) -> std::io::Result<Child> {
    const ETXTBSY: i32 = 26;
    let mut attempts = 0;
    loop {
        match cmd.spawn() {
            Err(e) if e.raw_os_error() == Some(ETXTBSY) && attempts < 5 => {
                attempts += 1;
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
            other => return other,
        }
    }
}

fn exit_status(status: std::process::ExitStatus) -> ServiceStatus {
    if status.success() {
        ServiceStatus::Stopped
    } else {
        ServiceStatus::error(format!("process exited: {}", status))
    }
}

#[async_trait]
impl Backend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    fn is_local(&self) -> bool {
        true
    }

    async fn create(&self, spec: &ServiceSpec, options: CreateOptions) -> Result<RuntimeProcess> {
        let key = spec.key();
        let stale = {
            let mut processes = self.processes.lock().unwrap_or_else(|e| e.into_inner());
            let alive = match processes.get_mut(&key) {
                Some(existing) => Some(existing.child.try_wait()?.is_none()),
                None => None,
            };
            match alive {
                Some(true) => return Err(Error::AlreadyExists(key.to_string())),
                Some(false) => processes.remove(&key),
                None => None,
            }
        };
        if let Some(process) = stale {
            Self::stop(&key, process).await;
        }

        let process = self.spawn(spec, &options).await?;
        let info = process.info.clone();
        let mut processes = self.processes.lock().unwrap_or_else(|e| e.into_inner());
        processes.insert(key, process);
        Ok(info)
    }

    async fn update(&self, spec: &ServiceSpec, options: CreateOptions) -> Result<RuntimeProcess> {
        let key = spec.key();
        if let Some(process) = self.take(&key) {
            Self::stop(&key, process).await;
        }
        self.create(spec, options).await
    }

    async fn delete(&self, key: &ServiceKey) -> Result<()> {
        if let Some(process) = self.take(key) {
            Self::stop(key, process).await;
            info!(service = %key, "stopped local process");
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<RuntimeProcess>> {
        let mut processes = self.processes.lock().unwrap_or_else(|e| e.into_inner());
        let mut listed = Vec::with_capacity(processes.len());
        for process in processes.values_mut() {
            if let Some(status) = process.child.try_wait()? {
                process.info.status = exit_status(status);
            }
            listed.push(process.info.clone());
        }
        listed.sort_by(|a, b| a.key().cmp(&b.key()));
        Ok(listed)
    }

    async fn logs(&self, key: &ServiceKey, lines: Option<usize>) -> Result<Vec<String>> {
        match tokio::fs::read_to_string(self.log_path(key)).await {
            Ok(content) => Ok(tail_lines(&content, lines)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}
