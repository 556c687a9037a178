//! Supervised runs as child processes of this host.

use super::{Fetched, ProcessRuntime, RunningProcess};
use crate::build::BuildArtifact;
use crate::error::{Error, Result};
use crate::platform::Platform;
use crate::runtime::{spawn_retrying, write_executable};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::process::{Child, Command};
use tracing::{debug, info};

pub struct LocalProcessRuntime {
    platform: Arc<Platform>,

    /// Passed to every run as arguments.
    args: Vec<String>,

    fetched: Mutex<HashMap<String, Fetched>>,
}

impl LocalProcessRuntime {
    pub fn new(platform: Arc<Platform>) -> Self {
        Self {
            platform,
            args: Vec::new(),
            fetched: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    fn cached(&self, source: &str) -> Option<Fetched> {
        let fetched = self.fetched.lock().unwrap_or_else(|e| e.into_inner());
        fetched.get(source).cloned()
    }
}

struct ChildProcess {
    child: Child,

    dir: PathBuf,
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

#[async_trait]
impl RunningProcess for ChildProcess {
    async fn wait(&mut self) -> Result<()> {
        let status = self.child.wait().await?;
        if status.success() {
            Ok(())
        } else {
            Err(Error::other(format!("process exited: {}", status)))
        }
    }

    async fn kill(&mut self) -> Result<()> {
        self.child.kill().await?;
        Ok(())
    }
}

#[async_trait]
impl ProcessRuntime for LocalProcessRuntime {
    async fn fetch(&self, source: &str, update: bool) -> Result<Fetched> {
        if !update {
            if let Some(fetched) = self.cached(source) {
                debug!(source, "reusing fetched source");
                return Ok(fetched);
            }
        }

        let descriptor = self.platform.resolve_source(source)?;
        let payload = self
            .platform
            .fetch_source(&descriptor, &BTreeMap::new())
            .await?;
        let fetched = Fetched {
            source: descriptor,
            payload,
        };
        self.fetched
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(source.to_string(), fetched.clone());
        Ok(fetched)
    }

    async fn build(&self, fetched: &Fetched) -> Result<BuildArtifact> {
        self.platform
            .build(&fetched.source, &fetched.payload, None)
            .await
    }

    async fn exec(&self, artifact: &BuildArtifact) -> Result<Box<dyn RunningProcess>> {
        let name = artifact.source.runtime_name();
        let dir = self
            .platform
            .config
            .work_dir()
            .join(format!("run-{}", uuid::Uuid::new_v4()));
        let binary = write_executable(&dir, &name, &artifact.binary)?;

        let mut cmd = Command::new(&binary);
        cmd.args(&self.args)
            .envs(
                self.platform
                    .config
                    .runtime
                    .profile
                    .iter()
                    .filter_map(|entry| entry.split_once('=')),
            )
            .current_dir(&dir)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let child = match spawn_retrying(&mut cmd).await {
            Ok(child) => child,
            Err(err) => {
                let _ = std::fs::remove_dir_all(&dir);
                return Err(Error::backend(&name, format!("spawn failed: {}", err)));
            }
        };
        info!(
            source = %artifact.source,
            pid = child.id().unwrap_or_default(),
            "started supervised process"
        );
        Ok(Box::new(ChildProcess { child, dir }))
    }
}
