//! Docker Backend
//!
//! Runs services as containers through the `docker` CLI. Containers are
//! labelled so `list` can recover them after a restart of the orchestrator.

use super::{Backend, CreateOptions, RuntimeProcess, tail_lines, write_executable};
use crate::error::{Error, Result};
use crate::service::{DEFAULT_NAMESPACE, ServiceKey, ServiceSpec, ServiceStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{debug, info};

const LABEL_SERVICE: &str = "micro.service";
const LABEL_VERSION: &str = "micro.version";
const LABEL_NAMESPACE: &str = "micro.namespace";
const MOUNT_POINT: &str = "/srv/service";

#[derive(Debug, Clone)]
pub struct DockerConfig {
    /// Image that source-built binaries are mounted into.
    pub base_image: String,

    pub container_prefix: String,

    /// Host directory holding binaries to mount.
    pub work_dir: PathBuf,

    pub memory: Option<String>,

    pub cpus: Option<f64>,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            base_image: "debian:stable-slim".to_string(),
            container_prefix: "micro-".to_string(),
            work_dir: std::env::temp_dir().join("micro-run").join("docker"),
            memory: None,
            cpus: None,
        }
    }
}

pub struct DockerBackend {
    config: DockerConfig,
}

impl DockerBackend {
    pub fn new(config: DockerConfig) -> Result<Self> {
        which::which("docker")
            .map_err(|_| Error::other("docker backend selected but `docker` is not on PATH"))?;
        Ok(Self { config })
    }

    fn container_name(&self, key: &ServiceKey) -> String {
        let raw = format!("{}{}-{}", self.config.container_prefix, key.name, key.version);
        raw.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                    c
                } else {
                    '-'
                }
            })
            .collect()
    }

    fn run_args(&self, spec: &ServiceSpec, options: &CreateOptions) -> Result<Vec<String>> {
        let key = spec.key();
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            self.container_name(&key),
            "--label".to_string(),
            format!("{}={}", LABEL_SERVICE, spec.name),
            "--label".to_string(),
            format!("{}={}", LABEL_VERSION, spec.version),
            "--label".to_string(),
            format!("{}={}", LABEL_NAMESPACE, spec.namespace),
        ];
        for (k, v) in options.env_pairs() {
            args.push("-e".to_string());
            args.push(format!("{}={}", k, v));
        }
        if let Some(ref memory) = self.config.memory {
            args.push("--memory".to_string());
            args.push(memory.clone());
        }
        if let Some(cpus) = self.config.cpus {
            args.push("--cpus".to_string());
            args.push(cpus.to_string());
        }

        match (&spec.image, &options.artifact) {
            (Some(image), _) => args.push(image.clone()),
            (None, Some(_)) => {
                let host_dir = self.config.work_dir.join(self.container_name(&key));
                args.push("-v".to_string());
                args.push(format!("{}:{}:ro", host_dir.display(), MOUNT_POINT));
                args.push("-w".to_string());
                args.push(MOUNT_POINT.to_string());
                args.push(self.config.base_image.clone());
                if spec.command.is_empty() {
                    args.push(format!("{}/{}", MOUNT_POINT, spec.name));
                }
            }
            (None, None) => {
                return Err(Error::backend(
                    &key.to_string(),
                    "docker backend needs an image or a built artifact",
                ));
            }
        }
        args.extend(spec.command.iter().cloned());
        args.extend(spec.args.iter().cloned());
        Ok(args)
    }

    fn logs_args(&self, key: &ServiceKey, lines: Option<usize>) -> Vec<String> {
        let mut args = vec!["logs".to_string()];
        if let Some(lines) = lines {
            args.push("--tail".to_string());
            args.push(lines.to_string());
        }
        args.push(self.container_name(key));
        args
    }

    async fn stage_artifact(&self, spec: &ServiceSpec, options: &CreateOptions) -> Result<()> {
        let Some(artifact) = options.artifact.as_ref().filter(|_| spec.image.is_none()) else {
            return Ok(());
        };
        let dir = self.config.work_dir.join(self.container_name(&spec.key()));
        write_executable(&dir, &spec.name, &artifact.binary)?;
        Ok(())
    }

    async fn docker(&self, service: &str, args: &[String]) -> Result<String> {
        debug!(service, ?args, "docker");
        let output = Command::new("docker")
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::backend(service, format!("Failed to run docker: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::backend(service, stderr.trim().to_string()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Parse one line of `docker ps --format` output produced by [`PS_FORMAT`].
fn parse_ps_line(line: &str) -> Option<RuntimeProcess> {
    let fields: Vec<&str> = line.split('\t').collect();
    let [id, name, version, namespace, image, state, created] = fields.as_slice() else {
        return None;
    };
    if name.is_empty() {
        return None;
    }

    let status = match *state {
        "running" => ServiceStatus::Running,
        "restarting" => ServiceStatus::Restarting,
        "created" => ServiceStatus::Starting,
        "removing" => ServiceStatus::Stopping,
        other => ServiceStatus::error(format!("container {}", other)),
    };

    Some(RuntimeProcess {
        id: id.to_string(),
        name: name.to_string(),
        version: version.to_string(),
        namespace: if namespace.is_empty() {
            DEFAULT_NAMESPACE.to_string()
        } else {
            namespace.to_string()
        },
        reference: image.to_string(),
        started_at: parse_created(created).unwrap_or_else(Utc::now),
        status,
    })
}

/// `2024-05-01 10:00:00 +0000 UTC`
fn parse_created(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed: Vec<&str> = raw.split_whitespace().take(3).collect();
    DateTime::parse_from_str(&trimmed.join(" "), "%Y-%m-%d %H:%M:%S %z")
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

const PS_FORMAT: &str = "{{.ID}}\t{{.Label \"micro.service\"}}\t{{.Label \"micro.version\"}}\t{{.Label \"micro.namespace\"}}\t{{.Image}}\t{{.State}}\t{{.CreatedAt}}";

#[async_trait]
impl Backend for DockerBackend {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn is_local(&self) -> bool {
        false
    }

    async fn create(&self, spec: &ServiceSpec, options: CreateOptions) -> Result<RuntimeProcess> {
        let key = spec.key().to_string();
        self.stage_artifact(spec, &options).await?;
        let args = self.run_args(spec, &options)?;
        let id = self.docker(&key, &args).await?;
        info!(service = %key, container = %id, "started container");

        Ok(RuntimeProcess {
            id,
            name: spec.name.clone(),
            version: spec.version.clone(),
            namespace: spec.namespace.clone(),
            reference: spec
                .image
                .clone()
                .unwrap_or_else(|| self.config.base_image.clone()),
            started_at: Utc::now(),
            status: ServiceStatus::Running,
        })
    }

    async fn update(&self, spec: &ServiceSpec, options: CreateOptions) -> Result<RuntimeProcess> {
        self.delete(&spec.key()).await?;
        self.create(spec, options).await
    }

    async fn delete(&self, key: &ServiceKey) -> Result<()> {
        let service = key.to_string();
        let args = vec!["rm".to_string(), "-f".to_string(), self.container_name(key)];
        match self.docker(&service, &args).await {
            Ok(_) => {}
            Err(Error::BackendError { reason, .. }) if reason.contains("No such container") => {}
            Err(err) => return Err(err),
        }
        let staged = self.config.work_dir.join(self.container_name(key));
        if staged.exists() {
            tokio::fs::remove_dir_all(&staged).await?;
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<RuntimeProcess>> {
        let args: Vec<String> = [
            "ps",
            "-a",
            "--filter",
            &format!("label={}", LABEL_SERVICE),
            "--format",
            PS_FORMAT,
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let stdout = self.docker("list", &args).await?;
        Ok(stdout.lines().filter_map(parse_ps_line).collect())
    }

    async fn logs(&self, key: &ServiceKey, lines: Option<usize>) -> Result<Vec<String>> {
        let service = key.to_string();
        match self.docker(&service, &self.logs_args(key, lines)).await {
            Ok(stdout) => Ok(tail_lines(&stdout, None)),
            Err(Error::BackendError { reason, .. }) if reason.contains("No such container") => {
                Err(Error::NotFound(service))
            }
            Err(err) => Err(err),
        }
    }
}
