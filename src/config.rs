use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::build::Toolchain;
use crate::error::{Error, Result};

pub const CONFIG_FILE: &str = "micro-run.toml";

/// Orchestrator configuration loaded from `micro-run.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub reconciler: ReconcilerConfig,
    pub supervisor: SupervisorConfig,
    pub source: SourceConfig,
    pub build: BuildSection,
    pub runtime: RuntimeSection,
    pub store: StoreSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReconcilerConfig {
    pub tick_interval_secs: u64,
    /// Bound on checkout + build + create for one service.
    pub operation_timeout_secs: u64,
    pub workers: usize,
    /// Wake the loop as soon as an RPC changes desired state.
    pub watch_store: bool,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 10,
            operation_timeout_secs: 300,
            workers: 4,
            watch_store: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SupervisorConfig {
    /// How long finished runs stay queryable.
    pub retention_secs: u64,
    pub sweep_interval_secs: u64,
    /// Pause before a crashed run is restarted.
    pub restart_delay_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            retention_secs: 900,
            sweep_interval_secs: 60,
            restart_delay_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SourceConfig {
    pub cache_dir: Option<PathBuf>,
    /// Use a local `git` binary instead of hosted archives when available.
    pub prefer_git: bool,
    pub http_timeout_secs: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            prefer_git: false,
            http_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuildSection {
    /// `go` or `rust`; detected from the source when unset.
    pub toolchain: Option<String>,
    pub tmp_dir: Option<PathBuf>,

    /// Compiler binary used instead of `go` or `cargo` from `PATH`.
    pub compiler: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Local,
    Docker,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeSection {
    pub backend: BackendKind,
    pub work_dir: Option<PathBuf>,
    pub base_image: String,
    pub container_prefix: String,
    /// `KEY=VALUE` entries applied to every service after its own env.
    pub profile: Vec<String>,
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            backend: BackendKind::Local,
            work_dir: None,
            base_image: "debian:stable-slim".to_string(),
            container_prefix: "micro-".to_string(),
            profile: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Memory,
    File,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreSection {
    pub kind: StoreKind,
    pub dir: Option<PathBuf>,
}

impl Config {
    /// Search the current directory and its ancestors for `micro-run.toml`.
    pub fn find_config_path() -> Option<PathBuf> {
        let cwd = std::env::current_dir().ok()?;
        cwd.ancestors()
            .map(|dir| dir.join(CONFIG_FILE))
            .find(|candidate| candidate.is_file())
    }

    /// Explicit path, else a discovered file, else defaults.
    pub fn discover(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::load(path),
            None => match Self::find_config_path() {
                Some(path) => Self::load(&path),
                None => Ok(Self::default()),
            },
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::InvalidConfig {
            reason: format!("failed to read {}: {e}", path.display()),
        })?;
        Self::from_toml_str(&content).map_err(|e| match e {
            Error::InvalidConfig { reason } => Error::InvalidConfig {
                reason: format!("{}: {reason}", path.display()),
            },
            other => other,
        })
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).map_err(|e| Error::InvalidConfig {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| -> Result<()> {
            Err(Error::InvalidConfig {
                reason: reason.to_string(),
            })
        };
        if self.reconciler.tick_interval_secs == 0 {
            return invalid("reconciler.tick_interval_secs must be positive");
        }
        if self.reconciler.operation_timeout_secs == 0 {
            return invalid("reconciler.operation_timeout_secs must be positive");
        }
        if self.reconciler.workers == 0 {
            return invalid("reconciler.workers must be at least 1");
        }
        if self.supervisor.sweep_interval_secs == 0 {
            return invalid("supervisor.sweep_interval_secs must be positive");
        }
        if let Some(entry) = self.runtime.profile.iter().find(|e| !e.contains('=')) {
            return Err(Error::InvalidConfig {
                reason: format!("runtime.profile entry '{entry}' is not KEY=VALUE"),
            });
        }
        self.toolchain()?;
        Ok(())
    }

    pub fn toolchain(&self) -> Result<Option<Toolchain>> {
        self.build
            .toolchain
            .as_deref()
            .map(Toolchain::from_str)
            .transpose()
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.reconciler.tick_interval_secs)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.reconciler.operation_timeout_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.supervisor.retention_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.supervisor.sweep_interval_secs)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.supervisor.restart_delay_ms)
    }

    /// Root for state that is not configured explicitly.
    pub fn data_dir(&self) -> PathBuf {
        std::env::temp_dir().join("micro-run")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.source
            .cache_dir
            .clone()
            .unwrap_or_else(|| self.data_dir().join("git"))
    }

    pub fn work_dir(&self) -> PathBuf {
        self.runtime
            .work_dir
            .clone()
            .unwrap_or_else(|| self.data_dir().join("services"))
    }

    pub fn store_dir(&self) -> PathBuf {
        self.store
            .dir
            .clone()
            .unwrap_or_else(|| self.data_dir().join("store"))
    }
}
