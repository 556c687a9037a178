//! Runtime Backends
//!
//! Where built services actually execute.

mod docker;
mod local;

pub use docker::{DockerBackend, DockerConfig};
pub use local::LocalBackend;
pub(crate) use local::{spawn_retrying, write_executable};

use crate::build::BuildArtifact;
use crate::error::Result;
use crate::service::{ReadFilter, ServiceKey, ServiceSpec, ServiceStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Live handle for a service as the backend reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeProcess {
    pub id: String,

    pub name: String,

    pub version: String,

    pub namespace: String,

    /// Binary path or image the process runs.
    pub reference: String,

    pub started_at: DateTime<Utc>,

    pub status: ServiceStatus,
}

impl RuntimeProcess {
    pub fn key(&self) -> ServiceKey {
        ServiceKey::new(&self.name, &self.version)
    }

    pub fn matches(&self, filter: &ReadFilter) -> bool {
        filter.name.as_deref().is_none_or(|n| n == self.name)
            && filter.version.as_deref().is_none_or(|v| v == self.version)
            && filter
                .namespace
                .as_deref()
                .is_none_or(|ns| ns == self.namespace)
    }
}

#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// `KEY=VALUE` entries.
    pub env: Vec<String>,

    pub secrets: BTreeMap<String, String>,

    pub artifact: Option<Arc<BuildArtifact>>,

    /// Blob key the artifact was uploaded under, for remote backends.
    pub artifact_key: Option<String>,
}

impl CreateOptions {
    /// Environment and secrets as one list of pairs, secrets last.
    pub fn env_pairs(&self) -> Vec<(String, String)> {
        self.env
            .iter()
            .filter_map(|entry| entry.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .chain(self.secrets.iter().map(|(k, v)| (k.clone(), v.clone())))
            .collect()
    }
}

#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether processes run on this host, reading artifacts directly.
    fn is_local(&self) -> bool;

    async fn create(&self, spec: &ServiceSpec, options: CreateOptions) -> Result<RuntimeProcess>;

    async fn update(&self, spec: &ServiceSpec, options: CreateOptions) -> Result<RuntimeProcess>;

    /// Deleting an unknown service is not an error.
    async fn delete(&self, key: &ServiceKey) -> Result<()>;

    async fn list(&self) -> Result<Vec<RuntimeProcess>>;

    /// The last `lines` lines a service wrote, or everything when `None`.
    async fn logs(&self, key: &ServiceKey, lines: Option<usize>) -> Result<Vec<String>>;

    async fn read(&self, filter: &ReadFilter) -> Result<Vec<RuntimeProcess>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|p| p.matches(filter))
            .collect())
    }
}

/// Split `text` into lines, keeping only the last `lines` of them.
pub(crate) fn tail_lines(text: &str, lines: Option<usize>) -> Vec<String> {
    let all: Vec<&str> = text.lines().collect();
    let skip = lines.map_or(0, |n| all.len().saturating_sub(n));
    all[skip..].iter().map(|l| l.to_string()).collect()
}
