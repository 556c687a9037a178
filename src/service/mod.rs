//! Service Model
//!
//! Declared services, their stored records and the filters used to query them.

mod status;

pub use status::ServiceStatus;

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DEFAULT_VERSION: &str = "latest";
pub const DEFAULT_NAMESPACE: &str = "default";
pub const STORE_PREFIX: &str = "service:";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceKey {
    pub name: String,

    pub version: String,
}

impl ServiceKey {
    pub fn new(name: &str, version: &str) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
        }
    }

    pub fn store_key(&self) -> String {
        format!("{}{}:{}", STORE_PREFIX, self.name, self.version)
    }
}

impl std::fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.name, self.version)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSpec {
    pub name: String,

    pub version: String,

    /// Source reference: `host/org/repo[/folder][@ref]`, a local path or a
    /// `source://` blob key.
    pub source: String,

    /// Subdirectory the compiler runs in, relative to the checkout.
    pub entrypoint: Option<String>,

    /// Prebuilt image for container backends.
    pub image: Option<String>,

    pub command: Vec<String>,

    pub args: Vec<String>,

    /// `KEY=VALUE` entries.
    pub env: Vec<String>,

    pub secrets: BTreeMap<String, String>,

    pub namespace: String,

    #[serde(rename = "type")]
    pub kind: String,
}

impl ServiceSpec {
    pub fn new(name: &str, source: &str) -> Self {
        Self {
            name: name.to_string(),
            source: source.to_string(),
            ..Default::default()
        }
    }

    pub fn with_version(mut self, version: &str) -> Self {
        self.version = version.to_string();
        self
    }

    pub fn with_env(mut self, entry: &str) -> Self {
        self.env.push(entry.to_string());
        self
    }

    pub fn key(&self) -> ServiceKey {
        ServiceKey::new(&self.name, &self.version)
    }

    /// Fill defaults and reject specs that can never be reconciled.
    pub fn normalize(mut self) -> Result<Self> {
        self.name = self.name.trim().to_string();
        if self.name.is_empty() {
            return Err(Error::InvalidSpec {
                reason: "service name must not be empty".to_string(),
            });
        }
        if self.name.contains(':') || self.version.contains(':') {
            return Err(Error::InvalidSpec {
                reason: format!("'{}' must not contain ':'", self.key()),
            });
        }
        if self.version.trim().is_empty() {
            self.version = DEFAULT_VERSION.to_string();
        }
        if self.namespace.trim().is_empty() {
            self.namespace = DEFAULT_NAMESPACE.to_string();
        }
        if let Some(entry) = self.entrypoint.as_deref() {
            let escapes = std::path::Path::new(entry)
                .components()
                .any(|c| !matches!(c, std::path::Component::Normal(_)));
            if escapes {
                return Err(Error::InvalidSpec {
                    reason: format!("entrypoint '{}' must be a relative path inside the source", entry),
                });
            }
        }
        if self.source.trim().is_empty() && self.image.is_none() {
            return Err(Error::InvalidSpec {
                reason: format!("service {} needs a source or an image", self.name),
            });
        }
        Ok(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildInfo {
    pub sha256: String,

    pub size: usize,

    pub toolchain: String,

    pub source: String,

    pub built_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ownership {
    pub owner: String,

    pub group: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub status: ServiceStatus,

    pub build_info: Option<BuildInfo>,

    pub owner: String,

    pub group: String,

    pub updated_at: DateTime<Utc>,

    /// Bumped by every caller update.
    pub revision: u64,

    /// Revision last pushed to the backend.
    pub applied_revision: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub spec: ServiceSpec,

    pub metadata: Metadata,
}

impl ServiceRecord {
    pub fn new(spec: ServiceSpec, ownership: Ownership) -> Self {
        let group = if ownership.group.is_empty() {
            spec.namespace.clone()
        } else {
            ownership.group
        };
        Self {
            spec,
            metadata: Metadata {
                status: ServiceStatus::Started,
                build_info: None,
                owner: ownership.owner,
                group,
                updated_at: Utc::now(),
                revision: 0,
                applied_revision: 0,
            },
        }
    }

    pub fn key(&self) -> ServiceKey {
        self.spec.key()
    }

    pub fn status(&self) -> &ServiceStatus {
        &self.metadata.status
    }

    pub fn error(&self) -> Option<&str> {
        self.metadata.status.error_message()
    }

    pub fn set_status(&mut self, status: ServiceStatus) {
        self.metadata.status = status;
        self.metadata.updated_at = Utc::now();
    }

    pub fn needs_update(&self) -> bool {
        self.metadata.revision != self.metadata.applied_revision
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Selects services for `read`; unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadFilter {
    pub name: Option<String>,

    pub version: Option<String>,

    pub namespace: Option<String>,

    #[serde(rename = "type")]
    pub kind: Option<String>,
}

impl ReadFilter {
    pub fn service(name: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            ..Default::default()
        }
    }

    pub fn matches(&self, spec: &ServiceSpec) -> bool {
        fn check(want: &Option<String>, have: &str) -> bool {
            want.as_deref().is_none_or(|w| w == have)
        }
        check(&self.name, &spec.name)
            && check(&self.version, &spec.version)
            && check(&self.namespace, &spec.namespace)
            && check(&self.kind, &spec.kind)
    }
}
