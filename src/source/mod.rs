//! Source References
//!
//! Parsing of `host/org/repo/folder@ref` references, local paths and uploaded
//! `source://` blobs, plus checkout of remote repositories.

pub mod archive;
pub mod fetch;
pub mod git;

pub use fetch::{ArchiveFetcher, FetchResponse, HttpFetcher};
pub use git::{CANDIDATE_REFS, CheckedOutSource, Checkout, CheckoutOptions};

use crate::error::{Error, Result};
use serde::Serialize;
use std::path::{Component, Path, PathBuf};

pub const LATEST: &str = "latest";
pub const BLOB_SCHEME: &str = "source://";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceDescriptor {
    Remote {
        repo_address: String,
        subfolder: String,
        reference: String,
    },

    Local {
        full_path: PathBuf,
        folder: String,
        repo_root: Option<PathBuf>,
        reference: String,
    },

    /// Source previously uploaded to the blob store.
    Blob { key: String },
}

impl SourceDescriptor {
    pub fn parse(source: &str) -> Result<Self> {
        let source = source.trim();
        if let Some(key) = source.strip_prefix(BLOB_SCHEME) {
            if key.is_empty() {
                return Err(Error::invalid_source(source, "empty blob key"));
            }
            return Ok(SourceDescriptor::Blob {
                key: key.to_string(),
            });
        }

        let mut halves = source.split('@');
        let path = halves.next().unwrap_or_default();
        let reference = match (halves.next(), halves.next()) {
            (None, _) => LATEST,
            (Some(_), Some(_)) => {
                return Err(Error::invalid_source(source, "more than one '@'"));
            }
            (Some(r), None) if r.is_empty() => {
                return Err(Error::invalid_source(source, "empty ref after '@'"));
            }
            (Some(r), None) => r,
        };

        let segments: Vec<&str> = path.trim_end_matches('/').split('/').collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(Error::invalid_source(source, "empty path segment"));
        }
        if segments.iter().any(|s| *s == "." || *s == "..") {
            return Err(Error::invalid_source(
                source,
                "'.' and '..' segments are not allowed",
            ));
        }
        if segments.len() < 3 {
            return Err(Error::invalid_source(
                source,
                "expected at least host/org/repo",
            ));
        }

        Ok(SourceDescriptor::Remote {
            repo_address: segments[..3].join("/"),
            subfolder: segments[3..].join("/"),
            reference: reference.to_string(),
        })
    }

    /// Like [`parse`](Self::parse), but treats paths that exist on disk as
    /// local checkouts. `path_exists` is consulted for every candidate path.
    pub fn parse_local(
        work_dir: &Path,
        source: &str,
        path_exists: impl Fn(&Path) -> bool,
    ) -> Result<Self> {
        let candidate = Path::new(source);
        let full_path = if candidate.is_absolute() && path_exists(candidate) {
            Some(clean_path(candidate))
        } else {
            let joined = work_dir.join(candidate);
            path_exists(&joined).then(|| clean_path(&joined))
        };

        let Some(full_path) = full_path else {
            return Self::parse(source);
        };

        let repo_root = find_repo_root(&full_path, &path_exists);
        let folder = match repo_root.as_deref() {
            Some(root) if root != full_path => full_path
                .strip_prefix(root)
                .map(|rel| rel.to_string_lossy().into_owned())
                .unwrap_or_default(),
            _ => file_name(&full_path),
        };

        Ok(SourceDescriptor::Local {
            full_path,
            folder,
            repo_root,
            reference: LATEST.to_string(),
        })
    }

    /// Resolve against the real filesystem.
    pub fn resolve(work_dir: &Path, source: &str) -> Result<Self> {
        Self::parse_local(work_dir, source, |p| p.exists())
    }

    pub fn reference(&self) -> &str {
        match self {
            SourceDescriptor::Remote { reference, .. }
            | SourceDescriptor::Local { reference, .. } => reference,
            SourceDescriptor::Blob { .. } => LATEST,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, SourceDescriptor::Local { .. })
    }

    /// Name a process built from this source would run under.
    pub fn runtime_name(&self) -> String {
        match self {
            SourceDescriptor::Remote {
                repo_address,
                subfolder,
                ..
            } => {
                let tail = if subfolder.is_empty() {
                    repo_address
                } else {
                    subfolder
                };
                tail.rsplit('/').next().unwrap_or(tail).to_string()
            }
            SourceDescriptor::Local { folder, .. } => {
                folder.rsplit('/').next().unwrap_or(folder).to_string()
            }
            SourceDescriptor::Blob { key } => key.split(':').next().unwrap_or(key).to_string(),
        }
    }

    /// Location of the service inside its repository.
    pub fn runtime_source(&self) -> String {
        match self {
            SourceDescriptor::Remote {
                repo_address,
                subfolder,
                ..
            } if subfolder.is_empty() => repo_address.clone(),
            SourceDescriptor::Remote {
                repo_address,
                subfolder,
                ..
            } => format!("{}/{}", repo_address, subfolder),
            SourceDescriptor::Local { full_path, .. } => full_path.to_string_lossy().into_owned(),
            SourceDescriptor::Blob { key } => format!("{}{}", BLOB_SCHEME, key),
        }
    }
}

impl std::fmt::Display for SourceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceDescriptor::Remote { reference, .. } => {
                write!(f, "{}@{}", self.runtime_source(), reference)
            }
            SourceDescriptor::Local { full_path, .. } => write!(f, "{}", full_path.display()),
            SourceDescriptor::Blob { key } => write!(f, "{}{}", BLOB_SCHEME, key),
        }
    }
}

fn find_repo_root(full_path: &Path, path_exists: &impl Fn(&Path) -> bool) -> Option<PathBuf> {
    full_path
        .ancestors()
        .find(|dir| path_exists(&dir.join("go.mod")) || path_exists(&dir.join(".git")))
        .map(Path::to_path_buf)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Lexically remove `.` and `..` components.
fn clean_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
