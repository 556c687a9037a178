//! Build Pipeline
//!
//! Turns uploaded or checked-out source into a runnable binary.

mod toolchain;

pub use toolchain::{GO_BINARY, Toolchain};

use crate::error::{Error, Result};
use crate::service::BuildInfo;
use crate::source::SourceDescriptor;
use crate::source::archive::{self, ArchiveFormat};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// How `source` is packed; `None` means a single source file.
    pub archive: Option<ArchiveFormat>,

    /// Directory, relative to the unpacked root, the compiler runs in.
    pub entrypoint: Option<String>,

    pub source: SourceDescriptor,
}

#[derive(Debug, Clone)]
pub struct BuildArtifact {
    pub binary: Vec<u8>,

    pub source: SourceDescriptor,

    pub sha256: String,

    pub size: usize,

    pub toolchain: String,

    pub built_at: DateTime<Utc>,
}

impl BuildArtifact {
    pub fn new(binary: Vec<u8>, source: SourceDescriptor, toolchain: &str) -> Self {
        Self {
            sha256: compute_sha256(&binary),
            size: binary.len(),
            binary,
            source,
            toolchain: toolchain.to_string(),
            built_at: Utc::now(),
        }
    }

    pub fn build_info(&self) -> BuildInfo {
        BuildInfo {
            sha256: self.sha256.clone(),
            size: self.size,
            toolchain: self.toolchain.clone(),
            source: self.source.to_string(),
            built_at: self.built_at,
        }
    }
}

pub fn compute_sha256(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[async_trait]
pub trait Builder: Send + Sync {
    async fn build(&self, source: &[u8], options: &BuildOptions) -> Result<BuildArtifact>;
}

#[derive(Debug, Clone, Default)]
pub struct BuildConfig {
    /// Skip detection and always use this toolchain.
    pub toolchain: Option<Toolchain>,

    pub tmp_dir: Option<PathBuf>,

    /// Compiler binary; the toolchain's program on `PATH` when unset.
    pub compiler: Option<PathBuf>,
}

pub struct CompilerBuilder {
    config: BuildConfig,
}

impl CompilerBuilder {
    pub fn new(config: BuildConfig) -> Self {
        Self { config }
    }

    fn temp_dir(&self) -> Result<tempfile::TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("build-");
        Ok(match &self.config.tmp_dir {
            Some(parent) => {
                std::fs::create_dir_all(parent)?;
                builder.tempdir_in(parent)?
            }
            None => builder.tempdir()?,
        })
    }
}

#[async_trait]
impl Builder for CompilerBuilder {
    async fn build(&self, source: &[u8], options: &BuildOptions) -> Result<BuildArtifact> {
        let start = Instant::now();
        let tmp = self.temp_dir()?;
        let root = tmp.path();

        match options.archive {
            Some(format) => {
                archive::unpack_as(format, source, root).map_err(|e| Error::BuildFailed {
                    output: format!("unpacking {} source: {}", format.as_str(), e),
                })?;
            }
            None => self
                .config
                .toolchain
                .unwrap_or(Toolchain::Go)
                .write_single_file(root, source)?,
        }

        let work_dir = match options.entrypoint.as_deref() {
            Some(entry) if !entry.is_empty() => root.join(entry),
            _ => find_entrypoint(root).unwrap_or_else(|| root.to_path_buf()),
        };
        if !work_dir.is_dir() {
            return Err(Error::BuildFailed {
                output: format!(
                    "entrypoint '{}' not found in source",
                    options.entrypoint.as_deref().unwrap_or_default()
                ),
            });
        }

        let toolchain = self
            .config
            .toolchain
            .or_else(|| Toolchain::detect(&work_dir))
            .ok_or_else(|| Error::BuildFailed {
                output: format!("no go.mod, *.go or Cargo.toml in {}", work_dir.display()),
            })?;
        let vendored = root.join("vendor").is_dir();

        debug!(toolchain = toolchain.as_str(), vendored, dir = %work_dir.display(), "running compiler");
        let mut command = match &self.config.compiler {
            Some(program) => toolchain.command_with(program, vendored),
            None => toolchain.command(vendored),
        };
        let program = command.as_std().get_program().to_string_lossy().into_owned();
        let output = command
            .current_dir(&work_dir)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::BuildFailed {
                output: format!(
                    "Failed to run {}. Is it installed? Error: {}",
                    program,
                    e
                ),
            })?;

        if !output.status.success() {
            let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
            return Err(Error::BuildFailed { output: combined });
        }

        let binary = tokio::fs::read(toolchain.binary_path(&work_dir)?).await?;
        let artifact = BuildArtifact::new(binary, options.source.clone(), toolchain.as_str());
        info!(
            source = %options.source,
            toolchain = toolchain.as_str(),
            size = artifact.size,
            duration_ms = start.elapsed().as_millis() as u64,
            "build finished"
        );
        Ok(artifact)
    }
}

/// Directory holding the service's `main.go`: the root itself, or the only
/// one found under `cmd/`. `None` when there is no single candidate.
pub fn find_entrypoint(root: &Path) -> Option<PathBuf> {
    if root.join("main.go").is_file() {
        return Some(root.to_path_buf());
    }
    let mut found = Vec::new();
    collect_main_dirs(&root.join("cmd"), &mut found);
    match found.as_slice() {
        [only] => Some(only.clone()),
        _ => None,
    }
}

fn collect_main_dirs(dir: &Path, found: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if path.is_dir() {
            collect_main_dirs(&path, found);
        } else if entry.file_name() == "main.go" {
            found.push(dir.to_path_buf());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(entrypoint: Option<&str>) -> BuildOptions {
        BuildOptions {
            archive: Some(ArchiveFormat::Tar),
            entrypoint: entrypoint.map(str::to_string),
            source: SourceDescriptor::Blob {
                key: "foo:latest".to_string(),
            },
        }
    }

    fn tar_of(dir: &std::path::Path) -> Vec<u8> {
        archive::pack_dir(dir).unwrap()
    }

    #[test]
    fn test_compute_sha256() {
        assert_eq!(
            compute_sha256(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_artifact_build_info() {
        let artifact = BuildArtifact::new(
            b"\x7fELF".to_vec(),
            SourceDescriptor::parse("github.com/a/b/c@v1").unwrap(),
            "go",
        );
        let info = artifact.build_info();
        assert_eq!(info.size, 4);
        assert_eq!(info.toolchain, "go");
        assert_eq!(info.source, "github.com/a/b/c@v1");
    }

    #[tokio::test]
    async fn test_missing_entrypoint_fails_and_cleans_up() {
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("main.go"), "package main").unwrap();
        let scratch = tempfile::tempdir().unwrap();

        let builder = CompilerBuilder::new(BuildConfig {
            tmp_dir: Some(scratch.path().to_path_buf()),
            ..Default::default()
        });
        let err = builder
            .build(&tar_of(src.path()), &options(Some("cmd/server")))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "build_failed");
        assert!(err.to_string().contains("cmd/server"));
        assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_undetectable_source_fails() {
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("README.md"), "hello").unwrap();

        let builder = CompilerBuilder::new(BuildConfig::default());
        let err = builder
            .build(&tar_of(src.path()), &options(None))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BuildFailed { .. }));
    }

    #[tokio::test]
    async fn test_corrupt_archive_is_build_failure() {
        let builder = CompilerBuilder::new(BuildConfig::default());
        let err = builder
            .build(b"definitely not a tarball", &options(None))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "build_failed");
    }

    #[test]
    fn test_find_entrypoint() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(find_entrypoint(dir.path()), None);

        std::fs::create_dir_all(dir.path().join("cmd/server")).unwrap();
        std::fs::write(dir.path().join("cmd/server/main.go"), "package main").unwrap();
        assert_eq!(
            find_entrypoint(dir.path()),
            Some(dir.path().join("cmd/server"))
        );

        std::fs::create_dir_all(dir.path().join("cmd/worker")).unwrap();
        std::fs::write(dir.path().join("cmd/worker/main.go"), "package main").unwrap();
        assert_eq!(find_entrypoint(dir.path()), None);

        std::fs::write(dir.path().join("main.go"), "package main").unwrap();
        assert_eq!(find_entrypoint(dir.path()), Some(dir.path().to_path_buf()));
    }

    /// A compiler that prints to both streams and fails.
    #[cfg(unix)]
    fn failing_compiler(dir: &Path, stdout: &str) -> PathBuf {
        let script = format!(
            "#!/bin/sh\necho \"{}\"\necho './main.go:5:2: undefined: fmt.Prinln' >&2\nexit 1\n",
            stdout
        );
        crate::runtime::write_executable(dir, "fake-go", script.as_bytes()).unwrap()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_compiler_output_is_kept_on_failure() {
        let bin = tempfile::tempdir().unwrap();
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("go.mod"), "module svc\n").unwrap();
        std::fs::write(src.path().join("main.go"), "package main").unwrap();

        let builder = CompilerBuilder::new(BuildConfig {
            compiler: Some(failing_compiler(bin.path(), "# svc")),
            ..Default::default()
        });
        let err = builder
            .build(&tar_of(src.path()), &options(None))
            .await
            .unwrap_err();
        match err {
            Error::BuildFailed { output } => {
                assert_eq!(output, "# svc\n./main.go:5:2: undefined: fmt.Prinln\n")
            }
            other => panic!("expected build failure, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_compiler_runs_in_discovered_cmd_dir() {
        let bin = tempfile::tempdir().unwrap();
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("go.mod"), "module svc\n").unwrap();
        std::fs::create_dir_all(src.path().join("cmd/greeter")).unwrap();
        std::fs::write(src.path().join("cmd/greeter/main.go"), "package main").unwrap();

        let builder = CompilerBuilder::new(BuildConfig {
            toolchain: Some(Toolchain::Go),
            compiler: Some(failing_compiler(bin.path(), "in $(pwd -P)")),
            ..Default::default()
        });
        let err = builder
            .build(&tar_of(src.path()), &options(None))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cmd/greeter"), "{err}");
    }
}
