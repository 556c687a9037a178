use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use tokio::process::Command;

/// Output name for Go builds.
pub const GO_BINARY: &str = "micro_build";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Toolchain {
    Go,
    Rust,
}

impl Toolchain {
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "go" | "golang" => Ok(Toolchain::Go),
            "rust" | "rs" | "cargo" => Ok(Toolchain::Rust),
            other => Err(Error::InvalidConfig {
                reason: format!("Unsupported toolchain: {}. Supported: go, rust", other),
            }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Toolchain::Go => "go",
            Toolchain::Rust => "rust",
        }
    }

    pub fn program(&self) -> &'static str {
        match self {
            Toolchain::Go => "go",
            Toolchain::Rust => "cargo",
        }
    }

    pub fn detect(dir: &Path) -> Option<Self> {
        if dir.join("go.mod").exists() {
            return Some(Toolchain::Go);
        }
        if dir.join("Cargo.toml").exists() {
            return Some(Toolchain::Rust);
        }
        let has_go_files = std::fs::read_dir(dir)
            .ok()?
            .filter_map(|e| e.ok())
            .any(|e| e.path().extension().is_some_and(|ext| ext == "go"));
        has_go_files.then_some(Toolchain::Go)
    }

    /// Lay out a single uploaded file as a buildable project.
    pub fn write_single_file(&self, dir: &Path, contents: &[u8]) -> Result<()> {
        match self {
            Toolchain::Go => {
                std::fs::write(dir.join("main.go"), contents)?;
                std::fs::write(dir.join("go.mod"), "module service\n\ngo 1.21\n")?;
            }
            Toolchain::Rust => {
                std::fs::create_dir_all(dir.join("src"))?;
                std::fs::write(dir.join("src/main.rs"), contents)?;
                std::fs::write(
                    dir.join("Cargo.toml"),
                    "[package]\nname = \"service\"\nversion = \"0.1.0\"\nedition = \"2021\"\n",
                )?;
            }
        }
        Ok(())
    }

    pub fn command(&self, vendored: bool) -> Command {
        self.command_with(self.program(), vendored)
    }

    pub fn command_with(&self, program: impl AsRef<OsStr>, vendored: bool) -> Command {
        let mut cmd = Command::new(program);
        match self {
            Toolchain::Go => {
                cmd.args(["build", "-o", GO_BINARY]);
                if vendored {
                    cmd.args(["-mod", "vendor"]);
                }
                cmd.arg(".");
            }
            Toolchain::Rust => {
                cmd.args(["build", "--release"]);
                if vendored {
                    cmd.arg("--offline");
                }
            }
        }
        cmd
    }

    pub fn binary_path(&self, work_dir: &Path) -> Result<PathBuf> {
        match self {
            Toolchain::Go => Ok(work_dir.join(GO_BINARY)),
            Toolchain::Rust => {
                let name = rust_binary_name(work_dir)?;
                Ok(work_dir.join("target").join("release").join(name))
            }
        }
    }
}

fn rust_binary_name(dir: &Path) -> Result<String> {
    let content = std::fs::read_to_string(dir.join("Cargo.toml"))?;
    let manifest: toml::Value = toml::from_str(&content).map_err(|e| Error::BuildFailed {
        output: format!("invalid Cargo.toml: {}", e),
    })?;

    let explicit_bin = manifest
        .get("bin")
        .and_then(|b| b.as_array())
        .and_then(|bins| bins.first())
        .and_then(|b| b.get("name"))
        .and_then(|n| n.as_str());
    let package = manifest
        .get("package")
        .and_then(|p| p.get("name"))
        .and_then(|n| n.as_str());

    explicit_bin
        .or(package)
        .map(str::to_string)
        .ok_or_else(|| Error::BuildFailed {
            output: "Cargo.toml has no package name".to_string(),
        })
}
