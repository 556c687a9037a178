//! Platform Wiring
//!
//! Every collaborator the reconciler and supervisor use, built once from
//! [`Config`] and shared by reference.

use crate::auth::{CredentialIssuer, LocalIssuer};
use crate::build::{BuildArtifact, BuildConfig, BuildOptions, Builder, CompilerBuilder};
use crate::config::{BackendKind, Config, StoreKind};
use crate::error::{Error, Result};
use crate::runtime::{Backend, DockerBackend, DockerConfig, LocalBackend};
use crate::source::archive::{self, ArchiveFormat};
use crate::source::{BLOB_SCHEME, Checkout, CheckoutOptions, HttpFetcher, SourceDescriptor};
use crate::store::{BlobStore, FileBlobStore, FileStore, MemoryBlobStore, MemoryStore, Store};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Source bytes ready for the build pipeline.
#[derive(Debug, Clone)]
pub struct SourcePayload {
    pub bytes: Vec<u8>,

    /// `None` for a single source file.
    pub archive: Option<ArchiveFormat>,
}

pub struct Platform {
    pub config: Config,

    pub store: Arc<dyn Store>,

    pub blobs: Arc<dyn BlobStore>,

    pub backend: Arc<dyn Backend>,

    pub issuer: Arc<dyn CredentialIssuer>,

    pub checkout: Arc<Checkout>,

    pub builder: Arc<dyn Builder>,
}

impl Platform {
    pub fn from_config(config: Config) -> Result<Self> {
        config.validate()?;

        let (store, blobs): (Arc<dyn Store>, Arc<dyn BlobStore>) = match config.store.kind {
            StoreKind::Memory => (
                Arc::new(MemoryStore::new()),
                Arc::new(MemoryBlobStore::new()),
            ),
            StoreKind::File => {
                let dir = config.store_dir();
                (
                    Arc::new(FileStore::new(dir.join("records"))?),
                    Arc::new(FileBlobStore::new(dir.join("blobs"))?),
                )
            }
        };

        let backend: Arc<dyn Backend> = match config.runtime.backend {
            BackendKind::Local => Arc::new(LocalBackend::new(config.work_dir())?),
            BackendKind::Docker => Arc::new(DockerBackend::new(DockerConfig {
                base_image: config.runtime.base_image.clone(),
                container_prefix: config.runtime.container_prefix.clone(),
                work_dir: config.work_dir(),
                ..Default::default()
            })?),
        };

        let fetcher = Arc::new(HttpFetcher::new(config.source.http_timeout_secs)?);
        let checkout = Arc::new(Checkout::new(
            fetcher,
            CheckoutOptions {
                cache_dir: config.cache_dir(),
                prefer_git: config.source.prefer_git,
                tmp_dir: config.build.tmp_dir.clone(),
            },
        ));

        let builder = Arc::new(CompilerBuilder::new(BuildConfig {
            toolchain: config.toolchain()?,
            tmp_dir: config.build.tmp_dir.clone(),
            compiler: config.build.compiler.clone(),
        }));

        Ok(Self {
            config,
            store,
            blobs,
            backend,
            issuer: Arc::new(LocalIssuer::new()),
            checkout,
            builder,
        })
    }

    /// Parse a source reference, treating existing paths as local checkouts.
    pub fn resolve_source(&self, source: &str) -> Result<SourceDescriptor> {
        if source.starts_with(BLOB_SCHEME) {
            return SourceDescriptor::parse(source);
        }
        let work_dir = std::env::current_dir()?;
        SourceDescriptor::resolve(&work_dir, source)
    }

    /// Read uploaded source from the blob store, or check out and pack a
    /// repository.
    pub async fn fetch_source(
        &self,
        source: &SourceDescriptor,
        secrets: &BTreeMap<String, String>,
    ) -> Result<SourcePayload> {
        if let SourceDescriptor::Blob { .. } = source {
            let bytes = self.blobs.read(&source.to_string()).await?;
            let archive = ArchiveFormat::detect(&bytes);
            return Ok(SourcePayload { bytes, archive });
        }

        let checked_out = self.checkout.checkout(source, secrets).await?;
        debug!(source = %source, reference = checked_out.reference(), "packing checkout");
        let service_dir = checked_out.service_dir().to_path_buf();
        let bytes = tokio::task::spawn_blocking(move || {
            let packed = archive::pack_dir(&service_dir);
            drop(checked_out);
            packed
        })
        .await
        .map_err(|e| Error::other(format!("pack task failed: {}", e)))??;

        Ok(SourcePayload {
            bytes,
            archive: Some(ArchiveFormat::Tar),
        })
    }

    pub async fn build(
        &self,
        source: &SourceDescriptor,
        payload: &SourcePayload,
        entrypoint: Option<&str>,
    ) -> Result<BuildArtifact> {
        let options = BuildOptions {
            archive: payload.archive,
            entrypoint: entrypoint.map(str::to_string),
            source: source.clone(),
        };
        self.builder.build(&payload.bytes, &options).await
    }
}
