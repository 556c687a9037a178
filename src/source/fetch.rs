//! Archive Fetching
//!
//! HTTP access for repository archives, behind a trait so checkout can run
//! against canned responses.

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,

    pub body: Vec<u8>,
}

impl FetchResponse {
    pub fn ok(body: Vec<u8>) -> Self {
        Self { status: 200, body }
    }

    pub fn not_found() -> Self {
        Self {
            status: 404,
            body: Vec::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == 200
    }
}

#[async_trait]
pub trait ArchiveFetcher: Send + Sync {
    /// GET `url`, sending `authorization` verbatim when present.
    async fn fetch(&self, url: &str, authorization: Option<&str>) -> Result<FetchResponse>;
}

pub struct HttpFetcher {
    http: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout_secs: u64) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent(format!("micro-run/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::other(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { http })
    }
}

#[async_trait]
impl ArchiveFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, authorization: Option<&str>) -> Result<FetchResponse> {
        let mut request = self.http.get(url);
        if let Some(value) = authorization {
            request = request.header(reqwest::header::AUTHORIZATION, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::other(format!("GET {} failed: {}", url, e)))?;
        let status = response.status().as_u16();
        if status != 200 {
            return Ok(FetchResponse {
                status,
                body: Vec::new(),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| Error::other(format!("Reading {} failed: {}", url, e)))?;
        Ok(FetchResponse {
            status,
            body: body.to_vec(),
        })
    }
}
