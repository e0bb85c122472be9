//! Where schema bytes come from.
//!
//! The loader only ever asks a source for a manifest path; the source decides
//! how that maps to a request. `HttpSource` joins the path onto a base URL
//! and forces revalidation against the origin.

use crate::error::{Error, Result};
use crate::utils;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{CACHE_CONTROL, PRAGMA};
use tracing::debug;

#[async_trait]
pub trait SchemaSource: Send + Sync {
    /// Human-readable location of `file`, used in error messages.
    fn locate(&self, file: &str) -> String;

    /// Fetch the raw bytes of manifest path `file`.
    async fn fetch(&self, file: &str) -> Result<Bytes>;
}

/// Fetch schema files over HTTP(S) relative to a base URL.
#[derive(Debug, Clone)]
pub struct HttpSource {
    client: reqwest::Client,
    base: String,
}

impl HttpSource {
    pub fn new<B: Into<String>>(base: B) -> Result<Self> {
        let base = base.into();
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::Transport {
                url: base.clone(),
                reason: e.to_string(),
            })?;
        Ok(Self::with_client(client, base))
    }

    /// Use an existing client (shared connection pool, custom TLS, proxies).
    pub fn with_client<B: Into<String>>(client: reqwest::Client, base: B) -> Self {
        Self {
            client,
            base: base.into(),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }
}

#[async_trait]
impl SchemaSource for HttpSource {
    fn locate(&self, file: &str) -> String {
        utils::fetch_url(&self.base, file)
    }

    async fn fetch(&self, file: &str) -> Result<Bytes> {
        let url = self.locate(file);
        debug!(%url, "downloading schema file");
        let transport = |reason: String| Error::Transport {
            url: url.clone(),
            reason,
        };
        let response = self
            .client
            .get(&url)
            .header(CACHE_CONTROL, "no-cache")
            .header(PRAGMA, "no-cache")
            .send()
            .await
            .map_err(|e| transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(transport(format!("HTTP {}", status)));
        }
        response.bytes().await.map_err(|e| transport(e.to_string()))
    }
}
