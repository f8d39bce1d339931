//! Fetching plugin manifests and code from an update source.
//!
//! A source is a base URL; `plugin.json` and `plugin.js` live next to each
//! other under it.

use crate::config::FetchConfig;
use crate::error::PluginHostError;
use crate::record::Manifest;
use async_trait::async_trait;
use reqwest::header::{CACHE_CONTROL, PRAGMA};
use reqwest::{Client, Url};
use tracing::debug;

pub const MANIFEST_FILE: &str = "plugin.json";
pub const CODE_FILE: &str = "plugin.js";

/// Retrieves plugin documents from a source.
#[async_trait]
pub trait PluginFetcher: Send + Sync {
    async fn fetch_manifest(&self, source: &str) -> Result<Manifest, PluginHostError>;

    async fn fetch_code(&self, source: &str) -> Result<String, PluginHostError>;
}

/// HTTP fetcher that always bypasses caches.
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(config: &FetchConfig) -> Result<Self, PluginHostError> {
        let client = Client::builder()
            .timeout(config.timeout())
            .user_agent(config.user_agent.as_str())
            .build()
            .map_err(|e| PluginHostError::NetworkError(format!("http client: {e}")))?;
        Ok(Self { client })
    }

    async fn get_text(&self, source: &str, file: &str) -> Result<String, PluginHostError> {
        let url = resolve(source, file)?;
        debug!(url = %url, "Fetching plugin document");

        let resp = self
            .client
            .get(url.clone())
            .header(CACHE_CONTROL, "no-cache")
            .header(PRAGMA, "no-cache")
            .send()
            .await
            .map_err(|e| PluginHostError::NetworkError(format!("fetch failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(PluginHostError::NetworkError(format!(
                "HTTP {} fetching {url}",
                resp.status()
            )));
        }

        resp.text()
            .await
            .map_err(|e| PluginHostError::NetworkError(format!("read body: {e}")))
    }
}

#[async_trait]
impl PluginFetcher for HttpFetcher {
    async fn fetch_manifest(&self, source: &str) -> Result<Manifest, PluginHostError> {
        let body = self.get_text(source, MANIFEST_FILE).await?;
        serde_json::from_str(&body)
            .map_err(|e| PluginHostError::NetworkError(format!("malformed manifest from {source}: {e}")))
    }

    async fn fetch_code(&self, source: &str) -> Result<String, PluginHostError> {
        self.get_text(source, CODE_FILE).await
    }
}

/// Resolves `file` against `source`, treating the source as a directory.
pub fn resolve(source: &str, file: &str) -> Result<Url, PluginHostError> {
    let mut base = Url::parse(source)
        .map_err(|e| PluginHostError::NetworkError(format!("invalid source {source}: {e}")))?;
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base.join(file)
        .map_err(|e| PluginHostError::NetworkError(format!("invalid source {source}: {e}")))
}
