//! Upstream explorer access: the request key, the [`Fetcher`] seam every
//! cache layer implements, and the reqwest-backed [`HttpFetcher`].

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};
use url::Url;
use crate::config::Config;
use crate::error::{ProxyError, Result, UpstreamError};
use crate::keys::KeyPool;
use crate::metrics::{Metrics, Timer};

/// Identifies one upstream request. Shared by both cache tiers and the
/// stampede lock table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub explorer: String,
    pub module: String,
    pub action: String,
    pub address: String,
}

impl CacheKey {
    pub fn new(
        explorer: impl Into<String>,
        module: impl Into<String>,
        action: impl Into<String>,
        address: impl Into<String>,
    ) -> Self {
        Self {
            explorer: explorer.into(),
            module: module.into(),
            action: action.into(),
            address: address.into(),
        }
    }

    pub fn matches(&self, explorer: &str, address: &str) -> bool {
        self.explorer == explorer && self.address == address
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}/{}", self.explorer, self.module, self.action, self.address)
    }
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, key: &CacheKey) -> std::result::Result<Value, UpstreamError>;
}

#[async_trait]
impl<T: Fetcher + ?Sized> Fetcher for Arc<T> {
    async fn fetch(&self, key: &CacheKey) -> std::result::Result<Value, UpstreamError> {
        (**self).fetch(key).await
    }
}

/// Single GET against an explorer's base URL with a rotated API key.
/// No retries: any failure surfaces immediately.
pub struct HttpFetcher {
    client: Client,
    endpoints: HashMap<String, Url>,
    keys: KeyPool,
}

impl HttpFetcher {
    pub fn new(client: Client, endpoints: HashMap<String, Url>, keys: KeyPool) -> Self {
        Self {
            client,
            endpoints,
            keys,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.upstream.timeout())
            .user_agent(config.upstream.user_agent.clone())
            .build()
            .map_err(|e| ProxyError::Config(format!("Failed to build http client: {}", e)))?;

        let endpoints = config
            .explorers
            .iter()
            .map(|(name, explorer)| (name.clone(), explorer.url.clone()))
            .collect();

        Ok(Self::new(client, endpoints, KeyPool::from_config(config)))
    }

    // The request URL carries the API key, so never echo reqwest's message.
    fn describe(error: &reqwest::Error) -> String {
        if error.is_timeout() {
            "request timed out".to_string()
        } else if error.is_connect() {
            "connection refused or unreachable".to_string()
        } else if error.is_body() {
            "response body error".to_string()
        } else if error.is_request() {
            "request failed".to_string()
        } else {
            "network error".to_string()
        }
    }

    async fn send(&self, key: &CacheKey) -> std::result::Result<Value, UpstreamError> {
        let url = self
            .endpoints
            .get(&key.explorer)
            .ok_or_else(|| UpstreamError::UnknownExplorer(key.explorer.clone()))?;

        let mut query = vec![
            ("module", key.module.as_str()),
            ("action", key.action.as_str()),
            ("address", key.address.as_str()),
        ];
        if let Some(api_key) = self.keys.next_key(&key.explorer) {
            query.push(("apiKey", api_key));
        }

        let transport = |e: reqwest::Error| UpstreamError::Transport {
            explorer: key.explorer.clone(),
            message: Self::describe(&e),
        };

        let response = self
            .client
            .get(url.clone())
            .query(&query)
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(UpstreamError::Status {
                explorer: key.explorer.clone(),
                status: status.as_u16(),
            });
        }

        let body = response.bytes().await.map_err(transport)?;
        serde_json::from_slice(&body).map_err(|e| UpstreamError::InvalidBody {
            explorer: key.explorer.clone(),
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, key: &CacheKey) -> std::result::Result<Value, UpstreamError> {
        info!(
            explorer = %key.explorer,
            module = %key.module,
            action = %key.action,
            address = %key.address,
            "fetching from upstream"
        );

        let timer = Timer::new();
        let result = self.send(key).await;
        Metrics::record_upstream_request(&key.explorer, result.is_ok(), timer.elapsed());

        if let Err(e) = &result {
            warn!(explorer = %key.explorer, address = %key.address, error = %e, "upstream fetch failed");
        }
        result
    }
}
