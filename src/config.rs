use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;
use crate::error::{ProxyError, Result};

const ENV_PREFIX: &str = "EXPLORER_CACHE";
const DEFAULT_CONFIG_PATH: &str = "config.toml";
const BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExplorerConfig {
    pub url: Url,
    #[serde(default)]
    pub keys: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub metrics_listen: Option<SocketAddr>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8000)),
            metrics_listen: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub dir: PathBuf,
    pub size_limit_bytes: u64,
    pub volatile_ttl_secs: u64,
    pub volatile_capacity: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("cache"),
            size_limit_bytes: 10_000_000_000,
            volatile_ttl_secs: 3600,
            volatile_capacity: 100_000,
        }
    }
}

impl CacheConfig {
    pub fn volatile_ttl(&self) -> Duration {
        Duration::from_secs(self.volatile_ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            user_agent: BROWSER_USER_AGENT.to_string(),
        }
    }
}

impl UpstreamConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    pub explorers: HashMap<String, ExplorerConfig>,
}

impl Config {
    fn env_var(key: &str) -> Option<String> {
        std::env::var(format!("{}_{}", ENV_PREFIX, key)).ok()
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let config: Config = toml::from_str(raw)
            .map_err(|e| ProxyError::Config(format!("Invalid config file: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ProxyError::Config(format!("Cannot read {}: {}", path.display(), e)))?;
        Self::parse(&raw)
    }

    /// Loads the TOML file named by `EXPLORER_CACHE_CONFIG` (default
    /// `config.toml`), then applies `EXPLORER_CACHE_*` overrides. `.env` is
    /// expected to be loaded by the caller.
    pub fn from_env() -> Result<Self> {
        let path = Self::env_var("CONFIG").unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
        let mut config = Self::from_file(&path)?;
        config.apply_overrides(Self::env_var)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(listen) = lookup("LISTEN") {
            self.server.listen = listen
                .parse()
                .map_err(|e| ProxyError::Config(format!("Invalid listen address {}: {}", listen, e)))?;
        }
        if let Some(listen) = lookup("METRICS_LISTEN") {
            let addr = listen
                .parse()
                .map_err(|e| ProxyError::Config(format!("Invalid metrics address {}: {}", listen, e)))?;
            self.server.metrics_listen = Some(addr);
        }
        if let Some(dir) = lookup("DIR") {
            self.cache.dir = PathBuf::from(dir);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.explorers.is_empty() {
            return Err(ProxyError::Config("No explorers configured".to_string()));
        }
        for (name, explorer) in &self.explorers {
            if !matches!(explorer.url.scheme(), "http" | "https") {
                return Err(ProxyError::Config(format!(
                    "Explorer {} must use an http(s) url, got {}",
                    name, explorer.url
                )));
            }
        }
        if self.cache.size_limit_bytes == 0 {
            return Err(ProxyError::Config("cache.size_limit_bytes must be positive".to_string()));
        }
        if self.cache.volatile_ttl_secs == 0 {
            return Err(ProxyError::Config("cache.volatile_ttl_secs must be positive".to_string()));
        }
        Ok(())
    }
}
