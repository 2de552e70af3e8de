pub mod error;
pub mod config;
pub mod keys;
pub mod upstream;
pub mod cache;
pub mod durable;
pub mod stampede;
pub mod classify;
pub mod resolver;
pub mod server;
pub mod metrics;

pub use error::{ProxyError, Result, UpstreamError};
pub use config::{Config, ExplorerConfig};
pub use keys::KeyPool;
pub use upstream::{CacheKey, Fetcher, HttpFetcher};
pub use cache::VolatileCache;
pub use durable::DurableCache;
pub use stampede::StampedeGuard;
pub use classify::{Classifier, EtherscanClassifier, PerExplorerClassifier, Verdict};
pub use resolver::{CacheStats, Resolution, Resolver};
pub use server::{router, AppState};
pub use metrics::Metrics;
