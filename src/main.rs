use std::sync::Arc;
use dotenv::dotenv;
use explorer_cache::{
    router, AppState, Config, DurableCache, EtherscanClassifier, HttpFetcher, Metrics, Resolver,
    VolatileCache,
};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("explorer_cache=info")),
        )
        .init();

    let config = Config::from_env()?;

    if let Some(addr) = config.server.metrics_listen {
        Metrics::init(addr)?;
        info!(%addr, "metrics exporter listening");
    }

    let fetcher = HttpFetcher::from_config(&config)?;
    let volatile = VolatileCache::new(
        fetcher,
        config.cache.volatile_ttl(),
        config.cache.volatile_capacity,
    );
    let durable = DurableCache::open(&config.cache.dir, config.cache.size_limit_bytes)?;
    let resolver = Arc::new(Resolver::new(durable, volatile, Arc::new(EtherscanClassifier)));

    let stats = resolver.stats()?;
    info!(
        dir = %config.cache.dir.display(),
        entries = stats.count,
        size_bytes = stats.size_bytes,
        explorers = config.explorers.len(),
        "durable cache opened"
    );

    let app = router(AppState::new(resolver.clone(), config.explorers.keys().cloned()));
    let listener = TcpListener::bind(config.server.listen).await?;
    info!(listen = %config.server.listen, "explorer cache listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    resolver.durable().flush()?;
    info!("shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
}
