use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::{
    cache::{Cache, MemoryCache, NoCache},
    config::Config,
    routes::{AppState, router},
    yt_dlp::YtDlp,
};

mod cache;
mod config;
mod error;
mod format;
mod routes;
mod selector;
mod stats;
mod yt_dlp;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    let addr = config.listen_addr()?;

    let cache: Arc<dyn Cache> = if config.cache_ttl().is_zero() {
        info!("metadata cache disabled");
        Arc::new(NoCache)
    } else {
        Arc::new(MemoryCache::new())
    };
    let extractor = Arc::new(YtDlp::from_config(&config));
    let app = router(AppState::new(&config, extractor, cache));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!("listening on http://{addr} using {}", config.yt_dlp.display());

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running server")?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = signal_or_park("ctrl-c", signal::ctrl_c());

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutting down");
}

/// Resolves once `signal` fires. A handler that failed to install parks forever
/// so the other signal can still shut the server down.
async fn signal_or_park(name: &str, installed: impl Future<Output = std::io::Result<()>>) {
    if let Err(e) = installed.await {
        error!("failed to install {name} handler: {e}");
        std::future::pending::<()>().await;
    }
}
