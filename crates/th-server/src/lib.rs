//! th-server: channel sessions and the loopback HLS proxy.
//!
//! This crate ties the transport-stream parser and the segmenter into a
//! running service. It provides:
//!
//! - Source readers for HTTP(S) tuners and local capture files
//! - One demux/segment pipeline per active channel
//! - A session manager with idle expiry
//! - A minimal HTTP/1.1 proxy serving playlists and segments
//! - Graceful shutdown via signal handling

pub mod http;
pub mod pipeline;
pub mod reader;
pub mod resolver;
pub mod server;
pub mod session;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use th_core::config::Config;

pub use pipeline::{Pipeline, PipelineCore, PipelineState, PipelineStats};
pub use reader::Source;
pub use resolver::{ChannelResolver, StaticResolver};
pub use server::ProxyServer;
pub use session::{EnsuredPlaylist, Session, SessionManager};

/// Start the proxy with the channels from `config` and run until a
/// shutdown signal arrives. All sessions are stopped before returning.
pub async fn start(config: Config) -> th_core::Result<()> {
    for warning in config.validate() {
        tracing::warn!("Config warning: {warning}");
    }

    let resolver = StaticResolver::from_config(&config.channels);
    if resolver.is_empty() {
        tracing::warn!("No channels configured; every playlist request will be 404");
    } else {
        tracing::info!("Loaded {} channel(s)", resolver.len());
    }

    let sessions = Arc::new(SessionManager::new(Arc::new(resolver), &config));
    tokio::fs::create_dir_all(sessions.root()).await?;
    tracing::info!("Session directories under {}", sessions.root().display());

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .map_err(|e| th_core::Error::Internal(format!("Invalid server address: {e}")))?;
    let server = ProxyServer::bind(addr, sessions.clone()).await?;

    let cancel = CancellationToken::new();
    let sweeper = sessions.clone().start_sweeper(cancel.clone());
    let signal = tokio::spawn(shutdown_signal(cancel.clone()));

    server.run(cancel.clone()).await;

    cancel.cancel();
    let _ = tokio::join!(sweeper, signal);
    sessions.stop_all().await;

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Cancel `cancel` on SIGINT or SIGTERM. Returns early if it is cancelled
/// elsewhere.
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Shutdown signal received"),
        _ = terminate => tracing::info!("Shutdown signal received"),
        _ = cancel.cancelled() => return,
    }
    cancel.cancel();
}
