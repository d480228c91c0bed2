use crate::pipeline::types::PipelineStats;
use crate::web::api::{get_health, get_status};
use anyhow::Result;
use axum::{routing::get, Router};
use std::net::{IpAddr, SocketAddr, TcpListener};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Binds `host:port`, moving on to the next port while the address is taken.
fn bind_with_fallback(host: IpAddr, port: u16) -> Result<TcpListener> {
    let mut current_port = port;
    loop {
        let addr = SocketAddr::new(host, current_port);
        match TcpListener::bind(addr) {
            Ok(listener) => {
                // Must be non-blocking before it is handed to Tokio
                listener.set_nonblocking(true)?;
                info!("Successfully bound to {}", addr);
                return Ok(listener);
            }
            Err(e) => {
                warn!("Failed to bind to {}: {}. Trying next port...", addr, e);
                current_port = current_port.wrapping_add(1);
                if current_port == 0 || current_port == port {
                    return Err(anyhow::anyhow!("No available ports found"));
                }
            }
        }
    }
}

pub fn router(stats: Arc<PipelineStats>) -> Router {
    Router::new()
        .route("/api/status", get(get_status))
        .route("/api/health", get(get_health))
        .layer(TraceLayer::new_for_http())
        .with_state(stats)
}

/// Serves the status endpoints until the task is dropped.
pub async fn run_status_server(host: IpAddr, port: u16, stats: Arc<PipelineStats>) -> Result<()> {
    let listener = bind_with_fallback(host, port)?;
    let tokio_listener = tokio::net::TcpListener::from_std(listener)?;
    info!(
        "Status server started on http://{:?}",
        tokio_listener.local_addr()?
    );

    axum::serve(tokio_listener, router(stats)).await?;

    Ok(())
}
