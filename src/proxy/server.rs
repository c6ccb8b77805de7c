//! Proxy server setup and initialization

use anyhow::{Context, Result};
use axum::Router;
use tokio::net::TcpListener;

use crate::config::Config;
use crate::proxy::state::{EventSink, ProxyState};

/// Start the proxy server: build `ProxyState` from `config`, bind `config.bind_addr`,
/// and serve every connection (CONNECT tunnels included) through [`super::handler`]
/// until `shutdown_rx` fires.
pub async fn start_proxy(
    config: Config,
    events: EventSink,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> Result<()> {
    let bind_addr = config.bind_addr;

    if config.ca.is_some() {
        tracing::info!("Forward-proxy CA configured: CONNECT requests will be intercepted");
    } else {
        tracing::debug!("No CA configured: CONNECT requests will receive 501");
    }

    let state = ProxyState::new(config, events).context("failed to build proxy state")?;

    let app = Router::new()
        .fallback(super::handler)
        .with_state(state);

    let listener = TcpListener::bind(bind_addr)
        .await
        .context("failed to bind to address")?;

    tracing::info!(%bind_addr, "proxy listening");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move {
            shutdown_rx.await.ok();
        })
        .await
        .context("server error")?;

    tracing::info!("proxy server shut down gracefully");
    Ok(())
}
