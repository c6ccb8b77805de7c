//! obsproxy - an observability proxy for Anthropic-compatible coding agents
//!
//! Sits between a client (Claude Code or any Anthropic Messages API client)
//! and an upstream provider (Anthropic directly, or GitHub Copilot via
//! on-the-fly translation), forwarding every request unchanged while
//! recording a `PipelineEvent` for each stage of the exchange. Those events
//! fan out to an archive writer (HAR-shaped JSON on disk) and an in-memory
//! analytics accumulator (session cost and tool-economics reporting).
//!
//! Architecture:
//! - `proxy`: axum-based HTTP/CONNECT server, provider plugins, translation
//! - `router`: fans `PipelineEvent`s out to every subscriber
//! - `storage`: archive writer, one subscriber
//! - `analytics`: session/tool-cost accumulator, the other subscriber
//! - `config`: env/file/default layered configuration
//! - `logging`: tracing subscriber setup

mod analytics;
mod config;
mod events;
mod logging;
mod pricing;
mod proxy;
mod router;
mod storage;
mod tokens;

use anyhow::{Context, Result};
use crate::config::Config;
use crate::proxy::state::EventSink;
use crate::router::EventRouter;
use crate::storage::ArchiveWriter;

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();

    Config::ensure_config_exists();
    let config = Config::from_env();

    tracing::info!(
        provider = config.provider.as_str(),
        bind_addr = %config.bind_addr,
        "starting obsproxy"
    );

    let mut router = EventRouter::new();
    let archive_rx = router.subscribe("archive");
    let analytics_rx = router.subscribe("analytics");

    // Connection tasks only ever see an `EventSink`; this bridge task is the
    // only place that talks to the router directly, so subscriber
    // registration never races with a connection trying to publish.
    let (bridge_tx, mut bridge_rx) = tokio::sync::mpsc::unbounded_channel();
    let bridge_handle = tokio::spawn(async move {
        while let Some(event) = bridge_rx.recv().await {
            router.publish(event);
        }
    });
    let events = EventSink::new(bridge_tx);

    let archive_path = config.archive.path.clone();
    let archive_max_pending = config.archive.max_pending;
    let archive_handle = tokio::spawn(async move {
        let writer = ArchiveWriter::new(archive_path, archive_max_pending, archive_rx);
        if let Err(e) = writer.run().await {
            tracing::error!(error = %e, "archive writer exited with error");
        }
    });

    let analytics = analytics::Analytics::new();
    let analytics_handle = tokio::spawn(analytics.clone().run(analytics_rx));

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

    let proxy_config = config.clone();
    let proxy_handle = tokio::spawn(async move {
        proxy::server::start_proxy(proxy_config, events, shutdown_rx)
            .await
            .context("proxy server failed")
    });

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    tracing::info!("shutdown signal received");

    let _ = shutdown_tx.send(());

    if let Err(e) = proxy_handle.await.context("proxy task panicked")? {
        tracing::error!(error = %e, "proxy server error during shutdown");
    }

    // Dropping the proxy server's EventSink (inside `proxy_handle`) closes
    // the bridge channel, which lets the bridge, archive, and analytics
    // tasks drain their backlog and exit on their own.
    let _ = bridge_handle.await;
    let _ = archive_handle.await;
    let _ = analytics_handle.await;

    tracing::info!("shutdown complete");
    Ok(())
}
