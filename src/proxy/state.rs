//! Shared proxy state
//!
//! One `ProxyState` is built at startup and cloned (cheaply, via `Arc`) into
//! every connection task. It carries everything the handler needs to process
//! one request: the upstream HTTP client, the active provider plugin, the
//! request/response pipelines, the event bus handle, and (in forward-proxy
//! mode) the certificate authority used to terminate CONNECT tunnels.

use crate::config::Config;
use crate::events::PipelineEvent;
use crate::proxy::ca::CertificateAuthority;
use crate::proxy::interceptor::InterceptorPipeline;
use crate::proxy::provider::{self, ProviderPlugin, ProviderSpec};
use crate::proxy::transformation::TransformationPipeline;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

/// A lightweight, cloneable handle onto the event bus's publish side.
///
/// `EventRouter` itself lives in the main task and owns subscriber
/// registration; connection tasks only ever need to push events, so they get
/// a channel to a small forwarding task instead of the router directly.
#[derive(Clone)]
pub struct EventSink {
    tx: UnboundedSender<PipelineEvent>,
}

impl EventSink {
    pub fn new(tx: UnboundedSender<PipelineEvent>) -> Self {
        Self { tx }
    }

    pub fn publish(&self, event: PipelineEvent) {
        if self.tx.send(event).is_err() {
            tracing::warn!("event dropped: router closed");
        }
    }
}

/// Shared state handed to every connection task
#[derive(Clone)]
pub struct ProxyState {
    pub config: Arc<Config>,
    pub client: reqwest::Client,
    pub events: EventSink,
    pub registry: Arc<[ProviderSpec]>,
    pub plugin: Arc<dyn ProviderPlugin>,
    pub transformation: Arc<TransformationPipeline>,
    pub interceptors: Arc<InterceptorPipeline>,
    pub ca: Option<Arc<CertificateAuthority>>,
}

impl ProxyState {
    pub fn new(config: Config, events: EventSink) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .http1_only()
            .build()?;

        let ca = match &config.ca {
            Some(ca_config) => Some(Arc::new(CertificateAuthority::load(ca_config)?)),
            None => None,
        };

        let plugin = provider::active_plugin(&config);
        let transformation = TransformationPipeline::from_config(&config.transformers);
        let interceptors = InterceptorPipeline::from_config(config.transformers.enabled);

        Ok(Self {
            config: Arc::new(config),
            client,
            events,
            registry: provider::registry(),
            plugin,
            transformation: Arc::new(transformation),
            interceptors: Arc::new(interceptors),
            ca,
        })
    }

    /// Name of the provider a CONNECT target's host resolves to, for tagging
    /// events on tunneled connections. Falls back to the active plugin's own
    /// key when no registered spec claims the host.
    pub fn provider_for_host(&self, host: &str) -> &'static str {
        self.registry
            .iter()
            .find(|spec| spec.matches_host(host))
            .map(|spec| spec.key)
            .unwrap_or(self.plugin.spec().key)
    }
}
