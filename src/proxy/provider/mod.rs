//! Provider registry and plugin contract
//!
//! A `ProviderSpec` is static metadata about one upstream API family, built
//! once at startup into an immutable registry. A `ProviderPlugin` is the
//! behavior that goes with one spec: deciding which paths and hosts belong to
//! it, preparing one outbound request (auth headers, translation, rate
//! limiting), and running its auth flow. The core handler (`proxy::mod`) owns
//! the actual HTTP dispatch, streaming, and error-to-event mapping so that
//! logic lives in exactly one place regardless of which plugin is active.

pub mod anthropic;
pub mod copilot;

use crate::config::Config;
use crate::proxy::translation::{TranslationContext, TranslationPipeline};
use anyhow::Result;
use async_trait::async_trait;
use axum::http::HeaderMap;
use std::sync::Arc;

/// Static description of one upstream API family
#[derive(Debug, Clone)]
pub struct ProviderSpec {
    pub key: &'static str,
    pub display_name: &'static str,
    /// Path prefixes this provider recognizes as its own API surface
    pub api_paths: &'static [&'static str],
    pub protocol_family: ProtocolFamily,
    /// Hostname glob patterns used to infer a provider from a CONNECT target
    pub host_patterns: &'static [&'static str],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolFamily {
    Anthropic,
    OpenAi,
}

impl ProviderSpec {
    /// Whether `path` falls under one of this provider's recognized prefixes
    pub fn handles_path(&self, path: &str) -> bool {
        self.api_paths.iter().any(|prefix| path.starts_with(prefix))
    }

    /// Whether `host` matches one of this provider's host glob patterns
    /// (patterns support a single leading `*.` wildcard, e.g. `*.anthropic.com`)
    pub fn matches_host(&self, host: &str) -> bool {
        self.host_patterns.iter().any(|pattern| match pattern.strip_prefix("*.") {
            Some(suffix) => host == suffix || host.ends_with(&format!(".{suffix}")),
            None => host == *pattern,
        })
    }
}

pub(crate) const ANTHROPIC_SPEC: ProviderSpec = ProviderSpec {
    key: "anthropic",
    display_name: "Anthropic",
    api_paths: &["/v1/messages", "/v1/complete"],
    protocol_family: ProtocolFamily::Anthropic,
    host_patterns: &["*.anthropic.com", "anthropic.com"],
};

pub(crate) const COPILOT_SPEC: ProviderSpec = ProviderSpec {
    key: "copilot",
    display_name: "GitHub Copilot",
    api_paths: &[
        "/v1/messages",
        "/v1/messages/count_tokens",
        "/chat/completions",
        "/v1/chat/completions",
        "/embeddings",
        "/v1/embeddings",
        "/models",
        "/v1/models",
        "/usage",
        "/token",
    ],
    protocol_family: ProtocolFamily::OpenAi,
    host_patterns: &["*.githubcopilot.com", "*.github.com"],
};

/// Build the immutable provider registry once at startup
pub fn registry() -> Arc<[ProviderSpec]> {
    Arc::from(vec![ANTHROPIC_SPEC, COPILOT_SPEC])
}

/// Outcome of a plugin's auth flow
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(dead_code)]
pub enum AuthResult {
    Ok,
    Refreshed,
    Failed(String),
}

/// An outbound request, ready for the core handler to dispatch
pub struct PreparedRequest {
    pub url: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    /// Translation state from the request leg, carried forward so the
    /// handler can translate this same exchange's response with it
    pub translation_ctx: TranslationContext,
}

/// Why a plugin declined to prepare a request right now
#[derive(Debug, Clone)]
pub enum PrepareError {
    /// Translation of the request body failed
    Translation(String),
    /// The plugin's shared rate limit rejected this call (HTTP 429 path)
    RateLimited { retry_after_secs: u64 },
}

impl std::fmt::Display for PrepareError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PrepareError::Translation(msg) => write!(f, "translation failed: {msg}"),
            PrepareError::RateLimited { retry_after_secs } => {
                write!(f, "rate limited, retry after {retry_after_secs}s")
            }
        }
    }
}
impl std::error::Error for PrepareError {}

/// A provider plugin: decides how one upstream API family is reached
#[async_trait]
pub trait ProviderPlugin: Send + Sync {
    fn spec(&self) -> &'static ProviderSpec;

    /// Whether this plugin recognizes `path` as one of its own API endpoints
    fn handles_path(&self, path: &str) -> bool {
        self.spec().handles_path(path)
    }

    /// Whether a request to `path` is expected to carry a JSON body worth
    /// capturing in a `RequestBody` event
    fn expects_json_body(&self, path: &str) -> bool {
        self.handles_path(path)
    }

    /// Build the upstream URL, headers, and (possibly translated) body for
    /// one request. Applies the plugin's rate limit per its configured policy
    /// (wait or reject) before returning.
    async fn prepare_request(
        &self,
        path: &str,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<PreparedRequest, PrepareError>;

    /// The translation pipeline this plugin's responses need run through, if any
    fn translation(&self) -> &TranslationPipeline;

    /// Re-run (or, with `force`, forcibly refresh) this plugin's auth flow
    async fn run_auth_flow(&self, force: bool) -> AuthResult;
}

/// Build the active plugin for the configured provider
pub fn active_plugin(config: &Config) -> Arc<dyn ProviderPlugin> {
    match config.provider {
        crate::config::ProviderKind::Anthropic => {
            Arc::new(anthropic::AnthropicPlugin::new(config))
        }
        crate::config::ProviderKind::Copilot => Arc::new(copilot::CopilotPlugin::new(config)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anthropic_spec_handles_messages_path() {
        assert!(ANTHROPIC_SPEC.handles_path("/v1/messages"));
        assert!(!ANTHROPIC_SPEC.handles_path("/v1/chat/completions"));
    }

    #[test]
    fn host_pattern_matches_subdomains() {
        assert!(ANTHROPIC_SPEC.matches_host("api.anthropic.com"));
        assert!(!ANTHROPIC_SPEC.matches_host("api.githubcopilot.com"));
    }

    #[test]
    fn registry_contains_both_providers() {
        let reg = registry();
        assert_eq!(reg.len(), 2);
        assert!(reg.iter().any(|p| p.key == "anthropic"));
        assert!(reg.iter().any(|p| p.key == "copilot"));
    }
}
