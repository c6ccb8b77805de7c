//! Anthropic provider plugin - near-transparent passthrough
//!
//! The client already speaks Anthropic Messages, and so does this backend, so
//! there is no translation: the only job here is resolving the upstream URL
//! and forwarding the client's own auth header (`x-api-key` or `Authorization`)
//! unchanged. `run_auth_flow` is a no-op - the client is responsible for its
//! own Anthropic credentials.

use super::{AuthResult, PrepareError, PreparedRequest, ProviderPlugin, ProviderSpec, ANTHROPIC_SPEC};
use crate::config::Config;
use crate::proxy::translation::{TranslationContext, TranslationPipeline};
use async_trait::async_trait;
use axum::http::HeaderMap;

pub struct AnthropicPlugin {
    base_url: String,
    translation: TranslationPipeline,
}

impl AnthropicPlugin {
    pub fn new(config: &Config) -> Self {
        Self {
            base_url: config.anthropic_base_url.trim_end_matches('/').to_string(),
            translation: TranslationPipeline::new(),
        }
    }
}

#[async_trait]
impl ProviderPlugin for AnthropicPlugin {
    fn spec(&self) -> &'static ProviderSpec {
        &ANTHROPIC_SPEC
    }

    async fn prepare_request(
        &self,
        path: &str,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<PreparedRequest, PrepareError> {
        Ok(PreparedRequest {
            url: format!("{}{}", self.base_url, path),
            headers: headers.clone(),
            body: body.to_vec(),
            translation_ctx: TranslationContext::passthrough(),
        })
    }

    fn translation(&self) -> &TranslationPipeline {
        &self.translation
    }

    async fn run_auth_flow(&self, _force: bool) -> AuthResult {
        AuthResult::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn prepares_url_against_configured_base() {
        let config = Config {
            anthropic_base_url: "https://api.anthropic.com".to_string(),
            ..Config::default()
        };
        let plugin = AnthropicPlugin::new(&config);
        let prepared = plugin
            .prepare_request("/v1/messages", &HeaderMap::new(), b"{}")
            .await
            .unwrap();
        assert_eq!(prepared.url, "https://api.anthropic.com/v1/messages");
        assert_eq!(prepared.body, b"{}");
    }

    #[tokio::test]
    async fn auth_flow_is_a_no_op() {
        let plugin = AnthropicPlugin::new(&Config::default());
        assert_eq!(plugin.run_auth_flow(true).await, AuthResult::Ok);
    }
}
