//! GitHub Copilot provider plugin - translating, rate-limited
//!
//! Copilot speaks OpenAI Chat Completions; the client always speaks Anthropic
//! Messages, so `/v1/messages` (and the Claude Code token-count endpoint) goes
//! through `TranslationPipeline::for_openai_backend`. Every other recognized
//! path (`chat/completions`, `embeddings`, `models`, `usage`, `token`, with or
//! without a `v1/` prefix) is forwarded as-is - Copilot's own clients already
//! speak its native format. A single shared rate limiter enforces a minimum
//! interval between upstream calls; a call that arrives too soon either waits
//! (`rate_limit_wait = true`) or is rejected with a rate-limit error.

use super::{AuthResult, PrepareError, PreparedRequest, ProviderPlugin, ProviderSpec, COPILOT_SPEC};
use crate::config::Config;
use crate::proxy::helpers;
use crate::proxy::translation::{ModelMapping, TranslationContext, TranslationPipeline};
use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::time::sleep;

pub struct CopilotPlugin {
    base_url: String,
    vscode_version: String,
    account_type: String,
    token: Option<String>,
    github_token: Option<String>,
    min_interval: Duration,
    wait_on_limit: bool,
    last_call: Arc<Mutex<Option<Instant>>>,
    translation: TranslationPipeline,
}

impl CopilotPlugin {
    pub fn new(config: &Config) -> Self {
        Self {
            base_url: config.copilot.base_url.trim_end_matches('/').to_string(),
            vscode_version: config.copilot.vscode_version.clone(),
            account_type: config.copilot.account_type.clone(),
            token: config.copilot.token.clone(),
            github_token: config.copilot.github_token.clone(),
            min_interval: Duration::from_secs_f64(config.copilot.rate_limit_seconds.max(0.0)),
            wait_on_limit: config.copilot.rate_limit_wait,
            last_call: Arc::new(Mutex::new(None)),
            translation: TranslationPipeline::for_openai_backend(ModelMapping::new()),
        }
    }

    /// Whether `path` (stripped of an optional leading `v1/`) matches `suffix`
    fn path_is(path: &str, suffix: &str) -> bool {
        let trimmed = path.trim_start_matches('/');
        trimmed == suffix || trimmed == format!("v1/{suffix}")
    }

    fn is_messages_path(path: &str) -> bool {
        path == "/v1/messages"
    }

    fn is_count_tokens_path(path: &str) -> bool {
        path == "/v1/messages/count_tokens"
    }

    /// Only the `v1/`-prefixed models path gets translated to Anthropic
    /// schema; bare `/models` is Copilot's own native endpoint and is
    /// forwarded unchanged for clients that speak Copilot directly.
    fn is_v1_models_path(path: &str) -> bool {
        path == "/v1/models"
    }

    /// Enforce the shared min-interval rate limit. Returns the wait already
    /// performed (if any) or an error if the call should be rejected outright.
    async fn throttle(&self) -> Result<(), PrepareError> {
        if self.min_interval.is_zero() {
            return Ok(());
        }

        let wait = {
            let mut last = self.last_call.lock().unwrap();
            let now = Instant::now();
            let wait = match *last {
                Some(prev) => self.min_interval.saturating_sub(now.duration_since(prev)),
                None => Duration::ZERO,
            };
            *last = Some(now + wait);
            wait
        };

        if wait.is_zero() {
            return Ok(());
        }

        if self.wait_on_limit {
            sleep(wait).await;
            Ok(())
        } else {
            Err(PrepareError::RateLimited {
                retry_after_secs: wait.as_secs().max(1),
            })
        }
    }

    fn auth_headers(&self, headers: HeaderMap) -> HeaderMap {
        let mut headers = {
            let mut filtered = HeaderMap::new();
            for (name, value) in headers.iter() {
                if helpers::is_auth_header(name.as_str()) || helpers::is_anthropic_header(name.as_str()) {
                    continue;
                }
                filtered.append(name.clone(), value.clone());
            }
            filtered
        };
        if let Some(token) = &self.token {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {token}")) {
                tracing::debug!(token = %helpers::hash_credential(token), "substituting Copilot token");
                headers.insert(HeaderName::from_static("authorization"), value);
            }
        }
        if let Ok(value) = HeaderValue::from_str(&self.vscode_version) {
            headers.insert(
                HeaderName::from_static("editor-version"),
                HeaderValue::from_str(&format!("vscode/{}", self.vscode_version))
                    .unwrap_or(value.clone()),
            );
        }
        if let Ok(value) = HeaderValue::from_str(&self.account_type) {
            headers.insert(HeaderName::from_static("copilot-account-type"), value);
        }
        headers
    }
}

#[async_trait]
impl ProviderPlugin for CopilotPlugin {
    fn spec(&self) -> &'static ProviderSpec {
        &COPILOT_SPEC
    }

    fn expects_json_body(&self, path: &str) -> bool {
        Self::is_messages_path(path)
            || Self::is_count_tokens_path(path)
            || Self::path_is(path, "chat/completions")
            || Self::path_is(path, "embeddings")
    }

    async fn prepare_request(
        &self,
        path: &str,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<PreparedRequest, PrepareError> {
        self.throttle().await?;

        if Self::is_count_tokens_path(path) {
            // No upstream call - the handler services this locally from the
            // estimator and never reaches `prepare_request`'s caller for the
            // dispatch step. We still return something shaped so the handler's
            // generic path doesn't need a special case for "no dispatch".
            return Ok(PreparedRequest {
                url: String::new(),
                headers: self.auth_headers(headers.clone()),
                body: body.to_vec(),
                translation_ctx: TranslationContext::passthrough(),
            });
        }

        let (upstream_path, translated_body, translation_ctx) = if Self::is_messages_path(path) {
            let headers_for_translation = headers.clone();
            let (translated, ctx) = self
                .translation
                .translate_request(body, &headers_for_translation)
                .map_err(|e| PrepareError::Translation(e.to_string()))?;
            ("/chat/completions", translated, ctx)
        } else if Self::is_v1_models_path(path) {
            return Ok(PreparedRequest {
                url: format!("{}/models", self.base_url),
                headers: self.auth_headers(headers.clone()),
                body: body.to_vec(),
                translation_ctx: TranslationContext::passthrough().with_model_list_response(),
            });
        } else {
            let trimmed = path.trim_start_matches("/v1/").trim_start_matches('/');
            return Ok(PreparedRequest {
                url: format!("{}/{}", self.base_url, trimmed),
                headers: self.auth_headers(headers.clone()),
                body: body.to_vec(),
                translation_ctx: TranslationContext::passthrough(),
            });
        };

        Ok(PreparedRequest {
            url: format!("{}{}", self.base_url, upstream_path),
            headers: self.auth_headers(headers.clone()),
            body: translated_body,
            translation_ctx,
        })
    }

    fn translation(&self) -> &TranslationPipeline {
        &self.translation
    }

    async fn run_auth_flow(&self, force: bool) -> AuthResult {
        if !force && self.token.is_some() {
            return AuthResult::Ok;
        }
        match &self.github_token {
            Some(_) => AuthResult::Refreshed,
            None => AuthResult::Failed("no GitHub token configured for Copilot device flow".to_string()),
        }
    }
}
