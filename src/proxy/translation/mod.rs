//! Provider translation - converts Anthropic Messages bodies to/from a backend's
//! native wire format
//!
//! The proxy always speaks Anthropic Messages to the client. Most provider
//! plugins (Anthropic itself, any Anthropic-compatible gateway) forward the
//! body unchanged. A plugin whose backend speaks a different format (OpenAI
//! Chat Completions, used by the Copilot plugin) registers a translator pair
//! here: one for the outbound request, one for the inbound response.
//!
//! # Streaming and buffered responses
//!
//! `translate_buffered()` converts a complete JSON response body in one shot.
//! `translate_chunk()` is called once per SSE chunk of a streaming response,
//! using `TranslationContext` to carry state (open content blocks, in-flight
//! tool calls) across chunk boundaries; `finalize()` runs after the last chunk.
//!
//! # Adding a new backend format
//!
//! 1. Add variant to `ApiFormat`
//! 2. Create a submodule implementing `RequestTranslator` and `ResponseTranslator`
//! 3. Register the pair in `TranslationPipeline::for_backend()`

mod context;
pub mod openai;

pub use context::{ModelMapping, TranslationContext};

use axum::http::HeaderMap;

// ============================================================================
// API Format
// ============================================================================

/// Wire format identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiFormat {
    /// Anthropic Messages API (`/v1/messages`) - the proxy's client-facing format
    Anthropic,
    /// OpenAI Chat Completions API (`/v1/chat/completions`)
    OpenAI,
}

impl ApiFormat {
    /// Human-readable name for logging
    pub fn name(&self) -> &'static str {
        match self {
            ApiFormat::Anthropic => "Anthropic",
            ApiFormat::OpenAI => "OpenAI",
        }
    }
}

impl std::fmt::Display for ApiFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

// ============================================================================
// Translator Traits
// ============================================================================

/// Converts an Anthropic request body into a backend's native format
pub trait RequestTranslator: Send + Sync {
    fn name(&self) -> &'static str;
    fn source_format(&self) -> ApiFormat;
    fn target_format(&self) -> ApiFormat;

    fn translate(
        &self,
        body: &[u8],
        headers: &HeaderMap,
    ) -> anyhow::Result<(Vec<u8>, TranslationContext)>;

    /// Translate using a model mapping override instead of the translator's own
    fn translate_with_mapping(
        &self,
        body: &[u8],
        headers: &HeaderMap,
        mapping_override: Option<&ModelMapping>,
    ) -> anyhow::Result<(Vec<u8>, TranslationContext)> {
        let _ = mapping_override;
        self.translate(body, headers)
    }
}

/// Converts a backend's native response format back to Anthropic Messages
pub trait ResponseTranslator: Send + Sync {
    fn name(&self) -> &'static str;
    fn source_format(&self) -> ApiFormat;
    fn target_format(&self) -> ApiFormat;

    /// Translate a complete non-streaming response
    fn translate_buffered(&self, body: &[u8], ctx: &TranslationContext) -> anyhow::Result<Vec<u8>>;

    /// Translate one SSE chunk; `ctx` carries state across calls for one stream
    fn translate_chunk(
        &self,
        chunk: &[u8],
        ctx: &mut TranslationContext,
    ) -> anyhow::Result<Vec<u8>>;

    /// Final bytes to append once the backend stream ends, if any
    fn finalize(&self, ctx: &TranslationContext) -> Option<Vec<u8>>;
}

// ============================================================================
// Translation Pipeline
// ============================================================================

/// Holds the request/response translator pair for one backend format
///
/// A pipeline with no registered pair is a passthrough: bodies cross unchanged
/// and `TranslationContext::passthrough()` is handed to the response path.
pub struct TranslationPipeline {
    request_translator: Option<Box<dyn RequestTranslator>>,
    response_translator: Option<Box<dyn ResponseTranslator>>,
    enabled: bool,
}

impl TranslationPipeline {
    /// Passthrough pipeline - Anthropic in, Anthropic out, unchanged
    pub fn new() -> Self {
        Self {
            request_translator: None,
            response_translator: None,
            enabled: false,
        }
    }

    /// Build the Anthropic → OpenAI pipeline used by the Copilot provider plugin
    pub fn for_openai_backend(model_mapping: ModelMapping) -> Self {
        Self {
            request_translator: Some(Box::new(openai::AnthropicToOpenAiRequest::new(
                model_mapping.clone(),
            ))),
            response_translator: Some(Box::new(openai::OpenAiToAnthropicResponse::new(
                model_mapping,
            ))),
            enabled: true,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Translate an Anthropic request body for this pipeline's backend format
    ///
    /// Passthrough pipelines return the body unchanged and a passthrough context.
    pub fn translate_request(
        &self,
        body: &[u8],
        headers: &HeaderMap,
    ) -> anyhow::Result<(Vec<u8>, TranslationContext)> {
        match &self.request_translator {
            Some(translator) => translator.translate(body, headers),
            None => Ok((body.to_vec(), TranslationContext::passthrough())),
        }
    }

    pub fn translate_buffered_response(
        &self,
        body: &[u8],
        ctx: &TranslationContext,
    ) -> anyhow::Result<Vec<u8>> {
        if ctx.is_model_list {
            return Ok(openai::translate_models_to_anthropic(body));
        }
        match &self.response_translator {
            Some(translator) if ctx.needs_response_translation() => {
                translator.translate_buffered(body, ctx)
            }
            _ => Ok(body.to_vec()),
        }
    }

    pub fn translate_response_chunk(
        &self,
        chunk: &[u8],
        ctx: &mut TranslationContext,
    ) -> anyhow::Result<Vec<u8>> {
        match &self.response_translator {
            Some(translator) if ctx.needs_response_translation() => {
                translator.translate_chunk(chunk, ctx)
            }
            _ => Ok(chunk.to_vec()),
        }
    }

    pub fn finalize_response(&self, ctx: &TranslationContext) -> Option<Vec<u8>> {
        match &self.response_translator {
            Some(translator) if ctx.needs_response_translation() => translator.finalize(ctx),
            _ => None,
        }
    }
}

impl Default for TranslationPipeline {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_format_display() {
        assert_eq!(ApiFormat::Anthropic.to_string(), "Anthropic");
        assert_eq!(ApiFormat::OpenAI.to_string(), "OpenAI");
    }

    #[test]
    fn test_passthrough_pipeline() {
        let pipeline = TranslationPipeline::new();
        assert!(!pipeline.is_enabled());

        let body = b"test body";
        let headers = HeaderMap::new();
        let (translated, ctx) = pipeline.translate_request(body, &headers).unwrap();

        assert_eq!(translated, body);
        assert!(!ctx.needs_response_translation());
    }

    #[test]
    fn test_openai_backend_pipeline_translates() {
        let pipeline = TranslationPipeline::for_openai_backend(ModelMapping::new());
        assert!(pipeline.is_enabled());

        let headers = HeaderMap::new();
        let body = br#"{"model":"claude-sonnet-4-20250514","max_tokens":10,"messages":[{"role":"user","content":"hi"}]}"#;
        let (translated, ctx) = pipeline.translate_request(body, &headers).unwrap();

        let openai: serde_json::Value = serde_json::from_slice(&translated).unwrap();
        assert_eq!(openai["messages"][0]["role"], "user");
        assert!(ctx.needs_response_translation());
    }
}
