//! Anthropic ↔ OpenAI translation for the Copilot provider plugin
//!
//! The proxy's client-facing protocol is always Anthropic Messages; these
//! translators convert outbound requests to OpenAI Chat Completions for
//! backends that only speak that format, and convert their responses back.

mod models;
mod reverse_request;
mod reverse_response;

pub use models::translate_models_to_anthropic;
pub use reverse_request::AnthropicToOpenAiRequest;
pub use reverse_response::OpenAiToAnthropicResponse;
