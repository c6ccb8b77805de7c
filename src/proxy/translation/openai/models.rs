//! OpenAI model-list → Anthropic model-list translation
//!
//! Unlike chat completions, a model list has no streaming leg and no usage
//! accounting - it's a flat schema remap, kept separate from
//! `reverse_response.rs`'s `ResponseTranslator` so that trait stays focused
//! on one complete message per call.

use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Deserialize)]
struct OpenAiModelList {
    #[serde(default)]
    data: Vec<OpenAiModelEntry>,
}

#[derive(Debug, Deserialize)]
struct OpenAiModelEntry {
    #[serde(default)]
    id: String,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Serialize)]
struct AnthropicModelEntry {
    #[serde(rename = "type")]
    entry_type: &'static str,
    id: String,
    display_name: String,
    created_at: &'static str,
}

#[derive(Debug, Serialize)]
struct AnthropicModelList {
    data: Vec<AnthropicModelEntry>,
    has_more: bool,
    first_id: String,
    last_id: String,
}

/// Translate a Copilot `/models` body into Anthropic's `/v1/models` shape.
/// A malformed or non-object upstream body yields an empty list rather than
/// an error - matching the "never block on a non-essential endpoint" posture
/// the rest of the Copilot plugin takes toward its auxiliary paths.
pub fn translate_models_to_anthropic(body: &[u8]) -> Vec<u8> {
    let parsed: OpenAiModelList = serde_json::from_slice(body).unwrap_or_default();

    let data: Vec<AnthropicModelEntry> = parsed
        .data
        .into_iter()
        .filter_map(|model| {
            let id = model.id.trim().to_string();
            if id.is_empty() {
                return None;
            }
            let display_name = if model.name.trim().is_empty() {
                id.clone()
            } else {
                model.name.trim().to_string()
            };
            Some(AnthropicModelEntry {
                entry_type: "model",
                id,
                display_name,
                created_at: "1970-01-01T00:00:00Z",
            })
        })
        .collect();

    let first_id = data.first().map(|m| m.id.clone()).unwrap_or_default();
    let last_id = data.last().map(|m| m.id.clone()).unwrap_or_default();

    let translated = AnthropicModelList {
        data,
        has_more: false,
        first_id,
        last_id,
    };

    serde_json::to_vec(&translated).unwrap_or_else(|_| b"{}".to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translates_model_entries_to_anthropic_shape() {
        let body = br#"{"data":[{"id":"gpt-4","name":"GPT-4"},{"id":"gpt-4o-mini","name":"GPT-4o Mini"}]}"#;
        let translated = translate_models_to_anthropic(body);
        let value: serde_json::Value = serde_json::from_slice(&translated).unwrap();

        assert_eq!(value["data"][0]["type"], "model");
        assert_eq!(value["data"][0]["id"], "gpt-4");
        assert_eq!(value["data"][0]["display_name"], "GPT-4");
        assert_eq!(value["data"][0]["created_at"], "1970-01-01T00:00:00Z");
        assert_eq!(value["has_more"], false);
        assert_eq!(value["first_id"], "gpt-4");
        assert_eq!(value["last_id"], "gpt-4o-mini");
    }

    #[test]
    fn missing_name_falls_back_to_id() {
        let body = br#"{"data":[{"id":"gpt-4"}]}"#;
        let translated = translate_models_to_anthropic(body);
        let value: serde_json::Value = serde_json::from_slice(&translated).unwrap();
        assert_eq!(value["data"][0]["display_name"], "gpt-4");
    }

    #[test]
    fn entries_without_an_id_are_dropped() {
        let body = br#"{"data":[{"id":"","name":"blank"},{"id":"gpt-4","name":"GPT-4"}]}"#;
        let translated = translate_models_to_anthropic(body);
        let value: serde_json::Value = serde_json::from_slice(&translated).unwrap();
        assert_eq!(value["data"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn malformed_body_yields_empty_list() {
        let translated = translate_models_to_anthropic(b"not json");
        let value: serde_json::Value = serde_json::from_slice(&translated).unwrap();
        assert_eq!(value["data"], serde_json::json!([]));
        assert_eq!(value["first_id"], "");
        assert_eq!(value["last_id"], "");
    }
}
