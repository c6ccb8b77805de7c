//! Progress extractor - turns one Anthropic SSE event into a `ResponseProgress`
//! event payload, if it carries anything worth surfacing incrementally
//!
//! This sits beside the assembler (`proxy::assembler`) in the fan-out: the
//! assembler rebuilds state, this function is a pure, stateless projection of
//! one event into `events::EventKind::ResponseProgress` fields.

use crate::events::ToolUseProgress;
use serde_json::Value;

/// One incremental progress observation, ready to be wrapped in `EventKind::ResponseProgress`
#[derive(Debug, Default, PartialEq)]
pub struct Progress {
    pub delta_text: Option<String>,
    pub stop_reason: Option<String>,
    pub model: Option<String>,
    pub tool_use: Option<ToolUseProgress>,
}

impl Progress {
    fn is_empty(&self) -> bool {
        self.delta_text.is_none()
            && self.stop_reason.is_none()
            && self.model.is_none()
            && self.tool_use.is_none()
    }
}

/// In-flight tool call state the extractor needs to attribute `input_json_delta`
/// chunks to the right `id`/`name` (those only appear on `content_block_start`).
#[derive(Debug, Default)]
pub struct ProgressExtractor {
    open_tool_calls: std::collections::HashMap<u32, (String, String, String)>,
}

impl ProgressExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extract progress from one parsed SSE event. Returns `None` when the
    /// event carries nothing a progress consumer needs (e.g. `content_block_stop`).
    pub fn extract(&mut self, event_type: &str, event: &Value) -> Option<Progress> {
        let mut progress = Progress::default();

        match event_type {
            "message_start" => {
                progress.model = event
                    .get("message")
                    .and_then(|m| m.get("model"))
                    .and_then(|v| v.as_str())
                    .map(String::from);
            }
            "content_block_start" => {
                let index = event.get("index").and_then(|v| v.as_u64())? as u32;
                let block = event.get("content_block")?;
                if block.get("type").and_then(|v| v.as_str()) == Some("tool_use") {
                    let id = block.get("id").and_then(|v| v.as_str()).unwrap_or("").to_string();
                    let name = block.get("name").and_then(|v| v.as_str()).unwrap_or("").to_string();
                    self.open_tool_calls
                        .insert(index, (id.clone(), name.clone(), String::new()));
                    progress.tool_use = Some(ToolUseProgress {
                        id,
                        name,
                        partial_input: String::new(),
                    });
                }
            }
            "content_block_delta" => {
                let index = event.get("index").and_then(|v| v.as_u64())? as u32;
                let delta = event.get("delta")?;
                match delta.get("type").and_then(|v| v.as_str()) {
                    Some("text_delta") => {
                        progress.delta_text = delta
                            .get("text")
                            .and_then(|v| v.as_str())
                            .map(String::from);
                    }
                    Some("input_json_delta") => {
                        if let Some((id, name, buffer)) = self.open_tool_calls.get_mut(&index) {
                            buffer.push_str(
                                delta.get("partial_json").and_then(|v| v.as_str()).unwrap_or(""),
                            );
                            progress.tool_use = Some(ToolUseProgress {
                                id: id.clone(),
                                name: name.clone(),
                                partial_input: buffer.clone(),
                            });
                        }
                    }
                    _ => {}
                }
            }
            "content_block_stop" => {
                let index = event.get("index").and_then(|v| v.as_u64())? as u32;
                self.open_tool_calls.remove(&index);
            }
            "message_delta" => {
                progress.stop_reason = event
                    .get("delta")
                    .and_then(|d| d.get("stop_reason"))
                    .and_then(|v| v.as_str())
                    .map(String::from);
            }
            _ => {}
        }

        if progress.is_empty() {
            None
        } else {
            Some(progress)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn message_start_surfaces_model() {
        let mut extractor = ProgressExtractor::new();
        let progress = extractor
            .extract("message_start", &json!({"message": {"model": "claude-3-opus"}}))
            .unwrap();
        assert_eq!(progress.model.as_deref(), Some("claude-3-opus"));
    }

    #[test]
    fn text_delta_surfaces_delta_text() {
        let mut extractor = ProgressExtractor::new();
        let progress = extractor
            .extract(
                "content_block_delta",
                &json!({"index": 0, "delta": {"type": "text_delta", "text": "hi"}}),
            )
            .unwrap();
        assert_eq!(progress.delta_text.as_deref(), Some("hi"));
    }

    #[test]
    fn tool_use_accumulates_partial_json_across_deltas() {
        let mut extractor = ProgressExtractor::new();
        extractor
            .extract(
                "content_block_start",
                &json!({"index": 0, "content_block": {"type": "tool_use", "id": "t1", "name": "search"}}),
            )
            .unwrap();

        let p1 = extractor
            .extract(
                "content_block_delta",
                &json!({"index": 0, "delta": {"type": "input_json_delta", "partial_json": "{\"q\":"}}),
            )
            .unwrap();
        assert_eq!(p1.tool_use.as_ref().unwrap().partial_input, "{\"q\":");

        let p2 = extractor
            .extract(
                "content_block_delta",
                &json!({"index": 0, "delta": {"type": "input_json_delta", "partial_json": "\"rust\"}"}}),
            )
            .unwrap();
        assert_eq!(p2.tool_use.as_ref().unwrap().partial_input, "{\"q\":\"rust\"}");
        assert_eq!(p2.tool_use.as_ref().unwrap().name, "search");
    }

    #[test]
    fn content_block_stop_produces_no_progress() {
        let mut extractor = ProgressExtractor::new();
        assert!(extractor.extract("content_block_stop", &json!({"index": 0})).is_none());
    }

    #[test]
    fn message_delta_surfaces_stop_reason() {
        let mut extractor = ProgressExtractor::new();
        let progress = extractor
            .extract("message_delta", &json!({"delta": {"stop_reason": "end_turn"}}))
            .unwrap();
        assert_eq!(progress.stop_reason.as_deref(), Some("end_turn"));
    }
}
