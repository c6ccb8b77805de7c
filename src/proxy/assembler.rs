//! Response assembler - rebuilds one complete Anthropic message from a stream
//! of parsed SSE events
//!
//! Every protocol family's events eventually arrive here in Anthropic shape:
//! native Anthropic traffic passes straight through, and translating plugins
//! (Copilot) project their own wire format into the same Anthropic event
//! vocabulary before handing it to this assembler. That keeps exactly one FSM
//! in the codebase responsible for "what does the final message look like".

use serde_json::{json, Value};

#[derive(Debug, Clone)]
enum BlockKind {
    Text { text: String },
    ToolUse { id: String, name: String, buffer: String },
}

#[derive(Debug, Clone)]
struct Block {
    index: u32,
    kind: BlockKind,
}

/// Accumulates `message_start` / `content_block_*` / `message_delta` /
/// `message_stop` events into a single reassembled Anthropic message
#[derive(Debug, Default)]
pub struct ResponseAssembler {
    id: Option<String>,
    model: Option<String>,
    role: Option<String>,
    input_tokens: u64,
    output_tokens: u64,
    cache_read_tokens: Option<u64>,
    cache_creation_tokens: Option<u64>,
    blocks: Vec<Block>,
    stop_reason: Option<String>,
    stop_sequence: Option<Value>,
    started: bool,
}

impl ResponseAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one parsed SSE event. `event_type` is the SSE `event:` line (or the
    /// JSON payload's own `type` field, which the Anthropic wire format always
    /// repeats); `event` is the decoded `data:` JSON payload.
    pub fn on_event(&mut self, event_type: &str, event: &Value) {
        match event_type {
            "message_start" => {
                self.started = true;
                if let Some(message) = event.get("message") {
                    self.id = message.get("id").and_then(|v| v.as_str()).map(String::from);
                    self.model = message
                        .get("model")
                        .and_then(|v| v.as_str())
                        .map(String::from);
                    self.role = message
                        .get("role")
                        .and_then(|v| v.as_str())
                        .map(String::from);
                    if let Some(usage) = message.get("usage") {
                        self.input_tokens =
                            usage.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
                        self.cache_read_tokens =
                            usage.get("cache_read_input_tokens").and_then(|v| v.as_u64());
                        self.cache_creation_tokens = usage
                            .get("cache_creation_input_tokens")
                            .and_then(|v| v.as_u64());
                    }
                }
            }
            "content_block_start" => {
                let Some(index) = event.get("index").and_then(|v| v.as_u64()) else {
                    return;
                };
                let index = index as u32;
                let Some(block) = event.get("content_block") else {
                    return;
                };
                let kind = match block.get("type").and_then(|v| v.as_str()) {
                    Some("tool_use") => BlockKind::ToolUse {
                        id: block.get("id").and_then(|v| v.as_str()).unwrap_or("").to_string(),
                        name: block.get("name").and_then(|v| v.as_str()).unwrap_or("").to_string(),
                        buffer: String::new(),
                    },
                    _ => BlockKind::Text {
                        text: block
                            .get("text")
                            .and_then(|v| v.as_str())
                            .unwrap_or("")
                            .to_string(),
                    },
                };
                self.blocks.push(Block { index, kind });
            }
            "content_block_delta" => {
                let Some(index) = event.get("index").and_then(|v| v.as_u64()) else {
                    return;
                };
                let index = index as u32;
                let Some(delta) = event.get("delta") else {
                    return;
                };
                let Some(block) = self.blocks.iter_mut().find(|b| b.index == index) else {
                    return;
                };
                match delta.get("type").and_then(|v| v.as_str()) {
                    Some("text_delta") => {
                        if let BlockKind::Text { text } = &mut block.kind {
                            text.push_str(delta.get("text").and_then(|v| v.as_str()).unwrap_or(""));
                        }
                    }
                    Some("input_json_delta") => {
                        if let BlockKind::ToolUse { buffer, .. } = &mut block.kind {
                            buffer.push_str(
                                delta.get("partial_json").and_then(|v| v.as_str()).unwrap_or(""),
                            );
                        }
                    }
                    _ => {}
                }
            }
            "content_block_stop" => {
                // Finalization of tool-use JSON happens lazily in `result()` so
                // that a block_stop arriving without a preceding delta (an empty
                // tool call) still yields `input: {}`.
            }
            "message_delta" => {
                if let Some(delta) = event.get("delta") {
                    if let Some(reason) = delta.get("stop_reason").and_then(|v| v.as_str()) {
                        self.stop_reason = Some(reason.to_string());
                    }
                    if let Some(seq) = delta.get("stop_sequence") {
                        self.stop_sequence = Some(seq.clone());
                    }
                }
                if let Some(usage) = event.get("usage") {
                    if let Some(out) = usage.get("output_tokens").and_then(|v| v.as_u64()) {
                        self.output_tokens += out;
                    }
                    if let Some(cr) = usage.get("cache_read_input_tokens").and_then(|v| v.as_u64()) {
                        self.cache_read_tokens = Some(cr);
                    }
                    if let Some(cc) = usage.get("cache_creation_input_tokens").and_then(|v| v.as_u64()) {
                        self.cache_creation_tokens = Some(cc);
                    }
                }
            }
            "message_stop" => {}
            _ => {}
        }
    }

    /// Finalize and return the reassembled message. If `message_start` was
    /// never observed, falls back to an empty assistant message rather than
    /// dropping the response entirely.
    pub fn result(&self) -> Option<Value> {
        if !self.started {
            return Some(json!({
                "type": "message",
                "role": "assistant",
                "content": [],
            }));
        }

        let content: Vec<Value> = self
            .blocks
            .iter()
            .map(|block| match &block.kind {
                BlockKind::Text { text } => json!({ "type": "text", "text": text }),
                BlockKind::ToolUse { id, name, buffer } => {
                    let input: Value = serde_json::from_str(buffer).unwrap_or_else(|_| json!({}));
                    json!({ "type": "tool_use", "id": id, "name": name, "input": input })
                }
            })
            .collect();

        let mut usage = json!({
            "input_tokens": self.input_tokens,
            "output_tokens": self.output_tokens,
        });
        if let Some(cr) = self.cache_read_tokens {
            usage["cache_read_input_tokens"] = json!(cr);
        }
        if let Some(cc) = self.cache_creation_tokens {
            usage["cache_creation_input_tokens"] = json!(cc);
        }

        Some(json!({
            "id": self.id,
            "type": "message",
            "role": self.role.clone().unwrap_or_else(|| "assistant".to_string()),
            "model": self.model,
            "content": content,
            "stop_reason": self.stop_reason,
            "stop_sequence": self.stop_sequence,
            "usage": usage,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_message_start_yields_empty_fallback_message() {
        let assembler = ResponseAssembler::new();
        let result = assembler.result().unwrap();
        assert_eq!(result["type"], "message");
        assert_eq!(result["role"], "assistant");
        assert_eq!(result["content"], json!([]));
    }

    #[test]
    fn assembles_simple_text_turn() {
        let mut assembler = ResponseAssembler::new();
        assembler.on_event(
            "message_start",
            &json!({"message": {"id": "msg_1", "model": "claude-3-opus", "role": "assistant", "usage": {"input_tokens": 10}}}),
        );
        assembler.on_event(
            "content_block_start",
            &json!({"index": 0, "content_block": {"type": "text", "text": ""}}),
        );
        assembler.on_event(
            "content_block_delta",
            &json!({"index": 0, "delta": {"type": "text_delta", "text": "Hello"}}),
        );
        assembler.on_event(
            "content_block_delta",
            &json!({"index": 0, "delta": {"type": "text_delta", "text": " world"}}),
        );
        assembler.on_event("content_block_stop", &json!({"index": 0}));
        assembler.on_event(
            "message_delta",
            &json!({"delta": {"stop_reason": "end_turn"}, "usage": {"output_tokens": 5}}),
        );
        assembler.on_event("message_stop", &json!({}));

        let result = assembler.result().unwrap();
        assert_eq!(result["id"], "msg_1");
        assert_eq!(result["content"][0]["text"], "Hello world");
        assert_eq!(result["stop_reason"], "end_turn");
        assert_eq!(result["usage"]["input_tokens"], 10);
        assert_eq!(result["usage"]["output_tokens"], 5);
    }

    #[test]
    fn assembles_fragmented_tool_use_json() {
        let mut assembler = ResponseAssembler::new();
        assembler.on_event(
            "message_start",
            &json!({"message": {"id": "msg_2", "model": "m", "role": "assistant", "usage": {}}}),
        );
        assembler.on_event(
            "content_block_start",
            &json!({"index": 0, "content_block": {"type": "tool_use", "id": "toolu_1", "name": "read_file"}}),
        );
        for chunk in ["{\"p", "ath\":\"a.p", "y\"}"] {
            assembler.on_event(
                "content_block_delta",
                &json!({"index": 0, "delta": {"type": "input_json_delta", "partial_json": chunk}}),
            );
        }
        assembler.on_event("content_block_stop", &json!({"index": 0}));

        let result = assembler.result().unwrap();
        assert_eq!(result["content"][0]["type"], "tool_use");
        assert_eq!(result["content"][0]["name"], "read_file");
        assert_eq!(result["content"][0]["input"]["path"], "a.py");
    }

    #[test]
    fn malformed_tool_json_defaults_to_empty_object() {
        let mut assembler = ResponseAssembler::new();
        assembler.on_event("message_start", &json!({"message": {"id": "msg_3"}}));
        assembler.on_event(
            "content_block_start",
            &json!({"index": 0, "content_block": {"type": "tool_use", "id": "t", "name": "n"}}),
        );
        assembler.on_event(
            "content_block_delta",
            &json!({"index": 0, "delta": {"type": "input_json_delta", "partial_json": "not json"}}),
        );

        let result = assembler.result().unwrap();
        assert_eq!(result["content"][0]["input"], json!({}));
    }
}
