//! Stream fan-out - the SSE driver that forwards raw bytes to the client while
//! simultaneously feeding the assembler, progress extractor, and event bus
//!
//! Each complete line of an Anthropic-shaped SSE stream is delivered to three
//! places independently: the client (byte-for-byte, so the original framing
//! survives), the progress extractor (for incremental `ResponseProgress`
//! events), and the response assembler (for the final `ResponseComplete`).
//! A malformed data line is logged and skipped - it never breaks forwarding.

use crate::events::{EventKind, PipelineEvent};
use crate::proxy::assembler::ResponseAssembler;
use crate::proxy::progress::ProgressExtractor;

/// Drives one proxied SSE stream, in Anthropic wire shape, to completion
pub struct StreamFanOut {
    request_id: String,
    provider: String,
    seq: u32,
    line_buffer: String,
    current_event_type: Option<String>,
    assembler: ResponseAssembler,
    progress: ProgressExtractor,
    finished: bool,
}

impl StreamFanOut {
    pub fn new(request_id: String, provider: String, start_seq: u32) -> Self {
        Self {
            request_id,
            provider,
            seq: start_seq,
            line_buffer: String::new(),
            current_event_type: None,
            assembler: ResponseAssembler::new(),
            progress: ProgressExtractor::new(),
            finished: false,
        }
    }

    fn next_event(&mut self, kind: EventKind) -> PipelineEvent {
        let seq = self.seq;
        self.seq += 1;
        PipelineEvent::new(
            self.request_id.clone(),
            seq,
            monotonic_now(),
            self.provider.clone(),
            kind,
        )
    }

    /// Feed one chunk of raw upstream bytes. Returns the bytes to forward to
    /// the client unchanged, and the events this chunk produced.
    pub fn on_chunk(&mut self, chunk: &[u8]) -> (Vec<u8>, Vec<PipelineEvent>) {
        self.line_buffer.push_str(&String::from_utf8_lossy(chunk));
        let mut events = Vec::new();

        let mut consumed_up_to = 0;
        while let Some(rel_pos) = self.line_buffer[consumed_up_to..].find('\n') {
            let line_end = consumed_up_to + rel_pos;
            let line = self.line_buffer[consumed_up_to..line_end].trim_end_matches('\r');

            if let Some(event_type) = line.strip_prefix("event: ") {
                self.current_event_type = Some(event_type.trim().to_string());
            } else if let Some(data) = line.strip_prefix("data: ") {
                if data.trim() == "[DONE]" {
                    self.finished = true;
                } else {
                    self.handle_data_line(data, &mut events);
                }
            }

            consumed_up_to = line_end + 1;
        }
        self.line_buffer.drain(..consumed_up_to);

        (chunk.to_vec(), events)
    }

    fn handle_data_line(&mut self, data: &str, events: &mut Vec<PipelineEvent>) {
        let parsed: serde_json::Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(err) => {
                tracing::warn!(error = %err, "malformed SSE data line, skipping");
                return;
            }
        };

        let event_type = parsed
            .get("type")
            .and_then(|v| v.as_str())
            .map(String::from)
            .or_else(|| self.current_event_type.clone())
            .unwrap_or_default();

        if event_type == "message_stop" {
            self.finished = true;
        }

        self.assembler.on_event(&event_type, &parsed);

        if let Some(progress) = self.progress.extract(&event_type, &parsed) {
            events.push(self.next_event(EventKind::ResponseProgress {
                delta_text: progress.delta_text,
                stop_reason: progress.stop_reason,
                model: progress.model,
                tool_use: progress.tool_use,
            }));
        }
    }

    /// True once `[DONE]` or `message_stop` has been observed.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Finalize the stream: emit `ResponseComplete` (the assembler falls back
    /// to an empty message if `message_start` was never observed) followed by
    /// `ResponseDone`.
    pub fn finish(mut self) -> Vec<PipelineEvent> {
        let mut events = Vec::new();
        let body = self.assembler.result().unwrap_or_else(|| {
            serde_json::json!({ "type": "message", "role": "assistant", "content": [] })
        });
        events.push(self.next_event(EventKind::ResponseComplete { body }));
        events.push(self.next_event(EventKind::ResponseDone {}));
        events
    }
}

pub(crate) fn monotonic_now() -> u64 {
    use std::time::Instant;
    static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    let start = *START.get_or_init(Instant::now);
    Instant::now().duration_since(start).as_nanos() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwards_raw_bytes_unchanged() {
        let mut fanout = StreamFanOut::new("req-1".to_string(), "anthropic".to_string(), 0);
        let chunk = b"event: ping\ndata: {}\n\n";
        let (forwarded, _events) = fanout.on_chunk(chunk);
        assert_eq!(forwarded, chunk);
    }

    #[test]
    fn emits_progress_and_completes_on_message_stop() {
        let mut fanout = StreamFanOut::new("req-1".to_string(), "anthropic".to_string(), 0);

        let (_, e1) = fanout.on_chunk(
            b"event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\",\"model\":\"claude-3\",\"role\":\"assistant\",\"usage\":{\"input_tokens\":1}}}\n\n",
        );
        assert_eq!(e1.len(), 1);
        matches!(&e1[0].kind, EventKind::ResponseProgress { model, .. } if model.as_deref() == Some("claude-3"));

        let (_, e2) = fanout.on_chunk(
            b"event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"hi\"}}\n\n",
        );
        assert_eq!(e2.len(), 1);
        matches!(&e2[0].kind, EventKind::ResponseProgress { delta_text, .. } if delta_text.as_deref() == Some("hi"));

        let (_, _e3) = fanout.on_chunk(b"event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n");
        assert!(fanout.is_finished());

        let final_events = fanout.finish();
        assert_eq!(final_events.len(), 2);
        matches!(final_events[0].kind, EventKind::ResponseComplete { .. });
        matches!(final_events[1].kind, EventKind::ResponseDone {});
    }

    #[test]
    fn malformed_data_line_is_skipped_without_panicking() {
        let mut fanout = StreamFanOut::new("req-1".to_string(), "anthropic".to_string(), 0);
        let (_, events) = fanout.on_chunk(b"data: not json at all\n\n");
        assert!(events.is_empty());
    }

    #[test]
    fn done_marker_finishes_stream() {
        let mut fanout = StreamFanOut::new("req-1".to_string(), "anthropic".to_string(), 0);
        fanout.on_chunk(b"data: [DONE]\n\n");
        assert!(fanout.is_finished());
    }

    #[test]
    fn finish_without_message_start_still_emits_response_complete() {
        let fanout = StreamFanOut::new("req-1".to_string(), "anthropic".to_string(), 0);
        let events = fanout.finish();
        assert_eq!(events.len(), 2);
        match &events[0].kind {
            EventKind::ResponseComplete { body } => {
                assert_eq!(body["type"], "message");
                assert_eq!(body["content"], serde_json::json!([]));
            }
            other => panic!("expected ResponseComplete, got {other:?}"),
        }
        matches!(events[1].kind, EventKind::ResponseDone {});
    }
}
