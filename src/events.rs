//! Pipeline event envelope
//!
//! Every observation the proxy makes about a request/response cycle is wrapped
//! in a `PipelineEvent` and pushed onto the event bus (`proxy::router`). Events
//! are ordered per `request_id` by `seq`; subscribers (archive writer, analytics
//! accumulator, anything else listening) never need to re-derive ordering.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Monotonically increasing nanosecond timestamp, relative to an arbitrary
/// fixed epoch chosen at process start. Not wall-clock time - only useful for
/// ordering and measuring durations within one run.
pub type MonotonicNanos = u64;

/// One observation about a request/response cycle, tagged with enough context
/// for any subscriber to place it without looking anything else up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineEvent {
    /// Correlates every event belonging to one proxied request
    pub request_id: String,
    /// Per-request sequence number, starting at 0
    pub seq: u32,
    /// When this event was recorded, monotonic
    pub recv_time: MonotonicNanos,
    /// Which provider handled (or is handling) this request
    pub provider: String,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl PipelineEvent {
    pub fn new(
        request_id: String,
        seq: u32,
        recv_time: MonotonicNanos,
        provider: String,
        kind: EventKind,
    ) -> Self {
        Self {
            request_id,
            seq,
            recv_time,
            provider,
            kind,
        }
    }
}

/// A single tool invocation as reported in a progress delta
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolUseProgress {
    pub id: String,
    pub name: String,
    /// Accumulated partial JSON input seen so far for this tool call
    pub partial_input: String,
}

/// The 9 observation kinds a provider plugin or the core handler can emit
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// Request headers as received from the client, after hop-by-hop stripping
    RequestHeaders {
        method: String,
        path: String,
        headers: HashMap<String, String>,
    },
    /// Raw request body, captured before any provider translation
    RequestBody { body: serde_json::Value },
    /// Response status and headers, captured before body streaming begins
    ResponseHeaders {
        status: u16,
        headers: HashMap<String, String>,
    },
    /// An incremental step of assembled response progress (see `proxy::progress`)
    ResponseProgress {
        #[serde(skip_serializing_if = "Option::is_none")]
        delta_text: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        stop_reason: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_use: Option<ToolUseProgress>,
    },
    /// Fully assembled response body (buffered responses, or a streaming
    /// response once `message_stop`/`[DONE]` is reached)
    ResponseComplete { body: serde_json::Value },
    /// Terminal marker for a request's event sequence - always the last event
    ResponseDone {},
    /// A structured error surfaced by the upstream provider
    Error { code: u16, reason: String },
    /// A proxy-side failure (connection refused, timeout, TLS failure, ...)
    ProxyError { error: String },
    /// A completed proxy HTTP exchange, for access-log-style consumers
    Log {
        method: String,
        path: String,
        status: u16,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_kind_round_trips_through_json() {
        let event = PipelineEvent::new(
            "req-1".to_string(),
            0,
            12345,
            "anthropic".to_string(),
            EventKind::Log {
                method: "POST".to_string(),
                path: "/v1/messages".to_string(),
                status: 200,
            },
        );

        let json = serde_json::to_string(&event).unwrap();
        let back: PipelineEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.request_id, "req-1");
        assert_eq!(back.seq, 0);
        matches!(back.kind, EventKind::Log { .. });
    }

    #[test]
    fn response_done_has_no_payload_fields() {
        let event = PipelineEvent::new(
            "req-2".to_string(),
            5,
            0,
            "copilot".to_string(),
            EventKind::ResponseDone {},
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "response_done");
    }
}
