//! Archive writer - assembles each request/response cycle into a HAR 1.2
//! entry and persists the whole run as `{"log": {version, creator, entries}}`
//!
//! Subscribes to the event bus and accumulates per-`request_id` state
//! (`pending`) until `ResponseComplete` arrives, at which point the entry is
//! finalized, appended to the in-memory completed list, and the archive file
//! is rewritten in full. `pending` is bounded (`max_pending`): once it would
//! grow past that, the oldest in-flight request is evicted with a warning
//! rather than let a client that never completes leak memory forever.
//!
//! A request whose body contains the `<<CC_DUMP_SIDE_CHANNEL:{...}>>` marker
//! gets an `_obsproxy` extension object with `category: "side_channel"` plus
//! the marker's own fields, and a human-readable `comment`, instead of the
//! default `_obsproxy.category: "primary"`.

use crate::events::{EventKind, PipelineEvent};
use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use tokio::sync::mpsc;

const SIDE_CHANNEL_MARKER: &str = "<<CC_DUMP_SIDE_CHANNEL:";

struct PartialEntry {
    started_wall: chrono::DateTime<Utc>,
    started_mono: u64,
    method: String,
    path: String,
    request_headers: HashMap<String, String>,
    request_body: Option<Value>,
    side_channel: Option<Value>,
    response_status: Option<u16>,
    response_headers: HashMap<String, String>,
}

impl PartialEntry {
    fn new(method: String, path: String, headers: HashMap<String, String>, started_mono: u64) -> Self {
        Self {
            started_wall: Utc::now(),
            started_mono,
            method,
            path,
            request_headers: headers,
            request_body: None,
            side_channel: None,
            response_status: None,
            response_headers: HashMap::new(),
        }
    }

    /// The archived request body, always re-serialized with `stream: false`
    /// regardless of what the client actually requested - a HAR entry
    /// records one complete exchange, so the synthetic flag avoids implying
    /// the captured body is a partial SSE fragment.
    fn request_text(&self) -> String {
        let mut body = self.request_body.clone().unwrap_or_else(|| json!({}));
        if let Value::Object(map) = &mut body {
            map.insert("stream".to_string(), json!(false));
        }
        body.to_string()
    }

    fn finalize(self, completed_mono: u64, response_body: Value) -> Value {
        let elapsed_ms = completed_mono.saturating_sub(self.started_mono) as f64 / 1_000_000.0;
        let request_text = self.request_text();

        let mut entry = json!({
            "startedDateTime": self.started_wall.to_rfc3339(),
            "time": elapsed_ms,
            "request": {
                "method": self.method,
                "url": self.path,
                "headers": headers_array(&self.request_headers),
                "postData": {
                    "mimeType": "application/json",
                    "text": request_text,
                },
            },
            "response": {
                "status": self.response_status.unwrap_or(0),
                "headers": headers_array(&self.response_headers),
                "content": {
                    "mimeType": "application/json",
                    "text": response_body.to_string(),
                },
            },
        });

        match &self.side_channel {
            Some(meta) => {
                let field = |key: &str| meta.get(key).and_then(|v| v.as_str()).unwrap_or("");
                let run_id = field("run_id");
                let purpose = field("purpose");
                let prompt_version = field("prompt_version");
                let policy_version = field("policy_version");
                let source_session_id = field("source_session_id");

                entry["_obsproxy"] = json!({
                    "category": "side_channel",
                    "run_id": run_id,
                    "purpose": purpose,
                    "prompt_version": prompt_version,
                    "policy_version": policy_version,
                    "source_session_id": source_session_id,
                });
                entry["comment"] = json!(format!(
                    "obsproxy side-channel run={run_id} purpose={purpose} \
                     prompt_version={prompt_version} policy_version={policy_version}"
                ));
            }
            None => {
                entry["_obsproxy"] = json!({ "category": "primary" });
            }
        }
        entry
    }
}

fn headers_array(headers: &HashMap<String, String>) -> Vec<Value> {
    headers
        .iter()
        .map(|(name, value)| json!({ "name": name, "value": value }))
        .collect()
}

/// Detect a `<<CC_DUMP_SIDE_CHANNEL:{...}>>` marker in a request body and
/// return its parsed payload, if present and well-formed
fn detect_side_channel(body: &Value) -> Option<Value> {
    let text = body.to_string();
    let start = text.find(SIDE_CHANNEL_MARKER)?;
    let json_start = start + SIDE_CHANNEL_MARKER.len();
    let close = text[json_start..].find("}>>")?;
    let json_str = &text[json_start..json_start + close + 1];
    serde_json::from_str(json_str).ok()
}

pub struct ArchiveWriter {
    path: PathBuf,
    max_pending: usize,
    pending: HashMap<String, PartialEntry>,
    pending_order: VecDeque<String>,
    completed: Vec<Value>,
    event_rx: mpsc::UnboundedReceiver<PipelineEvent>,
}

impl ArchiveWriter {
    pub fn new(path: PathBuf, max_pending: usize, event_rx: mpsc::UnboundedReceiver<PipelineEvent>) -> Self {
        Self {
            path,
            max_pending,
            pending: HashMap::new(),
            pending_order: VecDeque::new(),
            completed: Vec::new(),
            event_rx,
        }
    }

    /// Drain the event bus until it closes, then persist and report fatally
    /// if the run produced no completed entries at all.
    pub async fn run(mut self) -> Result<()> {
        tracing::info!(path = %self.path.display(), "archive writer started");

        while let Some(event) = self.event_rx.recv().await {
            self.handle_event(event);
        }

        if self.completed.is_empty() {
            tracing::error!("archive closed with zero completed entries - deleting archive file");
            let _ = std::fs::remove_file(&self.path);
            anyhow::bail!("archive writer produced no entries");
        }

        tracing::info!(entries = self.completed.len(), "archive writer shutting down");
        Ok(())
    }

    fn handle_event(&mut self, event: PipelineEvent) {
        match event.kind {
            EventKind::RequestHeaders { method, path, headers } => {
                self.touch_pending(event.request_id.clone(), move |_| {
                    PartialEntry::new(method, path, headers, event.recv_time)
                });
            }
            EventKind::RequestBody { body } => {
                if let Some(entry) = self.pending.get_mut(&event.request_id) {
                    entry.side_channel = detect_side_channel(&body);
                    entry.request_body = Some(body);
                }
            }
            EventKind::ResponseHeaders { status, headers } => {
                if let Some(entry) = self.pending.get_mut(&event.request_id) {
                    entry.response_status = Some(status);
                    entry.response_headers = headers;
                }
            }
            EventKind::ResponseComplete { body } => {
                if let Some(entry) = self.pending.remove(&event.request_id) {
                    self.pending_order.retain(|id| id != &event.request_id);
                    let finalized = entry.finalize(event.recv_time, body);
                    self.completed.push(finalized);
                    self.persist();
                }
            }
            EventKind::Error { .. }
            | EventKind::ProxyError { .. }
            | EventKind::ResponseProgress { .. }
            | EventKind::ResponseDone {}
            | EventKind::Log { .. } => {}
        }
    }

    fn touch_pending(&mut self, request_id: String, make: impl FnOnce(&str) -> PartialEntry) {
        if !self.pending.contains_key(&request_id) {
            if self.pending.len() >= self.max_pending {
                if let Some(oldest) = self.pending_order.pop_front() {
                    tracing::warn!(request_id = %oldest, "evicting oldest pending archive entry: max_pending exceeded");
                    self.pending.remove(&oldest);
                }
            }
            self.pending_order.push_back(request_id.clone());
        }
        let entry = make(&request_id);
        self.pending.insert(request_id, entry);
    }

    fn persist(&self) {
        if let Err(e) = self.write_archive() {
            tracing::error!(error = %e, "failed to persist archive");
        }
    }

    fn write_archive(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).context("creating archive directory")?;
        }
        let archive = json!({
            "log": {
                "version": "1.2",
                "creator": {
                    "name": "obsproxy",
                    "version": env!("CARGO_PKG_VERSION"),
                },
                "entries": self.completed,
            }
        });
        let contents = serde_json::to_vec_pretty(&archive).context("serializing archive")?;
        std::fs::write(&self.path, contents).context("writing archive file")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    fn headers_event(request_id: &str, seq: u32) -> PipelineEvent {
        PipelineEvent::new(
            request_id.to_string(),
            seq,
            0,
            "anthropic".to_string(),
            EventKind::RequestHeaders {
                method: "POST".to_string(),
                path: "/v1/messages".to_string(),
                headers: Map::new(),
            },
        )
    }

    #[tokio::test]
    async fn completed_request_produces_one_archive_entry() {
        let (tx, rx) = mpsc::unbounded_channel();
        let dir = std::env::temp_dir().join(format!("obsproxy-archive-test-{}", std::process::id()));
        let path = dir.join("archive.json");
        let writer = ArchiveWriter::new(path.clone(), 256, rx);

        tx.send(headers_event("req-1", 0)).unwrap();
        tx.send(PipelineEvent::new(
            "req-1".to_string(),
            1,
            0,
            "anthropic".to_string(),
            EventKind::RequestBody { body: json!({"model": "claude-3"}) },
        ))
        .unwrap();
        tx.send(PipelineEvent::new(
            "req-1".to_string(),
            2,
            100_000_000,
            "anthropic".to_string(),
            EventKind::ResponseComplete { body: json!({"id": "msg_1"}) },
        ))
        .unwrap();
        drop(tx);

        writer.run().await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let archive: Value = serde_json::from_str(&contents).unwrap();
        assert_eq!(archive["log"]["version"], "1.2");
        assert_eq!(archive["log"]["creator"]["name"], "obsproxy");
        let entries = archive["log"]["entries"].as_array().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["_obsproxy"]["category"], "primary");
        assert_eq!(entries[0]["request"]["method"], "POST");
        let request_text = entries[0]["request"]["postData"]["text"].as_str().unwrap();
        let request_body: Value = serde_json::from_str(request_text).unwrap();
        assert_eq!(request_body["stream"], false);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn empty_archive_at_close_is_fatal() {
        let (tx, rx) = mpsc::unbounded_channel();
        let dir = std::env::temp_dir().join(format!("obsproxy-archive-empty-{}", std::process::id()));
        let path = dir.join("archive.json");
        let writer = ArchiveWriter::new(path.clone(), 256, rx);
        drop(tx);

        assert!(writer.run().await.is_err());
    }

    #[tokio::test]
    async fn max_pending_evicts_oldest_entry() {
        let (tx, rx) = mpsc::unbounded_channel();
        let path = std::env::temp_dir().join(format!("obsproxy-archive-bound-{}.json", std::process::id()));
        let mut writer = ArchiveWriter::new(path, 1, rx);

        writer.handle_event(headers_event("req-a", 0));
        writer.handle_event(headers_event("req-b", 0));

        assert!(!writer.pending.contains_key("req-a"));
        assert!(writer.pending.contains_key("req-b"));
        drop(tx);
    }

    #[test]
    fn side_channel_marker_is_detected_and_parsed() {
        let body = json!({
            "messages": [{"role": "user", "content": "<<CC_DUMP_SIDE_CHANNEL:{\"run_id\":\"r1\",\"purpose\":\"eval\"}>>"}]
        });
        let detected = detect_side_channel(&body).unwrap();
        assert_eq!(detected["run_id"], "r1");
        assert_eq!(detected["purpose"], "eval");
    }

    #[test]
    fn ordinary_body_has_no_side_channel() {
        let body = json!({"messages": [{"role": "user", "content": "hello"}]});
        assert!(detect_side_channel(&body).is_none());
    }

    #[test]
    fn finalize_forces_stream_false_regardless_of_original_value() {
        let mut entry = PartialEntry::new("POST".to_string(), "/v1/messages".to_string(), Map::new(), 0);
        entry.request_body = Some(json!({"model": "claude-3", "stream": true}));
        let finalized = entry.finalize(0, json!({"id": "msg_1"}));
        let request_body: Value =
            serde_json::from_str(finalized["request"]["postData"]["text"].as_str().unwrap()).unwrap();
        assert_eq!(request_body["stream"], false);
    }

    #[test]
    fn finalize_annotates_side_channel_entry() {
        let mut entry = PartialEntry::new("POST".to_string(), "/v1/messages".to_string(), Map::new(), 0);
        entry.request_body = Some(json!({"model": "claude-3"}));
        entry.side_channel = Some(json!({
            "run_id": "run-1",
            "purpose": "block_summary",
            "prompt_version": "v1",
            "policy_version": "redaction-v1",
            "source_session_id": "sess-1",
        }));
        let finalized = entry.finalize(0, json!({"id": "msg_1"}));

        assert_eq!(finalized["_obsproxy"]["category"], "side_channel");
        assert_eq!(finalized["_obsproxy"]["run_id"], "run-1");
        assert_eq!(finalized["_obsproxy"]["source_session_id"], "sess-1");
        let comment = finalized["comment"].as_str().unwrap();
        assert!(comment.contains("run=run-1"));
        assert!(comment.contains("purpose=block_summary"));
        assert!(comment.contains("prompt_version=v1"));
        assert!(comment.contains("policy_version=redaction-v1"));
    }
}
