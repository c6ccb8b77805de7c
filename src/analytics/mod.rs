//! Analytics accumulator - folds request/response pairs into session statistics
//!
//! Subscribes to the event bus like the archive writer, but keeps state
//! forever (for the life of the process) rather than writing anything to
//! disk: one [`TurnRecord`] per completed request, plus a handful of pure
//! reducers (`get_session_stats`, `get_turn_timeline`, `get_dashboard_snapshot`,
//! `get_tool_economics`) that derive summaries from the turn list on demand.
//!
//! Tool-call correlation happens against the *request* body, not the
//! response, because the client always speaks Anthropic Messages: a
//! `tool_use` block in one turn's request is the model's prior tool call,
//! and the paired `tool_result` block carries what came back. OpenAI-shaped
//! `tool_calls`/`role: "tool"` pairs are recognized too, for the case where
//! a client talks to this proxy in OpenAI's own wire format.

use crate::events::{EventKind, PipelineEvent};
use crate::pricing::{self, HAIKU_BASE_UNIT};
use crate::tokens;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::{mpsc, RwLock};

/// One correlated tool call: the model's request for it, and what came back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub tool_use_id: String,
    pub name: String,
    pub input_tokens: u32,
    pub result_tokens: u32,
    pub is_error: bool,
}

/// One committed request/response cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRecord {
    pub sequence_num: u32,
    pub model: String,
    #[serde(default)]
    pub stop_reason: Option<String>,
    pub input_tokens: u32,
    pub output_tokens: u32,
    #[serde(default)]
    pub cache_read_tokens: u32,
    #[serde(default)]
    pub cache_creation_tokens: u32,
    pub request_json: Value,
    #[serde(default)]
    pub tool_invocations: Vec<ToolInvocation>,
}

/// Sum of token counts across some set of turns.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SessionStats {
    pub input: u64,
    pub output: u64,
    pub cache_read: u64,
    pub cache_creation: u64,
}

/// One row of the per-turn timeline.
#[derive(Debug, Clone, Serialize)]
pub struct TurnTimelineRow {
    pub sequence_num: u32,
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cache_read_tokens: u32,
    pub cache_creation_tokens: u32,
    /// `input + cache_read`, the effective context size this turn saw
    pub input_total: u32,
    /// `cache_read / input_total`, 0 when `input_total` is 0
    pub cache_pct: f64,
}

/// Per-model aggregated cost, part of the dashboard snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ModelCostRow {
    pub model: String,
    pub turns: u32,
    pub input: u64,
    pub output: u64,
    pub cache_read: u64,
    pub cache_creation: u64,
    pub cost_usd: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DashboardSnapshot {
    pub summary: SessionStats,
    pub timeline: Vec<TurnTimelineRow>,
    pub model_rows: Vec<ModelCostRow>,
}

/// One row of the tool-economics report.
#[derive(Debug, Clone, Serialize)]
pub struct ToolEconomicsRow {
    pub name: String,
    /// Present only when grouping by model
    pub model: Option<String>,
    pub invocation_count: u32,
    pub error_count: u32,
    pub cache_contrib: f64,
    /// Normalized cost in Haiku-input-token-equivalent units
    pub normalized_cost: f64,
}

/// Cost for a turn's token usage under the fixed pricing table.
pub fn compute_session_cost(
    input: u64,
    output: u64,
    cache_read: u64,
    cache_creation: u64,
    model: &str,
) -> f64 {
    pricing::calculate_cost(
        model,
        input as u32,
        output as u32,
        cache_creation as u32,
        cache_read as u32,
    )
}

/// Extract tool invocations correlated within one request body's message list.
///
/// Handles both shapes the proxy might see in a request: Anthropic
/// `tool_use`/`tool_result` content blocks, and OpenAI `tool_calls`/
/// `role: "tool"` messages.
fn extract_tool_invocations(request_json: &Value) -> Vec<ToolInvocation> {
    let Some(messages) = request_json.get("messages").and_then(Value::as_array) else {
        return Vec::new();
    };

    let mut calls: HashMap<String, (String, u32)> = HashMap::new();
    let mut invocations = Vec::new();

    for message in messages {
        // Anthropic shape: content is a list of typed blocks
        if let Some(blocks) = message.get("content").and_then(Value::as_array) {
            for block in blocks {
                match block.get("type").and_then(Value::as_str) {
                    Some("tool_use") => {
                        let id = block.get("id").and_then(Value::as_str).unwrap_or_default();
                        let name = block.get("name").and_then(Value::as_str).unwrap_or_default();
                        let input = block.get("input").cloned().unwrap_or(Value::Null);
                        calls.insert(
                            id.to_string(),
                            (name.to_string(), tokens::estimate_json_tokens(&input)),
                        );
                    }
                    Some("tool_result") => {
                        let id = block
                            .get("tool_use_id")
                            .and_then(Value::as_str)
                            .unwrap_or_default();
                        let is_error = block
                            .get("is_error")
                            .and_then(Value::as_bool)
                            .unwrap_or(false);
                        let result_text = tool_result_text(block.get("content"));
                        if let Some((name, input_tokens)) = calls.remove(id) {
                            invocations.push(ToolInvocation {
                                tool_use_id: id.to_string(),
                                name,
                                input_tokens,
                                result_tokens: tokens::estimate_tokens(&result_text),
                                is_error,
                            });
                        }
                    }
                    _ => {}
                }
            }
        }

        // OpenAI shape: assistant message carries tool_calls, a later
        // message with role "tool" carries the result
        if let Some(tool_calls) = message.get("tool_calls").and_then(Value::as_array) {
            for call in tool_calls {
                let id = call.get("id").and_then(Value::as_str).unwrap_or_default();
                let name = call
                    .get("function")
                    .and_then(|f| f.get("name"))
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let input = call
                    .get("function")
                    .and_then(|f| f.get("arguments"))
                    .and_then(Value::as_str)
                    .unwrap_or("");
                calls.insert(
                    id.to_string(),
                    (name.to_string(), tokens::estimate_tokens(input)),
                );
            }
        }
        if message.get("role").and_then(Value::as_str) == Some("tool") {
            let id = message
                .get("tool_call_id")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let result_text = message
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            if let Some((name, input_tokens)) = calls.remove(id) {
                invocations.push(ToolInvocation {
                    tool_use_id: id.to_string(),
                    name,
                    input_tokens,
                    result_tokens: tokens::estimate_tokens(&result_text),
                    is_error: false,
                });
            }
        }
    }

    invocations
}

/// Flatten a `tool_result` block's content (string, or a list of text blocks)
/// into plain text for estimation purposes.
fn tool_result_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

struct PendingTurn {
    request_json: Option<Value>,
}

struct AccumulatorState {
    turns: Vec<TurnRecord>,
    pending: HashMap<String, PendingTurn>,
    next_sequence: u32,
}

impl AccumulatorState {
    fn new() -> Self {
        Self {
            turns: Vec::new(),
            pending: HashMap::new(),
            next_sequence: 1,
        }
    }

    fn handle_event(&mut self, event: PipelineEvent) {
        match event.kind {
            EventKind::RequestBody { body } => {
                self.pending
                    .entry(event.request_id)
                    .or_insert(PendingTurn { request_json: None })
                    .request_json = Some(body);
            }
            EventKind::ResponseComplete { body } => {
                let Some(pending) = self.pending.remove(&event.request_id) else {
                    return;
                };
                let Some(request_json) = pending.request_json else {
                    return;
                };
                self.commit_turn(request_json, body);
            }
            _ => {}
        }
    }

    fn commit_turn(&mut self, request_json: Value, response_json: Value) {
        let model = response_json
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let stop_reason = response_json
            .get("stop_reason")
            .and_then(Value::as_str)
            .map(str::to_string);
        let usage = response_json.get("usage").cloned().unwrap_or(Value::Null);
        let input_tokens = usage
            .get("input_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32;
        let output_tokens = usage
            .get("output_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32;
        let cache_read_tokens = usage
            .get("cache_read_input_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32;
        let cache_creation_tokens = usage
            .get("cache_creation_input_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32;

        let tool_invocations = extract_tool_invocations(&request_json);

        let turn = TurnRecord {
            sequence_num: self.next_sequence,
            model,
            stop_reason,
            input_tokens,
            output_tokens,
            cache_read_tokens,
            cache_creation_tokens,
            request_json,
            tool_invocations,
        };
        self.next_sequence += 1;
        self.turns.push(turn);
    }

    fn session_stats(&self, current_turn: Option<&TurnRecord>) -> SessionStats {
        let mut stats = SessionStats::default();
        for turn in self.turns.iter().chain(current_turn) {
            stats.input += turn.input_tokens as u64;
            stats.output += turn.output_tokens as u64;
            stats.cache_read += turn.cache_read_tokens as u64;
            stats.cache_creation += turn.cache_creation_tokens as u64;
        }
        stats
    }

    fn latest_turn(&self) -> Option<TurnRecord> {
        self.turns.last().cloned()
    }

    fn turn_timeline(&self) -> Vec<TurnTimelineRow> {
        self.turns
            .iter()
            .map(|turn| {
                let input_total = turn.input_tokens + turn.cache_read_tokens;
                let cache_pct = if input_total == 0 {
                    0.0
                } else {
                    turn.cache_read_tokens as f64 / input_total as f64
                };
                TurnTimelineRow {
                    sequence_num: turn.sequence_num,
                    model: turn.model.clone(),
                    input_tokens: turn.input_tokens,
                    output_tokens: turn.output_tokens,
                    cache_read_tokens: turn.cache_read_tokens,
                    cache_creation_tokens: turn.cache_creation_tokens,
                    input_total,
                    cache_pct,
                }
            })
            .collect()
    }

    fn dashboard_snapshot(&self, current_turn: Option<&TurnRecord>) -> DashboardSnapshot {
        let summary = self.session_stats(current_turn);
        let timeline = self.turn_timeline();

        let mut by_model: HashMap<String, (u32, u64, u64, u64, u64)> = HashMap::new();
        for turn in self.turns.iter().chain(current_turn) {
            let entry = by_model.entry(turn.model.clone()).or_default();
            entry.0 += 1;
            entry.1 += turn.input_tokens as u64;
            entry.2 += turn.output_tokens as u64;
            entry.3 += turn.cache_read_tokens as u64;
            entry.4 += turn.cache_creation_tokens as u64;
        }

        let mut model_rows: Vec<ModelCostRow> = by_model
            .into_iter()
            .map(|(model, (turns, input, output, cache_read, cache_creation))| {
                let cost_usd =
                    compute_session_cost(input, output, cache_read, cache_creation, &model);
                ModelCostRow {
                    model,
                    turns,
                    input,
                    output,
                    cache_read,
                    cache_creation,
                    cost_usd,
                }
            })
            .collect();
        model_rows.sort_by(|a, b| a.model.cmp(&b.model));

        DashboardSnapshot {
            summary,
            timeline,
            model_rows,
        }
    }

    fn tool_economics(&self, group_by_model: bool) -> Vec<ToolEconomicsRow> {
        #[derive(Default)]
        struct Agg {
            invocation_count: u32,
            error_count: u32,
            cache_contrib: f64,
            normalized_cost: f64,
        }

        let mut rows: HashMap<(String, Option<String>), Agg> = HashMap::new();

        for turn in &self.turns {
            if turn.tool_invocations.is_empty() {
                continue;
            }
            let total_input: u32 = turn.tool_invocations.iter().map(|i| i.input_tokens).sum();
            let pricing = pricing::get_pricing(&turn.model);

            for inv in &turn.tool_invocations {
                let cache_contrib = if total_input == 0 {
                    0.0
                } else {
                    (inv.input_tokens as f64 / total_input as f64)
                        * turn.cache_read_tokens as f64
                };
                let normalized_cost = inv.input_tokens as f64
                    * (pricing.input_per_million / HAIKU_BASE_UNIT)
                    + inv.result_tokens as f64 * (pricing.output_per_million / HAIKU_BASE_UNIT);

                let key = (
                    inv.name.clone(),
                    if group_by_model {
                        Some(turn.model.clone())
                    } else {
                        None
                    },
                );
                let agg = rows.entry(key).or_default();
                agg.invocation_count += 1;
                agg.error_count += inv.is_error as u32;
                agg.cache_contrib += cache_contrib;
                agg.normalized_cost += normalized_cost;
            }
        }

        let mut result: Vec<ToolEconomicsRow> = rows
            .into_iter()
            .map(|((name, model), agg)| ToolEconomicsRow {
                name,
                model,
                invocation_count: agg.invocation_count,
                error_count: agg.error_count,
                cache_contrib: agg.cache_contrib,
                normalized_cost: agg.normalized_cost,
            })
            .collect();

        result.sort_by(|a, b| {
            b.normalized_cost
                .partial_cmp(&a.normalized_cost)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.name.cmp(&b.name))
                .then_with(|| a.model.cmp(&b.model))
        });
        result
    }
}

/// Serializable snapshot of accumulator state, for `get_state`/`restore_state`.
#[derive(Debug, Serialize, Deserialize, Default)]
pub struct PersistedState {
    #[serde(default)]
    pub turns: Vec<TurnRecord>,
    #[serde(default)]
    pub next_sequence: u32,
    /// Catches any historical field this version doesn't recognize, so
    /// round-tripping an older snapshot through `get_state`/`restore_state`
    /// never loses data silently - it just isn't interpreted.
    #[serde(flatten)]
    pub unknown: HashMap<String, Value>,
}

/// Shared handle to accumulated analytics state, cheaply cloneable.
#[derive(Clone)]
pub struct Analytics {
    state: std::sync::Arc<RwLock<AccumulatorState>>,
}

impl Analytics {
    pub fn new() -> Self {
        Self {
            state: std::sync::Arc::new(RwLock::new(AccumulatorState::new())),
        }
    }

    pub async fn get_session_stats(&self, current_turn: Option<&TurnRecord>) -> SessionStats {
        self.state.read().await.session_stats(current_turn)
    }

    pub async fn get_latest_turn_stats(&self) -> Option<TurnRecord> {
        self.state.read().await.latest_turn()
    }

    pub async fn get_turn_timeline(&self) -> Vec<TurnTimelineRow> {
        self.state.read().await.turn_timeline()
    }

    pub async fn get_dashboard_snapshot(&self, current_turn: Option<&TurnRecord>) -> DashboardSnapshot {
        self.state.read().await.dashboard_snapshot(current_turn)
    }

    pub async fn get_tool_economics(&self, group_by_model: bool) -> Vec<ToolEconomicsRow> {
        self.state.read().await.tool_economics(group_by_model)
    }

    pub async fn get_state(&self) -> PersistedState {
        let state = self.state.read().await;
        PersistedState {
            turns: state.turns.clone(),
            next_sequence: state.next_sequence,
            unknown: HashMap::new(),
        }
    }

    pub async fn restore_state(&self, persisted: PersistedState) {
        let mut state = self.state.write().await;
        state.turns = persisted.turns;
        state.next_sequence = persisted.next_sequence.max(1);
    }

    /// Drain the event bus until it closes. Exceptions while handling a
    /// single event are logged and swallowed so one malformed request never
    /// takes the accumulator down.
    pub async fn run(self, mut event_rx: mpsc::UnboundedReceiver<PipelineEvent>) {
        tracing::info!("analytics accumulator started");
        while let Some(event) = event_rx.recv().await {
            let mut state = self.state.write().await;
            state.handle_event(event);
        }
        tracing::info!("analytics accumulator shutting down");
    }
}

impl Default for Analytics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::PipelineEvent;
    use serde_json::json;

    fn body_event(request_id: &str, seq: u32, kind: EventKind) -> PipelineEvent {
        PipelineEvent::new(request_id.to_string(), seq, 0, "anthropic".to_string(), kind)
    }

    #[tokio::test]
    async fn completed_turn_is_committed_with_usage() {
        let analytics = Analytics::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(analytics.clone().run(rx));

        tx.send(body_event(
            "req-1",
            0,
            EventKind::RequestBody {
                body: json!({"model": "claude-3-5-sonnet-20241022", "messages": []}),
            },
        ))
        .unwrap();
        tx.send(body_event(
            "req-1",
            1,
            EventKind::ResponseComplete {
                body: json!({
                    "model": "claude-3-5-sonnet-20241022",
                    "stop_reason": "end_turn",
                    "usage": {"input_tokens": 100, "output_tokens": 50, "cache_read_input_tokens": 20}
                }),
            },
        ))
        .unwrap();
        drop(tx);
        handle.await.unwrap();

        let latest = analytics.get_latest_turn_stats().await.unwrap();
        assert_eq!(latest.sequence_num, 1);
        assert_eq!(latest.input_tokens, 100);
        assert_eq!(latest.cache_read_tokens, 20);

        let stats = analytics.get_session_stats(None).await;
        assert_eq!(stats.input, 100);
        assert_eq!(stats.cache_read, 20);
    }

    #[tokio::test]
    async fn tool_use_and_result_are_correlated() {
        let analytics = Analytics::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(analytics.clone().run(rx));

        let request = json!({
            "model": "claude-3-5-sonnet-20241022",
            "messages": [
                {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "tu_1", "name": "read_file", "input": {"path": "a.rs"}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "tu_1", "content": "file contents here"}
                ]}
            ]
        });

        tx.send(body_event("req-1", 0, EventKind::RequestBody { body: request }))
            .unwrap();
        tx.send(body_event(
            "req-1",
            1,
            EventKind::ResponseComplete {
                body: json!({
                    "model": "claude-3-5-sonnet-20241022",
                    "stop_reason": "tool_use",
                    "usage": {"input_tokens": 100, "output_tokens": 50, "cache_read_input_tokens": 40}
                }),
            },
        ))
        .unwrap();
        drop(tx);
        handle.await.unwrap();

        let latest = analytics.get_latest_turn_stats().await.unwrap();
        assert_eq!(latest.tool_invocations.len(), 1);
        assert_eq!(latest.tool_invocations[0].name, "read_file");
        assert!(latest.tool_invocations[0].result_tokens > 0);

        let economics = analytics.get_tool_economics(false).await;
        assert_eq!(economics.len(), 1);
        assert_eq!(economics[0].name, "read_file");
        // sole invocation absorbs the whole turn's cache_read
        assert!((economics[0].cache_contrib - 40.0).abs() < 0.001);
    }

    #[test]
    fn timeline_computes_cache_percentage() {
        let mut state = AccumulatorState::new();
        state.turns.push(TurnRecord {
            sequence_num: 1,
            model: "claude-3-5-sonnet-20241022".to_string(),
            stop_reason: Some("end_turn".to_string()),
            input_tokens: 80,
            output_tokens: 10,
            cache_read_tokens: 20,
            cache_creation_tokens: 0,
            request_json: json!({}),
            tool_invocations: vec![],
        });

        let timeline = state.turn_timeline();
        assert_eq!(timeline[0].input_total, 100);
        assert!((timeline[0].cache_pct - 0.2).abs() < 0.0001);
    }

    #[test]
    fn unknown_model_falls_back_to_sonnet_cost() {
        let cost = compute_session_cost(1_000_000, 0, 0, 0, "some-unreleased-model");
        assert!((cost - 3.00).abs() < 0.0001);
    }

    #[tokio::test]
    async fn state_round_trips_ignoring_unknown_fields() {
        let analytics = Analytics::new();
        let mut persisted = analytics.get_state().await;
        persisted.turns.push(TurnRecord {
            sequence_num: 1,
            model: "claude-3-5-sonnet-20241022".to_string(),
            stop_reason: None,
            input_tokens: 10,
            output_tokens: 5,
            cache_read_tokens: 0,
            cache_creation_tokens: 0,
            request_json: json!({}),
            tool_invocations: vec![],
        });
        persisted.next_sequence = 2;

        let json = serde_json::to_value(&persisted).unwrap();
        let mut json = json;
        json["some_future_field_this_version_does_not_know"] = json!("ignored");
        let restored: PersistedState = serde_json::from_value(json).unwrap();

        analytics.restore_state(restored).await;
        let latest = analytics.get_latest_turn_stats().await.unwrap();
        assert_eq!(latest.sequence_num, 1);
    }
}
