//! Core proxy handler
//!
//! One function, [`handler`], processes every inbound connection regardless
//! of whether the proxy is running in reverse-proxy mode (client points
//! directly at us) or forward-proxy mode (client CONNECTs through us and we
//! terminate TLS ourselves via [`ca::CertificateAuthority`]). A CONNECT
//! request is upgraded to a raw socket, wrapped in a locally-minted TLS
//! server context, and re-entered as its own nested HTTP/1 connection that
//! runs the same per-request logic as the outer listener.

pub mod assembler;
pub mod ca;
pub(crate) mod error;
pub mod fanout;
pub(crate) mod helpers;
pub mod interceptor;
pub mod progress;
pub mod provider;
pub mod server;
pub mod state;
pub mod transformation;
pub mod translation;

use crate::events::{EventKind, PipelineEvent};
use crate::proxy::error::ProxyError;
use crate::proxy::fanout::{monotonic_now, StreamFanOut};
use crate::proxy::provider::PrepareError;
use crate::proxy::state::ProxyState;
use crate::proxy::transformation::{TransformContext, TransformResult};
use crate::proxy::translation::TranslationContext;
use crate::tokens;
use axum::{
    body::Body,
    extract::{Request, State},
    http::{HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures::StreamExt;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use serde_json::{json, Value};
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Upper bound on a request body we'll buffer in memory
const MAX_BODY_BYTES: usize = 50 * 1024 * 1024;

/// Entry point for every connection the outer listener accepts
pub async fn handler(State(state): State<ProxyState>, req: Request) -> Response {
    if req.method() == Method::CONNECT {
        return handle_connect(state, req).await;
    }
    process_request(&state, req, None).await
}

// ============================================================================
// CONNECT / forward-proxy TLS interception
// ============================================================================

/// Extract the bare host from a CONNECT request's authority-form target,
/// accepting a bracketed IPv6 literal and an optional trailing port.
fn connect_host(uri: &Uri) -> Option<String> {
    uri.authority().map(|authority| authority.host().to_string())
}

async fn handle_connect(state: ProxyState, req: Request) -> Response {
    let Some(host) = connect_host(req.uri()) else {
        return (StatusCode::BAD_REQUEST, "malformed CONNECT target").into_response();
    };

    let Some(ca) = state.ca.clone() else {
        tracing::debug!(host, "CONNECT received with no CA configured, replying 501");
        return StatusCode::NOT_IMPLEMENTED.into_response();
    };

    // Extracted before `req` is consumed - the upgrade only completes once
    // this response is written back to the client.
    let upgrade = hyper::upgrade::on(req);

    tokio::spawn(async move {
        let upgraded = match upgrade.await {
            Ok(upgraded) => upgraded,
            Err(err) => {
                tracing::warn!(error = %err, host, "CONNECT upgrade failed");
                return;
            }
        };

        let tls_config = match ca.ssl_context_for_host(&host) {
            Ok(cfg) => cfg,
            Err(err) => {
                tracing::warn!(error = %err, host, "minting leaf certificate failed");
                return;
            }
        };

        let acceptor = tokio_rustls::TlsAcceptor::from(tls_config);
        let tls_stream = match acceptor.accept(TokioIo::new(upgraded)).await {
            Ok(stream) => stream,
            Err(err) => {
                tracing::warn!(error = %err, host, "TLS handshake with tunneled client failed");
                return;
            }
        };

        let service = service_fn(move |req: hyper::Request<hyper::body::Incoming>| {
            let state = state.clone();
            let host = host.clone();
            async move {
                let (parts, body) = req.into_parts();
                let req = Request::from_parts(parts, Body::new(body));
                let response = process_request(&state, req, Some(&host)).await;
                Ok::<_, std::convert::Infallible>(response)
            }
        });

        if let Err(err) = hyper::server::conn::http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .serve_connection(TokioIo::new(tls_stream), service)
            .await
        {
            tracing::debug!(error = %err, host, "tunneled connection ended");
        }
    });

    // The reason phrase the CONNECT convention expects ("Connection
    // Established") isn't reachable through `http::response::Builder`; every
    // client that matters here only inspects the numeric 200.
    Response::builder()
        .status(StatusCode::OK)
        .body(Body::empty())
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

// ============================================================================
// Per-request processing
// ============================================================================

/// A small per-request sequence counter and event-bus handle
struct Emitter<'a> {
    state: &'a ProxyState,
    request_id: String,
    provider: String,
    seq: u32,
}

impl<'a> Emitter<'a> {
    fn emit(&mut self, kind: EventKind) {
        let event = PipelineEvent::new(
            self.request_id.clone(),
            self.seq,
            monotonic_now(),
            self.provider.clone(),
            kind,
        );
        self.seq += 1;
        self.state.events.publish(event);
    }
}

/// Process one request, in either reverse-proxy mode (`forward_target: None`)
/// or over a decrypted CONNECT tunnel (`forward_target: Some(host)`).
async fn process_request(state: &ProxyState, req: Request, forward_target: Option<&str>) -> Response {
    let request_id = uuid::Uuid::new_v4().to_string();
    let provider = forward_target
        .map(|host| state.provider_for_host(host).to_string())
        .unwrap_or_else(|| state.plugin.spec().key.to_string());

    let method = req.method().clone();
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());
    let request_headers = req.headers().clone();

    let mut emitter = Emitter {
        state,
        request_id: request_id.clone(),
        provider: provider.clone(),
        seq: 0,
    };

    let body_bytes = match axum::body::to_bytes(req.into_body(), MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(err) => {
            return ProxyError::MalformedBody(format!("failed to read request body: {err}"))
                .into_response()
        }
    };

    let expects_json = state.plugin.expects_json_body(&path);

    let body_value = if expects_json {
        match serde_json::from_slice::<Value>(&body_bytes) {
            Ok(value) => value,
            Err(err) => {
                return ProxyError::MalformedBody(format!("invalid JSON body: {err}")).into_response()
            }
        }
    } else {
        Value::Null
    };

    if expects_json {
        emitter.emit(EventKind::RequestHeaders {
            method: method.to_string(),
            path: path.clone(),
            headers: helpers::headers_to_map(&strip_hop_by_hop(&request_headers)),
        });
        emitter.emit(EventKind::RequestBody {
            body: body_value.clone(),
        });
    }

    // Request pipeline: transformation, then interception
    let body_value = if expects_json {
        let model_name = body_value.get("model").and_then(|v| v.as_str());
        let transform_ctx = TransformContext::new(None, &path, model_name);
        match state.transformation.transform(&body_value, &transform_ctx) {
            TransformResult::Unchanged => body_value,
            TransformResult::Modified { body, .. } => body,
            TransformResult::Block { reason, status } => {
                emitter.emit(EventKind::Log {
                    method: method.to_string(),
                    path: path.clone(),
                    status: status.as_u16(),
                });
                return blocked_response(status, &reason);
            }
            TransformResult::Error(_) => body_value,
        }
    } else {
        body_value
    };

    if expects_json {
        if let Some(text) = state.interceptors.run(&body_value) {
            return synthetic_response(&mut emitter, &method, &path, &body_value, &text);
        }
    }

    let outbound_body = if expects_json {
        match serde_json::to_vec(&body_value) {
            Ok(bytes) => bytes,
            Err(err) => {
                return ProxyError::MalformedBody(format!("failed to re-serialize body: {err}"))
                    .into_response()
            }
        }
    } else {
        body_bytes.to_vec()
    };

    let prepared = match state
        .plugin
        .prepare_request(&path, &request_headers, &outbound_body)
        .await
    {
        Ok(prepared) => prepared,
        Err(PrepareError::Translation(msg)) => return ProxyError::MalformedBody(msg).into_response(),
        Err(PrepareError::RateLimited { retry_after_secs }) => {
            emitter.emit(EventKind::Error {
                code: 429,
                reason: "rate limited".to_string(),
            });
            return ProxyError::RateLimited { retry_after_secs }.into_response();
        }
    };

    // Providers that service a request entirely from local state (the
    // Copilot token-count estimator) signal this with an empty URL and are
    // never dispatched upstream.
    if prepared.url.is_empty() {
        return serve_locally(&mut emitter, &method, &path, &body_value);
    }

    let effective_url = match forward_target {
        Some(host) => rewrite_authority(&prepared.url, host),
        None => prepared.url.clone(),
    };

    let outbound_headers = strip_hop_by_hop(&prepared.headers);

    let response = state
        .client
        .request(method.clone(), &effective_url)
        .headers(outbound_headers)
        .body(prepared.body)
        .send()
        .await;

    let response = match response {
        Ok(response) => response,
        Err(err) => {
            emitter.emit(EventKind::ProxyError {
                error: err.to_string(),
            });
            emitter.emit(EventKind::Log {
                method: method.to_string(),
                path: path.clone(),
                status: StatusCode::BAD_GATEWAY.as_u16(),
            });
            return ProxyError::Transport(err.to_string()).into_response();
        }
    };

    let status = response.status();
    let response_headers = strip_hop_by_hop(response.headers());

    if !status.is_success() {
        let body = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(err) => {
                emitter.emit(EventKind::ProxyError {
                    error: err.to_string(),
                });
                return ProxyError::Transport(err.to_string()).into_response();
            }
        };

        let translated = state
            .plugin
            .translation()
            .translate_buffered_response(&body, &prepared.translation_ctx)
            .unwrap_or_else(|_| body.to_vec());

        if expects_json {
            let reason = serde_json::from_slice::<Value>(&translated)
                .ok()
                .and_then(|v| {
                    v.get("error")
                        .and_then(|e| e.get("message"))
                        .and_then(|m| m.as_str())
                        .map(String::from)
                })
                .unwrap_or_else(|| format!("upstream returned status {}", status.as_u16()));
            emitter.emit(EventKind::Error {
                code: status.as_u16(),
                reason,
            });
        }
        emitter.emit(EventKind::Log {
            method: method.to_string(),
            path: path.clone(),
            status: status.as_u16(),
        });

        let mut builder = Response::builder().status(status);
        for (name, value) in response_headers.iter() {
            builder = builder.header(name, value);
        }
        return builder.body(Body::from(translated)).unwrap_or_else(|_| {
            ProxyError::ResponseBuild("failed to build response".to_string()).into_response()
        });
    }

    let is_streaming = response_headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("text/event-stream"))
        .unwrap_or(false);

    emitter.emit(EventKind::ResponseHeaders {
        status: status.as_u16(),
        headers: helpers::reqwest_headers_to_map(&response_headers),
    });

    if is_streaming {
        stream_response(
            state,
            emitter,
            method,
            path,
            response,
            status,
            prepared.translation_ctx,
            response_headers,
        )
    } else {
        buffered_response(
            state,
            emitter,
            method,
            path,
            response,
            status,
            prepared.translation_ctx,
            response_headers,
        )
        .await
    }
}

/// Non-streaming upstream response: buffer fully, translate, forward verbatim
async fn buffered_response(
    state: &ProxyState,
    mut emitter: Emitter<'_>,
    method: Method,
    path: String,
    response: reqwest::Response,
    status: StatusCode,
    translation_ctx: TranslationContext,
    response_headers: HeaderMap,
) -> Response {
    let body = match response.bytes().await {
        Ok(bytes) => bytes,
        Err(err) => {
            emitter.emit(EventKind::ProxyError {
                error: err.to_string(),
            });
            return ProxyError::Transport(err.to_string()).into_response();
        }
    };

    let translated = state
        .plugin
        .translation()
        .translate_buffered_response(&body, &translation_ctx)
        .unwrap_or_else(|_| body.to_vec());

    let event_body = serde_json::from_slice::<Value>(&translated)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&translated).to_string()));
    emitter.emit(EventKind::ResponseComplete { body: event_body });
    emitter.emit(EventKind::ResponseDone {});
    emitter.emit(EventKind::Log {
        method: method.to_string(),
        path,
        status: status.as_u16(),
    });

    let mut builder = Response::builder().status(status);
    for (name, value) in response_headers.iter() {
        builder = builder.header(name, value);
    }
    builder.body(Body::from(translated)).unwrap_or_else(|_| {
        ProxyError::ResponseBuild("failed to build response".to_string()).into_response()
    })
}

/// Streaming (SSE) upstream response: fan each translated chunk out to the
/// client, the progress/assembler machinery, and the event bus at once.
/// The forwarding work (and the event emission it produces) continues in a
/// spawned task; this function only has to hand back the client-facing body.
fn stream_response(
    state: &ProxyState,
    emitter: Emitter<'_>,
    method: Method,
    path: String,
    response: reqwest::Response,
    status: StatusCode,
    mut translation_ctx: TranslationContext,
    response_headers: HeaderMap,
) -> Response {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<Result<Bytes, std::io::Error>>();
    let events = state.events.clone();
    let plugin = state.plugin.clone();
    let request_id = emitter.request_id.clone();
    let provider = emitter.provider.clone();
    let next_seq = emitter.seq;

    tokio::spawn(async move {
        let mut fanout = StreamFanOut::new(request_id.clone(), provider.clone(), next_seq);
        let mut emitted = 0u32;
        let mut upstream = response.bytes_stream();

        while let Some(chunk_result) = upstream.next().await {
            let chunk = match chunk_result {
                Ok(chunk) => chunk,
                Err(err) => {
                    tracing::warn!(error = %err, "upstream stream read failed");
                    break;
                }
            };

            let translated = match plugin
                .translation()
                .translate_response_chunk(&chunk, &mut translation_ctx)
            {
                Ok(bytes) => bytes,
                Err(err) => {
                    tracing::warn!(error = %err, "response chunk translation failed");
                    continue;
                }
            };

            let (forward_bytes, chunk_events) = fanout.on_chunk(&translated);
            emitted += chunk_events.len() as u32;
            for event in chunk_events {
                events.publish(event);
            }
            if tx.send(Ok(Bytes::from(forward_bytes))).is_err() {
                break;
            }
        }

        if let Some(final_bytes) = plugin.translation().finalize_response(&translation_ctx) {
            let (forward_bytes, chunk_events) = fanout.on_chunk(&final_bytes);
            emitted += chunk_events.len() as u32;
            for event in chunk_events {
                events.publish(event);
            }
            let _ = tx.send(Ok(Bytes::from(forward_bytes)));
        }

        let final_events = fanout.finish();
        emitted += final_events.len() as u32;
        for event in final_events {
            events.publish(event);
        }

        let log_event = PipelineEvent::new(
            request_id,
            next_seq + emitted,
            monotonic_now(),
            provider,
            EventKind::Log {
                method: method.to_string(),
                path,
                status: status.as_u16(),
            },
        );
        events.publish(log_event);
    });

    let body_stream = UnboundedReceiverStream::new(rx);
    let mut builder = Response::builder().status(status);
    for (name, value) in response_headers.iter() {
        builder = builder.header(name, value);
    }
    builder.body(Body::from_stream(body_stream)).unwrap_or_else(|_| {
        ProxyError::ResponseBuild("failed to build streaming response".to_string()).into_response()
    })
}

/// Build the Anthropic-shaped error body for a transformer `Block` result
fn blocked_response(status: StatusCode, reason: &str) -> Response {
    let body = json!({
        "type": "error",
        "error": { "type": "invalid_request_error", "message": reason },
    });
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Build the literal Anthropic SSE frames for an interceptor short-circuit:
/// `message_start -> content_block_start -> content_block_delta(text_delta)
/// -> content_block_stop -> message_delta(end_turn) -> message_stop -> [DONE]`
fn build_synthetic_sse(message_id: &str, model: &str, text: &str, input_tokens: u32, output_tokens: u32) -> String {
    let frames = [
        (
            "message_start",
            json!({
                "type": "message_start",
                "message": {
                    "id": message_id,
                    "type": "message",
                    "role": "assistant",
                    "model": model,
                    "content": [],
                    "stop_reason": null,
                    "stop_sequence": null,
                    "usage": { "input_tokens": input_tokens, "output_tokens": 0 },
                },
            }),
        ),
        (
            "content_block_start",
            json!({
                "type": "content_block_start",
                "index": 0,
                "content_block": { "type": "text", "text": "" },
            }),
        ),
        (
            "content_block_delta",
            json!({
                "type": "content_block_delta",
                "index": 0,
                "delta": { "type": "text_delta", "text": text },
            }),
        ),
        (
            "content_block_stop",
            json!({ "type": "content_block_stop", "index": 0 }),
        ),
        (
            "message_delta",
            json!({
                "type": "message_delta",
                "delta": { "stop_reason": "end_turn", "stop_sequence": null },
                "usage": { "output_tokens": output_tokens },
            }),
        ),
        ("message_stop", json!({ "type": "message_stop" })),
    ];

    let mut sse = String::new();
    for (event_type, payload) in frames {
        sse.push_str(&format!("event: {event_type}\ndata: {payload}\n\n"));
    }
    sse.push_str("data: [DONE]\n\n");
    sse
}

/// Build a synthetic Anthropic SSE stream from an interceptor's text, without
/// ever contacting upstream, and drive it through the same `StreamFanOut`
/// that real upstream streams use - so the event bus sees the same
/// `ResponseProgress`/`ResponseComplete`/`ResponseDone` shape either way.
fn synthetic_response(
    emitter: &mut Emitter<'_>,
    method: &Method,
    path: &str,
    request_body: &Value,
    text: &str,
) -> Response {
    let model = request_body
        .get("model")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string();
    let input_tokens = tokens::estimate_json_tokens(request_body);
    let output_tokens = tokens::estimate_tokens(text);
    let message_id = format!("msg_{}", uuid::Uuid::new_v4());

    let sse = build_synthetic_sse(&message_id, &model, text, input_tokens, output_tokens);

    emitter.emit(EventKind::ResponseHeaders {
        status: 200,
        headers: std::collections::HashMap::from([(
            "content-type".to_string(),
            "text/event-stream".to_string(),
        )]),
    });

    let mut fanout = StreamFanOut::new(emitter.request_id.clone(), emitter.provider.clone(), emitter.seq);
    let (_, chunk_events) = fanout.on_chunk(sse.as_bytes());
    emitter.seq += chunk_events.len() as u32;
    for event in chunk_events {
        emitter.state.events.publish(event);
    }
    let final_events = fanout.finish();
    emitter.seq += final_events.len() as u32;
    for event in final_events {
        emitter.state.events.publish(event);
    }

    emitter.emit(EventKind::Log {
        method: method.to_string(),
        path: path.to_string(),
        status: 200,
    });

    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .body(Body::from(sse))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Serve the Copilot token-count endpoint locally, from the estimator
fn serve_locally(emitter: &mut Emitter<'_>, method: &Method, path: &str, body: &Value) -> Response {
    let input_tokens = tokens::estimate_json_tokens(body);
    let response_body = json!({ "input_tokens": input_tokens });

    emitter.emit(EventKind::ResponseHeaders {
        status: 200,
        headers: std::collections::HashMap::from([(
            "content-type".to_string(),
            "application/json".to_string(),
        )]),
    });
    emitter.emit(EventKind::ResponseComplete {
        body: response_body.clone(),
    });
    emitter.emit(EventKind::ResponseDone {});
    emitter.emit(EventKind::Log {
        method: method.to_string(),
        path: path.to_string(),
        status: 200,
    });

    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json")
        .body(Body::from(response_body.to_string()))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Strip hop-by-hop headers from a header map before forwarding it across
/// the proxy boundary, in either direction
fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers.iter() {
        if !helpers::is_hop_by_hop_header(name.as_str()) {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

/// Replace a prepared upstream URL's authority with the literal CONNECT
/// target, preserving whatever path the plugin rewrote the request to
fn rewrite_authority(url: &str, host: &str) -> String {
    match url.parse::<Uri>() {
        Ok(parsed) => {
            let path_and_query = parsed
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or("/");
            format!("https://{host}{path_and_query}")
        }
        Err(_) => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_host_extracts_bare_host() {
        let uri: Uri = "api.anthropic.com:443".parse().unwrap();
        assert_eq!(connect_host(&uri).as_deref(), Some("api.anthropic.com"));
    }

    #[test]
    fn connect_host_rejects_path_only_uri() {
        let uri: Uri = "/v1/messages".parse().unwrap();
        assert_eq!(connect_host(&uri), None);
    }

    #[test]
    fn rewrite_authority_preserves_path() {
        let rewritten = rewrite_authority("https://api.githubcopilot.com/chat/completions", "proxy.local");
        assert_eq!(rewritten, "https://proxy.local/chat/completions");
    }

    #[test]
    fn strip_hop_by_hop_drops_connection_header() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", "keep-alive".parse().unwrap());
        headers.insert("content-type", "application/json".parse().unwrap());
        let stripped = strip_hop_by_hop(&headers);
        assert!(stripped.get("connection").is_none());
        assert!(stripped.get("content-type").is_some());
    }
}
