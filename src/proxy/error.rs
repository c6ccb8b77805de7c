//! Proxy error types and response handling
//!
//! Covers the per-request error taxonomy: everything here maps to a client
//! HTTP response shaped like an Anthropic API error (`{"type":"error","error":
//! {"type":..,"message":..}}`), because that's the only error shape the
//! client (which always speaks Anthropic Messages) knows how to parse.
//! Startup-time failures (bad config, unreadable CA files, a taken bind
//! address) are a separate, unrelated path - they propagate as
//! `anyhow::Result` out of `main` and never construct a `ProxyError`.

use axum::{
    body::Body,
    http::{HeaderValue, Response, StatusCode},
    response::IntoResponse,
};
use serde_json::json;

/// Per-request failures the proxy handler can produce.
#[derive(Debug)]
pub(crate) enum ProxyError {
    /// Connect refused, DNS failure, upstream TLS handshake failure, or a
    /// write that failed because the client socket was dropped.
    Transport(String),
    /// A plugin could not resolve credentials for its upstream.
    Auth(String),
    /// A plugin's rate limiter rejected this call outright.
    RateLimited { retry_after_secs: u64 },
    /// The request body was required to be JSON and wasn't, or was missing
    /// fields the active provider plugin needed.
    MalformedBody(String),
    /// Failed to build the outgoing `Response` itself - should not happen
    /// in practice, kept as a defensive fallback.
    ResponseBuild(String),
}

impl ProxyError {
    fn status_and_kind(&self) -> (StatusCode, &'static str) {
        match self {
            ProxyError::Transport(_) => (StatusCode::BAD_GATEWAY, "api_error"),
            ProxyError::Auth(_) => (StatusCode::UNAUTHORIZED, "authentication_error"),
            ProxyError::RateLimited { .. } => (StatusCode::TOO_MANY_REQUESTS, "rate_limit_error"),
            ProxyError::MalformedBody(_) => (StatusCode::BAD_REQUEST, "invalid_request_error"),
            ProxyError::ResponseBuild(_) => (StatusCode::INTERNAL_SERVER_ERROR, "api_error"),
        }
    }

    fn message(&self) -> String {
        match self {
            ProxyError::Transport(msg)
            | ProxyError::Auth(msg)
            | ProxyError::MalformedBody(msg)
            | ProxyError::ResponseBuild(msg) => msg.clone(),
            ProxyError::RateLimited { retry_after_secs } => {
                format!("rate limited, retry after {retry_after_secs}s")
            }
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response<Body> {
        let (status, kind) = self.status_and_kind();
        let message = self.message();
        let retry_after = match &self {
            ProxyError::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        };

        tracing::error!(status = %status, kind, "proxy error: {message}");

        let body = json!({
            "type": "error",
            "error": { "type": kind, "message": message },
        });

        let mut builder = Response::builder().status(status);
        if let Some(secs) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                builder = builder.header("retry-after", value);
            }
        }

        builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap_or_else(|_| Response::new(Body::from("internal error building error response")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_sets_retry_after_header() {
        let response = ProxyError::RateLimited { retry_after_secs: 5 }.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get("retry-after").unwrap(), "5");
    }

    #[test]
    fn auth_failure_maps_to_401() {
        let response = ProxyError::Auth("no token".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn transport_failure_maps_to_502() {
        let response = ProxyError::Transport("connection refused".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn malformed_body_maps_to_400() {
        let response = ProxyError::MalformedBody("not json".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
