//! Header and body helpers shared by the proxy handler and provider plugins

use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Header names that carry credentials and must never be forwarded verbatim
/// to a different provider than the one the client authenticated against
pub(crate) fn is_auth_header(name: &str) -> bool {
    let lower = name.to_lowercase();
    lower == "authorization" || lower == "x-api-key"
}

/// Anthropic-specific headers that should be stripped when forwarding to a
/// non-Anthropic backend (e.g. the Copilot plugin's OpenAI-speaking endpoint)
pub(crate) fn is_anthropic_header(name: &str) -> bool {
    let lower = name.to_lowercase();
    lower.starts_with("anthropic-") || lower == "x-stainless-lang" || lower == "x-stainless-arch"
}

/// Hop-by-hop headers that must never be forwarded upstream or downstream
pub(crate) fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
            | "host"
    )
}

/// Hash an API key or bearer token for correlation without logging the secret
pub(crate) fn hash_credential(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    let hash = hasher.finalize();
    format!("{:x}", hash)[..16].to_string()
}

/// Flatten an axum `HeaderMap` into a plain string map for event payloads
pub(crate) fn headers_to_map(headers: &axum::http::HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

/// Flatten a reqwest `HeaderMap` into a plain string map for event payloads
pub(crate) fn reqwest_headers_to_map(headers: &reqwest::header::HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_headers_detected_case_insensitively() {
        assert!(is_auth_header("X-Api-Key"));
        assert!(is_auth_header("AUTHORIZATION"));
        assert!(!is_auth_header("content-type"));
    }

    #[test]
    fn anthropic_headers_detected() {
        assert!(is_anthropic_header("anthropic-version"));
        assert!(is_anthropic_header("anthropic-beta"));
        assert!(!is_anthropic_header("x-api-key"));
    }

    #[test]
    fn hop_by_hop_headers_detected() {
        assert!(is_hop_by_hop_header("Connection"));
        assert!(is_hop_by_hop_header("Host"));
        assert!(!is_hop_by_hop_header("content-type"));
    }
}
