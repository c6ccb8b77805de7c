//! Request interceptors - the second half of the request pipeline
//!
//! Interceptors run after transforms (see `proxy::transformation`) and may
//! short-circuit the request entirely: if one returns `Some(text)`, that text
//! becomes a synthetic Anthropic-format streamed response and upstream is
//! never contacted. The first `Some` wins; later interceptors don't run.

use serde_json::Value;

/// A single request interceptor
///
/// Given the (already-transformed) request body, decide whether to short-circuit
/// the request with synthetic response text.
pub trait Interceptor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Return `Some(text)` to short-circuit with that text as the assistant's
    /// reply; `None` to let the request continue through the pipeline.
    fn intercept(&self, body: &Value) -> Option<String>;
}

/// Ordered chain of interceptors
///
/// Carries no built-in interceptors; `enabled` is a master kill-switch and
/// callers register whatever interceptors the deployment needs via `register()`.
pub struct InterceptorPipeline {
    interceptors: Vec<Box<dyn Interceptor>>,
    enabled: bool,
}

impl InterceptorPipeline {
    pub fn new() -> Self {
        Self {
            interceptors: Vec::new(),
            enabled: true,
        }
    }

    pub fn from_config(enabled: bool) -> Self {
        if !enabled {
            tracing::debug!("Request interceptor pipeline disabled");
        }
        Self {
            interceptors: Vec::new(),
            enabled,
        }
    }

    pub fn register(&mut self, interceptor: impl Interceptor + 'static) {
        tracing::debug!("Registered interceptor: {}", interceptor.name());
        self.interceptors.push(Box::new(interceptor));
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    /// Run the chain; the first interceptor to return `Some` wins and no
    /// further interceptors are consulted.
    pub fn run(&self, body: &Value) -> Option<String> {
        if !self.enabled {
            return None;
        }
        for interceptor in &self.interceptors {
            if let Some(text) = interceptor.intercept(body) {
                tracing::debug!("Request intercepted by {}", interceptor.name());
                return Some(text);
            }
        }
        None
    }
}

impl Default for InterceptorPipeline {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysBlock;
    impl Interceptor for AlwaysBlock {
        fn name(&self) -> &'static str {
            "always-block"
        }
        fn intercept(&self, _body: &Value) -> Option<String> {
            Some("policy-block".to_string())
        }
    }

    struct NeverIntercepts;
    impl Interceptor for NeverIntercepts {
        fn name(&self) -> &'static str {
            "never"
        }
        fn intercept(&self, _body: &Value) -> Option<String> {
            None
        }
    }

    #[test]
    fn empty_pipeline_never_intercepts() {
        let pipeline = InterceptorPipeline::new();
        assert_eq!(pipeline.run(&serde_json::json!({})), None);
    }

    #[test]
    fn first_match_wins() {
        let mut pipeline = InterceptorPipeline::new();
        pipeline.register(NeverIntercepts);
        pipeline.register(AlwaysBlock);
        assert_eq!(
            pipeline.run(&serde_json::json!({})),
            Some("policy-block".to_string())
        );
    }

    #[test]
    fn disabled_pipeline_skips_registered_interceptors() {
        let mut pipeline = InterceptorPipeline::from_config(false);
        pipeline.register(AlwaysBlock);
        assert_eq!(pipeline.run(&serde_json::json!({})), None);
    }
}
