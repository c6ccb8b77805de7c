//! Structured logging setup
//!
//! Headless equivalent of the teacher's TUI-routed logging: the same
//! `tracing` + `tracing-subscriber` stack, wired with `EnvFilter` so
//! `RUST_LOG` controls verbosity, but writing straight to stderr instead of
//! an in-memory ring buffer a terminal UI would drain. There is no TUI here,
//! so there's nothing to protect from a garbled alternate screen buffer.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global tracing subscriber.
///
/// Honors `RUST_LOG`; defaults to `info` for this crate and `warn` for
/// dependencies when unset.
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,hyper=warn,reqwest=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true).compact())
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_is_constructible() {
        // Smoke test: building the fallback filter doesn't panic.
        let _ = EnvFilter::new("info,hyper=warn,reqwest=warn");
        let _ = init;
    }
}
