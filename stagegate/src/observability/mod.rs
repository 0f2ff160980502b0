//! Logging setup and spans.
//!
//! Logs go to stderr so dry-run scripts on stdout stay clean. The filter is
//! taken from `RUST_LOG` and defaults to `info`.

use tracing::{info_span, Span};
use tracing_subscriber::EnvFilter;

/// Installs the global subscriber. Later calls are no-ops.
pub fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    // A second init (tests, embedding) keeps the first subscriber.
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

/// Span wrapping one coordinator invocation for a stage instance.
#[must_use]
pub fn stage_span(pool: &str, stage: &str) -> Span {
    info_span!("stage", pool, stage)
}
