//! Development and operations logging for the agent.
//!
//! Two channels with separate jobs:
//!
//! - **Tracing (this module)**: leveled diagnostics to stderr, filtered by
//!   the configured `log_level` and overridable via `RUST_LOG`.
//! - **Activity log (`pipeline::activity`)**: the human-facing, emoji-marked
//!   record of what the agent did, unaffected by the filter here.

use crate::config::LogLevel;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// `RUST_LOG` wins when set; otherwise the configured level applies to the
/// whole crate. Safe to call once per process.
pub fn init(level: LogLevel) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("argus={}", level.as_str())));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
