//! Structured logging with `tracing`.
//!
//! - [`init_subscriber`] installs a human-readable stderr subscriber
//! - [`init_json_subscriber`] installs a JSON-lines stderr subscriber
//! - [`capture_logs`] records events in memory for test assertions
//!
//! Job-level failures are reported to listeners, not logged as errors; the
//! client logs wire traffic at `debug`, lifecycle at `info`, and best-effort
//! failures (reset calls, dropped messages) at `warn`.

mod capture;

pub use capture::{CapturedEvent, CapturedLogs, capture_logs};

use tracing_subscriber::EnvFilter;

fn filter_for(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Initialize the global tracing subscriber with compact stderr output.
///
/// `RUST_LOG` takes precedence over `level`. Subsequent calls are no-ops.
pub fn init_subscriber(level: &str) {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter_for(level))
        .with_target(true)
        .with_writer(std::io::stderr)
        .compact();

    // try_init fails if a global subscriber is already set
    let _ = subscriber.try_init();
}

/// Initialize the global tracing subscriber with JSON-lines stderr output.
pub fn init_json_subscriber(level: &str) {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter_for(level))
        .with_writer(std::io::stderr)
        .json();

    let _ = subscriber.try_init();
}
