//! Tracing initialisation for stanrun binaries.
//!
//! Call [`init_tracing`] once at program start. Later calls are ignored
//! because the global subscriber can only be set once per process.
//!
//! Filtering is resolved in this order:
//!
//! * `STANRUN_LOG`, for settings that should not leak into other tools
//!   sharing the same shell (e.g. `STANRUN_LOG=stanrun_core=debug`);
//! * `RUST_LOG`;
//! * the `level` passed by the caller.
//!
//! Logs always go to stderr. Stdout belongs to command output such as the
//! JSON summaries printed by `stanrun run`.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable checked before `RUST_LOG`.
pub const LOG_ENV: &str = "STANRUN_LOG";

/// Initialise the global tracing subscriber.
///
/// * `json`: emit newline-delimited JSON log lines instead of text.
/// * `level`: verbosity when neither `STANRUN_LOG` nor `RUST_LOG` is set.
pub fn init_tracing(json: bool, level: Level) {
    let directives = std::env::var(LOG_ENV)
        .or_else(|_| std::env::var(EnvFilter::DEFAULT_ENV))
        .ok();
    let filter = build_filter(directives.as_deref(), level);

    let json_layer = json.then(|| {
        fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .json()
    });
    let text_layer = (!json).then(|| {
        fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .try_init()
        .ok();
}

/// Parse `directives`, falling back to `level` when they are absent or
/// malformed.
fn build_filter(directives: Option<&str>, level: Level) -> EnvFilter {
    directives
        .filter(|d| !d.trim().is_empty())
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new(level.as_str()))
}
