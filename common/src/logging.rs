//! Structured logging initialization
//!
//! Provides consistent logging initialization across all db-ensure components.

use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Guard that keeps the tracing subscriber active.
/// Drop this at the end of main to flush logs.
pub struct LogGuard;

/// Initialize structured logging for a component.
///
/// Logs go to stderr so they never interleave with a tool's report on stdout.
/// `RUST_LOG` takes precedence over `default_level`.
///
/// # Example
/// ```ignore
/// let _guard = init_logging("ensure-db", tracing::Level::WARN);
/// warn!("Something looks off");
/// ```
pub fn init_logging(component: &str, default_level: Level) -> LogGuard {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.as_str().to_lowercase()));

    let format = fmt::layer().with_target(false).with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(filter)
        .with(format)
        .init();

    tracing::debug!(component, "Logging initialized");

    LogGuard
}
