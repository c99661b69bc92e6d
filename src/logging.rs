//! Structured logging backed by `tracing`.
//!
//! One global subscriber: level filter, a stdout layer and, when the log
//! directory is writable, a daily-rotated file under the user data directory.

use std::path::PathBuf;
use std::sync::{Once, OnceLock};

use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_FILE: &str = "dashboard.log";

static INIT_LOGGING: Once = Once::new();
static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

pub fn resolve_log_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("cv-trace-dashboard")
        .join("logs")
}

/// `RUST_LOG` wins, then `DASHBOARD_LOG_LEVEL`, then `info`.
fn level_filter() -> EnvFilter {
    let fallback = std::env::var("DASHBOARD_LOG_LEVEL").unwrap_or_else(|_| "info".into());
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&fallback))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

pub fn init_logging() {
    INIT_LOGGING.call_once(|| {
        let log_dir = resolve_log_dir();
        let writer = std::fs::create_dir_all(&log_dir).map(|_| {
            let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(&log_dir, LOG_FILE));
            LOG_GUARD.set(guard).ok();
            writer
        });
        let sink_error = writer.as_ref().err().map(ToString::to_string);
        let file_layer = writer
            .ok()
            .map(|w| fmt::layer().with_ansi(false).with_timer(UtcTime::rfc_3339()).with_writer(w));

        tracing_subscriber::registry()
            .with(level_filter())
            .with(fmt::layer().with_timer(UtcTime::rfc_3339()))
            .with(file_layer)
            .init();

        match sink_error {
            None => info!("Logging to stdout and {} (rotated daily)", log_dir.join(LOG_FILE).display()),
            Some(err) => warn!("Log directory {} unusable ({}), logging to stdout only", log_dir.display(), err),
        }
    });
}

/// Loggable form of a configuration value. Credentials are reduced to their
/// length so nothing of them reaches the log files.
pub fn redact(key: &str, value: &str) -> String {
    let upper = key.to_ascii_uppercase();
    let len = value.chars().count();
    if upper.contains("JSON") {
        format!("{} characters", len)
    } else if ["SECRET", "PASSWORD", "TOKEN", "KEY"].iter().any(|m| upper.contains(m)) {
        format!("<redacted, {} characters>", len)
    } else if len > 20 {
        format!("{}...", value.chars().take(20).collect::<String>())
    } else {
        value.to_string()
    }
}
