//! Logging setup for embedders.
//!
//! Honors `RUST_LOG` when set, otherwise the configured level. Output is
//! pretty or json per config, optionally teed to a file via a non-blocking
//! appender. Returns the appender guard; dropping it flushes and stops the
//! background writer.

use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;

/// Timestamps log lines as "YYYY-MM-DD HH:MM:SS.mmm [hostname]".
struct HostTimer {
    hostname: String,
}

impl HostTimer {
    fn new() -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());
        let short = hostname.split('.').next().unwrap_or(&hostname).to_string();
        Self { hostname: short }
    }
}

impl fmt::time::FormatTime for HostTimer {
    fn format_time(&self, w: &mut fmt::format::Writer<'_>) -> std::fmt::Result {
        use chrono::Utc;
        let now = Utc::now();
        write!(
            w,
            "{}.{:03} [{}]",
            now.format("%Y-%m-%d %H:%M:%S"),
            now.timestamp_subsec_millis(),
            self.hostname
        )
    }
}

/// Initialize the global subscriber. Call once per process.
pub fn init(config: &LoggingConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    let mut guard = None;

    match (config.format.as_str(), &config.file) {
        ("json", Some(path)) => {
            let (writer, g) = file_writer(path);
            guard = Some(g);
            fmt()
                .json()
                .with_env_filter(filter)
                .with_writer(writer)
                .init();
        }
        ("json", None) => {
            fmt().json().with_env_filter(filter).init();
        }
        (_, Some(path)) => {
            let (writer, g) = file_writer(path);
            guard = Some(g);
            fmt()
                .with_env_filter(filter)
                .with_timer(HostTimer::new())
                .with_ansi(false)
                .with_writer(writer)
                .init();
        }
        (_, None) => {
            fmt()
                .with_env_filter(filter)
                .with_timer(HostTimer::new())
                .init();
        }
    }

    guard
}

fn file_writer(
    path: &str,
) -> (
    tracing_appender::non_blocking::NonBlocking,
    tracing_appender::non_blocking::WorkerGuard,
) {
    let path = std::path::Path::new(path);
    let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
    let file = path
        .file_name()
        .map(|f| f.to_string_lossy().to_string())
        .unwrap_or_else(|| "reclaim.log".to_string());
    tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file))
}
