//! Structured file logging for the server process.

use std::time::{SystemTime, UNIX_EPOCH};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, LogOptions};

const DEFAULT_FILTER: &str = "info,tower_http=warn,hyper=warn";
const LOG_FILE: &str = "server.log";

pub struct LoggingHandle {
    pub run_id: String,
    /// Flushes buffered lines when dropped; hold it for the process lifetime.
    pub guard: WorkerGuard,
}

/// Install the global subscriber writing to `<options.dir>/server.log`.
pub fn init_logging(options: &LogOptions) -> anyhow::Result<LoggingHandle> {
    std::fs::create_dir_all(&options.dir)?;
    let log_path = options.dir.join(LOG_FILE);

    if options.truncate_on_start {
        std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&log_path)?;
    }

    let requested = options
        .filter
        .clone()
        .or_else(|| std::env::var("RUST_LOG").ok());
    let (filter, directives) = resolve_filter(requested.as_deref());

    let file_appender = tracing_appender::rolling::never(&options.dir, LOG_FILE);
    let (writer, guard) = tracing_appender::non_blocking(file_appender);

    let registry = tracing_subscriber::registry().with(filter);
    match options.format {
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .pretty()
                    .with_file(true)
                    .with_line_number(true)
                    .with_target(true),
            )
            .try_init()?,
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .with_writer(writer)
                    .json()
                    .flatten_event(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_target(true)
                    .with_current_span(true),
            )
            .try_init()?,
    }

    let run_id = options.run_id.clone().unwrap_or_else(generated_run_id);

    tracing::info!(
        component = "logging",
        event = "logging.initialized",
        log_path = %log_path.display(),
        format = ?options.format,
        filter = %directives,
        run_id = %run_id,
    );

    Ok(LoggingHandle { run_id, guard })
}

/// Parse the requested directives, falling back to the default set when
/// they are missing or invalid. Returns the directives actually in effect.
fn resolve_filter(requested: Option<&str>) -> (EnvFilter, String) {
    if let Some(directives) = requested {
        if let Ok(filter) = EnvFilter::try_new(directives) {
            return (filter, directives.to_string());
        }
    }
    (EnvFilter::new(DEFAULT_FILTER), DEFAULT_FILTER.to_string())
}

fn generated_run_id() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    format!("pid-{}-{}", std::process::id(), now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_directives_are_kept() {
        let (_, directives) = resolve_filter(Some("debug,hyper=warn"));
        assert_eq!(directives, "debug,hyper=warn");
    }

    #[test]
    fn invalid_or_missing_directives_use_default() {
        assert_eq!(resolve_filter(Some("info,campusdock=loud")).1, DEFAULT_FILTER);
        assert_eq!(resolve_filter(None).1, DEFAULT_FILTER);
    }

    #[test]
    fn generated_run_id_names_this_process() {
        let id = generated_run_id();
        assert!(id.starts_with(&format!("pid-{}-", std::process::id())));
    }
}
