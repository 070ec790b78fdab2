use crate::config::AppConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

fn file_appender(config: &AppConfig) -> RollingFileAppender {
    match config.rotation.as_str() {
        "hourly" => tracing_appender::rolling::hourly(&config.log_dir, &config.log_file),
        "daily" => tracing_appender::rolling::daily(&config.log_dir, &config.log_file),
        _ => tracing_appender::rolling::never(&config.log_dir, &config.log_file),
    }
}

/// Install the global subscriber
///
/// An empty `log_dir` logs to stdout only. Otherwise logs go to a rolling
/// file (plus coloured stdout in text mode) and the returned guard must be
/// kept alive until exit so buffered lines are flushed.
pub fn init_logging(config: &AppConfig) -> Option<WorkerGuard> {
    // RUST_LOG wins; sqlx logs every statement at info
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},sqlx=warn", config.log_level)));

    let registry = tracing_subscriber::registry().with(filter);

    if config.log_dir.is_empty() {
        if config.use_json {
            registry.with(fmt::layer().json().with_target(true)).init();
        } else {
            registry.with(fmt::layer().with_target(false)).init();
        }
        return None;
    }

    let (writer, guard) = tracing_appender::non_blocking(file_appender(config));

    if config.use_json {
        let file_layer = fmt::layer()
            .json()
            .with_target(true)
            .with_writer(writer)
            .with_ansi(false);
        registry.with(file_layer).init();
    } else {
        let file_layer = fmt::layer()
            .with_target(false)
            .with_writer(writer)
            .with_ansi(false);
        let stdout_layer = fmt::layer().with_target(false).with_ansi(true);
        registry.with(file_layer).with(stdout_layer).init();
    }

    Some(guard)
}
