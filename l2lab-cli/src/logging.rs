use std::path::Path;
use anyhow::anyhow;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::Layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub fn log_level(s: &str) -> anyhow::Result<LevelFilter> {
    match s.to_lowercase().as_str() {
        "error" => Ok(LevelFilter::ERROR),
        "warn" => Ok(LevelFilter::WARN),
        "info" => Ok(LevelFilter::INFO),
        "debug" => Ok(LevelFilter::DEBUG),
        "trace" => Ok(LevelFilter::TRACE),
        _ => Err(anyhow!("Unknown Log LevelFilter {}", s)),
    }
}

/// Log to stdout at `level`. With a `log_dir` everything down to debug also goes to a daily
/// rolling `l2lab.log` in there, the returned guard must live until exit for it to be flushed.
pub fn configure_logging(level: LevelFilter, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let stdout_log = tracing_subscriber::fmt::layer()
        .with_filter(level);

    let Some(log_dir) = log_dir else {
        tracing_subscriber::registry()
            .with(stdout_log)
            .init();
        return None;
    };

    if let Err(err) = std::fs::create_dir_all(log_dir) {
        tracing_subscriber::registry()
            .with(stdout_log)
            .init();
        tracing::warn!("could not create log folder {log_dir:?}, logging to stdout only: {err}");
        return None;
    }

    let file_appender = tracing_appender::rolling::daily(log_dir, "l2lab.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let debug_log = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(non_blocking)
        .with_filter(LevelFilter::DEBUG);

    tracing_subscriber::registry()
        .with(stdout_log.and_then(debug_log))
        .init();
    Some(guard)
}
