//! Logging infrastructure for agent-flow
//!
//! The server logs to stdout; when `AGENT_FLOW_LOG_DIR` is set a daily
//! rolling file layer is added alongside it.

use crate::config::LoggingConfig;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

/// Initialize the logging system.
///
/// The level comes from the config, overridable with `RUST_LOG`. Returns a
/// guard that must be kept alive for the file layer to flush.
pub fn init(config: &LoggingConfig) -> crate::error::Result<Option<LoggingGuard>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let stdout_layer = fmt::layer().with_target(true);

    let guard = match &config.dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let file_appender = RollingFileAppender::new(Rotation::DAILY, dir, "agent-flow.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let file_layer = fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true);

            tracing_subscriber::registry()
                .with(filter)
                .with(stdout_layer)
                .with(file_layer)
                .init();
            Some(LoggingGuard { _guard: guard })
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stdout_layer)
                .init();
            None
        }
    };

    tracing::info!(level = %config.level, file_layer = config.dir.is_some(), "logging ready");
    Ok(guard)
}

/// Logging for tests: compact, timestamp-free, captured per test case.
/// Repeated calls are harmless, so every test can start with it.
pub fn init_test() {
    let _ = tracing_subscriber::fmt()
        .compact()
        .without_time()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(fmt::TestWriter::new())
        .try_init();
}

/// Holds the non-blocking writer's worker thread open; dropping it is what
/// gets buffered file output onto disk at shutdown.
pub struct LoggingGuard {
    _guard: tracing_appender::non_blocking::WorkerGuard,
}
