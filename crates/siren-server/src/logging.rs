//! Logging initialization.
//!
//! - **Production**: JSON logs to rolling daily files + compact logs to stdout
//! - **Development**: Pretty logs to stdout with span events
//!
//! The filter comes from `RUST_LOG`, then `SIREN_LOG_LEVEL`, then
//! `logging.level` in the configuration file.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use siren_core::LoggingConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable overriding the configured log level.
pub const LOG_LEVEL_ENV: &str = "SIREN_LOG_LEVEL";

// Non-blocking writers stop flushing once their guard drops.
static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();
static STDOUT_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Initialize the global subscriber.
///
/// # Errors
///
/// Returns an error if the filter directive cannot be parsed or the log
/// directory cannot be created.
pub fn init(config: &LoggingConfig) -> anyhow::Result<()> {
    let level = std::env::var(LOG_LEVEL_ENV).unwrap_or_else(|_| config.level.clone());
    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&level))?;

    if config.production {
        let dir = config.directory.clone().unwrap_or_else(log_directory);
        init_production(env_filter, &dir)?;
    } else {
        init_development(env_filter);
    }
    Ok(())
}

fn init_production(env_filter: EnvFilter, log_dir: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(log_dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, log_dir, "siren");
    let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);
    let (non_blocking_stdout, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking_file)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    // journald adds its own colouring and timestamps
    let stdout_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(non_blocking_stdout)
        .with_target(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();

    let _ = FILE_GUARD.set(file_guard);
    let _ = STDOUT_GUARD.set(stdout_guard);
    Ok(())
}

fn init_development(env_filter: EnvFilter) {
    let stdout_layer = tracing_subscriber::fmt::layer()
        .pretty()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .init();
}

/// Default log directory for the current platform.
fn log_directory() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/var/log/siren")
    }
    #[cfg(not(target_os = "linux"))]
    {
        directories::ProjectDirs::from("", "", "siren")
            .map_or_else(|| PathBuf::from("./logs"), |dirs| dirs.data_dir().join("logs"))
    }
}
