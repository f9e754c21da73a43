//! Logging setup for the CLI.
//!
//! Records go to journald on Linux when it is reachable and to a daily file
//! under `log_dir` otherwise. Warnings and errors are also echoed to stderr so
//! the person running a command sees them.

use anyhow::Result;
use std::path::Path;
use tracing::Subscriber;
use tracing_subscriber::{
    filter::LevelFilter, fmt, layer::SubscriberExt, registry::LookupSpan,
    util::SubscriberInitExt, EnvFilter, Layer,
};

const LOG_ENV: &str = "CLASSMARK_LOG";
const LOG_FILE_PREFIX: &str = "classmark.log";

fn terminal_layer<S>() -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fmt::layer()
        .with_writer(std::io::stderr)
        .without_time()
        .with_target(false)
        .with_filter(LevelFilter::WARN)
}

/// Install the global subscriber. Call once, before anything logs.
///
/// `CLASSMARK_LOG` takes any `EnvFilter` directive and defaults to `info`.
pub fn init(log_dir: &Path) -> Result<()> {
    let env_filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));

    #[cfg(target_os = "linux")]
    {
        if let Ok(journald_layer) = tracing_journald::layer() {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(journald_layer)
                .with(terminal_layer())
                .init();

            tracing::debug!("Logging to journald");
            return Ok(());
        }
    }

    std::fs::create_dir_all(log_dir)?;

    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // The writer stops flushing once the guard drops
    static GUARD: std::sync::OnceLock<tracing_appender::non_blocking::WorkerGuard> =
        std::sync::OnceLock::new();
    let _ = GUARD.set(guard);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .with(terminal_layer())
        .init();

    tracing::debug!(log_dir = %log_dir.display(), "Logging to file");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_init_uses_given_log_dir() {
        let dir = tempdir().unwrap();
        let log_dir = dir.path().join("config").join("logs");
        init(&log_dir).unwrap();
        tracing::warn!("logging initialized for test");

        #[cfg(target_os = "linux")]
        if tracing_journald::layer().is_ok() {
            return;
        }
        assert!(log_dir.is_dir());
    }
}
