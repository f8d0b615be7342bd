#![deny(unsafe_code)]

//! Log initialization.
//!
//! Both binaries log through `tracing`; this crate owns the one-time
//! subscriber setup. The configured `log_level` keeps the original numeric
//! scale (0 silences everything, 9 is maximally chatty) and maps onto
//! tracing level filters. Output goes to stdout unless the process is
//! daemonized, and additionally to `log_file` when configured.

use std::fs::OpenOptions;
use std::io;
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{Layer, fmt};

/// Default verbosity when the config does not set one.
pub const DEFAULT_LEVEL: i64 = 3;

/// Logging setup failures.
#[derive(Debug, Error)]
pub enum LogError {
    /// The log file could not be opened for append.
    #[error("failed to open log file {path}: {source}")]
    OpenFile {
        /// The configured `log_file` path.
        path: String,
        /// Underlying I/O error.
        source: io::Error,
    },

    /// A subscriber was already installed in this process.
    #[error("logging already initialized")]
    AlreadyInitialized,
}

/// Where log lines should go.
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    /// Numeric verbosity, 0–9. Values outside the range are clamped.
    pub level: i64,
    /// Mirror output to stdout (disabled when daemonized).
    pub stdout: bool,
    /// Append-mode log file, if any.
    pub file: Option<std::path::PathBuf>,
}

/// Maps the numeric config scale onto a tracing filter.
#[must_use]
pub fn level_filter(level: i64) -> LevelFilter {
    match level {
        i64::MIN..=0 => LevelFilter::OFF,
        1 => LevelFilter::ERROR,
        2 => LevelFilter::WARN,
        3..=4 => LevelFilter::INFO,
        5..=6 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

/// Installs the global subscriber described by `opts`.
///
/// Must be called at most once per process; a second call fails rather than
/// silently replacing the sinks.
pub fn init(opts: &LogOptions) -> Result<(), LogError> {
    let filter = level_filter(opts.level);

    let stdout_layer = opts
        .stdout
        .then(|| fmt::layer().with_writer(io::stdout).with_filter(filter));

    let file_layer = match &opts.file {
        Some(path) => Some(
            fmt::layer()
                .with_ansi(false)
                .with_writer(open_log_file(path)?)
                .with_filter(filter),
        ),
        None => None,
    };

    tracing_subscriber::registry()
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .map_err(|_| LogError::AlreadyInitialized)
}

fn open_log_file(path: &Path) -> Result<Arc<std::fs::File>, LogError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map(Arc::new)
        .map_err(|source| LogError::OpenFile {
            path: path.display().to_string(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_zero_silences_everything() {
        assert_eq!(level_filter(0), LevelFilter::OFF);
        assert_eq!(level_filter(-3), LevelFilter::OFF);
    }

    #[test]
    fn levels_map_progressively() {
        assert_eq!(level_filter(1), LevelFilter::ERROR);
        assert_eq!(level_filter(2), LevelFilter::WARN);
        assert_eq!(level_filter(3), LevelFilter::INFO);
        assert_eq!(level_filter(4), LevelFilter::INFO);
        assert_eq!(level_filter(5), LevelFilter::DEBUG);
        assert_eq!(level_filter(9), LevelFilter::TRACE);
        assert_eq!(level_filter(100), LevelFilter::TRACE);
    }

    #[test]
    fn default_level_is_info() {
        assert_eq!(level_filter(DEFAULT_LEVEL), LevelFilter::INFO);
    }

    #[test]
    fn missing_log_file_directory_fails() {
        let opts = LogOptions {
            level: 3,
            stdout: false,
            file: Some("/nonexistent-dir/libsync.log".into()),
        };
        assert!(matches!(init(&opts), Err(LogError::OpenFile { .. })));
    }
}
