// Tracing subscriber setup.
//
// One global subscriber: an `EnvFilter` behind a `reload` layer, then a fmt
// layer writing to the configured log file (appending, no ANSI colors) or to
// stderr. `LogHandle` keeps the reload handle so the admin channel can change
// verbosity at runtime, and remembers the log file path for the admin log
// commands.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, fmt, reload};

use crate::config::LoggingConfig;

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log filter {filter:?}: {source}")]
    Filter {
        filter: String,
        source: tracing_subscriber::filter::ParseError,
    },
    #[error("failed to open log file {path}: {source}")]
    File {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to install subscriber: {0}")]
    Install(#[from] tracing_subscriber::util::TryInitError),
    #[error("failed to reload filter: {0}")]
    Reload(#[from] reload::Error),
}

/// Runtime access to the installed subscriber's filter.
pub trait LogControl: Send + Sync + 'static {
    fn set_filter(&self, filter: &str) -> Result<(), LoggingError>;
}

pub struct LogHandle {
    reload: reload::Handle<EnvFilter, Registry>,
    file: Option<PathBuf>,
}

impl LogHandle {
    pub fn file(&self) -> Option<&Path> {
        self.file.as_deref()
    }
}

impl LogControl for LogHandle {
    fn set_filter(&self, filter: &str) -> Result<(), LoggingError> {
        let parsed = parse_filter(filter)?;
        self.reload.reload(parsed)?;
        tracing::info!(filter, "log filter changed");
        Ok(())
    }
}

fn parse_filter(filter: &str) -> Result<EnvFilter, LoggingError> {
    EnvFilter::try_new(filter).map_err(|source| LoggingError::Filter {
        filter: filter.to_owned(),
        source,
    })
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<LogHandle, LoggingError> {
    let (filter, reload) = reload::Layer::new(parse_filter(&config.filter)?);
    let registry = tracing_subscriber::registry().with(filter);

    match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| LoggingError::File {
                    path: path.clone(),
                    source,
                })?;
            registry
                .with(
                    fmt::layer()
                        .with_ansi(false)
                        .with_thread_names(true)
                        .with_writer(Mutex::new(file)),
                )
                .try_init()?;
        }
        None => {
            registry
                .with(
                    fmt::layer()
                        .with_thread_names(true)
                        .with_writer(std::io::stderr),
                )
                .try_init()?;
        }
    }

    Ok(LogHandle {
        reload,
        file: config.file.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_filter_is_reported() {
        let err = parse_filter("boardroom_relay=loud").unwrap_err();
        assert!(matches!(err, LoggingError::Filter { .. }));
        assert!(parse_filter("boardroom_relay=debug,warn").is_ok());
    }
}
