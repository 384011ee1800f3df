//! Tracing subscriber setup.
//!
//! `RUST_LOG` wins when set; otherwise the configured level applies to
//! the whole binary.

use thiserror::Error;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

#[derive(Debug, Error)]
pub enum LoggerError {
    #[error("invalid log filter {0:?}")]
    InvalidFilter(String),
    #[error("logger already initialized")]
    AlreadyInitialized,
}

pub fn init(level: &str) -> Result<(), LoggerError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|_| LoggerError::InvalidFilter(level.to_owned()))?;

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().compact().with_filter(filter))
        .try_init()
        .map_err(|_| LoggerError::AlreadyInitialized)
}
