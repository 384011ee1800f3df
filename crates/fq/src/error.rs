//! Error type for fq client operations.
//!
//! Variants split along the fatal/transient line the client driver cares
//! about: resolution failures and duplicate-session refusals surface from
//! `FqClient::connect` and should abort startup; everything else is a
//! runtime condition the driver either retries or reports.

use thiserror::Error;

/// Unified error type for the fq client.
#[derive(Debug, Error)]
pub enum FqError {
    /// The broker hostname could not be resolved to an address.
    ///
    /// Raised from `FqClient::connect` before any socket is opened.
    /// Callers should treat this as a startup failure.
    #[error("unable to resolve broker host {host:?}: {source}")]
    Resolution {
        host: String,
        source: std::io::Error,
    },

    /// The broker refused the session because the source name is
    /// already attached by another client.
    #[error("broker refused session: {0}")]
    SessionInUse(String),

    /// The peer sent something the codec does not understand, or a
    /// field exceeded a wire limit on encode.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The driver task is gone; commands can no longer be delivered.
    #[error("client driver is not running")]
    Closed,

    /// Socket-level failure on either channel.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
