//! Downstream delivery: batching sink, transport seam, and the Scribe
//! wire implementation.
//!
//! The sink owns connection state and a pending batch behind one lock,
//! so concurrent producers serialize through a single
//! append/connect/flush cycle. Transports are behind [`SinkTransport`]
//! and opened through [`SinkConnector`], which keeps the delivery logic
//! testable without a live downstream.

use async_trait::async_trait;
use thiserror::Error;

mod scribe;
mod sink;

pub use scribe::{ScribeConnector, ScribeTransport};
pub use sink::RelaySink;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("downstream i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("downstream protocol violation: {0}")]
    Protocol(String),
}

/// One entry bound for the downstream log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub category: String,
    pub message: String,
}

/// What happens to the pending batch when delivery fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryPolicy {
    /// Discard the batch whether or not it was delivered. Keeps the
    /// sink from buffering unboundedly while the downstream is gone.
    DropOnFailure,
    /// Keep undelivered records and retry them with the next send,
    /// discarding the oldest once `max_pending` is exceeded.
    RetryNext { max_pending: usize },
}

/// An open downstream connection that can accept record batches.
#[async_trait]
pub trait SinkTransport: Send {
    async fn append(&mut self, records: &[LogRecord]) -> Result<(), RelayError>;
}

/// Factory for [`SinkTransport`] connections, invoked lazily whenever
/// the sink finds itself disconnected.
#[async_trait]
pub trait SinkConnector: Send + Sync {
    type Transport: SinkTransport;

    async fn open(&self) -> Result<Self::Transport, RelayError>;
}
