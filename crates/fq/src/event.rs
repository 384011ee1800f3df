//! Events delivered by the client driver to the application.

use std::collections::HashMap;
use std::time::SystemTime;

use bytes::Bytes;

/// A decoded piece of broker activity.
///
/// The driver pushes these over the channel returned by
/// [`FqClient::connect`](crate::FqClient::connect).
#[derive(Debug, Clone)]
pub enum FqEvent {
    /// Outcome of an authentication exchange. Emitted once per
    /// established connection, so a reconnect after transport loss
    /// produces a fresh `AuthResult(true)` and the application should
    /// re-issue its bind requests.
    AuthResult(bool),

    /// A status report from the broker: named counters observed at a
    /// point in time.
    StatusReport {
        at: SystemTime,
        counters: HashMap<String, u64>,
    },

    /// A routed message pushed over the data channel. The payload is
    /// opaque to this crate.
    Message(Bytes),
}
