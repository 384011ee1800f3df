//! Batching relay sink with lazy connection management.

use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{DeliveryPolicy, LogRecord, RelayError, SinkConnector, SinkTransport};

struct Inner<T> {
    transport: Option<T>,
    pending: Vec<LogRecord>,
}

/// Accepts records one at a time and pushes the accumulated batch
/// downstream on every send.
///
/// `send` never reports failure to the caller: a send that cannot be
/// delivered is logged and resolved according to the configured
/// [`DeliveryPolicy`]. A transport-level failure additionally drops the
/// connection so the next send dials a fresh one; a protocol-level
/// failure keeps the connection open.
pub struct RelaySink<C: SinkConnector> {
    connector: C,
    policy: DeliveryPolicy,
    inner: Mutex<Inner<C::Transport>>,
}

impl<C: SinkConnector> RelaySink<C> {
    pub fn new(connector: C) -> Self {
        Self::with_policy(connector, DeliveryPolicy::DropOnFailure)
    }

    pub fn with_policy(connector: C, policy: DeliveryPolicy) -> Self {
        Self {
            connector,
            policy,
            inner: Mutex::new(Inner {
                transport: None,
                pending: Vec::new(),
            }),
        }
    }

    /// Appends one record and attempts to flush the whole batch.
    pub async fn send(&self, category: &str, message: String) {
        let mut inner = self.inner.lock().await;
        inner.pending.push(LogRecord {
            category: category.to_owned(),
            message,
        });

        if inner.transport.is_none() {
            match self.connector.open().await {
                Ok(transport) => inner.transport = Some(transport),
                Err(error) => {
                    warn!(%error, "downstream unavailable");
                }
            }
        }

        let Inner { transport, pending } = &mut *inner;
        let delivered = match transport {
            Some(t) => match t.append(&*pending).await {
                Ok(()) => true,
                Err(error) => {
                    warn!(%error, records = pending.len(), "batch delivery failed");
                    if matches!(error, RelayError::Io(_)) {
                        *transport = None;
                    }
                    false
                }
            },
            None => false,
        };

        match (delivered, self.policy) {
            (true, _) => pending.clear(),
            (false, DeliveryPolicy::DropOnFailure) => {
                debug!(discarded = pending.len(), "dropping undelivered batch");
                pending.clear();
            }
            (false, DeliveryPolicy::RetryNext { max_pending }) => {
                if pending.len() > max_pending {
                    let excess = pending.len() - max_pending;
                    warn!(discarded = excess, "pending batch over limit");
                    pending.drain(..excess);
                }
            }
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.lock().await.transport.is_some()
    }
}
