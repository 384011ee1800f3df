//! Per-broker event handling: the bind-on-auth sequence, status delta
//! tracking, and forwarding messages into the relay sink.

use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use fq::{ClientHandle, FqError, FqEvent};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::core::monitor::StatusMonitor;
use crate::relay::{RelaySink, SinkConnector};

/// Heartbeat cadence negotiated with each broker.
pub const HEARTBEAT_INTERVAL_MS: u16 = 500;

/// The subset of broker commands a connection issues, abstracted so
/// tests can observe the sequence without a live broker.
#[async_trait]
pub trait BrokerHandle: Send + Sync {
    async fn set_heartbeat_interval(&self, interval_ms: u16) -> Result<(), FqError>;
    async fn send_bind_request(
        &self,
        exchange: &str,
        program: &str,
        peer_mode: bool,
    ) -> Result<(), FqError>;
    async fn send_status_request(&self) -> Result<(), FqError>;
}

#[async_trait]
impl BrokerHandle for ClientHandle {
    async fn set_heartbeat_interval(&self, interval_ms: u16) -> Result<(), FqError> {
        ClientHandle::set_heartbeat_interval(self, interval_ms).await
    }

    async fn send_bind_request(
        &self,
        exchange: &str,
        program: &str,
        peer_mode: bool,
    ) -> Result<(), FqError> {
        ClientHandle::send_bind_request(self, exchange, program, peer_mode).await
    }

    async fn send_status_request(&self) -> Result<(), FqError> {
        ClientHandle::send_status_request(self).await
    }
}

/// Destination for relayed records.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn send(&self, category: &str, message: String);
}

#[async_trait]
impl<C: SinkConnector> RecordSink for RelaySink<C> {
    async fn send(&self, category: &str, message: String) {
        RelaySink::send(self, category, message).await
    }
}

/// Drives one broker's event stream.
pub struct BrokerConnection {
    label: String,
    exchange: String,
    program: String,
    category: String,
    handle: Arc<dyn BrokerHandle>,
    sink: Arc<dyn RecordSink>,
    monitor: StatusMonitor,
}

impl BrokerConnection {
    pub fn new(
        label: impl Into<String>,
        exchange: impl Into<String>,
        program: impl Into<String>,
        category: impl Into<String>,
        handle: Arc<dyn BrokerHandle>,
        sink: Arc<dyn RecordSink>,
    ) -> Self {
        Self {
            label: label.into(),
            exchange: exchange.into(),
            program: program.into(),
            category: category.into(),
            handle,
            sink,
            monitor: StatusMonitor::new(),
        }
    }

    /// Consumes events until the stream closes or the token fires.
    pub async fn run(mut self, mut events: mpsc::Receiver<FqEvent>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        warn!(broker = %self.label, "event stream closed");
                        return;
                    }
                },
            }
        }
    }

    async fn handle_event(&mut self, event: FqEvent) {
        match event {
            FqEvent::AuthResult(true) => {
                info!(broker = %self.label, "authenticated, binding");
                if let Err(error) = self
                    .handle
                    .set_heartbeat_interval(HEARTBEAT_INTERVAL_MS)
                    .await
                {
                    warn!(broker = %self.label, %error, "heartbeat setup failed");
                    return;
                }
                if let Err(error) = self
                    .handle
                    .send_bind_request(&self.exchange, &self.program, false)
                    .await
                {
                    warn!(broker = %self.label, %error, "bind request failed");
                }
            }
            FqEvent::AuthResult(false) => {
                warn!(broker = %self.label, "authentication rejected");
            }
            FqEvent::StatusReport { at, counters } => {
                self.monitor.observe(&counters, at);
            }
            FqEvent::Message(payload) => {
                let encoded = STANDARD.encode(&payload);
                self.sink.send(&self.category, encoded).await;
            }
        }
    }
}
