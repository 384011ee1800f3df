//! Startup wiring and the periodic status poll.

use std::sync::Arc;

use thiserror::Error;
use tokio::time::{Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::BridgeConfig;
use crate::core::connection::{BrokerConnection, BrokerHandle, RecordSink};
use crate::relay::{RelaySink, ScribeConnector};

/// How often every broker is asked for a counter snapshot.
pub const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("broker {broker} failed to start: {source}")]
    BrokerStartup {
        broker: String,
        #[source]
        source: fq::FqError,
    },
}

/// Owns the per-broker tasks and runs the status poll loop.
pub struct Orchestrator {
    handles: Vec<(String, Arc<dyn BrokerHandle>)>,
    cancel: CancellationToken,
}

impl Orchestrator {
    /// Connects every configured broker and spawns its event loop. Any
    /// broker that cannot be reached or whose session key is already
    /// taken fails the whole startup.
    pub async fn start(
        config: &BridgeConfig,
        cancel: CancellationToken,
    ) -> Result<Self, OrchestratorError> {
        let sink: Arc<dyn RecordSink> = Arc::new(RelaySink::new(ScribeConnector::new(
            config.scribe_host.clone(),
            config.scribe_port,
        )));

        let mut handles: Vec<(String, Arc<dyn BrokerHandle>)> = Vec::new();
        for broker in &config.brokers {
            let label = broker.to_string();
            let creds = fq::Creds {
                host: broker.host.clone(),
                port: broker.port,
                source: config.source.clone(),
                password: config.password.clone(),
            };
            let (handle, events) = fq::FqClient::connect(creds, cancel.child_token())
                .await
                .map_err(|source| OrchestratorError::BrokerStartup {
                    broker: label.clone(),
                    source,
                })?;
            info!(broker = %label, "broker session started");

            let handle: Arc<dyn BrokerHandle> = Arc::new(handle);
            let connection = BrokerConnection::new(
                label.clone(),
                config.exchange.clone(),
                config.program.clone(),
                config.category.clone(),
                Arc::clone(&handle),
                Arc::clone(&sink),
            );
            tokio::spawn(connection.run(events, cancel.child_token()));
            handles.push((label, handle));
        }

        Ok(Self { handles, cancel })
    }

    /// Polls every broker for status once a second until cancelled.
    /// A handle whose session is gone just skips that round; its
    /// driver is reconnecting independently.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(STATUS_POLL_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => {
                    for (label, handle) in &self.handles {
                        if let Err(error) = handle.send_status_request().await {
                            debug!(broker = %label, %error, "status request skipped");
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use fq::FqError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct PollCounter {
        polls: AtomicUsize,
    }

    #[async_trait]
    impl BrokerHandle for PollCounter {
        async fn set_heartbeat_interval(&self, _interval_ms: u16) -> Result<(), FqError> {
            Ok(())
        }

        async fn send_bind_request(
            &self,
            _exchange: &str,
            _program: &str,
            _peer_mode: bool,
        ) -> Result<(), FqError> {
            Ok(())
        }

        async fn send_status_request(&self) -> Result<(), FqError> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct ClosedHandle;

    #[async_trait]
    impl BrokerHandle for ClosedHandle {
        async fn set_heartbeat_interval(&self, _interval_ms: u16) -> Result<(), FqError> {
            Err(FqError::Closed)
        }

        async fn send_bind_request(
            &self,
            _exchange: &str,
            _program: &str,
            _peer_mode: bool,
        ) -> Result<(), FqError> {
            Err(FqError::Closed)
        }

        async fn send_status_request(&self) -> Result<(), FqError> {
            Err(FqError::Closed)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn polls_every_broker_each_second() {
        let first = Arc::new(PollCounter::default());
        let second = Arc::new(PollCounter::default());
        let cancel = CancellationToken::new();
        let orchestrator = Orchestrator {
            handles: vec![
                ("a:8765".into(), Arc::clone(&first) as Arc<dyn BrokerHandle>),
                ("b:8765".into(), Arc::clone(&second) as Arc<dyn BrokerHandle>),
            ],
            cancel: cancel.clone(),
        };

        let task = tokio::spawn(orchestrator.run());
        tokio::time::sleep(Duration::from_millis(2500)).await;
        cancel.cancel();
        task.await.unwrap();

        // first tick fires immediately, then once per second
        assert!(first.polls.load(Ordering::SeqCst) >= 3);
        assert_eq!(
            first.polls.load(Ordering::SeqCst),
            second.polls.load(Ordering::SeqCst)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn a_dead_handle_does_not_stop_the_poll_loop() {
        let live = Arc::new(PollCounter::default());
        let cancel = CancellationToken::new();
        let orchestrator = Orchestrator {
            handles: vec![
                ("dead:8765".into(), Arc::new(ClosedHandle) as _),
                ("live:8765".into(), Arc::clone(&live) as _),
            ],
            cancel: cancel.clone(),
        };

        let task = tokio::spawn(orchestrator.run());
        tokio::time::sleep(Duration::from_millis(1500)).await;
        cancel.cancel();
        task.await.unwrap();

        assert!(live.polls.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_the_loop() {
        let handle = Arc::new(PollCounter::default());
        let cancel = CancellationToken::new();
        let orchestrator = Orchestrator {
            handles: vec![("a:8765".into(), Arc::clone(&handle) as _)],
            cancel: cancel.clone(),
        };

        let task = tokio::spawn(orchestrator.run());
        cancel.cancel();
        task.await.unwrap();
    }
}
