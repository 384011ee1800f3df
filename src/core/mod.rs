//! Bridge core: per-broker connections, status monitoring, and the
//! orchestrator that ties them to the relay sink.

pub mod connection;
pub mod monitor;
pub mod orchestrator;

pub use connection::{BrokerConnection, BrokerHandle, RecordSink, HEARTBEAT_INTERVAL_MS};
pub use monitor::{CounterDelta, StatusMonitor};
pub use orchestrator::{Orchestrator, OrchestratorError, STATUS_POLL_INTERVAL};
