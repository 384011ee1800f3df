//! fq2scribe relays messages from fq brokers into a Scribe log
//! collector.
//!
//! Each configured broker gets its own session (driven by the `fq`
//! crate) whose events feed a [`core::BrokerConnection`]: successful
//! authentication triggers the heartbeat/bind sequence, status reports
//! are diffed for counter movement, and delivered messages are base64
//! encoded and pushed through the shared [`relay::RelaySink`]. The
//! [`core::Orchestrator`] wires it all up and polls every broker for
//! status once a second.

pub mod config;
pub mod core;
pub mod logger;
pub mod relay;
