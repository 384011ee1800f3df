//! fq — minimal async client for the fq message broker.
//!
//! fq sessions use two TCP connections to the same broker: a command
//! channel (authentication, binding, heartbeats, status) and a data
//! channel over which the broker pushes routed messages. This crate
//! implements the subset of the protocol a consuming client needs:
//! plain authentication, bind requests, heartbeat configuration, status
//! requests, and message reception.
//!
//! The client is split along a command/event seam:
//!
//! * [`FqClient::connect`] resolves the broker, completes the initial
//!   TCP + auth exchange, and spawns a driver task that owns both
//!   sockets for the rest of the process lifetime.
//! * [`ClientHandle`] sends commands to the driver (heartbeat interval,
//!   bind request, status request).
//! * Decoded broker activity arrives as [`FqEvent`] values on the
//!   receiver returned by `connect`.
//!
//! The driver reconnects with capped exponential backoff when an
//! established connection is lost, re-authenticating and re-emitting
//! `FqEvent::AuthResult(true)` so the application can re-issue its
//! bindings. Rejected credentials are terminal: the driver reports
//! `AuthResult(false)` once and parks until cancellation.

pub mod backoff;
pub mod client;
pub mod error;
pub mod event;
pub mod wire;

pub use backoff::Backoff;
pub use client::{ClientHandle, Creds, FqClient};
pub use error::FqError;
pub use event::FqEvent;
