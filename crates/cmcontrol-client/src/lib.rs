//! The `cmcontrol-client` library crate provides a device-side client for
//! the CmControl system, speaking the CmControl Driver v1.00 and the
//! `MQTT+REST` tunnel over a broker.
//!
//! The broker only offers fire-and-forget publishes. This crate turns them
//! into request/response calls: a request is published on the `set` topic of
//! an endpoint, and the caller waits until the paired `get` topic receives
//! the answer, the deadline expires or the connection drops.
//!
//! Core functionalities of this crate include:
//!
//! - Connecting to the broker, classifying each failure into a precise
//!   error kind
//! - Answering the mandatory `ping` and `state` probes of the system
//! - Logging into the `REST` interface and renewing the `OAuth2` token
//!   before it expires
//! - Submitting apontamentos, alone or as a batch of one serial per request
//!
//! The client relies on `tokio` as asynchronous executor. The broker
//! messages are received by a dedicated task, so a caller waiting for a
//! response never blocks the heartbeat replies.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

/// Business operations built on top of the `setup.apontamento` endpoint.
pub mod apontamento;
/// The client and its connection lifecycle.
pub mod client;
/// Client configuration.
pub mod config;
/// Error management.
pub mod error;
/// The publish/subscribe transport contract and its `MQTT` implementation.
pub mod transport;

mod correlator;
mod heartbeat;
mod session;

pub use cmcontrol;

#[cfg(test)]
mod tests;
