//! The wire interface between a device and the CmControl system.
//!
//! This crate provides APIs to:
//!
//! - Build the topics of the CmControl Driver v1.00. Every request a device
//!   sends goes to a `set` topic and its answer comes back on the paired
//!   `get` topic, both derived from the device address and an endpoint name.
//! - Describe the business documents a device submits, such as a [`Setup`]
//!   bundling one or more [`Apontamento`]s with their serials, evidences and
//!   an optional transport order.
//! - Wrap those documents into the `MQTT+REST` envelope the system uses to
//!   tunnel its `REST` API over the broker.
//! - Inspect the loosely-typed response envelopes and decide whether a
//!   response reports a failure, including the business failures hidden
//!   behind a successful status code.
//!
//! The crate performs no I/O, so it can be compiled for both `std` and
//! `no_std` environments.
//!
//! [`Setup`]: document::Setup
//! [`Apontamento`]: document::Apontamento

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![no_std]

extern crate alloc;

/// Business documents submitted by a device.
pub mod document;
/// `MQTT+REST` request envelopes and response inspection.
pub mod envelope;
/// Payloads of the mandatory heartbeat endpoints.
pub mod heartbeat;
/// Rules deciding whether a response reports a failure.
pub mod rules;
/// Topic naming and endpoint names.
pub mod topics;

#[cfg(test)]
pub(crate) fn serialize<T: serde::Serialize>(value: T) -> serde_json::Value {
    serde_json::to_value(value).unwrap()
}

#[cfg(test)]
#[cfg(feature = "deserialize")]
pub(crate) fn deserialize<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> T {
    serde_json::from_value(value).unwrap()
}
