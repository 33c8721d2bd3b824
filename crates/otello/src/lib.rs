//! The communication interface among an `otello` end node and its connector.
//!
//! This crate provides APIs to:
//!
//! - Encode and decode the capability description of an end node: the
//!   affordances it exposes and the forms binding each affordance to a
//!   publish/subscribe topic.
//! - Address messages on the wire. Every topic follows the
//!   `{root}/{device}/{affordance}/{namespace}/{name}` scheme, where the
//!   namespace separates lifecycle traffic from application traffic.
//! - Build and interpret the adaptation actions and reports exchanged while
//!   an end node's application is replaced over the air, including the
//!   integrity-checked file transfer payload.
//! - Describe the application source files shipped to an end node and track
//!   the paths written by previous adaptations.
//! - Exchange the registration messages through which an end node announces
//!   itself to a connector.
//!
//! Data exchange between the end node and connector requires structures to
//! be serializable and deserializable. An end node serializes most of these
//! structures while the connector deserializes them and uses the data for
//! its tasks. An end node can avoid importing deserialization functions by
//! disabling the `deserialize` feature at compile time.
//!
//! This crate can be compiled for both `std` and `no_std` environments.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![no_std]

extern crate alloc;

mod macros;

/// Description of an end node and its affordances.
pub mod description;
/// Forms binding affordances to transport topics.
pub mod forms;
/// Adaptation actions, transfer payloads, and reports.
pub mod ota;
/// Registration messages exchanged with a connector.
pub mod registration;
/// Application source files and bookkeeping of written paths.
pub mod source;
/// Lifecycle states of an end node.
pub mod state;
/// The topic scheme addressing end nodes on the wire.
pub mod topic;

#[cfg(test)]
#[cfg(feature = "deserialize")]
pub(crate) fn serialize<T: serde::Serialize>(value: T) -> serde_json::Value {
    serde_json::to_value(value).unwrap()
}

#[cfg(test)]
#[cfg(feature = "deserialize")]
pub(crate) fn deserialize<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> T {
    serde_json::from_value(value).unwrap()
}
