//! The `otello-connector` library crate provides the server side of the
//! `otello` architecture: it accepts registrations from end nodes, mirrors
//! their lifecycle over `MQTT`, and replaces their applications over the
//! air.
//!
//! An end node is compliant with `otello` when its firmware publishes the
//! core status property and report event, and serves the adaptation actions
//! declared in its capability description.
//!
//! Core functionalities of this crate include:
//!
//! - Accepting end node registrations, fetching each node's capability
//!   description, and provisioning a controller per node through
//!   version-keyed factories
//! - Mirroring each node's lifecycle through a transition-checked state
//!   machine fed by its status publications
//! - Replacing a node's application through deferred adaptation operations,
//!   settled by the node's own reports and rolled back on failure
//! - Forwarding application publications to subscribers while caching their
//!   latest values
//!
//! The crate leverages `tokio` as an asynchronous executor. Registrations
//! and adaptations of distinct nodes run as independent tasks and never
//! wait on one another.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

/// Adaptation workflow replacing an end node's application.
pub mod adaptation;
/// Caches for the latest application publications of an end node.
pub mod cache;
/// The connector managing every registered end node.
pub mod connector;
/// A controller mirroring a single end node.
pub mod controller;
/// Error management.
pub mod error;
/// A transition-checked finite state machine.
pub mod fsm;
/// Deferred operations settled by end node publications.
pub mod session;
/// The broker link carrying all node traffic.
pub mod transport;

mod registration;
