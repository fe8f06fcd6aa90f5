//! peerlink - cluster peering for service-mesh control planes
//!
//! Two independently administered clusters exchange a token, open one
//! long-lived replication stream, and from then on the accepting cluster
//! keeps the dialing cluster's view of its exported services, CA roots and
//! server addresses eventually consistent.
//!
//! # Crates
//!
//! - [`common`] - errors, stream configuration, retry, telemetry and metrics
//! - [`proto`] - wire messages and framing
//! - [`pki`] - cluster CAs, rotation and certificate verification
//! - [`peering`] - tokens, exporter, dialer registry, trust and routing
//!
//! This crate adds [`state`], the on-disk snapshot of a cluster's peering
//! store used by the `peerlink` binary.

#![deny(missing_docs)]

pub mod state;

pub use peerlink_common as common;
pub use peerlink_peering as peering;
pub use peerlink_pki as pki;
pub use peerlink_proto as proto;

pub use peerlink_common::{Error, Result};
