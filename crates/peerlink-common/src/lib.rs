//! Common types for peerlink: errors, stream configuration, retry and telemetry

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod metrics;
pub mod retry;
pub mod telemetry;

pub use config::StreamConfig;
pub use error::Error;
pub use retry::{Backoff, RetryConfig};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Default port for the peering replication listener
pub const DEFAULT_PEERING_PORT: u16 = 8503;

/// Default trust domain used when a cluster does not configure one
pub const DEFAULT_TRUST_DOMAIN: &str = "peerlink.local";

/// Default datacenter name used in SNI routing names
pub const DEFAULT_DATACENTER: &str = "dc1";
