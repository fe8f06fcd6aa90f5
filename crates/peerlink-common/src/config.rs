//! Replication stream configuration
//!
//! Defaults are tuned for tens of peerings per cluster. Every value can be
//! overridden through `PEERLINK_*` environment variables so operators can
//! tighten heartbeats or widen the replay window without a rebuild.

use std::time::Duration;

use crate::retry::RetryConfig;

/// Default interval between exporter heartbeats
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Default silence after which the importer drops the stream
/// (3x the heartbeat interval)
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(45);

/// Default timeout for dialing a single candidate and completing the handshake
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default number of consecutive failures before an address moves to the back
pub const DEFAULT_FAILOVER_THRESHOLD: u32 = 2;

/// Default number of sequenced messages retained per peer for resume
pub const DEFAULT_MAX_LOG_ENTRIES: usize = 4096;

/// Default maximum size of one wire frame
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Default staleness threshold for `LastReceiveTime` health checks
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(120);

/// Tunables for the replication stream on both sides of a peering
#[derive(Clone, Debug, PartialEq)]
pub struct StreamConfig {
    /// How often the exporter sends a heartbeat on an idle stream
    pub heartbeat_interval: Duration,
    /// How long the importer waits for any message before reconnecting
    pub heartbeat_timeout: Duration,
    /// Timeout for connect plus handshake against one candidate
    pub connect_timeout: Duration,
    /// Consecutive failures before a candidate is moved to the back
    pub failover_threshold: u32,
    /// Per-peer replay log capacity on the exporting side
    pub max_log_entries: usize,
    /// Maximum encoded message size accepted by framed transports
    pub max_frame_bytes: usize,
    /// `LastReceiveTime` age after which a peering is reported stale
    pub stale_after: Duration,
    /// Backoff applied after a full pass over the candidate list fails
    pub backoff: RetryConfig,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            failover_threshold: DEFAULT_FAILOVER_THRESHOLD,
            max_log_entries: DEFAULT_MAX_LOG_ENTRIES,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            stale_after: DEFAULT_STALE_AFTER,
            backoff: RetryConfig::default(),
        }
    }
}

impl StreamConfig {
    /// Build a config from the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup, falling back to defaults
    ///
    /// Unparseable values are ignored so a typo never prevents startup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let secs = |key: &str, default: Duration| {
            lookup(key)
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(default)
        };
        let millis = |key: &str, default: Duration| {
            lookup(key)
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(default)
        };

        Self {
            heartbeat_interval: secs(
                "PEERLINK_HEARTBEAT_INTERVAL_SECS",
                defaults.heartbeat_interval,
            ),
            heartbeat_timeout: secs("PEERLINK_HEARTBEAT_TIMEOUT_SECS", defaults.heartbeat_timeout),
            connect_timeout: secs("PEERLINK_CONNECT_TIMEOUT_SECS", defaults.connect_timeout),
            failover_threshold: lookup("PEERLINK_FAILOVER_THRESHOLD")
                .and_then(|v| v.parse::<u32>().ok())
                .filter(|v| *v > 0)
                .unwrap_or(defaults.failover_threshold),
            max_log_entries: lookup("PEERLINK_MAX_LOG_ENTRIES")
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(defaults.max_log_entries),
            max_frame_bytes: lookup("PEERLINK_MAX_FRAME_BYTES")
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(defaults.max_frame_bytes),
            stale_after: secs("PEERLINK_STALE_AFTER_SECS", defaults.stale_after),
            backoff: RetryConfig {
                initial_delay: millis(
                    "PEERLINK_BACKOFF_INITIAL_MS",
                    defaults.backoff.initial_delay,
                ),
                max_delay: millis("PEERLINK_BACKOFF_MAX_MS", defaults.backoff.max_delay),
                ..defaults.backoff
            },
        }
    }
}
