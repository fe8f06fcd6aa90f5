//! Wire messages for peerlink replication streams.
//!
//! One duplex stream carries everything two peered clusters exchange. The
//! dialing (importing) side connects and opens the stream; the accepting
//! (exporting) side authenticates it and pushes data.
//!
//! # Stream Flow
//!
//! ```text
//! dialer                                   acceptor
//!   │ ── Open{peer_id, secret, resume} ──────▶ │
//!   │ ◀────────── Opened{stream_secret} ────── │   or Rejected{kind, reason}
//!   │ ◀──── Snapshot{epoch, seq, ...} ──────── │   unless resume is satisfiable
//!   │ ◀──── Upsert / Delete / RootUpdate ───── │
//!   │ ◀──── AddressUpdate / Heartbeat ──────── │
//!   │ ── Ack{seq} ───────────────────────────▶ │
//!   │ ── Resync{reason} ─────────────────────▶ │   on StaleSequence / ApplyConflict
//!   │ ◀──────────────── Close{reason} ──────── │   either direction, terminal
//! ```
//!
//! # Sequencing
//!
//! Every data message carries `seq`, strictly increasing per exporting
//! outbox. A [`Snapshot`] starts a new epoch and carries the sequence of the
//! last change it includes, so the first delta after it is `seq + 1`.
//! Sequence numbers are never reset, only epochs advance.
//!
//! Messages are JSON objects tagged by a `type` field; see [`frame`] for how
//! they are delimited on byte streams.

#![warn(missing_docs)]

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod frame;
pub mod tracing;

pub use frame::{FrameError, FrameReader, FrameWriter};

/// Namespace used when an entry does not name one
pub const DEFAULT_NAMESPACE: &str = "default";

/// Identifies one replicated service within a peering
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryKey {
    /// Namespace of the service on the exporting side
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Service name
    pub service: String,
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

impl EntryKey {
    /// Key for a service in the default namespace
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            service: service.into(),
        }
    }

    /// Key for a service in an explicit namespace
    pub fn namespaced(namespace: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            service: service.into(),
        }
    }
}

impl fmt::Display for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.service)
    }
}

/// One reachable instance of an exported service
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    /// Node the instance runs on
    #[serde(default)]
    pub node: String,
    /// IP or hostname
    pub address: String,
    /// Port the instance listens on
    pub port: u16,
}

impl ServiceEndpoint {
    /// Create an endpoint
    pub fn new(node: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        Self {
            node: node.into(),
            address: address.into(),
            port,
        }
    }
}

/// A service as replicated from the exporting cluster
///
/// `peer_name` is empty on the wire; the importing side stamps it with its
/// local peering name so imported entries never collide with local services.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEntry {
    /// Namespace and name of the service
    pub key: EntryKey,
    /// Local peering the entry was imported through (importing side only)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub peer_name: String,
    /// Instances to route to
    #[serde(default)]
    pub endpoints: Vec<ServiceEndpoint>,
    /// Mesh-gateway routable name
    pub sni: String,
    /// Exporter-side modification index of the catalog entry
    #[serde(default)]
    pub version: u64,
}

impl ServiceEntry {
    /// Service name shorthand
    pub fn service(&self) -> &str {
        &self.key.service
    }
}

/// Replication watermark the importer asks to resume from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resume {
    /// Epoch of the last applied snapshot
    pub epoch: u64,
    /// Highest contiguous sequence applied in that epoch
    pub seq: u64,
}

/// Credential presented in [`Open`]
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum StreamSecret {
    /// Single-use secret from the peering token
    Establishment(String),
    /// Long-lived secret handed out on first successful open
    Stream(String),
}

impl StreamSecret {
    /// The raw secret value
    pub fn value(&self) -> &str {
        match self {
            StreamSecret::Establishment(v) | StreamSecret::Stream(v) => v,
        }
    }
}

// Secrets never appear in logs
impl fmt::Debug for StreamSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamSecret::Establishment(_) => f.write_str("Establishment(<redacted>)"),
            StreamSecret::Stream(_) => f.write_str("Stream(<redacted>)"),
        }
    }
}

/// First message on every stream, sent by the dialing side
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Open {
    /// Accepting side's peering ID, taken from the token
    pub peer_id: String,
    /// Dialing side's own peering ID, recorded by the acceptor as its peer
    pub dialer_id: String,
    /// Credential for this stream
    pub secret: StreamSecret,
    /// Watermark to resume from; `None` requests a snapshot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume: Option<Resume>,
    /// W3C trace context of the dialing attempt
    #[serde(default, skip_serializing_if = "tracing::TraceContext::is_empty")]
    pub trace: tracing::TraceContext,
}

/// Why the accepting side refused a stream
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectKind {
    /// Secret missing, reused or wrong
    Unauthenticated,
    /// The peering was deleted on the accepting side
    Terminated,
    /// No peering with the presented ID
    NotFound,
}

/// Full replacement of the importer's view of one peer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// New replication epoch
    pub epoch: u64,
    /// Sequence of the last change folded into this snapshot
    pub seq: u64,
    /// Every export-eligible service
    pub entries: Vec<ServiceEntry>,
    /// Current CA roots as PEM, newest last
    pub roots: Vec<String>,
    /// Current server addresses, preferred first
    pub addresses: Vec<String>,
}

/// Every message that can appear on a replication stream
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReplicationMessage {
    /// Dialer opens the stream
    Open(Open),
    /// Acceptor accepted the stream; carries a stream secret on first exchange
    Opened {
        /// Newly minted stream secret, if the dialer used its establishment secret
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stream_secret: Option<String>,
    },
    /// Acceptor refused the stream
    Rejected {
        /// Category of refusal
        kind: RejectKind,
        /// Human-readable reason
        reason: String,
    },
    /// Full state, starts a new epoch
    Snapshot(Snapshot),
    /// Create or replace one entry
    Upsert {
        /// Sequence number
        seq: u64,
        /// New entry contents
        entry: ServiceEntry,
    },
    /// Remove one entry
    Delete {
        /// Sequence number
        seq: u64,
        /// Entry to remove
        key: EntryKey,
    },
    /// Replace the peer's CA roots wholesale
    RootUpdate {
        /// Sequence number
        seq: u64,
        /// Complete root set as PEM, newest last
        roots: Vec<String>,
    },
    /// Replace the peer's server addresses wholesale
    AddressUpdate {
        /// Sequence number
        seq: u64,
        /// Complete address list, preferred first
        addresses: Vec<String>,
    },
    /// Importer durably applied everything up to `seq`
    Ack {
        /// Highest contiguous applied sequence
        seq: u64,
    },
    /// Importer cannot apply deltas and asks for a fresh snapshot
    Resync {
        /// Why the importer gave up on deltas
        reason: String,
    },
    /// Keeps an idle stream alive
    Heartbeat,
    /// The peering was deleted; the receiver terminates its side
    Close {
        /// Human-readable reason
        reason: String,
    },
}

impl ReplicationMessage {
    /// Sequence number of data messages, `None` for control messages
    pub fn seq(&self) -> Option<u64> {
        match self {
            ReplicationMessage::Snapshot(s) => Some(s.seq),
            ReplicationMessage::Upsert { seq, .. }
            | ReplicationMessage::Delete { seq, .. }
            | ReplicationMessage::RootUpdate { seq, .. }
            | ReplicationMessage::AddressUpdate { seq, .. } => Some(*seq),
            _ => None,
        }
    }

    /// Short name of the message kind for logs and metric labels
    pub fn kind(&self) -> &'static str {
        match self {
            ReplicationMessage::Open(_) => "open",
            ReplicationMessage::Opened { .. } => "opened",
            ReplicationMessage::Rejected { .. } => "rejected",
            ReplicationMessage::Snapshot(_) => "snapshot",
            ReplicationMessage::Upsert { .. } => "upsert",
            ReplicationMessage::Delete { .. } => "delete",
            ReplicationMessage::RootUpdate { .. } => "root_update",
            ReplicationMessage::AddressUpdate { .. } => "address_update",
            ReplicationMessage::Ack { .. } => "ack",
            ReplicationMessage::Resync { .. } => "resync",
            ReplicationMessage::Heartbeat => "heartbeat",
            ReplicationMessage::Close { .. } => "close",
        }
    }

    /// Encode as a JSON document
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode from a JSON document
    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn web_entry() -> ServiceEntry {
        ServiceEntry {
            key: EntryKey::new("web"),
            peer_name: String::new(),
            endpoints: vec![ServiceEndpoint::new("node-1", "10.0.0.5", 8080)],
            sni: "web.default.dc1.internal.peerlink.local".to_string(),
            version: 7,
        }
    }

    #[test]
    fn test_messages_are_tagged_by_type() {
        let json = serde_json::to_value(ReplicationMessage::Ack { seq: 4 }).unwrap();
        assert_eq!(json["type"], "ack");
        assert_eq!(json["seq"], 4);

        let json = serde_json::to_value(ReplicationMessage::Heartbeat).unwrap();
        assert_eq!(json, serde_json::json!({"type": "heartbeat"}));
    }

    #[test]
    fn test_upsert_survives_encoding() {
        let msg = ReplicationMessage::Upsert {
            seq: 12,
            entry: web_entry(),
        };
        let decoded = ReplicationMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.seq(), Some(12));
        assert_eq!(decoded.kind(), "upsert");
    }

    #[test]
    fn test_peer_name_is_not_sent_when_empty() {
        let json = serde_json::to_value(web_entry()).unwrap();
        assert!(json.get("peer_name").is_none());
    }

    #[test]
    fn test_entry_key_defaults_namespace() {
        let key: EntryKey = serde_json::from_str(r#"{"service":"api"}"#).unwrap();
        assert_eq!(key, EntryKey::new("api"));
        assert_eq!(key.to_string(), "default/api");
    }

    #[test]
    fn test_open_without_resume_omits_field() {
        let msg = ReplicationMessage::Open(Open {
            peer_id: "p1".to_string(),
            dialer_id: "d1".to_string(),
            secret: StreamSecret::Establishment("s3cret".to_string()),
            resume: None,
            trace: Default::default(),
        });
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "open");
        assert!(json.get("resume").is_none());
        assert!(json.get("trace").is_none());
        assert_eq!(json["secret"]["kind"], "establishment");
    }

    #[test]
    fn test_secret_debug_is_redacted() {
        let secret = StreamSecret::Stream("hunter2".to_string());
        let debug = format!("{secret:?}");
        assert!(!debug.contains("hunter2"));
        assert_eq!(secret.value(), "hunter2");
    }

    #[test]
    fn test_control_messages_have_no_seq() {
        assert_eq!(ReplicationMessage::Heartbeat.seq(), None);
        assert_eq!(
            ReplicationMessage::Close {
                reason: "deleted".to_string()
            }
            .seq(),
            None
        );
        let snapshot = ReplicationMessage::Snapshot(Snapshot {
            epoch: 2,
            seq: 9,
            entries: vec![],
            roots: vec![],
            addresses: vec![],
        });
        assert_eq!(snapshot.seq(), Some(9));
    }

    #[test]
    fn test_rejected_kind_is_snake_case() {
        let msg = ReplicationMessage::Rejected {
            kind: RejectKind::NotFound,
            reason: "no such peering".to_string(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["kind"], "not_found");
    }
}
