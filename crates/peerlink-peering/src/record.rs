//! Peering records and their state machine
//!
//! A [`PeeringRecord`] is the single source of truth for one peering. The
//! address tracker and trust bundle are views over its fields; every change
//! to them goes through the same serialized apply path that writes the record.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use peerlink_common::{Error, Result};
use peerlink_proto::Resume;
use serde::{Deserialize, Serialize};

use crate::token::PeeringToken;

/// Which side of the relationship this cluster is on
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeeringRole {
    /// Generated the token and exports services
    Accepting,
    /// Consumed the token and imports services
    Dialing,
}

/// Lifecycle state of a peering
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeeringState {
    /// Created, no stream established yet
    Pending,
    /// First stream is being established
    Establishing,
    /// Replicating
    Active,
    /// Every known server address failed on the last pass
    FailingOver,
    /// Deleted by either side; terminal
    Terminated,
}

impl PeeringState {
    /// Whether the state machine allows moving from `self` to `next`
    ///
    /// Staying in the same state is always allowed except out of
    /// `Terminated`, which is absorbing.
    pub fn can_transition_to(self, next: PeeringState) -> bool {
        use PeeringState::*;
        match (self, next) {
            (Terminated, Terminated) => true,
            (Terminated, _) => false,
            (_, Terminated) => true,
            (a, b) if a == b => true,
            (Pending, Establishing) => true,
            (Establishing, Active) => true,
            // fatal authentication failure before the first stream
            (Establishing, Pending) => true,
            (Active, FailingOver) => true,
            (FailingOver, Active) => true,
            _ => false,
        }
    }

    /// Whether the peering has been deleted
    pub fn is_terminal(self) -> bool {
        self == PeeringState::Terminated
    }
}

impl fmt::Display for PeeringState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PeeringState::Pending => "Pending",
            PeeringState::Establishing => "Establishing",
            PeeringState::Active => "Active",
            PeeringState::FailingOver => "FailingOver",
            PeeringState::Terminated => "Terminated",
        };
        f.write_str(s)
    }
}

/// Credentials of a peering
///
/// On the accepting side `establishment` is the secret embedded in the
/// outstanding token. On the dialing side it is the secret read from the
/// token. Both sides clear it once the long-lived `stream` secret exists.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeeringSecrets {
    /// Single-use establishment secret
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub establishment: Option<String>,
    /// Stream secret exchanged on the first successful open
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<String>,
}

impl fmt::Debug for PeeringSecrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeeringSecrets")
            .field("establishment", &self.establishment.as_ref().map(|_| "<redacted>"))
            .field("stream", &self.stream.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Durable per-peering state
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeeringRecord {
    /// Stable identifier, also the peer ID the other side dials with
    pub id: String,
    /// Local name of the peering, used as the export consumer name
    pub name: String,
    /// Side of the relationship
    pub role: PeeringRole,
    /// Lifecycle state
    pub state: PeeringState,
    /// Counterpart's peering ID
    #[serde(default)]
    pub peer_id: String,
    /// TLS server name the peer's servers present
    #[serde(default)]
    pub server_name: String,
    /// Peer server addresses, most recently verified first
    #[serde(default)]
    pub peer_server_addresses: Vec<String>,
    /// Peer CA roots as PEM, newest last
    #[serde(default)]
    pub peer_ca_roots: Vec<String>,
    /// Services currently imported from the peer
    #[serde(default)]
    pub imported_service_count: u64,
    /// Services currently exported to the peer
    #[serde(default)]
    pub exported_service_count: u64,
    /// Last time any message arrived from the peer
    #[serde(default)]
    pub last_receive_time: Option<DateTime<Utc>>,
    /// Last time a message was sent to the peer
    #[serde(default)]
    pub last_send_time: Option<DateTime<Utc>>,
    /// Last time a heartbeat arrived from the peer
    #[serde(default)]
    pub last_heartbeat_time: Option<DateTime<Utc>>,
    /// Replication epoch of the last applied snapshot (0 before the first)
    #[serde(default)]
    pub epoch: u64,
    /// Highest contiguous sequence applied in `epoch`
    #[serde(default)]
    pub last_applied_seq: u64,
    /// Credentials
    #[serde(default)]
    pub secrets: PeeringSecrets,
    /// Most recent failure, cleared when a stream is established
    #[serde(default)]
    pub last_error: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Set when the peering was deleted locally
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl PeeringRecord {
    fn blank(name: &str, role: PeeringRole) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            role,
            state: PeeringState::Pending,
            peer_id: String::new(),
            server_name: String::new(),
            peer_server_addresses: Vec::new(),
            peer_ca_roots: Vec::new(),
            imported_service_count: 0,
            exported_service_count: 0,
            last_receive_time: None,
            last_send_time: None,
            last_heartbeat_time: None,
            epoch: 0,
            last_applied_seq: 0,
            secrets: PeeringSecrets::default(),
            last_error: None,
            created_at: Utc::now(),
            deleted_at: None,
        }
    }

    /// A new accepting-side peering with a fresh establishment secret
    pub fn new_accepting(name: &str) -> Self {
        let mut record = Self::blank(name, PeeringRole::Accepting);
        record.secrets.establishment = Some(uuid::Uuid::new_v4().to_string());
        record
    }

    /// A new dialing-side peering seeded from a decoded token
    pub fn new_dialing(name: &str, token: &PeeringToken) -> Self {
        let mut record = Self::blank(name, PeeringRole::Dialing);
        record.peer_id = token.peer_id.clone();
        record.server_name = token.server_name.clone();
        record.peer_server_addresses = token.server_addresses.clone();
        record.peer_ca_roots = token.ca_roots.clone();
        record.secrets.establishment = Some(token.establishment_secret.clone());
        record
    }

    /// Move to `next`, rejecting transitions the state machine forbids
    pub fn transition(&mut self, next: PeeringState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::InvalidStateTransition {
                peering: self.name.clone(),
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        if self.state != next {
            tracing::info!(peering = %self.name, from = %self.state, to = %next, "peering state changed");
        }
        self.state = next;
        Ok(())
    }

    /// Mark the peering deleted and drop its credentials
    pub fn terminate(&mut self) {
        self.state = PeeringState::Terminated;
        self.secrets = PeeringSecrets::default();
        if self.deleted_at.is_none() {
            self.deleted_at = Some(Utc::now());
        }
    }

    /// Watermark to resume replication from, `None` before the first snapshot
    pub fn resume_point(&self) -> Option<Resume> {
        (self.epoch > 0).then_some(Resume {
            epoch: self.epoch,
            seq: self.last_applied_seq,
        })
    }

    /// Whether nothing has been received for longer than `stale_after`
    ///
    /// Only meaningful for peerings that are supposed to be replicating; a
    /// peering that never received anything is stale once it is past
    /// `Establishing`.
    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        match self.state {
            PeeringState::Active | PeeringState::FailingOver => {}
            _ => return false,
        }
        let Some(last) = self.last_receive_time else {
            return true;
        };
        // an out-of-range threshold never trips
        chrono::Duration::from_std(stale_after)
            .map(|threshold| now.signed_duration_since(last) > threshold)
            .unwrap_or(false)
    }

    /// Whether the record can still replicate
    pub fn is_live(&self) -> bool {
        !self.state.is_terminal() && self.deleted_at.is_none()
    }
}
