//! Per-consumer replication outbox
//!
//! Holds the consumer's current exported view, the latest roots and
//! addresses, and a bounded log of sequenced messages since the last
//! snapshot. Sessions drain the log from their cursor; a cursor that fell
//! out of the retained window is answered with a snapshot instead.

use std::collections::{BTreeMap, VecDeque};

use peerlink_proto::{EntryKey, ReplicationMessage, Resume, ServiceEntry, Snapshot};
use tokio::sync::{watch, Mutex};
use tracing::{debug, trace};

use crate::export::{diff_views, ViewChange};

/// What a session should send next
#[derive(Clone, Debug, PartialEq)]
pub enum Pending {
    /// Sequenced messages after the cursor, possibly none
    Messages(Vec<ReplicationMessage>),
    /// The cursor is older than the retained log; a snapshot is required
    Gap,
    /// The peering was deleted; send `Close` and stop
    Closed(String),
}

#[derive(Debug)]
struct OutboxState {
    epoch: u64,
    head_seq: u64,
    acked_seq: u64,
    log: VecDeque<ReplicationMessage>,
    view: BTreeMap<EntryKey, ServiceEntry>,
    roots: Vec<String>,
    addresses: Vec<String>,
    closed: Option<String>,
}

impl OutboxState {
    /// Sequence of the oldest retained message, or `head + 1` when empty
    fn first_retained(&self) -> u64 {
        self.log
            .front()
            .and_then(ReplicationMessage::seq)
            .unwrap_or(self.head_seq.saturating_add(1))
    }

    fn apply_change(&mut self, change: ViewChange, cap: usize) {
        match change {
            ViewChange::Upsert(entry) => {
                self.view.insert(entry.key.clone(), entry.clone());
                self.append(|seq| ReplicationMessage::Upsert { seq, entry }, cap);
            }
            ViewChange::Delete(key) => {
                self.view.remove(&key);
                self.append(|seq| ReplicationMessage::Delete { seq, key }, cap);
            }
        }
    }

    fn append(&mut self, make: impl FnOnce(u64) -> ReplicationMessage, cap: usize) {
        self.head_seq += 1;
        self.log.push_back(make(self.head_seq));
        while self.log.len() > cap {
            self.log.pop_front();
        }
    }
}

/// Outbox of one consuming peer
#[derive(Debug)]
pub struct PeerOutbox {
    peering_name: String,
    max_log_entries: usize,
    state: Mutex<OutboxState>,
    version: watch::Sender<u64>,
}

impl PeerOutbox {
    /// Create an outbox seeded with the consumer's current view
    pub fn new(
        peering_name: &str,
        view: BTreeMap<EntryKey, ServiceEntry>,
        roots: Vec<String>,
        addresses: Vec<String>,
        max_log_entries: usize,
    ) -> Self {
        Self {
            peering_name: peering_name.to_string(),
            max_log_entries: max_log_entries.max(1),
            state: Mutex::new(OutboxState {
                epoch: 0,
                head_seq: 0,
                acked_seq: 0,
                log: VecDeque::new(),
                view,
                roots,
                addresses,
                closed: None,
            }),
            version: watch::channel(0).0,
        }
    }

    fn notify(&self) {
        self.version.send_modify(|v| *v = v.wrapping_add(1));
    }

    /// Receiver that changes whenever something is appended or the outbox closes
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    /// Append one view change
    pub async fn push_change(&self, change: ViewChange) {
        self.state
            .lock()
            .await
            .apply_change(change, self.max_log_entries);
        self.notify();
    }

    /// Replace the view, appending the difference; returns the number of changes
    ///
    /// Diffing and appending happen under one lock.
    pub async fn replace_view(&self, view: BTreeMap<EntryKey, ServiceEntry>) -> usize {
        let mut state = self.state.lock().await;
        let changes = diff_views(&state.view, &view);
        let count = changes.len();
        for change in changes {
            state.apply_change(change, self.max_log_entries);
        }
        drop(state);
        if count > 0 {
            self.notify();
            debug!(peering = %self.peering_name, changes = count, "exported view changed");
        }
        count
    }

    /// Append a wholesale root replacement
    pub async fn push_roots(&self, roots: Vec<String>) {
        let mut state = self.state.lock().await;
        state.roots = roots.clone();
        state.append(|seq| ReplicationMessage::RootUpdate { seq, roots }, self.max_log_entries);
        drop(state);
        self.notify();
    }

    /// Append a wholesale address replacement
    pub async fn push_addresses(&self, addresses: Vec<String>) {
        let mut state = self.state.lock().await;
        state.addresses = addresses.clone();
        state.append(
            |seq| ReplicationMessage::AddressUpdate { seq, addresses },
            self.max_log_entries,
        );
        drop(state);
        self.notify();
    }

    /// Record the consumer's acknowledgement and drop what it covers
    pub async fn ack(&self, seq: u64) {
        let mut state = self.state.lock().await;
        if seq <= state.acked_seq || seq > state.head_seq {
            return;
        }
        state.acked_seq = seq;
        while state
            .log
            .front()
            .and_then(ReplicationMessage::seq)
            .is_some_and(|s| s <= seq)
        {
            state.log.pop_front();
        }
        trace!(peering = %self.peering_name, seq, retained = state.log.len(), "ack compacted log");
    }

    /// Start a new epoch from the current state
    ///
    /// The epoch always exceeds both the outbox's previous epoch and the one
    /// the consumer last saw, so a consumer never mistakes a new snapshot for
    /// an old one after the exporter restarted.
    pub async fn snapshot(&self, resume_epoch: u64) -> Snapshot {
        let mut state = self.state.lock().await;
        state.epoch = state.epoch.max(resume_epoch) + 1;
        state.log.clear();
        state.acked_seq = state.head_seq;
        Snapshot {
            epoch: state.epoch,
            seq: state.head_seq,
            entries: state.view.values().cloned().collect(),
            roots: state.roots.clone(),
            addresses: state.addresses.clone(),
        }
    }

    /// Whether a consumer at `resume` can be caught up from the log alone
    pub async fn can_resume(&self, resume: Resume) -> bool {
        let state = self.state.lock().await;
        state.epoch > 0
            && resume.epoch == state.epoch
            && resume.seq <= state.head_seq
            && resume.seq.saturating_add(1) >= state.first_retained()
    }

    /// Messages after `cursor`
    pub async fn pending_after(&self, cursor: u64) -> Pending {
        let state = self.state.lock().await;
        if let Some(reason) = &state.closed {
            return Pending::Closed(reason.clone());
        }
        if cursor >= state.head_seq {
            return Pending::Messages(Vec::new());
        }
        if cursor.saturating_add(1) < state.first_retained() {
            return Pending::Gap;
        }
        Pending::Messages(
            state
                .log
                .iter()
                .filter(|m| m.seq().is_some_and(|s| s > cursor))
                .cloned()
                .collect(),
        )
    }

    /// Mark the peering deleted
    pub async fn close(&self, reason: &str) {
        self.state.lock().await.closed = Some(reason.to_string());
        self.notify();
    }

    /// Number of services in the consumer's view
    pub async fn exported_count(&self) -> usize {
        self.state.lock().await.view.len()
    }

    /// Current epoch and head sequence
    pub async fn position(&self) -> (u64, u64) {
        let state = self.state.lock().await;
        (state.epoch, state.head_seq)
    }

    /// Number of retained log messages
    pub async fn retained(&self) -> usize {
        self.state.lock().await.log.len()
    }
}
