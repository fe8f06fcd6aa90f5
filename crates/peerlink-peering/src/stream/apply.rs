//! Applying inbound replication messages on the importing side
//!
//! The [`Applier`] is the single writer of one dialing peering's record and
//! imported entries. Every message is applied to a copy of the record and
//! committed together with its entry change; the in-memory record is only
//! swapped in after the commit succeeds, so a failed commit leaves both the
//! store and the applier at the previous watermark.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use peerlink_common::{metrics, Error, Result};
use peerlink_proto::{EntryKey, ReplicationMessage, ServiceEntry, Snapshot};
use tracing::{debug, info, warn};

use crate::record::PeeringRecord;
use crate::store::{EntryChange, PeeringStore};
use crate::trust::{TrustBundle, TrustBundleReconciler};

/// Result of applying one message
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// A sequenced message was applied; acknowledge `seq`
    Applied {
        /// Watermark after the message
        seq: u64,
    },
    /// Liveness only
    Heartbeat,
    /// The exporter deleted the peering; it is now terminated locally
    Closed {
        /// Reason sent by the exporter
        reason: String,
    },
}

/// Serialized apply path of one dialing peering
pub struct Applier {
    store: Arc<dyn PeeringStore>,
    trust: Arc<TrustBundleReconciler>,
    record: PeeringRecord,
    keys: BTreeSet<EntryKey>,
}

impl Applier {
    /// Load a peering and its imported keys from the store
    ///
    /// Publishes the stored trust bundle so validation works before the
    /// first message after a restart.
    pub async fn load(
        store: Arc<dyn PeeringStore>,
        trust: Arc<TrustBundleReconciler>,
        id: &str,
    ) -> Result<Self> {
        let record = store.get(id).await?.ok_or_else(|| Error::not_found(id))?;
        let keys = store
            .entries(id)
            .await?
            .into_iter()
            .map(|e| e.key)
            .collect();
        if record.is_live() {
            match TrustBundle::from_record(&record) {
                Ok(bundle) => trust.publish(&record.id, bundle),
                Err(e) => warn!(peering = %record.name, error = %e, "stored trust bundle is unusable"),
            }
        }
        Ok(Self {
            store,
            trust,
            record,
            keys,
        })
    }

    /// Current record
    pub fn record(&self) -> &PeeringRecord {
        &self.record
    }

    /// Mutable record for stream-manager bookkeeping; call [`persist`](Self::persist) after
    pub fn record_mut(&mut self) -> &mut PeeringRecord {
        &mut self.record
    }

    /// Write the record without touching entries
    pub async fn persist(&mut self) -> Result<()> {
        self.store.put(self.record.clone()).await
    }

    /// Keys of the currently imported entries
    pub fn imported_keys(&self) -> impl Iterator<Item = &EntryKey> {
        self.keys.iter()
    }

    /// Apply one inbound message
    pub async fn apply(&mut self, message: ReplicationMessage) -> Result<ApplyOutcome> {
        if !self.record.is_live() {
            return Err(Error::PeeringTerminated {
                peering: self.record.name.clone(),
            });
        }
        let kind = message.kind();
        let outcome = match message {
            ReplicationMessage::Snapshot(snapshot) => self.apply_snapshot(snapshot).await?,
            ReplicationMessage::Upsert { seq, entry } => self.apply_upsert(seq, entry).await?,
            ReplicationMessage::Delete { seq, key } => self.apply_delete(seq, key).await?,
            ReplicationMessage::RootUpdate { seq, roots } => {
                self.apply_roots(seq, roots).await?
            }
            ReplicationMessage::AddressUpdate { seq, addresses } => {
                self.apply_addresses(seq, addresses).await?
            }
            ReplicationMessage::Heartbeat => self.apply_heartbeat().await?,
            ReplicationMessage::Close { reason } => {
                self.terminate().await?;
                ApplyOutcome::Closed { reason }
            }
            other => {
                return Err(Error::protocol(format!(
                    "unexpected {} on an established stream",
                    other.kind()
                )))
            }
        };
        metrics::record_message_applied(&self.record.name, kind);
        Ok(outcome)
    }

    /// Terminate the peering locally and drop everything it imported
    pub async fn terminate(&mut self) -> Result<()> {
        let mut next = self.record.clone();
        next.terminate();
        next.imported_service_count = 0;
        self.store
            .commit(next.clone(), EntryChange::ReplaceAll(Vec::new()))
            .await?;
        self.record = next;
        self.keys.clear();
        self.trust.remove(&self.record.id);
        metrics::set_imported_services(&self.record.name, 0);
        info!(peering = %self.record.name, "peering terminated");
        Ok(())
    }

    fn expect_next(&self, seq: u64) -> Result<()> {
        if self.record.epoch == 0 {
            return Err(Error::apply_conflict(
                &self.record.name,
                "delta received before the first snapshot",
            ));
        }
        let expected = self
            .record
            .last_applied_seq
            .checked_add(1)
            .ok_or_else(|| Error::apply_conflict(&self.record.name, "sequence space exhausted"))?;
        if seq != expected {
            return Err(Error::StaleSequence {
                peering: self.record.name.clone(),
                expected,
                got: seq,
            });
        }
        Ok(())
    }

    /// Copy of the record advanced to `seq` and marked as just received
    fn advanced(&self, seq: u64) -> PeeringRecord {
        let mut next = self.record.clone();
        next.last_applied_seq = seq;
        next.last_receive_time = Some(Utc::now());
        next
    }

    fn stamp(&self, mut entry: ServiceEntry) -> ServiceEntry {
        entry.peer_name = self.record.name.clone();
        entry
    }

    async fn apply_snapshot(&mut self, snapshot: Snapshot) -> Result<ApplyOutcome> {
        // epochs only move forward; a replayed snapshot must not roll back the view
        if snapshot.epoch <= self.record.epoch {
            return Err(Error::StaleSequence {
                peering: self.record.name.clone(),
                expected: self.record.epoch.saturating_add(1),
                got: snapshot.epoch,
            });
        }
        let bundle = TrustBundle::new(self.record.id.clone(), snapshot.roots.clone())?;
        let entries: Vec<ServiceEntry> = snapshot
            .entries
            .into_iter()
            .map(|e| self.stamp(e))
            .collect();

        let mut next = self.advanced(snapshot.seq);
        next.epoch = snapshot.epoch;
        next.peer_ca_roots = snapshot.roots;
        // an empty list would leave nothing to dial; keep what we have
        if !snapshot.addresses.is_empty() {
            next.peer_server_addresses = snapshot.addresses;
        }
        next.imported_service_count = entries.len() as u64;
        let keys = entries.iter().map(|e| e.key.clone()).collect();

        self.store
            .commit(next.clone(), EntryChange::ReplaceAll(entries))
            .await?;
        info!(
            peering = %next.name,
            epoch = next.epoch,
            seq = next.last_applied_seq,
            services = next.imported_service_count,
            "snapshot applied"
        );
        self.record = next;
        self.keys = keys;
        self.trust.publish(&self.record.id, bundle);
        metrics::set_imported_services(&self.record.name, self.record.imported_service_count);
        Ok(ApplyOutcome::Applied { seq: snapshot.seq })
    }

    async fn apply_upsert(&mut self, seq: u64, entry: ServiceEntry) -> Result<ApplyOutcome> {
        self.expect_next(seq)?;
        let entry = self.stamp(entry);
        let key = entry.key.clone();
        let is_new = !self.keys.contains(&key);

        let mut next = self.advanced(seq);
        next.imported_service_count = (self.keys.len() + usize::from(is_new)) as u64;
        self.store
            .commit(next.clone(), EntryChange::Upsert(entry))
            .await?;
        debug!(peering = %next.name, seq, service = %key, "upsert applied");
        self.record = next;
        self.keys.insert(key);
        metrics::set_imported_services(&self.record.name, self.record.imported_service_count);
        Ok(ApplyOutcome::Applied { seq })
    }

    async fn apply_delete(&mut self, seq: u64, key: EntryKey) -> Result<ApplyOutcome> {
        self.expect_next(seq)?;
        if !self.keys.contains(&key) {
            return Err(Error::apply_conflict(
                &self.record.name,
                format!("delete of unknown entry {key}"),
            ));
        }

        let mut next = self.advanced(seq);
        next.imported_service_count = (self.keys.len() - 1) as u64;
        self.store
            .commit(next.clone(), EntryChange::Delete(key.clone()))
            .await?;
        debug!(peering = %next.name, seq, service = %key, "delete applied");
        self.record = next;
        self.keys.remove(&key);
        metrics::set_imported_services(&self.record.name, self.record.imported_service_count);
        Ok(ApplyOutcome::Applied { seq })
    }

    async fn apply_roots(&mut self, seq: u64, roots: Vec<String>) -> Result<ApplyOutcome> {
        self.expect_next(seq)?;
        let bundle = TrustBundle::new(self.record.id.clone(), roots.clone())?;

        let mut next = self.advanced(seq);
        next.peer_ca_roots = roots;
        self.store.commit(next.clone(), EntryChange::None).await?;
        info!(peering = %next.name, seq, roots = next.peer_ca_roots.len(), "root update applied");
        self.record = next;
        self.trust.publish(&self.record.id, bundle);
        Ok(ApplyOutcome::Applied { seq })
    }

    async fn apply_addresses(&mut self, seq: u64, addresses: Vec<String>) -> Result<ApplyOutcome> {
        self.expect_next(seq)?;
        if addresses.is_empty() {
            return Err(Error::apply_conflict(
                &self.record.name,
                "address update with an empty list",
            ));
        }

        let mut next = self.advanced(seq);
        next.peer_server_addresses = addresses;
        self.store.commit(next.clone(), EntryChange::None).await?;
        info!(peering = %next.name, seq, addresses = ?next.peer_server_addresses, "address update applied");
        self.record = next;
        Ok(ApplyOutcome::Applied { seq })
    }

    async fn apply_heartbeat(&mut self) -> Result<ApplyOutcome> {
        let now = Utc::now();
        if let Some(age) = self
            .record
            .last_receive_time
            .and_then(|last| now.signed_duration_since(last).to_std().ok())
        {
            metrics::record_heartbeat_age(&self.record.name, age);
        }
        let mut next = self.record.clone();
        next.last_receive_time = Some(now);
        next.last_heartbeat_time = Some(now);
        self.store.put(next.clone()).await?;
        self.record = next;
        Ok(ApplyOutcome::Heartbeat)
    }
}
