//! Peering record store
//!
//! The storage layer is an external collaborator; [`PeeringStore`] is the
//! transactional surface the replication engine needs from it. `commit`
//! writes a record together with one change to its imported entries so a
//! crash never leaves the watermark ahead of (or behind) the entries.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use peerlink_common::{Error, Result};
use peerlink_proto::{EntryKey, ServiceEntry};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::record::PeeringRecord;

/// Change to a peering's imported entries, committed with its record
#[derive(Clone, Debug, PartialEq)]
pub enum EntryChange {
    /// Only the record changes
    None,
    /// Replace every entry (snapshot, or clear on termination)
    ReplaceAll(Vec<ServiceEntry>),
    /// Create or replace one entry
    Upsert(ServiceEntry),
    /// Remove one entry
    Delete(EntryKey),
}

/// Durable storage for peering records and imported entries
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PeeringStore: Send + Sync {
    /// Look up a record by ID
    async fn get(&self, id: &str) -> Result<Option<PeeringRecord>>;

    /// Look up a record by local name
    async fn get_by_name(&self, name: &str) -> Result<Option<PeeringRecord>>;

    /// Every record
    async fn list(&self) -> Result<Vec<PeeringRecord>>;

    /// Create or replace a record without touching its entries
    async fn put(&self, record: PeeringRecord) -> Result<()>;

    /// Atomically write a record and one change to its entries
    async fn commit(&self, record: PeeringRecord, change: EntryChange) -> Result<()>;

    /// Imported entries of one peering, ordered by key
    async fn entries(&self, peering_id: &str) -> Result<Vec<ServiceEntry>>;

    /// Remove a record and all of its entries
    async fn delete(&self, id: &str) -> Result<()>;
}

/// Serializable contents of a [`MemoryStore`]
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreState {
    /// Records keyed by ID
    #[serde(default)]
    pub records: BTreeMap<String, PeeringRecord>,
    /// Imported entries keyed by peering ID
    #[serde(default)]
    pub entries: BTreeMap<String, Vec<ServiceEntry>>,
}

#[derive(Default)]
struct Inner {
    records: HashMap<String, PeeringRecord>,
    entries: HashMap<String, BTreeMap<EntryKey, ServiceEntry>>,
}

/// In-process store
///
/// A single lock covers records and entries so `commit` is atomic.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore from a saved state
    pub fn from_state(state: StoreState) -> Self {
        let entries = state
            .entries
            .into_iter()
            .map(|(id, list)| {
                let map = list.into_iter().map(|e| (e.key.clone(), e)).collect();
                (id, map)
            })
            .collect();
        Self {
            inner: RwLock::new(Inner {
                records: state.records.into_iter().collect(),
                entries,
            }),
        }
    }

    /// Copy out the current contents
    pub async fn state(&self) -> StoreState {
        let inner = self.inner.read().await;
        StoreState {
            records: inner
                .records
                .iter()
                .map(|(id, r)| (id.clone(), r.clone()))
                .collect(),
            entries: inner
                .entries
                .iter()
                .filter(|(_, map)| !map.is_empty())
                .map(|(id, map)| (id.clone(), map.values().cloned().collect()))
                .collect(),
        }
    }
}

#[async_trait]
impl PeeringStore for MemoryStore {
    async fn get(&self, id: &str) -> Result<Option<PeeringRecord>> {
        Ok(self.inner.read().await.records.get(id).cloned())
    }

    async fn get_by_name(&self, name: &str) -> Result<Option<PeeringRecord>> {
        let inner = self.inner.read().await;
        // a terminated record may linger under the same name as its replacement
        let mut matches: Vec<_> = inner.records.values().filter(|r| r.name == name).collect();
        matches.sort_by_key(|r| (r.is_live(), r.created_at));
        Ok(matches.last().map(|r| (*r).clone()))
    }

    async fn list(&self) -> Result<Vec<PeeringRecord>> {
        let inner = self.inner.read().await;
        let mut records: Vec<_> = inner.records.values().cloned().collect();
        records.sort_by(|a, b| a.name.cmp(&b.name).then(a.created_at.cmp(&b.created_at)));
        Ok(records)
    }

    async fn put(&self, record: PeeringRecord) -> Result<()> {
        self.inner
            .write()
            .await
            .records
            .insert(record.id.clone(), record);
        Ok(())
    }

    async fn commit(&self, record: PeeringRecord, change: EntryChange) -> Result<()> {
        let mut inner = self.inner.write().await;
        let entries = inner.entries.entry(record.id.clone()).or_default();
        match change {
            EntryChange::None => {}
            EntryChange::ReplaceAll(list) => {
                *entries = list.into_iter().map(|e| (e.key.clone(), e)).collect();
            }
            EntryChange::Upsert(entry) => {
                entries.insert(entry.key.clone(), entry);
            }
            EntryChange::Delete(key) => {
                if entries.remove(&key).is_none() {
                    return Err(Error::storage(
                        "commit",
                        format!("entry {key} not found for peering {}", record.name),
                    ));
                }
            }
        }
        inner.records.insert(record.id.clone(), record);
        Ok(())
    }

    async fn entries(&self, peering_id: &str) -> Result<Vec<ServiceEntry>> {
        Ok(self
            .inner
            .read()
            .await
            .entries
            .get(peering_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.records.remove(id);
        inner.entries.remove(id);
        Ok(())
    }
}
