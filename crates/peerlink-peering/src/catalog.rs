//! Local service catalog of the exporting cluster
//!
//! Stands in for the catalog the consensus layer maintains. Every write bumps
//! a cluster-wide modify index that is carried on the wire as the entry's
//! version marker.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use peerlink_proto::{EntryKey, ServiceEndpoint};

/// One locally registered service
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CatalogService {
    /// Namespace and name
    pub key: EntryKey,
    /// Registered instances
    pub endpoints: Vec<ServiceEndpoint>,
    /// Index of the write that produced this version
    pub modify_index: u64,
}

/// Concurrent catalog keyed by [`EntryKey`]
#[derive(Debug, Default)]
pub struct Catalog {
    services: DashMap<EntryKey, CatalogService>,
    index: AtomicU64,
}

impl Catalog {
    /// Create an empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a service, returning its new modify index
    pub fn register(&self, key: EntryKey, endpoints: Vec<ServiceEndpoint>) -> u64 {
        let modify_index = self.index.fetch_add(1, Ordering::SeqCst) + 1;
        self.services.insert(
            key.clone(),
            CatalogService {
                key,
                endpoints,
                modify_index,
            },
        );
        modify_index
    }

    /// Remove a service; returns whether it existed
    pub fn deregister(&self, key: &EntryKey) -> bool {
        let removed = self.services.remove(key).is_some();
        if removed {
            self.index.fetch_add(1, Ordering::SeqCst);
        }
        removed
    }

    /// Look up one service
    pub fn get(&self, key: &EntryKey) -> Option<CatalogService> {
        self.services.get(key).map(|s| s.clone())
    }

    /// Every service, ordered by key
    pub fn entries(&self) -> Vec<CatalogService> {
        let mut all: Vec<_> = self.services.iter().map(|s| s.value().clone()).collect();
        all.sort_by(|a, b| a.key.cmp(&b.key));
        all
    }

    /// Number of registered services
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}
