//! Export filter
//!
//! Decides which local services a consuming peer may see. Decisions are
//! derived on every evaluation and never stored; the exporter recomputes a
//! consumer's view whenever the configuration or the catalog changes and
//! fans the difference out to that consumer's outbox.

use std::collections::{BTreeMap, BTreeSet};

use peerlink_proto::{EntryKey, ServiceEntry};
use serde::{Deserialize, Serialize};

use crate::catalog::CatalogService;
use crate::gateway::service_sni;

/// Config entry name that applies to every service without its own entry
pub const WILDCARD: &str = "*";

/// Service name to the set of peer names allowed to import it
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportedServicesConfig {
    /// Consumers per service name
    #[serde(default)]
    pub services: BTreeMap<String, BTreeSet<String>>,
}

impl ExportedServicesConfig {
    /// Create an empty config
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow `consumer` to import `service`
    pub fn export(mut self, service: &str, consumer: &str) -> Self {
        self.services
            .entry(service.to_string())
            .or_default()
            .insert(consumer.to_string());
        self
    }

    /// Remove the whole entry for `service`
    pub fn unexport(mut self, service: &str) -> Self {
        self.services.remove(service);
        self
    }

    /// Consumers governing `service`
    ///
    /// An explicit entry wins over the wildcard, even when its set is empty.
    pub fn consumers(&self, service: &str) -> Option<&BTreeSet<String>> {
        self.services
            .get(service)
            .or_else(|| self.services.get(WILDCARD))
    }
}

/// Outcome of evaluating one (service, consumer) pair
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExportDecision {
    /// The consumer sees the service
    Allowed,
    /// The service is silently left out of the consumer's view
    Denied,
}

/// Evaluate the config for one service and consumer
pub fn decide(service: &str, config: &ExportedServicesConfig, consumer: &str) -> ExportDecision {
    match config.consumers(service) {
        Some(consumers) if consumers.contains(consumer) => ExportDecision::Allowed,
        _ => ExportDecision::Denied,
    }
}

/// Whether `consumer` may import `service`
pub fn eligible(service: &str, config: &ExportedServicesConfig, consumer: &str) -> bool {
    decide(service, config, consumer) == ExportDecision::Allowed
}

/// Naming inputs for the SNI of exported entries
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SniContext {
    /// Datacenter of the exporting cluster
    pub datacenter: String,
    /// Trust domain of the exporting cluster
    pub trust_domain: String,
}

/// Wire form of one catalog service
pub fn to_entry(service: &CatalogService, sni: &SniContext) -> ServiceEntry {
    ServiceEntry {
        key: service.key.clone(),
        peer_name: String::new(),
        endpoints: service.endpoints.clone(),
        sni: service_sni(&service.key, &sni.datacenter, &sni.trust_domain),
        version: service.modify_index,
    }
}

/// Everything `consumer` is allowed to see
pub fn exported_view<'a, I>(
    catalog: I,
    config: &ExportedServicesConfig,
    consumer: &str,
    sni: &SniContext,
) -> BTreeMap<EntryKey, ServiceEntry>
where
    I: IntoIterator<Item = &'a CatalogService>,
{
    catalog
        .into_iter()
        .filter(|svc| eligible(&svc.key.service, config, consumer))
        .map(|svc| (svc.key.clone(), to_entry(svc, sni)))
        .collect()
}

/// One change between two views
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ViewChange {
    /// Entry is new or differs from the old view
    Upsert(ServiceEntry),
    /// Entry is gone from the new view
    Delete(EntryKey),
}

/// Changes that turn `old` into `new`, in key order, upserts before deletes
pub fn diff_views(
    old: &BTreeMap<EntryKey, ServiceEntry>,
    new: &BTreeMap<EntryKey, ServiceEntry>,
) -> Vec<ViewChange> {
    let upserts = new
        .iter()
        .filter(|(key, entry)| old.get(*key) != Some(*entry))
        .map(|(_, entry)| ViewChange::Upsert(entry.clone()));
    let deletes = old
        .keys()
        .filter(|key| !new.contains_key(*key))
        .map(|key| ViewChange::Delete(key.clone()));
    upserts.chain(deletes).collect()
}
