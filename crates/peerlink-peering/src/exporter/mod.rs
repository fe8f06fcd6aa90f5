//! Accepting (exporting) side of peerings
//!
//! The [`Exporter`] owns the local catalog, the exported-services
//! configuration, the cluster's CA roots and server addresses, and one
//! [`PeerOutbox`] per consuming peer. Catalog and configuration changes are
//! recomputed per consumer and fanned out to each outbox independently;
//! sessions accepted from dialing peers drain those outboxes.

mod outbox;
mod session;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use peerlink_common::{metrics, Error, Result, StreamConfig};
use peerlink_common::{DEFAULT_DATACENTER, DEFAULT_TRUST_DOMAIN};
use peerlink_proto::{EntryKey, ServiceEndpoint, ServiceEntry};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub use outbox::{PeerOutbox, Pending};

use crate::catalog::Catalog;
use crate::export::{exported_view, ExportedServicesConfig, SniContext};
use crate::record::{PeeringRecord, PeeringRole};
use crate::store::PeeringStore;
use crate::token::PeeringToken;
use crate::transport::{Acceptor, Connection};
use crate::trust::validate_roots;

/// Settings of the exporting side
#[derive(Clone, Debug)]
pub struct ExporterConfig {
    /// Datacenter name used in SNIs
    pub datacenter: String,
    /// Trust domain used in SNIs
    pub trust_domain: String,
    /// TLS server name of this cluster's servers, embedded in tokens
    pub server_name: String,
    /// Stream tunables
    pub stream: StreamConfig,
    /// Lifetime of generated tokens; `None` issues tokens without expiry
    pub token_ttl: Option<Duration>,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            datacenter: DEFAULT_DATACENTER.to_string(),
            trust_domain: DEFAULT_TRUST_DOMAIN.to_string(),
            server_name: format!("server.{DEFAULT_DATACENTER}.peering.{DEFAULT_TRUST_DOMAIN}"),
            stream: StreamConfig::default(),
            token_ttl: None,
        }
    }
}

struct SessionHandle {
    id: u64,
    cancel: CancellationToken,
}

pub(crate) struct Shared {
    config: ExporterConfig,
    store: Arc<dyn PeeringStore>,
    catalog: Catalog,
    exports: RwLock<ExportedServicesConfig>,
    roots: RwLock<Vec<String>>,
    addresses: RwLock<Vec<String>>,
    outboxes: DashMap<String, Arc<PeerOutbox>>,
    /// Serializes fan-out to outboxes and outbox creation
    fanout: Mutex<()>,
    sessions: DashMap<String, SessionHandle>,
    record_locks: DashMap<String, Arc<Mutex<()>>>,
    next_session: AtomicU64,
}

/// Exporting side of every accepting peering in this cluster
#[derive(Clone)]
pub struct Exporter {
    shared: Arc<Shared>,
}

impl Exporter {
    /// Create an exporter over `store`
    ///
    /// `roots` and `addresses` may start empty; tokens cannot be generated
    /// until both are set.
    pub fn new(
        config: ExporterConfig,
        store: Arc<dyn PeeringStore>,
        roots: Vec<String>,
        addresses: Vec<String>,
    ) -> Result<Self> {
        if !roots.is_empty() {
            validate_roots(&roots)?;
        }
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                store,
                catalog: Catalog::new(),
                exports: RwLock::new(ExportedServicesConfig::new()),
                roots: RwLock::new(roots),
                addresses: RwLock::new(addresses),
                outboxes: DashMap::new(),
                fanout: Mutex::new(()),
                sessions: DashMap::new(),
                record_locks: DashMap::new(),
                next_session: AtomicU64::new(1),
            }),
        })
    }

    /// The local catalog
    pub fn catalog(&self) -> &Catalog {
        &self.shared.catalog
    }

    /// Create or refresh the accepting peering `peer_name` and return its token
    ///
    /// A live peering keeps its ID, state and stream secret; only the
    /// establishment secret is replaced. A terminated peering is replaced by
    /// a fresh record.
    #[instrument(skip(self))]
    pub async fn generate_token(&self, peer_name: &str) -> Result<String> {
        let roots = self.shared.roots.read().await.clone();
        let addresses = self.shared.addresses.read().await.clone();
        if roots.is_empty() {
            return Err(Error::internal_with_context("token", "no CA roots configured"));
        }
        if addresses.is_empty() {
            return Err(Error::internal_with_context(
                "token",
                "no server addresses configured",
            ));
        }

        let existing = self.shared.store.get_by_name(peer_name).await?;
        let record = match existing {
            Some(record) if record.is_live() && record.role == PeeringRole::Accepting => {
                self.shared
                    .update_record(&record.id, |r| {
                        r.secrets.establishment = Some(uuid::Uuid::new_v4().to_string());
                        Ok(())
                    })
                    .await?
            }
            Some(record) if record.is_live() => {
                return Err(Error::internal_with_context(
                    "token",
                    format!("peering {} is a dialing peering", record.name),
                ));
            }
            _ => {
                let record = PeeringRecord::new_accepting(peer_name);
                self.shared.store.put(record.clone()).await?;
                info!(peering = %peer_name, id = %record.id, "accepting peering created");
                record
            }
        };

        let secret = record
            .secrets
            .establishment
            .clone()
            .ok_or_else(|| Error::internal_with_context("token", "establishment secret missing"))?;
        let mut token = PeeringToken::issue(
            &record.id,
            &self.shared.config.server_name,
            &roots,
            &addresses,
            &secret,
        );
        if let Some(ttl) = self.shared.config.token_ttl {
            let ttl = chrono::Duration::from_std(ttl)
                .map_err(|e| Error::internal_with_context("token", e.to_string()))?;
            token = token.with_expiry(Utc::now() + ttl);
        }
        self.shared.outbox_for(&record).await;
        self.shared.sync_exported_count(&record.id).await?;
        token.encode()
    }

    /// Register or replace a local service
    pub async fn register_service(
        &self,
        key: EntryKey,
        endpoints: Vec<ServiceEndpoint>,
    ) -> Result<()> {
        let index = self.shared.catalog.register(key.clone(), endpoints);
        debug!(service = %key, index, "service registered");
        self.shared.refresh_views().await
    }

    /// Remove a local service
    pub async fn deregister_service(&self, key: &EntryKey) -> Result<()> {
        if self.shared.catalog.deregister(key) {
            debug!(service = %key, "service deregistered");
            self.shared.refresh_views().await?;
        }
        Ok(())
    }

    /// Replace the exported-services configuration
    pub async fn set_exported_services(&self, config: ExportedServicesConfig) -> Result<()> {
        *self.shared.exports.write().await = config;
        self.shared.refresh_views().await
    }

    /// Replace this cluster's CA roots and push them to every consumer
    pub async fn update_roots(&self, roots: Vec<String>) -> Result<()> {
        validate_roots(&roots)?;
        let _fanout = self.shared.fanout.lock().await;
        *self.shared.roots.write().await = roots.clone();
        for (_, outbox) in self.shared.live_outboxes() {
            outbox.push_roots(roots.clone()).await;
        }
        info!(roots = roots.len(), "CA roots updated");
        Ok(())
    }

    /// Replace this cluster's server addresses and push them to every consumer
    pub async fn update_addresses(&self, addresses: Vec<String>) -> Result<()> {
        if addresses.is_empty() {
            return Err(Error::internal_with_context(
                "addresses",
                "server address list cannot be empty",
            ));
        }
        let _fanout = self.shared.fanout.lock().await;
        *self.shared.addresses.write().await = addresses.clone();
        for (_, outbox) in self.shared.live_outboxes() {
            outbox.push_addresses(addresses.clone()).await;
        }
        info!(addresses = ?addresses, "server addresses updated");
        Ok(())
    }

    /// Delete the accepting peering `name`
    ///
    /// The connected dialer, if any, receives `Close` and terminates its side.
    pub async fn delete_peering(&self, name: &str) -> Result<()> {
        let record = self
            .shared
            .store
            .get_by_name(name)
            .await?
            .filter(|r| r.role == PeeringRole::Accepting)
            .ok_or_else(|| Error::not_found(name))?;
        self.shared
            .update_record(&record.id, |r| {
                r.terminate();
                Ok(())
            })
            .await?;
        if let Some((_, outbox)) = self.shared.outboxes.remove(&record.id) {
            outbox.close("peering deleted by exporting cluster").await;
        }
        info!(peering = %name, "accepting peering deleted");
        Ok(())
    }

    /// Outbox of a peering, if one exists
    pub fn outbox(&self, peering_id: &str) -> Option<Arc<PeerOutbox>> {
        self.shared.outboxes.get(peering_id).map(|o| o.clone())
    }

    /// Whether a session is currently attached for a peering
    pub fn has_session(&self, peering_id: &str) -> bool {
        self.shared.sessions.contains_key(peering_id)
    }

    /// Serve one accepted connection until it ends
    #[instrument(skip(self, conn), fields(remote = %conn.remote))]
    pub async fn handle_connection(&self, conn: Connection) -> Result<()> {
        session::run(self.shared.clone(), conn).await
    }

    /// Accept connections until `shutdown` fires or the acceptor ends
    pub async fn serve<A: Acceptor>(&self, mut acceptor: A, shutdown: CancellationToken) {
        loop {
            let conn = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                accepted = acceptor.accept() => accepted,
            };
            match conn {
                Ok(Some(conn)) => {
                    let exporter = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = exporter.handle_connection(conn).await {
                            warn!(error = %e, "peering session ended with error");
                        }
                    });
                }
                Ok(None) => break,
                Err(e) => warn!(error = %e, "accept failed"),
            }
        }
        // other listeners may still be serving; only a shutdown ends their sessions
        if shutdown.is_cancelled() {
            for session in self.shared.sessions.iter() {
                session.cancel.cancel();
            }
        }
        info!("exporter stopped accepting");
    }
}

impl Shared {
    fn sni(&self) -> SniContext {
        SniContext {
            datacenter: self.config.datacenter.clone(),
            trust_domain: self.config.trust_domain.clone(),
        }
    }

    fn next_session_id(&self) -> u64 {
        self.next_session.fetch_add(1, Ordering::Relaxed)
    }

    fn record_lock(&self, id: &str) -> Arc<Mutex<()>> {
        self.record_locks.entry(id.to_string()).or_default().clone()
    }

    fn live_outboxes(&self) -> Vec<(String, Arc<PeerOutbox>)> {
        self.outboxes
            .iter()
            .map(|o| (o.key().clone(), o.value().clone()))
            .collect()
    }

    async fn view_for(&self, consumer: &str) -> BTreeMap<EntryKey, ServiceEntry> {
        let exports = self.exports.read().await;
        exported_view(&self.catalog.entries(), &exports, consumer, &self.sni())
    }

    /// Read-modify-write of one record under its lock
    pub(crate) async fn update_record<F>(&self, id: &str, f: F) -> Result<PeeringRecord>
    where
        F: FnOnce(&mut PeeringRecord) -> Result<()>,
    {
        let lock = self.record_lock(id);
        let _guard = lock.lock().await;
        let mut record = self.store.get(id).await?.ok_or_else(|| Error::not_found(id))?;
        f(&mut record)?;
        self.store.put(record.clone()).await?;
        Ok(record)
    }

    /// Outbox of `record`, created from the current view on first use
    async fn outbox_for(&self, record: &PeeringRecord) -> Arc<PeerOutbox> {
        if let Some(outbox) = self.outboxes.get(&record.id) {
            return outbox.clone();
        }
        let _fanout = self.fanout.lock().await;
        let view = self.view_for(&record.name).await;
        let roots = self.roots.read().await.clone();
        let addresses = self.addresses.read().await.clone();
        let fresh = Arc::new(PeerOutbox::new(
            &record.name,
            view,
            roots,
            addresses,
            self.config.stream.max_log_entries,
        ));
        self.outboxes
            .entry(record.id.clone())
            .or_insert(fresh)
            .clone()
    }

    async fn sync_exported_count(&self, id: &str) -> Result<()> {
        let Some(outbox) = self.outboxes.get(id).map(|o| o.clone()) else {
            return Ok(());
        };
        let count = outbox.exported_count().await as u64;
        let record = self
            .update_record(id, |r| {
                r.exported_service_count = count;
                Ok(())
            })
            .await?;
        metrics::set_exported_services(&record.name, count);
        Ok(())
    }

    /// Recompute every consumer's view from the current catalog and exports
    async fn refresh_views(&self) -> Result<()> {
        let _fanout = self.fanout.lock().await;
        for (id, outbox) in self.live_outboxes() {
            let Some(record) = self.store.get(&id).await? else {
                continue;
            };
            if !record.is_live() {
                continue;
            }
            let view = self.view_for(&record.name).await;
            if outbox.replace_view(view).await > 0 {
                self.sync_exported_count(&id).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use peerlink_pki::CertificateAuthority;

    fn exporter() -> (Exporter, Arc<MemoryStore>) {
        let ca = CertificateAuthority::new("east", "east.peerlink.local").unwrap();
        let store = Arc::new(MemoryStore::new());
        let exporter = Exporter::new(
            ExporterConfig::default(),
            store.clone(),
            vec![ca.cert_pem().to_string()],
            vec!["east-1".to_string()],
        )
        .unwrap();
        (exporter, store)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_catalog_churn_settles_on_final_view() {
        let (exporter, store) = exporter();
        exporter.generate_token("west").await.unwrap();
        exporter
            .set_exported_services(ExportedServicesConfig::new().export("*", "west"))
            .await
            .unwrap();
        let record = store.get_by_name("west").await.unwrap().unwrap();

        for _ in 0..30 {
            let mut tasks = Vec::new();
            for i in 0..16 {
                let exporter = exporter.clone();
                tasks.push(tokio::spawn(async move {
                    let key = EntryKey::new(format!("svc-{}", i % 4));
                    exporter
                        .register_service(
                            key.clone(),
                            vec![ServiceEndpoint::new("node-1", "10.0.0.1", 8080)],
                        )
                        .await
                        .unwrap();
                    exporter.deregister_service(&key).await.unwrap();
                }));
            }
            for task in tasks {
                task.await.unwrap();
            }
        }

        assert!(exporter.catalog().is_empty());
        let outbox = exporter.outbox(&record.id).unwrap();
        assert_eq!(outbox.exported_count().await, 0);
        let stored = store.get(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.exported_service_count, 0);
    }

    #[tokio::test]
    async fn test_new_outbox_sees_roots_pushed_before_it() {
        let (exporter, store) = exporter();
        let rotated = CertificateAuthority::new("east", "east.peerlink.local").unwrap();
        let roots = vec![rotated.cert_pem().to_string()];
        exporter.update_roots(roots.clone()).await.unwrap();

        exporter.generate_token("west").await.unwrap();
        let record = store.get_by_name("west").await.unwrap().unwrap();
        let snapshot = exporter.outbox(&record.id).unwrap().snapshot(0).await;
        assert_eq!(snapshot.roots, roots);
        assert_eq!(snapshot.addresses, vec!["east-1".to_string()]);
    }
}
