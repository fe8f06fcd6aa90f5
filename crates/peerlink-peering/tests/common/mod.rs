//! Shared harness for peering scenario tests
//!
//! Two clusters talk over one [`MemoryNetwork`]. The accepting cluster runs
//! an exporter behind any number of listener addresses (its "servers"); the
//! dialing cluster runs a registry over its own store.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use peerlink_common::{RetryConfig, StreamConfig};
use peerlink_peering::{
    Exporter, ExporterConfig, MemoryNetwork, MemoryStore, PeeringRecord, PeeringRegistry,
    PeeringState, PeeringStore,
};
use peerlink_pki::{CertificateAuthority, RootRotation};
use peerlink_proto::{EntryKey, ServiceEndpoint, ServiceEntry};
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

/// How long `eventually` waits before failing a test
pub const SETTLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Stream settings short enough for tests
pub fn fast_config() -> StreamConfig {
    StreamConfig {
        heartbeat_interval: Duration::from_millis(50),
        heartbeat_timeout: Duration::from_millis(500),
        connect_timeout: Duration::from_millis(500),
        backoff: RetryConfig {
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            jitter: false,
        },
        ..StreamConfig::default()
    }
}

/// Poll `check` until it holds, panicking with `what` after [`SETTLE_TIMEOUT`]
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + SETTLE_TIMEOUT;
    loop {
        if check().await {
            return;
        }
        if Instant::now() >= deadline {
            panic!("timed out waiting for: {what}");
        }
        sleep(Duration::from_millis(10)).await;
    }
}

/// Endpoint list with one instance
pub fn endpoints(address: &str) -> Vec<ServiceEndpoint> {
    vec![ServiceEndpoint::new("node-1", address, 8080)]
}

/// The accepting (exporting) cluster
pub struct AcceptingCluster {
    pub exporter: Exporter,
    pub store: Arc<MemoryStore>,
    pub network: MemoryNetwork,
    pub rotation: RootRotation,
    pub shutdown: CancellationToken,
}

impl AcceptingCluster {
    /// Start an exporter serving on every address in `servers`
    pub fn start(network: &MemoryNetwork, servers: &[&str], config: StreamConfig) -> Self {
        let rotation = RootRotation::new(
            CertificateAuthority::new("east", "east.peerlink.local").unwrap(),
        );
        let store = Arc::new(MemoryStore::new());
        let exporter = Exporter::new(
            ExporterConfig {
                trust_domain: "east.peerlink.local".to_string(),
                stream: config,
                ..ExporterConfig::default()
            },
            store.clone(),
            rotation.roots_pem(),
            servers.iter().map(|s| s.to_string()).collect(),
        )
        .unwrap();
        let cluster = Self {
            exporter,
            store,
            network: network.clone(),
            rotation,
            shutdown: CancellationToken::new(),
        };
        for server in servers {
            cluster.serve_on(server);
        }
        cluster
    }

    /// Bring up a server on `address`
    pub fn serve_on(&self, address: &str) {
        let listener = self.network.listen(address);
        let exporter = self.exporter.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move { exporter.serve(listener, shutdown).await });
    }

    /// Take the server on `address` down, dropping its streams
    pub fn stop_server(&self, address: &str) {
        self.network.shutdown(address);
    }

    /// Accepting record named `name`
    pub async fn record(&self, name: &str) -> PeeringRecord {
        self.store.get_by_name(name).await.unwrap().unwrap()
    }

    /// Wait until the accepting record `name` reports `count` exported services
    pub async fn wait_for_exported_count(&self, name: &str, count: u64) {
        eventually(&format!("{name} to export {count} services"), || async move {
            self.record(name).await.exported_service_count == count
        })
        .await;
    }

    /// Register `service` in the local catalog
    pub async fn register(&self, service: &str) {
        self.exporter
            .register_service(EntryKey::new(service), endpoints("10.1.0.1"))
            .await
            .unwrap();
    }
}

impl Drop for AcceptingCluster {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// The dialing (importing) cluster
pub struct DialingCluster {
    pub registry: PeeringRegistry,
    pub store: Arc<MemoryStore>,
}

impl DialingCluster {
    /// A registry over a fresh store
    pub fn start(network: &MemoryNetwork, config: StreamConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        Self::over(network, store, config)
    }

    /// A registry over an existing store, as after a leader change
    pub fn over(network: &MemoryNetwork, store: Arc<MemoryStore>, config: StreamConfig) -> Self {
        let registry = PeeringRegistry::new(store.clone(), Arc::new(network.clone()), config);
        Self { registry, store }
    }

    /// Current record of peering `id`
    pub async fn record(&self, id: &str) -> PeeringRecord {
        self.store.get(id).await.unwrap().unwrap()
    }

    /// Imported entries of peering `id`
    pub async fn entries(&self, id: &str) -> Vec<ServiceEntry> {
        self.store.entries(id).await.unwrap()
    }

    /// Imported service names of peering `id`
    pub async fn services(&self, id: &str) -> Vec<String> {
        self.entries(id)
            .await
            .into_iter()
            .map(|e| e.key.service)
            .collect()
    }

    /// Wait until peering `id` reaches `state`
    pub async fn wait_for_state(&self, id: &str, state: PeeringState) {
        eventually(&format!("peering {id} to be {state}"), || async move {
            self.record(id).await.state == state
        })
        .await;
    }

    /// Wait until peering `id` imports exactly `services`
    pub async fn wait_for_services(&self, id: &str, services: &[&str]) {
        let mut expected: Vec<String> = services.iter().map(|s| s.to_string()).collect();
        expected.sort();
        let expected = &expected;
        eventually(&format!("peering {id} to import {services:?}"), || async move {
            self.services(id).await == *expected
        })
        .await;
    }
}

/// Peer `dialing` with `accepting` under the names both sides use
pub async fn peer(accepting: &AcceptingCluster, dialing: &DialingCluster) -> PeeringRecord {
    let token = accepting.exporter.generate_token("west").await.unwrap();
    let record = dialing.registry.establish("east", &token).await.unwrap();
    dialing.wait_for_state(&record.id, PeeringState::Active).await;
    record
}
