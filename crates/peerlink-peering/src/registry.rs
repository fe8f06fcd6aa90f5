//! Dialing peering registry
//!
//! Process-wide registry of dialer tasks keyed by peering ID. It runs the
//! establishment workflow on the dialing side, starts and stops stream
//! tasks, and restarts every live dialing peering after a leader change.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use peerlink_common::{Error, Result, StreamConfig};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::record::{PeeringRecord, PeeringRole};
use crate::store::PeeringStore;
use crate::stream::{run_dialer, Applier, DialerCommand, DialerContext, DialerExit, StreamState};
use crate::token::PeeringToken;
use crate::transport::Transport;
use crate::trust::{TrustBundle, TrustBundleReconciler};

struct TaskHandle {
    cancel: CancellationToken,
    control: mpsc::Sender<DialerCommand>,
    state: watch::Receiver<StreamState>,
    join: JoinHandle<DialerExit>,
}

impl TaskHandle {
    fn is_running(&self) -> bool {
        !self.join.is_finished()
    }
}

/// Registry of dialing peerings and their stream tasks
pub struct PeeringRegistry {
    ctx: Arc<DialerContext>,
    tasks: DashMap<String, TaskHandle>,
}

impl PeeringRegistry {
    /// Create a registry over `store`, dialing through `transport`
    pub fn new(
        store: Arc<dyn PeeringStore>,
        transport: Arc<dyn Transport>,
        config: StreamConfig,
    ) -> Self {
        Self {
            ctx: Arc::new(DialerContext {
                store,
                transport,
                trust: Arc::new(TrustBundleReconciler::new()),
                config,
            }),
            tasks: DashMap::new(),
        }
    }

    /// Trust bundles of every dialing peering
    pub fn trust(&self) -> Arc<TrustBundleReconciler> {
        self.ctx.trust.clone()
    }

    /// Establish a dialing peering from a token and start streaming
    ///
    /// Establishing under the name of a live dialing peering terminates it
    /// first; the new peering gets a fresh ID and starts from a snapshot.
    #[instrument(skip(self, token))]
    pub async fn establish(&self, peer_name: &str, token: &str) -> Result<PeeringRecord> {
        let token = PeeringToken::decode(token)?;
        let bundle_roots = token.ca_roots.clone();

        if let Some(existing) = self.ctx.store.get_by_name(peer_name).await? {
            if existing.is_live() {
                if existing.role != PeeringRole::Dialing {
                    return Err(Error::internal_with_context(
                        "establish",
                        format!("peering {peer_name} already exists as an accepting peering"),
                    ));
                }
                info!(peering = %peer_name, old_id = %existing.id, "re-establishing peering");
                self.terminate(&existing.id, "peering re-established").await?;
            }
        }

        let record = PeeringRecord::new_dialing(peer_name, &token);
        let bundle = TrustBundle::new(record.id.clone(), bundle_roots)?;
        self.ctx.store.put(record.clone()).await?;
        self.ctx.trust.publish(&record.id, bundle);
        info!(
            peering = %record.name,
            id = %record.id,
            peer_id = %record.peer_id,
            addresses = record.peer_server_addresses.len(),
            "peering established from token"
        );

        self.start(&record.id);
        Ok(record)
    }

    /// Start the dialer of `id` unless it is already running
    pub fn start(&self, id: &str) {
        // the entry guard is held across the spawn so two callers cannot both start
        match self.tasks.entry(id.to_string()) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_running() {
                    debug!(peering_id = %id, "dialer already running");
                    return;
                }
                entry.insert(self.spawn_dialer(id));
            }
            Entry::Vacant(entry) => {
                entry.insert(self.spawn_dialer(id));
            }
        }
    }

    fn spawn_dialer(&self, id: &str) -> TaskHandle {
        let cancel = CancellationToken::new();
        let (control_tx, control_rx) = mpsc::channel(4);
        let (state_tx, state_rx) = watch::channel(StreamState::Idle);
        let join = tokio::spawn(run_dialer(
            self.ctx.clone(),
            id.to_string(),
            cancel.clone(),
            control_rx,
            state_tx,
        ));
        TaskHandle {
            cancel,
            control: control_tx,
            state: state_rx,
            join,
        }
    }

    /// Stop the dialer of `id` without changing the peering
    pub async fn stop(&self, id: &str) -> Option<DialerExit> {
        let (_, handle) = self.tasks.remove(id)?;
        handle.cancel.cancel();
        handle.join.await.ok()
    }

    /// Terminate the dialing peering `id`
    ///
    /// A running dialer sends `Close` to the exporter if it is streaming;
    /// otherwise the peering is terminated locally.
    pub async fn terminate(&self, id: &str, reason: &str) -> Result<()> {
        if let Some((_, handle)) = self.tasks.remove(id) {
            if handle.is_running() {
                let command = DialerCommand::Terminate {
                    reason: reason.to_string(),
                };
                if handle.control.send(command).await.is_ok() {
                    match handle.join.await {
                        Ok(DialerExit::Terminated) => return Ok(()),
                        Ok(exit) => debug!(peering_id = %id, ?exit, "dialer ended before terminating"),
                        Err(e) => warn!(peering_id = %id, error = %e, "dialer task failed"),
                    }
                } else {
                    handle.cancel.cancel();
                    let _ = handle.join.await;
                }
            }
        }

        let mut applier = Applier::load(self.ctx.store.clone(), self.ctx.trust.clone(), id).await?;
        if applier.record().is_live() {
            applier.terminate().await?;
        }
        Ok(())
    }

    /// Delete the dialing peering named `name`
    pub async fn delete_peering(&self, name: &str) -> Result<()> {
        let record = self
            .ctx
            .store
            .get_by_name(name)
            .await?
            .filter(|r| r.role == PeeringRole::Dialing)
            .ok_or_else(|| Error::not_found(name))?;
        self.terminate(&record.id, "peering deleted").await
    }

    /// Start a dialer for every live dialing peering in the store
    ///
    /// Called when this process becomes leader. Each dialer resumes from the
    /// stored watermark.
    pub async fn resume_all(&self) -> Result<usize> {
        let mut started = 0;
        for record in self.ctx.store.list().await? {
            if record.role != PeeringRole::Dialing || !record.is_live() {
                continue;
            }
            info!(
                peering = %record.name,
                epoch = record.epoch,
                seq = record.last_applied_seq,
                "resuming peering"
            );
            self.start(&record.id);
            started += 1;
        }
        Ok(started)
    }

    /// Connection state of the dialer of `id`
    pub fn stream_state(&self, id: &str) -> Option<StreamState> {
        self.tasks.get(id).map(|handle| *handle.state.borrow())
    }

    /// Watch the connection state of the dialer of `id`
    pub fn subscribe_state(&self, id: &str) -> Option<watch::Receiver<StreamState>> {
        self.tasks.get(id).map(|handle| handle.state.clone())
    }

    /// Whether the dialer of `id` is running
    pub fn is_running(&self, id: &str) -> bool {
        self.tasks
            .get(id)
            .map(|handle| handle.is_running())
            .unwrap_or(false)
    }

    /// Stop every dialer; used when leadership is lost
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.tasks.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.stop(&id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::PeeringState;
    use crate::store::MemoryStore;
    use crate::transport::MemoryNetwork;
    use peerlink_pki::CertificateAuthority;

    fn token(addresses: &[&str]) -> String {
        let root = CertificateAuthority::new("east", "east.peerlink.local")
            .unwrap()
            .cert_pem()
            .to_string();
        let addresses: Vec<String> = addresses.iter().map(|a| a.to_string()).collect();
        PeeringToken::issue("acceptor-id", "server.east", &[root], &addresses, "secret")
            .encode()
            .unwrap()
    }

    fn registry(store: Arc<MemoryStore>) -> PeeringRegistry {
        PeeringRegistry::new(store, Arc::new(MemoryNetwork::new()), StreamConfig::default())
    }

    #[tokio::test]
    async fn test_establish_persists_record_and_publishes_trust() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(store.clone());

        let record = registry.establish("east", &token(&["nowhere"])).await.unwrap();

        let stored = store.get(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.role, PeeringRole::Dialing);
        assert_eq!(stored.peer_id, "acceptor-id");
        assert!(registry.trust().current(&record.id).is_some());
        assert!(registry.is_running(&record.id));
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_establish_rejects_malformed_token() {
        let registry = registry(Arc::new(MemoryStore::new()));
        let err = registry.establish("east", "not a token").await.unwrap_err();
        assert!(matches!(err, Error::MalformedToken { .. }));
    }

    #[tokio::test]
    async fn test_reestablish_terminates_previous_peering() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(store.clone());

        let first = registry.establish("east", &token(&["nowhere"])).await.unwrap();
        let second = registry.establish("east", &token(&["nowhere"])).await.unwrap();

        assert_ne!(first.id, second.id);
        let old = store.get(&first.id).await.unwrap().unwrap();
        assert_eq!(old.state, PeeringState::Terminated);
        assert!(registry.trust().current(&first.id).is_none());
        assert_eq!(
            store.get_by_name("east").await.unwrap().unwrap().id,
            second.id
        );
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_resume_all_skips_terminated_and_accepting() {
        let store = Arc::new(MemoryStore::new());
        let live = PeeringRecord::new_dialing(
            "east",
            &PeeringToken::decode(&token(&["nowhere"])).unwrap(),
        );
        let mut dead = live.clone();
        dead.id = "dead".to_string();
        dead.name = "west".to_string();
        dead.terminate();
        store.put(live.clone()).await.unwrap();
        store.put(dead).await.unwrap();
        store.put(PeeringRecord::new_accepting("south")).await.unwrap();

        let registry = registry(store);
        assert_eq!(registry.resume_all().await.unwrap(), 1);
        assert!(registry.is_running(&live.id));
        assert!(!registry.is_running("dead"));
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_delete_closes_the_dialer() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(store.clone());
        let record = registry.establish("east", &token(&["nowhere"])).await.unwrap();
        let mut state = registry.subscribe_state(&record.id).unwrap();

        registry.delete_peering("east").await.unwrap();

        state
            .wait_for(|s| *s == StreamState::Closed)
            .await
            .unwrap();
        assert!(!registry.is_running(&record.id));
        assert_eq!(
            store.get(&record.id).await.unwrap().unwrap().state,
            PeeringState::Terminated
        );
    }

    /// Counts connects and never completes one
    #[derive(Default)]
    struct HangingTransport {
        connects: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Transport for HangingTransport {
        async fn connect(&self, _address: &str) -> Result<crate::transport::Connection> {
            self.connects
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            std::future::pending().await
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_starts_run_one_dialer() {
        let store = Arc::new(MemoryStore::new());
        let record = PeeringRecord::new_dialing(
            "east",
            &PeeringToken::decode(&token(&["nowhere"])).unwrap(),
        );
        store.put(record.clone()).await.unwrap();
        let transport = Arc::new(HangingTransport::default());
        let config = StreamConfig {
            connect_timeout: std::time::Duration::from_secs(1),
            ..StreamConfig::default()
        };
        let registry = Arc::new(PeeringRegistry::new(store, transport.clone(), config));

        let barrier = Arc::new(tokio::sync::Barrier::new(8));
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            let barrier = barrier.clone();
            let id = record.id.clone();
            tasks.push(tokio::spawn(async move {
                barrier.wait().await;
                registry.start(&id);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert!(registry.is_running(&record.id));
        assert_eq!(
            transport.connects.load(std::sync::atomic::Ordering::SeqCst),
            1
        );
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_delete_unknown_peering_is_not_found() {
        let registry = registry(Arc::new(MemoryStore::new()));
        let err = registry.delete_peering("missing").await.unwrap_err();
        assert!(matches!(err, Error::PeeringNotFound { .. }));
    }
}
