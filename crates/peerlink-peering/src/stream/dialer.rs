//! Dialing-side stream manager
//!
//! One task per dialing peering. It walks the candidate list pass by pass,
//! handshakes with the first server that answers, applies the stream until
//! it ends, and backs off before every new pass. The backoff only resets
//! once a stream has applied a sequenced message, so a server that accepts
//! and drops right away is not redialed in a tight loop. Fatal errors stop
//! the task; a `Close` from either side terminates the peering.

use std::sync::Arc;

use chrono::Utc;
use peerlink_common::{metrics, Backoff, Error, Result, StreamConfig};
use peerlink_proto::tracing::TraceContext;
use peerlink_proto::{Open, RejectKind, ReplicationMessage, StreamSecret};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::apply::{ApplyOutcome, Applier};
use super::state::{StreamEvent, StreamMachine, StreamState};
use crate::address::AddressTracker;
use crate::record::PeeringState;
use crate::store::PeeringStore;
use crate::transport::{Connection, Transport};
use crate::trust::TrustBundleReconciler;

/// Shared collaborators of every dialer task
pub struct DialerContext {
    /// Record and entry storage
    pub store: Arc<dyn PeeringStore>,
    /// How candidates are reached
    pub transport: Arc<dyn Transport>,
    /// Where applied trust bundles are published
    pub trust: Arc<TrustBundleReconciler>,
    /// Stream tunables
    pub config: StreamConfig,
}

/// Requests from the registry to a running dialer
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DialerCommand {
    /// Delete the peering: send `Close` if streaming, then terminate locally
    Terminate {
        /// Reason sent to the exporter
        reason: String,
    },
}

/// Why a dialer task ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DialerExit {
    /// Stopped by the registry; the peering stays as it is
    Cancelled,
    /// The peering is terminated
    Terminated,
    /// A fatal error the task will not retry
    Failed(Error),
}

enum StreamEnd {
    Cancelled,
    Terminated,
    /// `healthy` once at least one sequenced message was applied
    Disconnected { healthy: bool },
}

enum Input {
    Cancelled,
    Command(Option<DialerCommand>),
    Received(std::result::Result<Result<Option<ReplicationMessage>>, tokio::time::error::Elapsed>),
}

/// Run the dialer of peering `id` until it is cancelled, terminated or fails
pub async fn run_dialer(
    ctx: Arc<DialerContext>,
    id: String,
    cancel: CancellationToken,
    control: mpsc::Receiver<DialerCommand>,
    state_tx: watch::Sender<StreamState>,
) -> DialerExit {
    let span = info_span!("dialer", peering_id = %id);
    let machine = StreamMachine::with_sender(&id, state_tx);
    let mut dialer = match Dialer::new(ctx, &id, cancel, control, machine).await {
        Ok(dialer) => dialer,
        Err(e) => {
            warn!(peering_id = %id, error = %e, "dialer could not load peering");
            return DialerExit::Failed(e);
        }
    };
    match dialer.run().instrument(span).await {
        Ok(exit) => exit,
        Err(e) => {
            warn!(peering = %dialer.name(), error = %e, "dialer stopped");
            dialer.record_error(&e).await;
            DialerExit::Failed(e)
        }
    }
}

struct Dialer {
    ctx: Arc<DialerContext>,
    applier: Applier,
    tracker: AddressTracker,
    backoff: Backoff,
    cancel: CancellationToken,
    control: mpsc::Receiver<DialerCommand>,
    machine: StreamMachine,
}

impl Dialer {
    async fn new(
        ctx: Arc<DialerContext>,
        id: &str,
        cancel: CancellationToken,
        control: mpsc::Receiver<DialerCommand>,
        machine: StreamMachine,
    ) -> Result<Self> {
        let applier = Applier::load(ctx.store.clone(), ctx.trust.clone(), id).await?;
        Ok(Self {
            tracker: AddressTracker::new(ctx.config.failover_threshold),
            backoff: Backoff::new(ctx.config.backoff.clone()),
            ctx,
            applier,
            cancel,
            control,
            machine,
        })
    }

    fn name(&self) -> String {
        self.applier.record().name.clone()
    }

    async fn record_error(&mut self, err: &Error) {
        if !self.applier.record().is_live() {
            return;
        }
        self.applier.record_mut().last_error = Some(err.to_string());
        if let Err(e) = self.applier.persist().await {
            warn!(error = %e, "failed to record peering error");
        }
    }

    async fn set_state(&mut self, next: PeeringState) -> Result<()> {
        if self.applier.record().state == next {
            return Ok(());
        }
        self.applier.record_mut().transition(next)?;
        self.applier.persist().await
    }

    async fn terminate_locally(&mut self) -> Result<DialerExit> {
        self.applier.terminate().await?;
        self.machine.fire(StreamEvent::Terminate);
        Ok(DialerExit::Terminated)
    }

    async fn run(&mut self) -> Result<DialerExit> {
        if !self.applier.record().is_live() {
            self.machine.fire(StreamEvent::Terminate);
            return Ok(DialerExit::Terminated);
        }
        if self.applier.record().state == PeeringState::Pending {
            self.set_state(PeeringState::Establishing).await?;
        }

        loop {
            let reordered = {
                let record = self.applier.record_mut();
                self.tracker.start_pass(&mut record.peer_server_addresses)
            };
            if reordered {
                self.applier.persist().await?;
            }

            let mut restart = false;
            while let Some(address) = {
                let addresses = &self.applier.record().peer_server_addresses;
                self.tracker.next_candidate(addresses)
            } {
                if self.cancel.is_cancelled() {
                    return Ok(DialerExit::Cancelled);
                }
                self.machine.fire(StreamEvent::Dial);
                debug!(peering = %self.name(), %address, "dialing candidate");

                let conn = match self.connect(&address).await {
                    Ok(conn) => conn,
                    Err(e) => {
                        self.machine.fire(StreamEvent::ConnectFailed);
                        metrics::record_connect_attempt(&self.name(), "failure");
                        if let Some(exit) = self.handle_fatal(&e).await? {
                            return Ok(exit);
                        }
                        warn!(peering = %self.name(), %address, error = %e, "candidate failed");
                        self.tracker.report_failure(&address);
                        self.record_error(&e).await;
                        continue;
                    }
                };

                self.machine.fire(StreamEvent::Connected);
                metrics::record_connect_attempt(&self.name(), "success");
                // one write covers the new order, the cleared error, the state and the open
                {
                    let record = self.applier.record_mut();
                    self.tracker
                        .report_success(&address, &mut record.peer_server_addresses);
                    record.last_error = None;
                    record.last_send_time = Some(Utc::now());
                    if record.state != PeeringState::Active {
                        record.transition(PeeringState::Active)?;
                    }
                }
                self.applier.persist().await?;
                info!(peering = %self.name(), %address, "streaming");

                let end = self.stream(conn).await?;
                self.machine.fire(StreamEvent::Disconnected);
                match end {
                    StreamEnd::Cancelled => {
                        self.machine.fire(StreamEvent::Drained);
                        return Ok(DialerExit::Cancelled);
                    }
                    StreamEnd::Terminated => {
                        self.machine.fire(StreamEvent::Terminate);
                        return Ok(DialerExit::Terminated);
                    }
                    StreamEnd::Disconnected { healthy } => {
                        self.machine.fire(StreamEvent::Drained);
                        info!(peering = %self.name(), %address, healthy, "stream disconnected");
                        if healthy {
                            restart = true;
                            break;
                        }
                        self.tracker.report_failure(&address);
                    }
                }
            }

            if restart {
                // the stream replicated before ending, so the delay is back at its initial value
                debug!(peering = %self.name(), "restarting pass after a healthy stream");
            } else {
                if self.applier.record().state == PeeringState::Active {
                    self.set_state(PeeringState::FailingOver).await?;
                }
                warn!(peering = %self.name(), "every candidate failed, backing off");
            }
            if let Some(exit) = self.back_off().await? {
                return Ok(exit);
            }
        }
    }

    /// Wait out the next backoff delay; `Some` when the task must stop instead
    async fn back_off(&mut self) -> Result<Option<DialerExit>> {
        let delay = self.backoff.next_delay();
        debug!(
            peering = %self.name(),
            attempt = self.backoff.attempts(),
            delay_ms = delay.as_millis() as u64,
            "backing off"
        );
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Ok(Some(DialerExit::Cancelled)),
            command = self.control.recv() => match command {
                Some(DialerCommand::Terminate { reason }) => {
                    info!(peering = %self.name(), %reason, "terminating while disconnected");
                    self.terminate_locally().await.map(Some)
                }
                None => Ok(Some(DialerExit::Cancelled)),
            },
            _ = sleep(delay) => Ok(None),
        }
    }

    /// Map a handshake error to a task exit; `None` when it is retryable
    async fn handle_fatal(&mut self, err: &Error) -> Result<Option<DialerExit>> {
        match err {
            Error::PeeringTerminated { .. } => {
                info!(peering = %self.name(), "exporter reports the peering as deleted");
                self.terminate_locally().await.map(Some)
            }
            Error::AuthenticationFailure { .. } | Error::PeeringNotFound { .. } => {
                let next = match self.applier.record().state {
                    PeeringState::Establishing | PeeringState::Pending => PeeringState::Pending,
                    _ => PeeringState::FailingOver,
                };
                self.set_state(next).await?;
                self.record_error(err).await;
                warn!(peering = %self.name(), error = %err, "fatal handshake error, not retrying");
                Ok(Some(DialerExit::Failed(err.clone())))
            }
            _ => Ok(None),
        }
    }

    /// Connect to `address` and complete the handshake
    async fn connect(&mut self, address: &str) -> Result<Connection> {
        let record = self.applier.record();
        let name = record.name.clone();
        let secret = match (&record.secrets.stream, &record.secrets.establishment) {
            (Some(stream), _) => StreamSecret::Stream(stream.clone()),
            (None, Some(establishment)) => StreamSecret::Establishment(establishment.clone()),
            (None, None) => return Err(Error::authentication(&name, "no credentials to present")),
        };
        let open = Open {
            peer_id: record.peer_id.clone(),
            dialer_id: record.id.clone(),
            secret,
            resume: record.resume_point(),
            trace: TraceContext::current(),
        };

        let transport = self.ctx.transport.clone();
        let handshake = async move {
            let mut conn = transport.connect(address).await?;
            conn.sink.send(ReplicationMessage::Open(open)).await?;
            match conn.source.recv().await? {
                Some(ReplicationMessage::Opened { stream_secret }) => Ok((conn, stream_secret)),
                Some(ReplicationMessage::Rejected { kind, reason }) => Err(match kind {
                    RejectKind::Unauthenticated => Error::authentication(&name, reason),
                    RejectKind::NotFound => Error::not_found(&name),
                    RejectKind::Terminated => Error::PeeringTerminated { peering: name },
                }),
                Some(other) => Err(Error::protocol(format!(
                    "expected opened, got {}",
                    other.kind()
                ))),
                None => Err(Error::connection(address, "closed during handshake")),
            }
        };
        let (conn, stream_secret) = timeout(self.ctx.config.connect_timeout, handshake)
            .await
            .map_err(|_| Error::connection(address, "handshake timed out"))??;

        if let Some(secret) = stream_secret {
            let record = self.applier.record_mut();
            record.secrets.stream = Some(secret);
            record.secrets.establishment = None;
            self.applier.persist().await?;
            info!(peering = %self.name(), "stream secret exchanged");
        }
        Ok(conn)
    }

    async fn next_input(&mut self, conn: &mut Connection) -> Input {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Input::Cancelled,
            command = self.control.recv() => Input::Command(command),
            received = timeout(self.ctx.config.heartbeat_timeout, conn.source.recv()) => {
                Input::Received(received)
            }
        }
    }

    /// Apply messages until the stream ends
    async fn stream(&mut self, mut conn: Connection) -> Result<StreamEnd> {
        let mut healthy = false;
        let mut awaiting_snapshot = false;

        loop {
            let message = match self.next_input(&mut conn).await {
                Input::Cancelled | Input::Command(None) => return Ok(StreamEnd::Cancelled),
                Input::Command(Some(DialerCommand::Terminate { reason })) => {
                    info!(peering = %self.name(), %reason, "closing stream");
                    if let Err(e) = conn.sink.send(ReplicationMessage::Close { reason }).await {
                        debug!(error = %e, "close not delivered");
                    }
                    let _ = conn.sink.close().await;
                    self.terminate_locally().await?;
                    return Ok(StreamEnd::Terminated);
                }
                Input::Received(Err(_)) => {
                    warn!(
                        peering = %self.name(),
                        remote = %conn.remote,
                        timeout_ms = self.ctx.config.heartbeat_timeout.as_millis() as u64,
                        "no message within heartbeat timeout"
                    );
                    return Ok(StreamEnd::Disconnected { healthy });
                }
                Input::Received(Ok(Err(e))) => {
                    debug!(peering = %self.name(), error = %e, "stream read failed");
                    return Ok(StreamEnd::Disconnected { healthy });
                }
                Input::Received(Ok(Ok(None))) => {
                    return Ok(StreamEnd::Disconnected { healthy });
                }
                Input::Received(Ok(Ok(Some(message)))) => message,
            };

            let is_snapshot = matches!(message, ReplicationMessage::Snapshot(_));
            if awaiting_snapshot && message.seq().is_some() && !is_snapshot {
                continue;
            }
            let touches_addresses =
                is_snapshot || matches!(message, ReplicationMessage::AddressUpdate { .. });

            match self.applier.apply(message).await {
                Ok(ApplyOutcome::Applied { seq }) => {
                    awaiting_snapshot = false;
                    if !healthy {
                        healthy = true;
                        self.backoff.reset();
                    }
                    if touches_addresses {
                        self.tracker
                            .retain(&self.applier.record().peer_server_addresses);
                    }
                    if conn.sink.send(ReplicationMessage::Ack { seq }).await.is_err() {
                        return Ok(StreamEnd::Disconnected { healthy });
                    }
                    self.applier.record_mut().last_send_time = Some(Utc::now());
                }
                Ok(ApplyOutcome::Heartbeat) => {}
                Ok(ApplyOutcome::Closed { reason }) => {
                    info!(peering = %self.name(), %reason, "exporter closed the peering");
                    return Ok(StreamEnd::Terminated);
                }
                Err(e) if e.requires_resync() => {
                    if awaiting_snapshot {
                        continue;
                    }
                    warn!(peering = %self.name(), error = %e, "requesting resync");
                    metrics::record_resync(&self.name());
                    let resync = ReplicationMessage::Resync {
                        reason: e.to_string(),
                    };
                    if conn.sink.send(resync).await.is_err() {
                        return Ok(StreamEnd::Disconnected { healthy });
                    }
                    self.applier.record_mut().last_send_time = Some(Utc::now());
                    awaiting_snapshot = true;
                }
                Err(e) if e.is_retryable() => {
                    warn!(peering = %self.name(), error = %e, "dropping stream");
                    self.record_error(&e).await;
                    return Ok(StreamEnd::Disconnected { healthy });
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::PeeringRecord;
    use crate::store::MemoryStore;
    use crate::token::PeeringToken;
    use crate::transport::{MemoryNetwork, MessageSink, MessageSource};
    use peerlink_common::RetryConfig;
    use std::time::Duration;

    fn fast_config() -> StreamConfig {
        StreamConfig {
            heartbeat_interval: Duration::from_millis(50),
            heartbeat_timeout: Duration::from_millis(200),
            connect_timeout: Duration::from_millis(200),
            backoff: RetryConfig {
                initial_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(20),
                ..RetryConfig::default()
            },
            ..StreamConfig::default()
        }
    }

    #[tokio::test]
    async fn test_unreachable_candidates_lead_to_failing_over() {
        let store = Arc::new(MemoryStore::new());
        let token = PeeringToken::issue(
            "remote",
            "server.east",
            &[],
            &["nowhere-1".to_string(), "nowhere-2".to_string()],
            "secret",
        );
        let mut record = PeeringRecord::new_dialing("east", &token);
        record.state = PeeringState::Active;
        record.epoch = 1;
        store.put(record.clone()).await.unwrap();

        let ctx = Arc::new(DialerContext {
            store: store.clone(),
            transport: Arc::new(MemoryNetwork::new()),
            trust: Arc::new(TrustBundleReconciler::new()),
            config: fast_config(),
        });
        let cancel = CancellationToken::new();
        let (_control_tx, control_rx) = mpsc::channel(1);
        let (state_tx, _state_rx) = watch::channel(StreamState::Idle);
        let task = tokio::spawn(run_dialer(
            ctx,
            record.id.clone(),
            cancel.clone(),
            control_rx,
            state_tx,
        ));

        let mut state = PeeringState::Active;
        for _ in 0..100 {
            state = store.get(&record.id).await.unwrap().unwrap().state;
            if state == PeeringState::FailingOver {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(state, PeeringState::FailingOver);
        let stored = store.get(&record.id).await.unwrap().unwrap();
        assert!(stored.last_error.is_some());
        // nothing is ever dropped from the list
        assert_eq!(stored.peer_server_addresses.len(), 2);

        cancel.cancel();
        assert_eq!(task.await.unwrap(), DialerExit::Cancelled);
    }

    /// Fails every connect and remembers when it was asked
    #[derive(Default)]
    struct RecordingTransport {
        attempts: std::sync::Mutex<Vec<(String, tokio::time::Instant)>>,
    }

    #[async_trait::async_trait]
    impl Transport for RecordingTransport {
        async fn connect(&self, address: &str) -> Result<Connection> {
            if let Ok(mut attempts) = self.attempts.lock() {
                attempts.push((address.to_string(), tokio::time::Instant::now()));
            }
            Err(Error::connection(address, "refused"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_pass_starts_only_after_backoff() {
        let store = Arc::new(MemoryStore::new());
        let token = PeeringToken::issue(
            "remote",
            "server.east",
            &[],
            &["east-1".to_string(), "east-2".to_string()],
            "secret",
        );
        let record = PeeringRecord::new_dialing("east", &token);
        store.put(record.clone()).await.unwrap();

        let transport = Arc::new(RecordingTransport::default());
        let mut config = fast_config();
        config.backoff = RetryConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(1),
            jitter: false,
            ..RetryConfig::default()
        };
        let ctx = Arc::new(DialerContext {
            store,
            transport: transport.clone(),
            trust: Arc::new(TrustBundleReconciler::new()),
            config,
        });
        let cancel = CancellationToken::new();
        let (_control_tx, control_rx) = mpsc::channel(1);
        let (state_tx, _state_rx) = watch::channel(StreamState::Idle);
        let task = tokio::spawn(run_dialer(
            ctx,
            record.id.clone(),
            cancel.clone(),
            control_rx,
            state_tx,
        ));

        sleep(Duration::from_millis(1500)).await;
        cancel.cancel();
        assert_eq!(task.await.unwrap(), DialerExit::Cancelled);

        let attempts = transport.attempts.lock().unwrap().clone();
        let order: Vec<&str> = attempts.iter().map(|(a, _)| a.as_str()).collect();
        assert_eq!(order, vec!["east-1", "east-2", "east-1", "east-2"]);
        // within a pass candidates follow each other immediately
        assert!(attempts[1].1 - attempts[0].1 < Duration::from_millis(100));
        assert!(attempts[2].1 - attempts[1].1 >= Duration::from_secs(1));
    }

    /// Accepts every connect, answers the open, sends one heartbeat and hangs up
    #[derive(Default)]
    struct FlappingTransport {
        connects: std::sync::Mutex<Vec<tokio::time::Instant>>,
    }

    struct NullSink;

    #[async_trait::async_trait]
    impl MessageSink for NullSink {
        async fn send(&mut self, _message: ReplicationMessage) -> Result<()> {
            Ok(())
        }

        async fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    struct ScriptedSource(std::collections::VecDeque<ReplicationMessage>);

    #[async_trait::async_trait]
    impl MessageSource for ScriptedSource {
        async fn recv(&mut self) -> Result<Option<ReplicationMessage>> {
            Ok(self.0.pop_front())
        }
    }

    #[async_trait::async_trait]
    impl Transport for FlappingTransport {
        async fn connect(&self, address: &str) -> Result<Connection> {
            if let Ok(mut connects) = self.connects.lock() {
                connects.push(tokio::time::Instant::now());
            }
            let script = vec![
                ReplicationMessage::Opened {
                    stream_secret: None,
                },
                ReplicationMessage::Heartbeat,
            ];
            Ok(Connection {
                sink: Box::new(NullSink),
                source: Box::new(ScriptedSource(script.into())),
                remote: address.to_string(),
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_streams_that_drop_without_data_still_back_off() {
        let store = Arc::new(MemoryStore::new());
        let token = PeeringToken::issue(
            "remote",
            "server.east",
            &[],
            &["east-1".to_string(), "east-2".to_string()],
            "secret",
        );
        let record = PeeringRecord::new_dialing("east", &token);
        store.put(record.clone()).await.unwrap();

        let transport = Arc::new(FlappingTransport::default());
        let mut config = fast_config();
        config.backoff = RetryConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(1),
            jitter: false,
            ..RetryConfig::default()
        };
        let ctx = Arc::new(DialerContext {
            store: store.clone(),
            transport: transport.clone(),
            trust: Arc::new(TrustBundleReconciler::new()),
            config,
        });
        let cancel = CancellationToken::new();
        let (_control_tx, control_rx) = mpsc::channel(1);
        let (state_tx, _state_rx) = watch::channel(StreamState::Idle);
        let task = tokio::spawn(run_dialer(
            ctx,
            record.id.clone(),
            cancel.clone(),
            control_rx,
            state_tx,
        ));

        sleep(Duration::from_millis(500)).await;
        assert_eq!(transport.connects.lock().unwrap().len(), 2);

        sleep(Duration::from_millis(1000)).await;
        cancel.cancel();
        assert_eq!(task.await.unwrap(), DialerExit::Cancelled);

        let connects = transport.connects.lock().unwrap().clone();
        assert_eq!(connects.len(), 4);
        assert!(connects[2] - connects[1] >= Duration::from_secs(1));
        // handshakes succeeded, but nothing was replicated
        let stored = store.get(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.state, PeeringState::FailingOver);
        assert!(stored.last_send_time.is_some());
    }

    #[tokio::test]
    async fn test_terminate_while_disconnected_terminates_locally() {
        let store = Arc::new(MemoryStore::new());
        let token = PeeringToken::issue("remote", "s", &[], &["nowhere".to_string()], "secret");
        let record = PeeringRecord::new_dialing("east", &token);
        store.put(record.clone()).await.unwrap();

        let ctx = Arc::new(DialerContext {
            store: store.clone(),
            transport: Arc::new(MemoryNetwork::new()),
            trust: Arc::new(TrustBundleReconciler::new()),
            config: fast_config(),
        });
        let (control_tx, control_rx) = mpsc::channel(1);
        let (state_tx, state_rx) = watch::channel(StreamState::Idle);
        let task = tokio::spawn(run_dialer(
            ctx,
            record.id.clone(),
            CancellationToken::new(),
            control_rx,
            state_tx,
        ));

        control_tx
            .send(DialerCommand::Terminate {
                reason: "deleted".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(task.await.unwrap(), DialerExit::Terminated);
        assert_eq!(*state_rx.borrow(), StreamState::Closed);
        assert_eq!(
            store.get(&record.id).await.unwrap().unwrap().state,
            PeeringState::Terminated
        );
    }
}
