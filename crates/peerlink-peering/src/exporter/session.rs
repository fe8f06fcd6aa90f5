//! One accepted replication stream
//!
//! The handshake authenticates the dialer against its peering record. After
//! that a reader task consumes acks, resync requests and `Close`, while the
//! writer (this task) drains the peer's outbox and sends heartbeats. A newer
//! session for the same peering cancels the older one.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use peerlink_common::{metrics, Error, Result};
use peerlink_proto::{Open, RejectKind, ReplicationMessage, StreamSecret};
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{PeerOutbox, Pending, SessionHandle, Shared};
use crate::record::{PeeringRecord, PeeringRole, PeeringState};
use crate::transport::{Connection, MessageSink, MessageSource};

struct Rejection {
    kind: RejectKind,
    reason: String,
}

impl Rejection {
    fn new(kind: RejectKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }
}

struct Accepted {
    record: PeeringRecord,
    stream_secret: Option<String>,
}

pub(super) async fn run(shared: Arc<Shared>, conn: Connection) -> Result<()> {
    let Connection {
        mut sink,
        mut source,
        remote,
    } = conn;

    let open = match timeout(shared.config.stream.connect_timeout, source.recv()).await {
        Err(_) => return Err(Error::connection(&remote, "no open message before timeout")),
        Ok(received) => match received? {
            Some(ReplicationMessage::Open(open)) => open,
            Some(other) => {
                return Err(Error::protocol(format!(
                    "expected open, got {}",
                    other.kind()
                )))
            }
            None => return Ok(()),
        },
    };
    debug!(
        peer_id = %open.peer_id,
        trace_id = open.trace.trace_id().unwrap_or("-"),
        resume = ?open.resume,
        "open received"
    );

    let accepted = match authenticate(&shared, &open).await? {
        Ok(accepted) => accepted,
        Err(rejection) => {
            warn!(peer_id = %open.peer_id, kind = ?rejection.kind, reason = %rejection.reason, "stream rejected");
            sink.send(ReplicationMessage::Rejected {
                kind: rejection.kind,
                reason: rejection.reason,
            })
            .await?;
            sink.close().await?;
            return Ok(());
        }
    };
    let record = accepted.record;

    let session_id = shared.next_session_id();
    let cancel = CancellationToken::new();
    if let Some(previous) = shared.sessions.insert(
        record.id.clone(),
        SessionHandle {
            id: session_id,
            cancel: cancel.clone(),
        },
    ) {
        debug!(peering = %record.name, "replacing previous session");
        previous.cancel.cancel();
    }

    sink.send(ReplicationMessage::Opened {
        stream_secret: accepted.stream_secret,
    })
    .await?;
    info!(peering = %record.name, remote = %remote, "stream opened");

    let outbox = shared.outbox_for(&record).await;
    let result = stream(&shared, &record, &outbox, &open, sink, source, cancel).await;

    shared
        .sessions
        .remove_if(&record.id, |_, handle| handle.id == session_id);
    info!(peering = %record.name, "stream ended");
    result
}

async fn authenticate(
    shared: &Shared,
    open: &Open,
) -> Result<std::result::Result<Accepted, Rejection>> {
    let lock = shared.record_lock(&open.peer_id);
    let _guard = lock.lock().await;

    let Some(mut record) = shared.store.get(&open.peer_id).await? else {
        return Ok(Err(Rejection::new(RejectKind::NotFound, "unknown peering")));
    };
    if record.role != PeeringRole::Accepting {
        return Ok(Err(Rejection::new(RejectKind::NotFound, "unknown peering")));
    }
    if !record.is_live() {
        return Ok(Err(Rejection::new(
            RejectKind::Terminated,
            "peering was deleted",
        )));
    }

    let stream_secret = match &open.secret {
        StreamSecret::Establishment(secret) => {
            if record.secrets.establishment.as_deref() != Some(secret.as_str()) {
                return Ok(Err(Rejection::new(
                    RejectKind::Unauthenticated,
                    "establishment secret is invalid or was already exchanged",
                )));
            }
            let minted = uuid::Uuid::new_v4().to_string();
            record.secrets.establishment = None;
            record.secrets.stream = Some(minted.clone());
            record.peer_id = open.dialer_id.clone();
            if record.state == PeeringState::Pending {
                record.transition(PeeringState::Establishing)?;
            }
            Some(minted)
        }
        StreamSecret::Stream(secret) => {
            if record.secrets.stream.as_deref() != Some(secret.as_str()) {
                return Ok(Err(Rejection::new(
                    RejectKind::Unauthenticated,
                    "stream secret is invalid",
                )));
            }
            None
        }
    };
    record.transition(PeeringState::Active)?;
    record.last_receive_time = Some(Utc::now());
    record.last_error = None;
    // the secret must be durable before the dialer can learn it
    shared.store.put(record.clone()).await?;

    Ok(Ok(Accepted {
        record,
        stream_secret,
    }))
}

/// Writes `last_send_time` to the record, at most once per interval
struct SendStamp {
    every: Duration,
    last: Option<Instant>,
}

impl SendStamp {
    fn new(every: Duration) -> Self {
        Self { every, last: None }
    }

    async fn record(&mut self, shared: &Shared, record: &PeeringRecord) {
        let now = Instant::now();
        if self.last.is_some_and(|last| now.duration_since(last) < self.every) {
            return;
        }
        self.last = Some(now);
        let sent_at = Utc::now();
        if let Err(e) = shared
            .update_record(&record.id, |r| {
                r.last_send_time = Some(sent_at);
                Ok(())
            })
            .await
        {
            warn!(peering = %record.name, error = %e, "failed to record send time");
        }
    }
}

async fn send_snapshot(
    sink: &mut dyn MessageSink,
    outbox: &PeerOutbox,
    record: &PeeringRecord,
    resume_epoch: u64,
    reason: &'static str,
) -> Result<u64> {
    let snapshot = outbox.snapshot(resume_epoch).await;
    let seq = snapshot.seq;
    info!(
        peering = %record.name,
        epoch = snapshot.epoch,
        seq,
        entries = snapshot.entries.len(),
        reason,
        "sending snapshot"
    );
    metrics::record_snapshot_sent(&record.name, reason);
    sink.send(ReplicationMessage::Snapshot(snapshot)).await?;
    Ok(seq)
}

async fn stream(
    shared: &Arc<Shared>,
    record: &PeeringRecord,
    outbox: &Arc<PeerOutbox>,
    open: &Open,
    mut sink: Box<dyn MessageSink>,
    source: Box<dyn MessageSource>,
    cancel: CancellationToken,
) -> Result<()> {
    let resumable = match open.resume {
        Some(resume) => outbox.can_resume(resume).await,
        None => false,
    };
    let mut cursor = match open.resume {
        Some(resume) if resumable => {
            info!(peering = %record.name, epoch = resume.epoch, seq = resume.seq, "resuming from watermark");
            resume.seq
        }
        Some(resume) => {
            send_snapshot(&mut *sink, outbox, record, resume.epoch, "resume_unavailable").await?
        }
        None => send_snapshot(&mut *sink, outbox, record, 0, "initial").await?,
    };
    let mut stamp = SendStamp::new(shared.config.stream.heartbeat_interval);
    stamp.record(shared, record).await;

    let (resync_tx, mut resync_rx) = mpsc::channel::<String>(4);
    let reader_done = cancel.child_token();
    let reader = tokio::spawn(read_loop(
        shared.clone(),
        record.clone(),
        outbox.clone(),
        source,
        resync_tx,
        reader_done.clone(),
    ));

    let heartbeat_every = shared.config.stream.heartbeat_interval;
    let mut heartbeat = interval_at(Instant::now() + heartbeat_every, heartbeat_every);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut changes = outbox.subscribe();

    let result = loop {
        let _ = *changes.borrow_and_update();
        let sent = match outbox.pending_after(cursor).await {
            Pending::Messages(messages) => {
                let mut sent = false;
                let mut failed = None;
                for message in messages {
                    let seq = message.seq().unwrap_or(cursor);
                    if let Err(e) = sink.send(message).await {
                        failed = Some(e);
                        break;
                    }
                    cursor = seq;
                    sent = true;
                }
                if let Some(e) = failed {
                    break Err(e);
                }
                sent
            }
            Pending::Gap => {
                match send_snapshot(&mut *sink, outbox, record, 0, "compacted").await {
                    Ok(seq) => cursor = seq,
                    Err(e) => break Err(e),
                }
                true
            }
            Pending::Closed(reason) => {
                info!(peering = %record.name, %reason, "closing stream");
                let closed = sink.send(ReplicationMessage::Close { reason }).await;
                let _ = sink.close().await;
                break closed;
            }
        };
        if sent {
            heartbeat.reset();
            stamp.record(shared, record).await;
        }

        tokio::select! {
            biased;
            _ = reader_done.cancelled() => break Ok(()),
            Some(reason) = resync_rx.recv() => {
                info!(peering = %record.name, %reason, "peer requested resync");
                metrics::record_resync(&record.name);
                match send_snapshot(&mut *sink, outbox, record, 0, "resync").await {
                    Ok(seq) => cursor = seq,
                    Err(e) => break Err(e),
                }
                stamp.record(shared, record).await;
            }
            changed = changes.changed() => {
                if changed.is_err() {
                    break Ok(());
                }
            }
            _ = heartbeat.tick() => {
                if let Err(e) = sink.send(ReplicationMessage::Heartbeat).await {
                    break Err(e);
                }
                stamp.record(shared, record).await;
            }
        }
    };

    reader_done.cancel();
    reader.abort();
    result
}

async fn read_loop(
    shared: Arc<Shared>,
    record: PeeringRecord,
    outbox: Arc<PeerOutbox>,
    mut source: Box<dyn MessageSource>,
    resync_tx: mpsc::Sender<String>,
    done: CancellationToken,
) {
    loop {
        let received = tokio::select! {
            biased;
            _ = done.cancelled() => break,
            received = source.recv() => received,
        };
        let message = match received {
            Ok(Some(message)) => message,
            Ok(None) => {
                debug!(peering = %record.name, "peer closed stream");
                break;
            }
            Err(e) => {
                debug!(peering = %record.name, error = %e, "stream read failed");
                break;
            }
        };

        let now = Utc::now();
        match message {
            ReplicationMessage::Ack { seq } => {
                outbox.ack(seq).await;
                if let Err(e) = shared
                    .update_record(&record.id, |r| {
                        r.last_receive_time = Some(now);
                        Ok(())
                    })
                    .await
                {
                    warn!(peering = %record.name, error = %e, "failed to record ack");
                }
            }
            ReplicationMessage::Resync { reason } => {
                if resync_tx.send(reason).await.is_err() {
                    break;
                }
            }
            ReplicationMessage::Close { reason } => {
                info!(peering = %record.name, %reason, "peer deleted the peering");
                if let Err(e) = shared
                    .update_record(&record.id, |r| {
                        r.terminate();
                        Ok(())
                    })
                    .await
                {
                    warn!(peering = %record.name, error = %e, "failed to terminate peering");
                }
                shared.outboxes.remove(&record.id);
                break;
            }
            other => {
                warn!(peering = %record.name, kind = other.kind(), "unexpected message from dialer");
                break;
            }
        }
    }
    done.cancel();
}
