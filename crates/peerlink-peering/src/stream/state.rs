//! Connection state machine of one dialing stream
//!
//! ```text
//! Idle ──Dial──▶ Connecting ──Connected──▶ Streaming ──Disconnected──▶ Draining
//!  ▲                 │                                                   │
//!  └──ConnectFailed──┘◀───────────────────────Drained────────────────────┘
//!
//! any non-Closed state ──Terminate──▶ Closed
//! ```
//!
//! The table is pure so it can be tested without I/O; [`StreamMachine`]
//! applies it and publishes every state to watchers.

use std::fmt;

use tokio::sync::watch;
use tracing::trace;

/// Connection state of a dialing stream
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamState {
    /// Not connected, waiting to dial
    Idle,
    /// Dialing a candidate and handshaking
    Connecting,
    /// Applying messages
    Streaming,
    /// Stream lost; finishing in-flight work before going idle
    Draining,
    /// Terminated; never reconnects
    Closed,
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StreamState::Idle => "idle",
            StreamState::Connecting => "connecting",
            StreamState::Streaming => "streaming",
            StreamState::Draining => "draining",
            StreamState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Inputs to the state machine
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamEvent {
    /// Start dialing the next candidate
    Dial,
    /// Handshake succeeded
    Connected,
    /// Dial or handshake failed
    ConnectFailed,
    /// Established stream ended
    Disconnected,
    /// In-flight work after a disconnect finished
    Drained,
    /// The peering was terminated
    Terminate,
}

/// Transition table; `None` when the event is not valid in `state`
pub fn transition(state: StreamState, event: StreamEvent) -> Option<StreamState> {
    use StreamEvent::*;
    use StreamState::*;
    match (state, event) {
        (Closed, _) => None,
        (_, Terminate) => Some(Closed),
        (Idle, Dial) => Some(Connecting),
        (Connecting, Connected) => Some(Streaming),
        (Connecting, ConnectFailed) => Some(Idle),
        (Streaming, Disconnected) => Some(Draining),
        (Draining, Drained) => Some(Idle),
        _ => None,
    }
}

/// State holder that publishes changes
#[derive(Debug)]
pub struct StreamMachine {
    peering: String,
    tx: watch::Sender<StreamState>,
}

impl StreamMachine {
    /// Start in `Idle`
    pub fn new(peering: &str) -> Self {
        Self::with_sender(peering, watch::channel(StreamState::Idle).0)
    }

    /// Publish through an existing channel
    pub fn with_sender(peering: &str, tx: watch::Sender<StreamState>) -> Self {
        tx.send_replace(StreamState::Idle);
        Self {
            peering: peering.to_string(),
            tx,
        }
    }

    /// Current state
    pub fn state(&self) -> StreamState {
        *self.tx.borrow()
    }

    /// Watch state changes
    pub fn subscribe(&self) -> watch::Receiver<StreamState> {
        self.tx.subscribe()
    }

    /// Apply `event`; returns whether it was valid
    ///
    /// Invalid events leave the state unchanged.
    pub fn fire(&self, event: StreamEvent) -> bool {
        let current = self.state();
        match transition(current, event) {
            Some(next) => {
                trace!(peering = %self.peering, from = %current, to = %next, ?event, "stream state");
                self.tx.send_replace(next);
                true
            }
            None => false,
        }
    }
}
