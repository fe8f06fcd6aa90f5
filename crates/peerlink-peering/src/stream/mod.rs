//! Importing side of replication
//!
//! - [`state`]: connection state machine of one stream
//! - [`apply`]: serialized apply path for inbound messages
//! - [`dialer`]: the task that dials, handshakes and streams

pub mod apply;
pub mod dialer;
pub mod state;

pub use apply::{ApplyOutcome, Applier};
pub use dialer::{run_dialer, DialerCommand, DialerContext, DialerExit};
pub use state::{transition, StreamEvent, StreamMachine, StreamState};
