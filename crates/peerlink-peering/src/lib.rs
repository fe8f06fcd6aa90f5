//! Cluster peering for peerlink
//!
//! Two clusters peer by exchanging a token: the accepting side generates it,
//! the dialing side establishes a peering from it and opens a replication
//! stream to one of the accepting side's servers. The accepting side then
//! exports the services its configuration allows, together with its CA roots
//! and server addresses, and keeps them current with sequenced deltas.
//!
//! # Layout
//!
//! - [`exporter`]: accepting side, per-peer outboxes and stream sessions
//! - [`registry`] and [`stream`]: dialing side, one dialer task per peering
//! - [`export`]: which services a consumer may import
//! - [`trust`] and [`address`]: per-peer CA roots and server candidates
//! - [`gateway`]: SNI routing over imported services
//! - [`store`]: durable records and imported entries
//! - [`transport`]: how streams are carried

#![warn(missing_docs)]

pub mod address;
pub mod catalog;
pub mod export;
pub mod exporter;
pub mod gateway;
pub mod record;
pub mod registry;
pub mod store;
pub mod stream;
pub mod token;
pub mod transport;
pub mod trust;

pub use address::AddressTracker;
pub use catalog::{Catalog, CatalogService};
pub use export::{eligible, ExportDecision, ExportedServicesConfig};
pub use exporter::{Exporter, ExporterConfig};
pub use gateway::{Route, RoutingTable};
pub use record::{PeeringRecord, PeeringRole, PeeringState};
pub use registry::PeeringRegistry;
pub use store::{EntryChange, MemoryStore, PeeringStore, StoreState};
pub use stream::{StreamEvent, StreamState};
pub use token::PeeringToken;
pub use transport::{Acceptor, Connection, MemoryNetwork, TcpAcceptor, TcpTransport, Transport};
pub use trust::{TrustBundle, TrustBundleReconciler};
