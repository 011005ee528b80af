//! Upstream side of the gateway.
//!
//! # Data Flow
//! ```text
//! UpstreamClient::proxy
//!     → PeerSource::get_peer (peer.rs)
//!     → ConnectionPool::connect (connection.rs: idle reuse or new TCP)
//!     → exchange.rs (send request, read head, retry on next_upstream)
//!     → Transfer task (TransferPump, spill.rs when the client is slow)
//!     → PeerSource::report_outcome
//! ```
//!
//! # Design Decisions
//! - Peer selection lives behind the `PeerSource` trait
//! - Every socket operation runs under its own timeout
//! - Response bodies flow through a bounded channel; its capacity is the
//!   route's buffer count

pub mod connection;
pub mod exchange;
pub mod peer;
pub mod spill;

pub use connection::{ConnectionId, ConnectionPool, UpstreamConnection};
pub use exchange::{BodyReceiver, ProxyResponse, UpstreamClient};
pub use peer::{Peer, PeerSource};
pub use spill::SpillFile;
