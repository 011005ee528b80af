//! Load balancing subsystem: the default peer source.
//!
//! # Data Flow
//! ```text
//! proxy_pass group identified
//!     → pool.rs (BackendManager: backends of the group)
//!     → round_robin.rs (rotate, skipping tried, full and failed backends)
//!     → backend.rs (connection slot guard)
//!     → Peer handed to the upstream exchange
//!     → outcome reported back → backend failure accounting
//! ```
//!
//! # Design Decisions
//! - Load balancer is stateless apart from its rotation counter
//! - Backends that reached `max_fails` within `fail_timeout` are skipped
//!   for `fail_timeout`
//! - A peer keeps its connection slot until the response is fully transferred

use std::fmt::Debug;
use std::net::SocketAddr;
use std::sync::Arc;

pub mod backend;
pub mod pool;
pub mod round_robin;

pub use backend::{Backend, BackendConnectionGuard};
pub use pool::BackendManager;
pub use round_robin::RoundRobin;

/// Backend selection algorithm.
pub trait LoadBalancer: Send + Sync + Debug {
    /// Pick the next backend, skipping addresses already tried for this request.
    fn next_server(&self, backends: &[Arc<Backend>], tried: &[SocketAddr]) -> Option<Arc<Backend>>;
}
