//! The peer collaborator seam.

use std::fmt;
use std::net::SocketAddr;

use crate::gateway::FailureKind;
use crate::load_balancer::backend::BackendConnectionGuard;

/// One selected upstream server.
///
/// A peer handed out by the load balancer holds a connection slot on its
/// backend until dropped.
pub struct Peer {
    pub name: String,
    pub addr: SocketAddr,
    lease: Option<BackendConnectionGuard>,
}

impl Peer {
    /// A peer with no backing slot.
    pub fn new(name: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            name: name.into(),
            addr,
            lease: None,
        }
    }

    pub fn leased(guard: BackendConnectionGuard) -> Self {
        Self {
            name: guard.name.clone(),
            addr: guard.addr,
            lease: Some(guard),
        }
    }

    pub fn lease(&self) -> Option<&BackendConnectionGuard> {
        self.lease.as_ref()
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("name", &self.name)
            .field("addr", &self.addr)
            .finish()
    }
}

/// Hands out peers and receives attempt outcomes.
///
/// The gateway never decides which server to use; it asks for one, tells the
/// source how the attempt went, and asks again when `next_upstream` allows.
pub trait PeerSource: Send + Sync + fmt::Debug {
    /// Next peer of `group`, skipping the addresses in `tried`.
    fn get_peer(&self, group: &str, tried: &[SocketAddr]) -> Option<Peer>;

    /// Outcome of one attempt against `peer`.
    fn report_outcome(&self, peer: &Peer, outcome: Result<(), FailureKind>);

    /// Number of servers in `group`.
    fn group_size(&self, group: &str) -> usize;
}
