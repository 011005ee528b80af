//! Upstream connections and the idle keepalive pool.
//!
//! # Responsibilities
//! - Open TCP connections to peers under the connect timeout
//! - Keep idle connections per peer for reuse
//! - Drop idle connections that expired or were closed by the peer
//!
//! # Design Decisions
//! - A connection goes back to the pool only after its response ended by
//!   its own framing; the caller decides, the pool never inspects streams
//! - Liveness is probed with a non-blocking read before reuse

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;

use crate::config::KeepaliveConfig;
use crate::gateway::GatewayError;
use crate::resilience::upstream_io;

static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for an upstream connection, for tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "upstream-{}", self.0)
    }
}

/// An open connection to one peer.
#[derive(Debug)]
pub struct UpstreamConnection {
    pub id: ConnectionId,
    pub peer: SocketAddr,
    pub stream: TcpStream,
    /// Taken from the idle pool rather than freshly connected.
    pub reused: bool,
}

#[derive(Debug)]
struct IdleConnection {
    id: ConnectionId,
    stream: TcpStream,
    since: Instant,
}

/// Idle upstream connections, per peer address.
#[derive(Debug)]
pub struct ConnectionPool {
    idle: Mutex<HashMap<SocketAddr, Vec<IdleConnection>>>,
    max_idle_per_peer: usize,
    idle_timeout: Duration,
}

impl ConnectionPool {
    pub fn new(config: &KeepaliveConfig) -> Self {
        Self {
            idle: Mutex::new(HashMap::new()),
            max_idle_per_peer: config.max_idle_per_peer,
            idle_timeout: Duration::from_secs(config.idle_secs),
        }
    }

    /// Connect to `peer`, reusing an idle connection when `reuse` is set.
    pub async fn connect(&self, peer: SocketAddr, timeout: Duration, reuse: bool) -> Result<UpstreamConnection, GatewayError> {
        if reuse {
            if let Some(conn) = self.take(peer) {
                return Ok(conn);
            }
        }
        let stream = upstream_io(timeout, "connect", TcpStream::connect(peer)).await?;
        let id = ConnectionId::new();
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(conn = %id, peer = %peer, error = %e, "Failed to set TCP_NODELAY on upstream socket");
        }
        tracing::trace!(conn = %id, peer = %peer, "Upstream connected");
        Ok(UpstreamConnection {
            id,
            peer,
            stream,
            reused: false,
        })
    }

    /// Most recently parked live connection to `peer`.
    pub fn take(&self, peer: SocketAddr) -> Option<UpstreamConnection> {
        let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
        let list = idle.get_mut(&peer)?;

        while let Some(conn) = list.pop() {
            if conn.since.elapsed() > self.idle_timeout || !is_alive(&conn.stream) {
                tracing::trace!(conn = %conn.id, peer = %peer, "Dropping stale idle connection");
                continue;
            }
            tracing::trace!(conn = %conn.id, peer = %peer, "Reusing idle connection");
            return Some(UpstreamConnection {
                id: conn.id,
                peer,
                stream: conn.stream,
                reused: true,
            });
        }
        None
    }

    /// Park a connection whose last response ended cleanly.
    pub fn put(&self, conn: UpstreamConnection) {
        if self.max_idle_per_peer == 0 {
            return;
        }
        let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
        let list = idle.entry(conn.peer).or_default();
        list.retain(|c| c.since.elapsed() <= self.idle_timeout);
        if list.len() >= self.max_idle_per_peer {
            list.remove(0);
        }
        list.push(IdleConnection {
            id: conn.id,
            stream: conn.stream,
            since: Instant::now(),
        });
    }

    pub fn idle_count(&self, peer: SocketAddr) -> usize {
        let idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
        idle.get(&peer).map_or(0, Vec::len)
    }
}

/// An idle connection must have nothing to read: EOF or stray bytes both
/// disqualify it.
fn is_alive(stream: &TcpStream) -> bool {
    let mut probe = [0u8; 1];
    matches!(stream.try_read(&mut probe), Err(e) if e.kind() == std::io::ErrorKind::WouldBlock)
}
