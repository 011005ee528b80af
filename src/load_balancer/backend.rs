//! Backend abstraction.
//!
//! # Responsibilities
//! - Represent a single backend server
//! - Track active connections and enforce the connection limit
//! - Count failures inside the `fail_timeout` window and take the backend
//!   out of rotation once `max_fails` is reached

use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::BackendConfig;

/// A single backend server.
#[derive(Debug)]
pub struct Backend {
    pub name: String,
    pub addr: SocketAddr,
    /// Maximum concurrent connections allowed.
    pub max_connections: usize,
    /// Number of currently active connections.
    pub active_connections: AtomicUsize,

    /// Failures before the backend is skipped (0 = never).
    pub max_fails: u32,
    pub fail_timeout: Duration,

    /// Failures in the current window.
    failures: AtomicU32,
    /// Start of the failure window, in ms since `epoch`.
    window_start: AtomicU64,
    /// The backend is skipped until this instant, in ms since `epoch` (0 = available).
    down_until: AtomicU64,
    epoch: Instant,
}

impl Backend {
    pub fn new(name: impl Into<String>, addr: SocketAddr, max_connections: usize) -> Self {
        Self {
            name: name.into(),
            addr,
            max_connections,
            active_connections: AtomicUsize::new(0),
            max_fails: 1,
            fail_timeout: Duration::from_secs(10),
            failures: AtomicU32::new(0),
            window_start: AtomicU64::new(0),
            down_until: AtomicU64::new(0),
            epoch: Instant::now(),
        }
    }

    /// Build from configuration. `None` when the address does not parse.
    pub fn from_config(config: &BackendConfig) -> Option<Self> {
        let addr = config.address.parse().ok()?;
        Some(
            Self::new(&config.name, addr, config.max_connections)
                .with_failure_policy(config.max_fails, Duration::from_secs(config.fail_timeout_secs)),
        )
    }

    pub fn with_failure_policy(mut self, max_fails: u32, fail_timeout: Duration) -> Self {
        self.max_fails = max_fails;
        self.fail_timeout = fail_timeout;
        self
    }

    fn now_ms(&self) -> u64 {
        // Never 0, so 0 can mean "unset".
        self.epoch.elapsed().as_millis() as u64 + 1
    }

    /// Get the current number of active connections.
    pub fn load_count(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Decrement active connection count.
    pub fn dec_connections(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn is_full(&self) -> bool {
        self.load_count() >= self.max_connections
    }

    /// Try to create a connection guard that increments count.
    pub fn try_create_guard(self: &Arc<Self>) -> Option<BackendConnectionGuard> {
        let mut prev = self.active_connections.load(Ordering::Relaxed);
        loop {
            if prev >= self.max_connections {
                return None;
            }
            match self
                .active_connections
                .compare_exchange_weak(prev, prev + 1, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(x) => prev = x,
            }
        }
        Some(BackendConnectionGuard { backend: self.clone() })
    }

    // --- Failure accounting ---

    /// Whether the backend is in rotation.
    pub fn is_available(&self) -> bool {
        let until = self.down_until.load(Ordering::Relaxed);
        until == 0 || self.now_ms() >= until
    }

    /// Report a successful attempt.
    pub fn mark_success(&self) {
        self.failures.store(0, Ordering::Relaxed);
        self.down_until.store(0, Ordering::Relaxed);
    }

    /// Report a failed attempt. Returns true when this failure took the
    /// backend out of rotation.
    pub fn mark_failure(&self) -> bool {
        if self.max_fails == 0 {
            return false;
        }
        let now = self.now_ms();
        let window = self.fail_timeout.as_millis() as u64;

        let start = self.window_start.load(Ordering::Relaxed);
        if start == 0 || now.saturating_sub(start) > window {
            self.window_start.store(now, Ordering::Relaxed);
            self.failures.store(0, Ordering::Relaxed);
        }

        let failures = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= self.max_fails {
            self.down_until.store(now + window, Ordering::Relaxed);
            self.failures.store(0, Ordering::Relaxed);
            self.window_start.store(0, Ordering::Relaxed);
            return true;
        }
        false
    }
}

/// A RAII guard that manages the active connection count.
#[derive(Debug)]
pub struct BackendConnectionGuard {
    pub backend: Arc<Backend>,
}

impl Deref for BackendConnectionGuard {
    type Target = Backend;
    fn deref(&self) -> &Self::Target {
        &self.backend
    }
}

impl Drop for BackendConnectionGuard {
    fn drop(&mut self) {
        self.backend.dec_connections();
    }
}
