//! Backend pool management.
//!
//! # Responsibilities
//! - Manage collections of backends grouped by name
//! - Apply load balancing algorithms to select backends
//! - Feed attempt outcomes into each backend's failure accounting

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::config::BackendConfig;
use crate::gateway::FailureKind;
use crate::load_balancer::{backend::Backend, round_robin::RoundRobin, LoadBalancer};
use crate::upstream::{Peer, PeerSource};

type Group = (Vec<Arc<Backend>>, Box<dyn LoadBalancer>);

/// Manages backend pools and load balancing.
#[derive(Debug)]
pub struct BackendManager {
    /// Map of backend_group name -> (Backends, LoadBalancerAlgo).
    groups: HashMap<String, Group>,
}

impl BackendManager {
    /// Create a new backend manager from configuration.
    pub fn new(configs: &[BackendConfig]) -> Self {
        let mut grouped: HashMap<String, Vec<Arc<Backend>>> = HashMap::new();

        for config in configs {
            match Backend::from_config(config) {
                Some(backend) => grouped.entry(config.group.clone()).or_default().push(Arc::new(backend)),
                None => tracing::warn!(backend = %config.name, address = %config.address, "Invalid backend address"),
            }
        }

        let groups = grouped
            .into_iter()
            .map(|(name, backends)| {
                let lb: Box<dyn LoadBalancer> = Box::new(RoundRobin::new());
                (name, (backends, lb))
            })
            .collect();

        Self { groups }
    }

    /// Return a list of all backends.
    pub fn all_backends(&self) -> Vec<Arc<Backend>> {
        self.groups
            .values()
            .flat_map(|(backends, _)| backends.iter())
            .cloned()
            .collect()
    }
}

impl PeerSource for BackendManager {
    fn get_peer(&self, group: &str, tried: &[SocketAddr]) -> Option<Peer> {
        let Some((backends, lb)) = self.groups.get(group) else {
            tracing::debug!(group = %group, "Group not found in BackendManager");
            return None;
        };

        match lb.next_server(backends, tried) {
            Some(backend) => backend.try_create_guard().map(Peer::leased),
            None => {
                tracing::debug!(group = %group, backend_count = backends.len(), tried = tried.len(), "No available backend in group");
                None
            }
        }
    }

    fn report_outcome(&self, peer: &Peer, outcome: Result<(), FailureKind>) {
        let Some(backend) = peer.lease() else {
            return;
        };
        match outcome {
            Ok(()) => backend.mark_success(),
            // Client-error statuses say nothing about the server's health.
            Err(FailureKind::Status(code)) if code < 500 => backend.mark_success(),
            Err(kind) => {
                if backend.mark_failure() {
                    tracing::warn!(
                        peer = %backend.name,
                        addr = %backend.addr,
                        kind = %kind,
                        fail_timeout_secs = backend.fail_timeout.as_secs(),
                        "Backend marked unavailable"
                    );
                }
            }
        }
    }

    fn group_size(&self, group: &str) -> usize {
        self.groups.get(group).map_or(0, |(backends, _)| backends.len())
    }
}
