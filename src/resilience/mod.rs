//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Upstream attempt:
//!     → timeouts.rs (connect / send / read deadlines)
//!     → on failure: FailureKind reported to the peer source
//!     → retries.rs (next_upstream: may another peer be tried?)
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every upstream operation has a deadline
//! - Retry eligibility is decided per failure kind, method and body replayability
//! - Peer failure accounting lives in the load balancer, not here

pub mod retries;
pub mod timeouts;

pub use retries::{is_idempotent, NextUpstream, UnknownCondition};
pub use timeouts::{upstream_io, UpstreamTimeouts};
