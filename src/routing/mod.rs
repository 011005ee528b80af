//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming Request (host, path)
//!     → router.rs (route lookup)
//!     → matcher.rs (evaluate match conditions)
//!     → Return: matched Route (with its GatewaySettings) or NoMatch
//!
//! Route Compilation (at startup):
//!     RouteConfig[]
//!     → Compile GatewaySettings (rewrite rules, templates, policies)
//!     → Sort by priority, then prefix length
//!     → Freeze as immutable Router
//! ```
//!
//! # Design Decisions
//! - Routes compiled at startup, immutable at runtime
//! - No regex in hot path (prefix matching only)
//! - First match wins

pub mod matcher;
pub mod router;

pub use router::{Route, RouteMatch, Router, RouterError};
