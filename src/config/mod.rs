//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (read & deserialize)
//!     → validation.rs (semantic checks, all errors at once)
//!     → ProxyConfig (validated, immutable)
//!     → compiled per route into gateway::GatewaySettings
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require a restart
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, ConfigError};
pub use schema::{
    BackendConfig, CookieFlagsConfig, KeepaliveConfig, ListenerConfig, ObservabilityConfig, ProxyConfig,
    RewriteConfig, RouteConfig, SetHeaderConfig, TimeoutConfig,
};
pub use validation::{validate_config, ValidationError};
