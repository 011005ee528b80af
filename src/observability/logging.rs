//! Structured logging.
//!
//! # Design Decisions
//! - Uses tracing crate for structured logging
//! - `RUST_LOG` wins over the configured level

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter directive used when `RUST_LOG` is unset.
pub fn default_directive(log_level: &str) -> String {
    format!("proxy_gateway={log_level},tower_http={log_level}")
}

/// Install the global subscriber. Call once, from the binary.
pub fn init(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive(log_level)))
        .unwrap_or_else(|_| EnvFilter::new("proxy_gateway=info,tower_http=info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directive_parses() {
        assert_eq!(default_directive("debug"), "proxy_gateway=debug,tower_http=debug");
        assert!(EnvFilter::try_new(default_directive("warn")).is_ok());
    }
}
