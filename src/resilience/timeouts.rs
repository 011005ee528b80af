//! Timeout enforcement for upstream I/O.
//!
//! # Responsibilities
//! - Wrap connect, send and read operations with a deadline
//! - Map elapsed deadlines to `FailureKind::Timeout` and I/O errors to
//!   `FailureKind::Error`
//!
//! # Design Decisions
//! - Uses Tokio's timeout facilities
//! - Timeout errors stay distinct from other errors so they map to 504

use std::future::Future;
use std::time::Duration;

use crate::config::TimeoutConfig;
use crate::gateway::{FailureKind, GatewayError};

/// Per-operation upstream deadlines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpstreamTimeouts {
    pub connect: Duration,
    pub send: Duration,
    pub read: Duration,
}

impl UpstreamTimeouts {
    pub fn from_config(config: &TimeoutConfig) -> Self {
        Self {
            connect: Duration::from_secs(config.connect_secs),
            send: Duration::from_secs(config.send_secs),
            read: Duration::from_secs(config.read_secs),
        }
    }
}

impl Default for UpstreamTimeouts {
    fn default() -> Self {
        Self::from_config(&TimeoutConfig::default())
    }
}

/// Run an upstream I/O future under `limit`. `what` names the operation in the error.
pub async fn upstream_io<T, F>(limit: Duration, what: &str, fut: F) -> Result<T, GatewayError>
where
    F: Future<Output = std::io::Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(GatewayError::upstream(FailureKind::Error, format!("{what}: {e}"))),
        Err(_) => Err(GatewayError::upstream(
            FailureKind::Timeout,
            format!("{what} timed out after {}ms", limit.as_millis()),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_timeout_maps_to_timeout_kind() {
        let err = upstream_io(Duration::from_millis(10), "read", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, std::io::Error>(())
        })
        .await
        .unwrap_err();
        assert_eq!(err.failure_kind(), Some(FailureKind::Timeout));
        assert_eq!(err.status(), 504);
    }

    #[tokio::test]
    async fn test_io_error_maps_to_error_kind() {
        let err = upstream_io(Duration::from_secs(1), "connect", async {
            Err::<(), _>(std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"))
        })
        .await
        .unwrap_err();
        assert_eq!(err.failure_kind(), Some(FailureKind::Error));
        assert!(err.to_string().contains("connect"));
    }

    #[tokio::test]
    async fn test_success_passes_value() {
        let value = upstream_io(Duration::from_secs(1), "send", async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
    }
}
