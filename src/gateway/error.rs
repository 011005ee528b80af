//! Gateway error taxonomy.
//!
//! # Design Decisions
//! - Client-side and upstream-side failures are separate variants so the
//!   request body direction can never be mistaken for the response direction
//! - Only `Upstream` failures feed the `next_upstream` policy
//! - Framing overflow is not an error at all; the pump handles it in place

use std::fmt;

use thiserror::Error;

use crate::proto::FramingError;
use crate::rewrite::RewriteError;

/// Why an upstream attempt failed, as reported to the peer collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Connect, read or write error, or a premature close.
    Error,
    Timeout,
    /// Unparsable status line, header line or body framing.
    InvalidHeader,
    /// A response status the policy treats as a failure.
    Status(u16),
}

impl FailureKind {
    /// Stable label for metrics and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Error => "error",
            FailureKind::Timeout => "timeout",
            FailureKind::InvalidHeader => "invalid_header",
            FailureKind::Status(_) => "status",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Status(code) => write!(f, "http_{code}"),
            other => f.write_str(other.as_str()),
        }
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    /// The downstream client sent something unusable.
    #[error("client error: {0}")]
    Client(String),

    #[error("upstream {kind}: {reason}")]
    Upstream { kind: FailureKind, reason: String },

    /// No peer left to try.
    #[error("no live upstreams in {0:?}")]
    NoPeer(String),

    #[error("internal error: {0}")]
    Internal(String),

    /// The client went away before the response was delivered.
    #[error("client closed connection")]
    ClientClosed,
}

impl GatewayError {
    pub fn upstream(kind: FailureKind, reason: impl Into<String>) -> Self {
        GatewayError::Upstream {
            kind,
            reason: reason.into(),
        }
    }

    /// A framing violation on the response body.
    pub fn upstream_framing(err: FramingError) -> Self {
        let kind = match err {
            FramingError::InvalidChunked => FailureKind::InvalidHeader,
            _ => FailureKind::Error,
        };
        Self::upstream(kind, err.to_string())
    }

    /// A framing violation on the request body.
    pub fn client_framing(err: FramingError) -> Self {
        GatewayError::Client(err.to_string())
    }

    /// Failure kind when this error is eligible for `next_upstream`.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            GatewayError::Upstream { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Downstream status code for this error.
    pub fn status(&self) -> u16 {
        match self {
            GatewayError::Client(_) => 400,
            GatewayError::Upstream {
                kind: FailureKind::Timeout,
                ..
            } => 504,
            GatewayError::Upstream { .. } | GatewayError::NoPeer(_) => 502,
            GatewayError::Internal(_) => 500,
            // Nothing is sent; the code only shows up in logs and metrics.
            GatewayError::ClientClosed => 499,
        }
    }
}

impl From<RewriteError> for GatewayError {
    fn from(err: RewriteError) -> Self {
        GatewayError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(GatewayError::Client("bad chunk".into()).status(), 400);
        assert_eq!(GatewayError::upstream(FailureKind::Timeout, "read").status(), 504);
        assert_eq!(GatewayError::upstream(FailureKind::InvalidHeader, "x").status(), 502);
        assert_eq!(GatewayError::NoPeer("web".into()).status(), 502);
        assert_eq!(GatewayError::Internal("oom".into()).status(), 500);
    }

    #[test]
    fn test_directions_are_distinct() {
        let up = GatewayError::upstream_framing(FramingError::InvalidChunked);
        assert_eq!(up.failure_kind(), Some(FailureKind::InvalidHeader));

        let down = GatewayError::client_framing(FramingError::InvalidChunked);
        assert_eq!(down.failure_kind(), None);
        assert_eq!(down.status(), 400);
    }

    #[test]
    fn test_allocation_failure_is_internal() {
        let mut v: Vec<u8> = Vec::new();
        let reserve = v.try_reserve_exact(usize::MAX).unwrap_err();
        let err: GatewayError = RewriteError::from(reserve).into();
        assert!(matches!(err, GatewayError::Internal(_)));
        assert_eq!(FailureKind::Status(503).to_string(), "http_503");
    }
}
