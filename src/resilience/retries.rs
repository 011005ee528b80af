//! `next_upstream` policy.
//!
//! # Responsibilities
//! - Parse the configured condition tokens
//! - Decide whether a failed attempt may move on to another peer
//! - Bound the number of tries
//!
//! # Design Decisions
//! - Non-idempotent methods are only retried when `non_idempotent` is listed
//! - A body that was streamed to the upstream cannot be replayed, so the
//!   caller passes `replayable = false` and the attempt is final
//! - `off` disables retries entirely

use thiserror::Error;

use crate::gateway::FailureKind;

/// Unknown condition in a `next_upstream` list.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown next_upstream condition {0:?}")]
pub struct UnknownCondition(pub String);

const ERROR: u16 = 1 << 0;
const TIMEOUT: u16 = 1 << 1;
const INVALID_HEADER: u16 = 1 << 2;
const HTTP_500: u16 = 1 << 3;
const HTTP_502: u16 = 1 << 4;
const HTTP_503: u16 = 1 << 5;
const HTTP_504: u16 = 1 << 6;
const HTTP_403: u16 = 1 << 7;
const HTTP_404: u16 = 1 << 8;
const HTTP_429: u16 = 1 << 9;
const NON_IDEMPOTENT: u16 = 1 << 10;

/// When to try the next peer, and how many tries in total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextUpstream {
    mask: u16,
    tries: u32,
}

impl Default for NextUpstream {
    fn default() -> Self {
        Self {
            mask: ERROR | TIMEOUT,
            tries: 0,
        }
    }
}

impl NextUpstream {
    /// Policy that never retries.
    pub fn off() -> Self {
        Self { mask: 0, tries: 1 }
    }

    /// Build from condition tokens and a try limit (0 = no limit).
    pub fn parse<S: AsRef<str>>(tokens: &[S], tries: u32) -> Result<Self, UnknownCondition> {
        let mut mask = 0;
        for token in tokens {
            let token = token.as_ref();
            mask |= match token {
                "error" => ERROR,
                "timeout" => TIMEOUT,
                "invalid_header" => INVALID_HEADER,
                "http_500" => HTTP_500,
                "http_502" => HTTP_502,
                "http_503" => HTTP_503,
                "http_504" => HTTP_504,
                "http_403" => HTTP_403,
                "http_404" => HTTP_404,
                "http_429" => HTTP_429,
                "non_idempotent" => NON_IDEMPOTENT,
                "off" => return Ok(Self::off()),
                other => return Err(UnknownCondition(other.to_string())),
            };
        }
        Ok(Self { mask, tries })
    }

    pub fn is_off(&self) -> bool {
        self.mask & !NON_IDEMPOTENT == 0
    }

    /// Upstream status codes that count as a failed attempt.
    pub fn is_failure_status(&self, status: u16) -> bool {
        status_bit(status).is_some_and(|bit| self.mask & bit != 0)
    }

    /// Maximum number of tries for a group of `peers` backends.
    pub fn max_tries(&self, peers: usize) -> usize {
        let peers = peers.max(1);
        match self.tries {
            0 => peers,
            n => (n as usize).min(peers),
        }
    }

    /// Whether attempt number `tried` (1-based) that failed with `kind` may
    /// be followed by another one.
    pub fn should_retry(&self, kind: FailureKind, idempotent: bool, replayable: bool, tried: usize, peers: usize) -> bool {
        if !replayable || tried >= self.max_tries(peers) {
            return false;
        }
        if !idempotent && self.mask & NON_IDEMPOTENT == 0 {
            return false;
        }
        let bit = match kind {
            FailureKind::Error => ERROR,
            FailureKind::Timeout => TIMEOUT,
            FailureKind::InvalidHeader => INVALID_HEADER,
            FailureKind::Status(code) => match status_bit(code) {
                Some(bit) => bit,
                None => return false,
            },
        };
        self.mask & bit != 0
    }
}

fn status_bit(status: u16) -> Option<u16> {
    match status {
        500 => Some(HTTP_500),
        502 => Some(HTTP_502),
        503 => Some(HTTP_503),
        504 => Some(HTTP_504),
        403 => Some(HTTP_403),
        404 => Some(HTTP_404),
        429 => Some(HTTP_429),
        _ => None,
    }
}

/// RFC 9110 idempotent methods.
pub fn is_idempotent(method: &str) -> bool {
    matches!(method, "GET" | "HEAD" | "PUT" | "DELETE" | "OPTIONS" | "TRACE")
}
