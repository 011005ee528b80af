//! Header rewrite engine.
//!
//! # Data Flow
//! ```text
//! upstream Location / Refresh ─→ redirect.rs ─┐
//!                                             ├─→ pattern.rs (literal | regex match)
//! upstream Set-Cookie ─→ cookie.rs ───────────┘       │
//!        (Domain / Path attrs, flag edits)             ▼
//!                                              template.rs (replacement: text,
//!                                                $variables, $1..$9 captures)
//! ```
//!
//! # Design Decisions
//! - Header values are opaque bytes; nothing here assumes UTF-8
//! - Rules are tried in declaration order, first match wins
//! - A match replaces only the matched span of the value
//! - Rules are compiled once from configuration and shared read-only

pub mod cookie;
pub mod pattern;
pub mod redirect;
pub mod template;

pub use cookie::{CookieAttributes, CookieFlag, CookieFlagRule, CookieRewriter, SameSite};
pub use pattern::{LiteralMatch, Pattern, RewriteRule};
pub use redirect::RedirectRewriter;
pub use template::{Template, VariableSource};

use thiserror::Error;

/// Errors raised while compiling or applying rewrite rules.
#[derive(Debug, Error)]
pub enum RewriteError {
    #[error("invalid regex {pattern:?}: {source}")]
    InvalidRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("invalid cookie flag {0:?}")]
    InvalidCookieFlag(String),

    #[error("allocation failed while rewriting header value")]
    Allocation(#[from] std::collections::TryReserveError),
}
