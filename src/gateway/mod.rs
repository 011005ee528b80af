//! Per-request proxy pipeline.
//!
//! # Data Flow
//! ```text
//! ClientRequest → ProxyContext
//!     → RequestBuilder (method, URI, headers, body framing) → OutgoingHead
//!     → upstream exchange (crate::upstream)
//!     → ResponseProcessor (validate, rewrite, filter headers) → UpstreamHead
//!     → TransferPump (decode body, buffer or stream) → client
//! ```
//!
//! # Design Decisions
//! - Everything here is synchronous and IO-free; the upstream module drives it
//! - `GatewaySettings` is compiled once per route and shared read-only
//! - `ProxyContext` lives exactly as long as one downstream request

pub mod buffer;
pub mod context;
pub mod error;
pub mod pump;
pub mod request;
pub mod response;
pub mod settings;

pub use buffer::BufferPool;
pub use context::{ClientRequest, ProxyContext};
pub use error::{FailureKind, GatewayError};
pub use pump::{PumpMode, PumpStatus, TransferPump};
pub use request::{OutgoingBody, OutgoingHead, RequestBuilder};
pub use response::{ResponseProcessor, UpstreamHead};
pub use settings::{GatewaySettings, HeaderTemplate, ProxyPass, SettingsError};
