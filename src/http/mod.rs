//! Downstream HTTP side.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, middleware, proxy handler)
//!     → request.rs (request ID, ClientRequest snapshot)
//!     → routing layer picks the route and its GatewaySettings
//!     → upstream::UpstreamClient runs the exchange
//!     → response.rs (UpstreamHead + body channel → Axum response, or error page)
//!     → Send to client
//! ```

pub mod request;
pub mod response;
pub mod server;

pub use request::{client_request, MakeRequestUuidV4, RequestIdExt, RequestIdLayer, X_REQUEST_ID};
pub use response::{error_response, upstream_response};
pub use server::{AppState, HttpServer};
