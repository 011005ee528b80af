//! HTTP reverse-proxy protocol gateway.
//!
//! # Architecture Overview
//!
//! ```text
//!     Client Request
//!     ──────────────▶ http (Axum server, request id)
//!                         │
//!                         ▼
//!                     routing (host / path prefix → GatewaySettings)
//!                         │
//!                         ▼
//!                     gateway (ProxyContext, RequestBuilder) ──▶ rewrite (templates)
//!                         │
//!                         ▼
//!                     upstream (exchange driver) ◀──▶ load_balancer (peers)
//!                         │   ▲                          resilience (next_upstream, timeouts)
//!                         │   └── proto (head parser, framing codec)
//!                         ▼
//!                     gateway (ResponseProcessor, TransferPump) ──▶ rewrite (redirects, cookies)
//!                         │
//!     Client Response     ▼
//!     ◀────────────── http (streamed body)
//!
//!     Cross-cutting: config, observability, lifecycle
//! ```

// Wire and rewrite core
pub mod gateway;
pub mod proto;
pub mod rewrite;

// Traffic
pub mod http;
pub mod load_balancer;
pub mod routing;
pub mod upstream;

// Cross-cutting concerns
pub mod config;
pub mod lifecycle;
pub mod observability;
pub mod resilience;

pub use config::schema::ProxyConfig;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
