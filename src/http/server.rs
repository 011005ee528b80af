//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create the Axum router with the catch-all proxy handler
//! - Wire up middleware (tracing, head timeout, request ID)
//! - Bind the server to a listener and drain on shutdown
//! - Dispatch requests to the routing table and the upstream client
//! - Record per-request metrics

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{Request, StatusCode},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use tokio::net::TcpListener;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::config::ProxyConfig;
use crate::gateway::{GatewayError, ProxyContext};
use crate::http::request::{client_request, RequestIdExt, RequestIdLayer};
use crate::http::response::{error_response, upstream_response};
use crate::lifecycle::Shutdown;
use crate::load_balancer::BackendManager;
use crate::observability::metrics;
use crate::resilience::UpstreamTimeouts;
use crate::routing::{RouteMatch, Router as ProxyRouter, RouterError};
use crate::upstream::{ConnectionPool, PeerSource, UpstreamClient};

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub router: Arc<ProxyRouter>,
    pub upstream: UpstreamClient,
}

/// HTTP server for the gateway.
pub struct HttpServer {
    router: Router,
    config: ProxyConfig,
}

impl HttpServer {
    /// Create a new HTTP server with the given configuration.
    ///
    /// The configuration is expected to be validated already; route
    /// compilation errors are still reported.
    pub fn new(config: ProxyConfig) -> Result<Self, RouterError> {
        let proxy_router = Arc::new(ProxyRouter::new(&config.routes, &config.keepalive)?);
        let peers: Arc<dyn PeerSource> = Arc::new(BackendManager::new(&config.backends));
        let pool = Arc::new(ConnectionPool::new(&config.keepalive));

        let upstream = UpstreamClient::new(
            peers,
            pool,
            UpstreamTimeouts::from_config(&config.timeouts),
            config.listener.client_max_body_size,
        );

        let state = AppState {
            router: proxy_router,
            upstream,
        };

        let router = Self::build_router(&config, state);
        Ok(Self { router, config })
    }

    /// Build the Axum router with all middleware layers.
    fn build_router(config: &ProxyConfig, state: AppState) -> Router {
        Router::new()
            .route("/{*path}", any(proxy_handler))
            .route("/", any(proxy_handler))
            .with_state(state)
            .layer(TimeoutLayer::with_status_code(
                StatusCode::REQUEST_TIMEOUT,
                Duration::from_secs(config.timeouts.request_secs),
            ))
            .layer(RequestIdLayer)
            .layer(TraceLayer::new_for_http())
    }

    /// Run the server until `shutdown` fires, then drain open requests.
    pub async fn run(self, listener: TcpListener, shutdown: &Shutdown) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(
            address = %addr,
            routes = self.config.routes.len(),
            backends = self.config.backends.len(),
            "HTTP server starting"
        );

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();
        let mut stop = shutdown.subscribe();

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = stop.recv().await;
                tracing::info!("Draining connections");
            })
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }
}

/// Main proxy handler.
/// Looks up the route and hands the request to the upstream client.
async fn proxy_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response {
    let start_time = Instant::now();
    let request_id = request.request_id().unwrap_or("unknown").to_string();
    let method_str = request.method().to_string();

    tracing::debug!(
        request_id = %request_id,
        method = %method_str,
        uri = %request.uri(),
        remote_addr = %addr,
        "Proxying request"
    );

    let route = match state.router.match_route(&request) {
        RouteMatch::Matched(route) => route,
        RouteMatch::NoMatch => {
            tracing::warn!(request_id = %request_id, path = %request.uri().path(), "No route matched");
            metrics::record_request(&method_str, 404, "none", start_time);
            return (StatusCode::NOT_FOUND, "No matching route found").into_response();
        }
    };

    let settings = route.settings.clone();
    let ctx = ProxyContext::new(request_id.clone(), client_request(&request, addr), &settings);

    match state.upstream.proxy(settings, ctx, request.into_body()).await {
        Ok(upstream) => {
            tracing::debug!(
                request_id = %request_id,
                route = %route.name,
                peer = %upstream.peer,
                status = upstream.head.status,
                "Upstream response accepted"
            );
            metrics::record_request(&method_str, upstream.head.status, &upstream.peer, start_time);
            upstream_response(upstream)
        }
        Err(err) => {
            match &err {
                GatewayError::ClientClosed => {
                    tracing::debug!(request_id = %request_id, "Client closed before response")
                }
                GatewayError::Client(_) => tracing::warn!(request_id = %request_id, error = %err, "Bad client request"),
                _ => tracing::error!(request_id = %request_id, route = %route.name, error = %err, "Proxy request failed"),
            }
            metrics::record_request(&method_str, err.status(), "none", start_time);
            error_response(&err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendConfig, RouteConfig};
    use axum::extract::connect_info::MockConnectInfo;
    use tower::ServiceExt;

    fn config() -> ProxyConfig {
        ProxyConfig {
            routes: vec![RouteConfig {
                name: "api".into(),
                path_prefix: Some("/api/".into()),
                proxy_pass: "http://api".into(),
                ..Default::default()
            }],
            backends: vec![BackendConfig::new("api-1", "api", "127.0.0.1:9")],
            ..Default::default()
        }
    }

    fn app(config: ProxyConfig) -> Router {
        HttpServer::new(config)
            .unwrap()
            .router
            .layer(MockConnectInfo(SocketAddr::from(([127, 0, 0, 1], 40000))))
    }

    #[tokio::test]
    async fn test_unmatched_route_is_404_with_request_id() {
        let res = app(config())
            .oneshot(Request::builder().uri("/other").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        assert!(res.headers().request_id().is_some());
    }

    #[tokio::test]
    async fn test_no_live_upstream_is_502() {
        let mut config = config();
        config.backends.clear();
        let res = app(config)
            .oneshot(Request::builder().uri("/api/x").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_invalid_route_fails_construction() {
        let mut config = config();
        config.routes[0].proxy_pass = "ftp://api".into();
        assert!(HttpServer::new(config).is_err());
    }
}
