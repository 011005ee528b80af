//! Downstream request handling.
//!
//! # Responsibilities
//! - Generate a unique request ID (UUID v4) unless the client sent one
//! - Copy the ID onto the response
//! - Snapshot the Axum request into the gateway's `ClientRequest`
//!
//! # Design Decisions
//! - Request ID added as early as possible for tracing
//! - The ID travels upstream as an ordinary client header

use std::net::SocketAddr;

use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, Version};
use tower::Layer;
use tower_http::request_id::{MakeRequestId, PropagateRequestId, RequestId, SetRequestId};

use crate::gateway::ClientRequest;
use crate::proto::HttpVersion;

pub const X_REQUEST_ID: &str = "x-request-id";

/// Generates `x-request-id` values.
#[derive(Debug, Clone, Copy, Default)]
pub struct MakeRequestUuidV4;

impl MakeRequestId for MakeRequestUuidV4 {
    fn make_request_id<B>(&mut self, _request: &Request<B>) -> Option<RequestId> {
        let id = uuid::Uuid::new_v4().to_string();
        HeaderValue::from_str(&id).ok().map(RequestId::new)
    }
}

/// Sets `x-request-id` on the request when missing and echoes it on the
/// response.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestIdLayer;

impl<S> Layer<S> for RequestIdLayer {
    type Service = SetRequestId<PropagateRequestId<S>, MakeRequestUuidV4>;

    fn layer(&self, inner: S) -> Self::Service {
        let header = HeaderName::from_static(X_REQUEST_ID);
        SetRequestId::new(PropagateRequestId::new(inner, header.clone()), header, MakeRequestUuidV4)
    }
}

/// Access to the request ID once the layer has run.
pub trait RequestIdExt {
    fn request_id(&self) -> Option<&str>;
}

impl RequestIdExt for HeaderMap {
    fn request_id(&self) -> Option<&str> {
        self.get(X_REQUEST_ID).and_then(|v| v.to_str().ok())
    }
}

impl<B> RequestIdExt for Request<B> {
    fn request_id(&self) -> Option<&str> {
        self.headers().request_id()
    }
}

/// Snapshot of the downstream request for the gateway core.
pub fn client_request<B>(req: &Request<B>, remote_addr: SocketAddr) -> ClientRequest {
    let target = req
        .uri()
        .path_and_query()
        .map_or_else(|| req.uri().path().to_string(), |pq| pq.as_str().to_string());

    let mut client = ClientRequest::new(req.method().as_str(), target).with_remote_addr(remote_addr);
    client.version = match req.version() {
        Version::HTTP_09 => HttpVersion::HTTP_09,
        Version::HTTP_10 => HttpVersion::HTTP_10,
        _ => HttpVersion::HTTP_11,
    };
    // HeaderName is always lower-case.
    client.headers = req
        .headers()
        .iter()
        .map(|(name, value)| (name.as_str().to_string(), value.as_bytes().to_vec()))
        .collect();
    if client.header("host").is_none() {
        if let Some(authority) = req.uri().authority() {
            client.headers.push(("host".to_string(), authority.as_str().as_bytes().to_vec()));
        }
    }
    client
}
