//! Downstream response conversion.
//!
//! # Responsibilities
//! - Turn an accepted upstream head plus its body channel into an Axum response
//! - Map gateway errors to status codes and a generic error page
//!
//! # Design Decisions
//! - Bodies stream from the transfer task; nothing is collected here
//! - Upstream bytes never appear in an error page

use axum::body::Body;
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::stream;

use crate::gateway::GatewayError;
use crate::upstream::{BodyReceiver, ProxyResponse};

/// Generic error page for a failed request.
pub fn error_response(err: &GatewayError) -> Response {
    let status = StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = error_page(status);
    // The client connection may hold unread or misframed body bytes.
    if matches!(err, GatewayError::Client(_)) {
        response
            .headers_mut()
            .insert(axum::http::header::CONNECTION, HeaderValue::from_static("close"));
    }
    response
}

pub fn error_page(status: StatusCode) -> Response {
    let title = format!(
        "{} {}",
        status.as_u16(),
        status.canonical_reason().unwrap_or("Error")
    );
    let body = format!(
        "<html>\r\n<head><title>{title}</title></head>\r\n<body>\r\n<center><h1>{title}</h1></center>\r\n</body>\r\n</html>\r\n"
    );
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "text/html")],
        body,
    )
        .into_response()
}

/// Build the client response from an upstream response.
///
/// Empty `Server`/`Date` values are placeholders that keep the gateway from
/// adding its own and are dropped here.
pub fn upstream_response(upstream: ProxyResponse) -> Response {
    let ProxyResponse { head, body, peer } = upstream;

    let status = StatusCode::from_u16(head.status).unwrap_or_else(|_| {
        tracing::warn!(status = head.status, peer = %peer, "Unrepresentable upstream status");
        StatusCode::BAD_GATEWAY
    });

    let mut response = Response::new(body_stream(body));
    *response.status_mut() = status;

    let headers = response.headers_mut();
    for (name, value) in &head.headers {
        if value.is_empty() && (name.eq_ignore_ascii_case(b"server") || name.eq_ignore_ascii_case(b"date")) {
            continue;
        }
        match (HeaderName::from_bytes(name), HeaderValue::from_bytes(value)) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => {
                tracing::warn!(
                    peer = %peer,
                    header = %String::from_utf8_lossy(name),
                    "Dropping header not representable downstream"
                );
            }
        }
    }

    response
}

fn body_stream(rx: BodyReceiver) -> Body {
    Body::from_stream(stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (chunk, rx))
    }))
}
