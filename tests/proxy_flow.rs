//! End-to-end request and response flow through the gateway.

use std::time::Duration;

use proxy_gateway::config::{RewriteConfig, SetHeaderConfig};
use reqwest::StatusCode;

mod common;
use common::{
    backend, client, config, raw_exchange, response, route, start_fixed, start_proxy, start_upstream, Reply,
};

#[tokio::test]
async fn test_chunked_response_is_decoded() {
    let upstream =
        start_fixed(&b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n"[..]).await;
    let proxy = start_proxy(config(vec![route("all", "/", "http://web")], vec![backend("b1", "web", &upstream)])).await;

    let res = client().get(proxy.url("/wiki")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.text().await.unwrap(), "Wikipedia");
}

#[tokio::test]
async fn test_not_modified_has_empty_body() {
    let upstream = start_fixed(&b"HTTP/1.1 304 Not Modified\r\nContent-Length: 0\r\nETag: \"v1\"\r\n\r\n"[..]).await;
    let proxy = start_proxy(config(vec![route("all", "/", "http://web")], vec![backend("b1", "web", &upstream)])).await;

    let res = client().get(proxy.url("/page")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_MODIFIED);
    assert_eq!(res.headers()["etag"], "\"v1\"");
    assert!(res.bytes().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_excess_body_bytes_are_discarded() {
    let mut raw = b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\n".to_vec();
    raw.extend(std::iter::repeat(b'a').take(100));
    raw.extend(std::iter::repeat(b'z').take(10));
    let upstream = start_fixed(raw).await;
    let proxy = start_proxy(config(vec![route("all", "/", "http://web")], vec![backend("b1", "web", &upstream)])).await;

    let res = client().get(proxy.url("/")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = res.bytes().await.unwrap();
    assert_eq!(body.len(), 100);
    assert!(body.iter().all(|&b| b == b'a'));
}

#[tokio::test]
async fn test_set_cookie_path_rewritten() {
    let upstream = start_fixed(response("200 OK", &[("Set-Cookie", "sid=abc; Path=/old")], "ok")).await;
    let mut r = route("all", "/", "http://web");
    r.cookie_paths.push(RewriteConfig {
        pattern: "/old".into(),
        replacement: "/new".into(),
    });
    let proxy = start_proxy(config(vec![r], vec![backend("b1", "web", &upstream)])).await;

    let res = client().get(proxy.url("/")).send().await.unwrap();
    assert_eq!(res.headers()["set-cookie"], "sid=abc; Path=/new");
}

#[tokio::test]
async fn test_location_rewritten_to_route_prefix() {
    let upstream = start_fixed(response("302 Found", &[("Location", "http://web/login?next=1")], "")).await;
    let proxy = start_proxy(config(vec![route("app", "/app/", "http://web/")], vec![backend("b1", "web", &upstream)])).await;

    let res = client().get(proxy.url("/app/home")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::FOUND);
    assert_eq!(res.headers()["location"], "/app/login?next=1");
}

#[tokio::test]
async fn test_outgoing_request_line_and_headers() {
    let upstream = start_fixed(response("200 OK", &[], "done")).await;
    let mut r = route("app", "/app/", "http://web/");
    r.set_headers.push(SetHeaderConfig {
        name: "X-Forwarded-For".into(),
        value: "$proxy_add_x_forwarded_for".into(),
    });
    let proxy = start_proxy(config(vec![r], vec![backend("b1", "web", &upstream)])).await;

    let res = client()
        .get(proxy.url("/app/items?page=2"))
        .header("x-request-id", "trace-42")
        .header("Keep-Alive", "timeout=5")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers()["x-request-id"], "trace-42");
    assert_eq!(res.text().await.unwrap(), "done");

    let requests = upstream.requests();
    let sent = &requests[0];
    assert_eq!(sent.request_line(), "GET /items?page=2 HTTP/1.0");
    assert_eq!(sent.header("host"), Some("web"));
    assert_eq!(sent.header("connection"), Some("close"));
    assert_eq!(sent.header("x-request-id"), Some("trace-42"));
    assert_eq!(sent.header("x-forwarded-for"), Some("127.0.0.1"));
    assert_eq!(sent.header("keep-alive"), None);
}

#[tokio::test]
async fn test_generated_request_id_reaches_upstream_and_client() {
    let upstream = start_fixed(response("200 OK", &[], "")).await;
    let proxy = start_proxy(config(vec![route("all", "/", "http://web")], vec![backend("b1", "web", &upstream)])).await;

    let res = client().get(proxy.url("/")).send().await.unwrap();
    let id = res.headers()["x-request-id"].to_str().unwrap().to_string();
    assert!(!id.is_empty());
    assert_eq!(upstream.requests()[0].header("x-request-id"), Some(id.as_str()));
}

#[tokio::test]
async fn test_request_body_forwarded_with_length() {
    let upstream = start_fixed(response("201 Created", &[], "")).await;
    let proxy = start_proxy(config(vec![route("all", "/", "http://web")], vec![backend("b1", "web", &upstream)])).await;

    let res = client().post(proxy.url("/items")).body("payload").send().await.unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);

    let sent = &upstream.requests()[0];
    assert_eq!(sent.request_line(), "POST /items HTTP/1.0");
    assert_eq!(sent.header("content-length"), Some("7"));
    assert_eq!(sent.body, b"payload");
}

#[tokio::test]
async fn test_configured_body_wins_over_client_body() {
    let upstream = start_fixed(response("200 OK", &[], "")).await;
    let mut r = route("all", "/", "http://web");
    r.set_body = Some("fixed".into());
    let proxy = start_proxy(config(vec![r], vec![backend("b1", "web", &upstream)])).await;

    let res = client().post(proxy.url("/")).body("from the client").send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let sent = &upstream.requests()[0];
    assert_eq!(sent.header("content-length"), Some("5"));
    assert_eq!(sent.body, b"fixed");
}

#[tokio::test]
async fn test_large_body_through_small_buffers() {
    let body: String = std::iter::repeat_with(fastrand::alphanumeric).take(256 * 1024).collect();
    let upstream = start_fixed(response("200 OK", &[], &body)).await;
    let mut r = route("all", "/", "http://web");
    r.buffer_size = 1024;
    r.buffers = 2;
    let proxy = start_proxy(config(vec![r], vec![backend("b1", "web", &upstream)])).await;

    let res = client().get(proxy.url("/big")).send().await.unwrap();
    assert_eq!(res.text().await.unwrap(), body);
}

#[tokio::test]
async fn test_unbuffered_streaming_of_slow_upstream() {
    let upstream = start_upstream(|_| {
        Reply::Slow(vec![
            (Duration::ZERO, b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec()),
            (Duration::from_millis(20), b"5\r\nhello\r\n".to_vec()),
            (Duration::from_millis(20), b"6\r\n world\r\n".to_vec()),
            (Duration::from_millis(20), b"0\r\n\r\n".to_vec()),
        ])
    })
    .await;
    let mut r = route("all", "/", "http://web");
    r.buffering = false;
    let proxy = start_proxy(config(vec![r], vec![backend("b1", "web", &upstream)])).await;

    let res = client().get(proxy.url("/")).send().await.unwrap();
    assert_eq!(res.text().await.unwrap(), "hello world");
}

#[tokio::test]
async fn test_keepalive_reuses_upstream_connection() {
    let upstream = start_upstream(|_| Reply::KeepAlive(response("200 OK", &[], "pong"))).await;
    let mut r = route("all", "/", "http://web");
    r.http_version = "1.1".into();
    let mut config = config(vec![r], vec![backend("b1", "web", &upstream)]);
    config.keepalive.enabled = true;
    let proxy = start_proxy(config).await;

    let client = client();
    for _ in 0..2 {
        let res = client.get(proxy.url("/ping")).send().await.unwrap();
        assert_eq!(res.text().await.unwrap(), "pong");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    assert_eq!(upstream.requests().len(), 2);
    assert_eq!(upstream.connections(), 1);
    let sent = &upstream.requests()[1];
    assert_eq!(sent.request_line(), "GET /ping HTTP/1.1");
    assert_eq!(sent.header("connection"), None);
}

#[tokio::test]
async fn test_http09_response_accepted() {
    let upstream = start_fixed(&b"plain old response"[..]).await;
    let proxy = start_proxy(config(vec![route("all", "/", "http://web")], vec![backend("b1", "web", &upstream)])).await;

    let res = client().get(proxy.url("/")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.text().await.unwrap(), "plain old response");
}

#[tokio::test]
async fn test_unmatched_path_is_404() {
    let upstream = start_fixed(response("200 OK", &[], "")).await;
    let proxy = start_proxy(config(vec![route("api", "/api/", "http://web")], vec![backend("b1", "web", &upstream)])).await;

    let res = client().get(proxy.url("/static/x")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    assert!(upstream.requests().is_empty());
}

#[tokio::test]
async fn test_malformed_chunked_request_body_is_400_and_closes() {
    let upstream = start_fixed(response("200 OK", &[], "")).await;
    let proxy = start_proxy(config(vec![route("all", "/", "http://web")], vec![backend("b1", "web", &upstream)])).await;

    let reply = raw_exchange(
        proxy.addr,
        b"POST /upload HTTP/1.1\r\nHost: gw\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\nzz\r\n",
    )
    .await
    .expect("connection left open after a bad request body");

    assert!(reply.starts_with("HTTP/1.1 400"), "{reply}");
    assert!(reply.to_ascii_lowercase().contains("connection: close"), "{reply}");
    assert!(upstream.requests().is_empty());
}

#[tokio::test]
async fn test_extra_transfer_coding_on_request_is_400() {
    let upstream = start_fixed(response("200 OK", &[], "")).await;
    let proxy = start_proxy(config(vec![route("all", "/", "http://web")], vec![backend("b1", "web", &upstream)])).await;

    let reply = raw_exchange(
        proxy.addr,
        b"POST /upload HTTP/1.1\r\nHost: gw\r\nTransfer-Encoding: gzip, chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n",
    )
    .await
    .expect("connection left open after a rejected request");

    assert!(reply.starts_with("HTTP/1.1 400"), "{reply}");
    assert!(upstream.requests().is_empty());
}
