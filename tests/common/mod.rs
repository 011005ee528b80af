//! Shared utilities for integration testing.
#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use proxy_gateway::config::{BackendConfig, ProxyConfig, RouteConfig};
use proxy_gateway::{HttpServer, Shutdown};

/// One request as the mock upstream received it.
#[derive(Debug, Clone)]
pub struct MockRequest {
    pub head: String,
    pub body: Vec<u8>,
}

impl MockRequest {
    pub fn request_line(&self) -> &str {
        self.head.lines().next().unwrap_or_default()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.head.lines().skip(1).find_map(|line| {
            let (n, v) = line.split_once(':')?;
            n.trim().eq_ignore_ascii_case(name).then(|| v.trim())
        })
    }
}

/// What the mock does after reading a request.
pub enum Reply {
    /// Write the bytes, then close the connection.
    Close(Vec<u8>),
    /// Write the bytes and wait for another request on the same connection.
    KeepAlive(Vec<u8>),
    /// Write the parts with a pause before each, then close.
    Slow(Vec<(Duration, Vec<u8>)>),
    /// Never answer.
    Hang,
}

impl Reply {
    pub fn close(raw: impl AsRef<[u8]>) -> Self {
        Reply::Close(raw.as_ref().to_vec())
    }
}

/// `HTTP/1.1 <status>` response with a `Content-Length` body.
pub fn response(status: &str, headers: &[(&str, &str)], body: &str) -> Vec<u8> {
    let mut out = format!("HTTP/1.1 {status}\r\n");
    for (name, value) in headers {
        out.push_str(&format!("{name}: {value}\r\n"));
    }
    out.push_str(&format!("Content-Length: {}\r\n\r\n{body}", body.len()));
    out.into_bytes()
}

pub struct MockUpstream {
    pub addr: SocketAddr,
    requests: Arc<Mutex<Vec<MockRequest>>>,
    connections: Arc<AtomicUsize>,
}

impl MockUpstream {
    pub fn requests(&self) -> Vec<MockRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

/// Start a scripted upstream on an ephemeral port.
pub async fn start_upstream<F>(f: F) -> MockUpstream
where
    F: Fn(&MockRequest) -> Reply + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let requests = Arc::new(Mutex::new(Vec::new()));
    let connections = Arc::new(AtomicUsize::new(0));
    let f = Arc::new(f);

    let (log, count) = (requests.clone(), connections.clone());
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            count.fetch_add(1, Ordering::SeqCst);
            let (f, log) = (f.clone(), log.clone());
            tokio::spawn(serve_connection(socket, f, log));
        }
    });

    MockUpstream {
        addr,
        requests,
        connections,
    }
}

/// Start an upstream that answers every request with `raw` and closes.
pub async fn start_fixed(raw: impl Into<Vec<u8>>) -> MockUpstream {
    let raw = raw.into();
    start_upstream(move |_| Reply::Close(raw.clone())).await
}

async fn serve_connection<F>(mut socket: TcpStream, f: Arc<F>, log: Arc<Mutex<Vec<MockRequest>>>)
where
    F: Fn(&MockRequest) -> Reply + Send + Sync + 'static,
{
    let mut buf = Vec::new();
    loop {
        let Some(request) = read_request(&mut socket, &mut buf).await else {
            return;
        };
        log.lock().unwrap().push(request.clone());

        match (*f)(&request) {
            Reply::Close(raw) => {
                let _ = socket.write_all(&raw).await;
                let _ = socket.shutdown().await;
                return;
            }
            Reply::KeepAlive(raw) => {
                if socket.write_all(&raw).await.is_err() {
                    return;
                }
            }
            Reply::Slow(parts) => {
                for (pause, raw) in parts {
                    tokio::time::sleep(pause).await;
                    if socket.write_all(&raw).await.is_err() {
                        return;
                    }
                }
                let _ = socket.shutdown().await;
                return;
            }
            Reply::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                return;
            }
        }
    }
}

async fn read_request(socket: &mut TcpStream, buf: &mut Vec<u8>) -> Option<MockRequest> {
    let head_end = loop {
        if let Some(at) = find(buf, b"\r\n\r\n") {
            break at + 4;
        }
        fill(socket, buf).await?;
    };
    let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
    let partial = MockRequest { head, body: Vec::new() };

    let body_end = if let Some(len) = partial.header("content-length") {
        let end = head_end + len.parse::<usize>().ok()?;
        while buf.len() < end {
            fill(socket, buf).await?;
        }
        end
    } else if partial
        .header("transfer-encoding")
        .is_some_and(|te| te.eq_ignore_ascii_case("chunked"))
    {
        loop {
            if let Some(at) = find(&buf[head_end..], b"0\r\n\r\n") {
                break head_end + at + 5;
            }
            fill(socket, buf).await?;
        }
    } else {
        head_end
    };

    let body = buf[head_end..body_end].to_vec();
    buf.drain(..body_end);
    Some(MockRequest { body, ..partial })
}

async fn fill(socket: &mut TcpStream, buf: &mut Vec<u8>) -> Option<()> {
    let mut chunk = [0u8; 8192];
    match socket.read(&mut chunk).await {
        Ok(0) | Err(_) => None,
        Ok(n) => {
            buf.extend_from_slice(&chunk[..n]);
            Some(())
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

pub fn route(name: &str, prefix: &str, proxy_pass: &str) -> RouteConfig {
    RouteConfig {
        name: name.into(),
        path_prefix: Some(prefix.into()),
        proxy_pass: proxy_pass.into(),
        ..Default::default()
    }
}

pub fn backend(name: &str, group: &str, upstream: &MockUpstream) -> BackendConfig {
    BackendConfig::new(name, group, upstream.addr.to_string())
}

pub fn config(routes: Vec<RouteConfig>, backends: Vec<BackendConfig>) -> ProxyConfig {
    let mut config = ProxyConfig {
        routes,
        backends,
        ..Default::default()
    };
    config.listener.bind_address = "127.0.0.1:0".into();
    config.observability.metrics_enabled = false;
    config
}

pub struct TestProxy {
    pub addr: SocketAddr,
    pub shutdown: Shutdown,
}

impl TestProxy {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

/// Start the gateway on an ephemeral port.
pub async fn start_proxy(config: ProxyConfig) -> TestProxy {
    let listener = TcpListener::bind(&config.listener.bind_address).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = HttpServer::new(config).unwrap();
    let shutdown = Shutdown::new();

    let stop = shutdown.clone();
    tokio::spawn(async move {
        let _ = server.run(listener, &stop).await;
    });

    TestProxy { addr, shutdown }
}

/// Client that never follows redirects and ignores proxy env vars.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap()
}

/// Write `raw` to the gateway and read until it closes the connection.
/// `None` when the connection stays open longer than five seconds.
pub async fn raw_exchange(addr: SocketAddr, raw: &[u8]) -> Option<String> {
    let mut socket = TcpStream::connect(addr).await.unwrap();
    socket.write_all(raw).await.unwrap();
    let mut out = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), socket.read_to_end(&mut out))
        .await
        .ok()?
        .ok()?;
    Some(String::from_utf8_lossy(&out).into_owned())
}

/// Poll `check` until it holds or a second passes.
pub async fn eventually<Fut>(mut check: impl FnMut() -> Fut) -> bool
where
    Fut: Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
