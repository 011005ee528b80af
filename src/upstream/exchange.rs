//! The async exchange driver.
//!
//! # Data Flow
//! ```text
//! ProxyContext + client body
//!     → RequestBuilder (buffer the client body first when required)
//!     → for each peer the PeerSource hands out:
//!         connect (idle pool or new) → send head + body (BodyEncoder)
//!         → read head (ResponseHeadParser + ResponseProcessor)
//!         → failure? report, consult next_upstream, maybe try the next peer
//!     → spawn Transfer: read body → TransferPump → spill/deliver → client channel
//!     → connection parked when the pump reports keepalive
//! ```

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::gateway::{
    BufferPool, FailureKind, GatewayError, GatewaySettings, OutgoingBody, OutgoingHead, ProxyContext, PumpMode,
    PumpStatus, RequestBuilder, ResponseProcessor, TransferPump, UpstreamHead,
};
use crate::observability::metrics;
use crate::proto::{BodyEncoder, HeaderParse, ResponseHeadParser, StatusParse};
use crate::resilience::{is_idempotent, upstream_io, UpstreamTimeouts};
use crate::upstream::connection::{ConnectionPool, UpstreamConnection};
use crate::upstream::peer::{Peer, PeerSource};
use crate::upstream::spill::SpillFile;

/// Response body chunks for the downstream writer. An `Err` aborts the
/// downstream response.
pub type BodyReceiver = mpsc::Receiver<Result<Bytes, io::Error>>;

/// The upstream response as handed to the downstream side.
#[derive(Debug)]
pub struct ProxyResponse {
    pub head: UpstreamHead,
    pub body: BodyReceiver,
    /// Name of the peer that answered.
    pub peer: String,
}

/// Drives upstream exchanges for all routes.
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    peers: Arc<dyn PeerSource>,
    pool: Arc<ConnectionPool>,
    timeouts: UpstreamTimeouts,
    client_max_body_size: usize,
}

impl UpstreamClient {
    pub fn new(
        peers: Arc<dyn PeerSource>,
        pool: Arc<ConnectionPool>,
        timeouts: UpstreamTimeouts,
        client_max_body_size: usize,
    ) -> Self {
        Self {
            peers,
            pool,
            timeouts,
            client_max_body_size,
        }
    }

    /// Proxy one request. Returns once a response head was accepted; the body
    /// keeps flowing in a background task.
    pub async fn proxy(
        &self,
        settings: Arc<GatewaySettings>,
        mut ctx: ProxyContext,
        body: Body,
    ) -> Result<ProxyResponse, GatewayError> {
        ctx.client.check_transfer_coding()?;
        let builder = RequestBuilder::new(&settings);
        let mut body = Some(body);

        if builder.needs_buffering(&ctx) {
            let client_body = body.take().unwrap_or_default();
            let bytes = axum::body::to_bytes(client_body, self.client_max_body_size)
                .await
                .map_err(|e| GatewayError::Client(format!("reading client body: {e}")))?;
            metrics::record_body_bytes("client_to_upstream", bytes.len());
            ctx.set_buffered_body(bytes);
        }

        let request = builder.build(&mut ctx)?;
        if !request.is_streaming() {
            body = None;
        }

        let group = settings.proxy_pass.group.as_str();
        let peer_count = self.peers.group_size(group);
        let idempotent = is_idempotent(&request.method);
        let head_request = request.method == "HEAD";
        let mut tried: Vec<SocketAddr> = Vec::new();
        let mut last_error: Option<GatewayError> = None;

        loop {
            let Some(peer) = self.peers.get_peer(group, &tried) else {
                return Err(last_error.unwrap_or_else(|| GatewayError::NoPeer(group.to_string())));
            };
            tried.push(peer.addr);

            tracing::debug!(
                request_id = %ctx.request_id,
                peer = %peer.name,
                addr = %peer.addr,
                attempt = tried.len(),
                "Trying upstream peer"
            );

            let result = self.attempt(&peer, &settings, &ctx, &request, &mut body, head_request).await;
            let replayable = request.is_replayable() || body.is_some();

            let kind = match result {
                Ok((conn, head, rest)) => {
                    let status_failure = settings
                        .next_upstream
                        .is_failure_status(head.status)
                        .then_some(FailureKind::Status(head.status));

                    match status_failure {
                        Some(kind)
                            if settings
                                .next_upstream
                                .should_retry(kind, idempotent, replayable, tried.len(), peer_count) =>
                        {
                            last_error = Some(GatewayError::upstream(kind, format!("upstream returned {}", head.status)));
                            kind
                        }
                        _ => {
                            return Ok(self.start_transfer(settings.clone(), &ctx, peer, conn, head, rest, status_failure));
                        }
                    }
                }
                Err(e) => {
                    let Some(kind) = e.failure_kind() else {
                        return Err(e);
                    };
                    tracing::error!(
                        request_id = %ctx.request_id,
                        peer = %peer.name,
                        addr = %peer.addr,
                        error = %e,
                        "Upstream attempt failed"
                    );
                    if !settings
                        .next_upstream
                        .should_retry(kind, idempotent, replayable, tried.len(), peer_count)
                    {
                        self.peers.report_outcome(&peer, Err(kind));
                        metrics::record_upstream_failure(kind);
                        return Err(e);
                    }
                    last_error = Some(e);
                    kind
                }
            };

            self.peers.report_outcome(&peer, Err(kind));
            metrics::record_upstream_failure(kind);
            tracing::warn!(
                request_id = %ctx.request_id,
                peer = %peer.name,
                kind = %kind,
                "Trying next upstream"
            );
        }
    }

    /// One try against one peer, up to and including the response head.
    async fn attempt(
        &self,
        peer: &Peer,
        settings: &GatewaySettings,
        ctx: &ProxyContext,
        request: &OutgoingHead,
        body: &mut Option<Body>,
        head_request: bool,
    ) -> Result<(UpstreamConnection, UpstreamHead, Bytes), GatewayError> {
        let mut conn = self.pool.connect(peer.addr, self.timeouts.connect, settings.keepalive).await?;
        self.send_request(&mut conn, request, body).await?;
        let (head, rest) = self.read_head(&mut conn, settings, ctx, head_request).await?;

        tracing::debug!(
            request_id = %ctx.request_id,
            peer = %peer.name,
            conn = %conn.id,
            reused = conn.reused,
            status = head.status,
            frame = ?head.frame,
            keepalive = head.keepalive,
            buffering = head.buffering,
            "Upstream response head"
        );
        Ok((conn, head, rest))
    }

    async fn send_request(
        &self,
        conn: &mut UpstreamConnection,
        request: &OutgoingHead,
        body: &mut Option<Body>,
    ) -> Result<(), GatewayError> {
        let send = self.timeouts.send;
        upstream_io(send, "sending request head", conn.stream.write_all(&request.head)).await?;

        match &request.body {
            OutgoingBody::None => {}
            OutgoingBody::Buffered(bytes) => {
                upstream_io(send, "sending request body", conn.stream.write_all(bytes)).await?;
            }
            OutgoingBody::Stream(frame) => {
                let client_body = body
                    .take()
                    .ok_or_else(|| GatewayError::Internal("client body already consumed".to_string()))?;
                let mut encoder = BodyEncoder::new(*frame).map_err(GatewayError::client_framing)?;
                let mut stream = client_body.into_data_stream();
                let mut out = Vec::new();

                while let Some(chunk) = stream.next().await {
                    let chunk = chunk.map_err(|e| GatewayError::Client(format!("reading client body: {e}")))?;
                    metrics::record_body_bytes("client_to_upstream", chunk.len());
                    encoder.encode(chunk, &mut out).map_err(GatewayError::client_framing)?;
                    for buf in out.drain(..) {
                        upstream_io(send, "sending request body", conn.stream.write_all(&buf)).await?;
                    }
                }
                encoder.finish(&mut out).map_err(GatewayError::client_framing)?;
                for buf in out.drain(..) {
                    upstream_io(send, "sending request body", conn.stream.write_all(&buf)).await?;
                }
            }
        }
        Ok(())
    }

    /// Read and process the response head. Returns the head and any body
    /// bytes that arrived with it.
    async fn read_head(
        &self,
        conn: &mut UpstreamConnection,
        settings: &GatewaySettings,
        ctx: &ProxyContext,
        head_request: bool,
    ) -> Result<(UpstreamHead, Bytes), GatewayError> {
        let limit = settings.buffer_size;
        let mut buf = BytesMut::with_capacity(limit);
        let mut parser = ResponseHeadParser::new();

        let status = loop {
            match parser.parse_status_line(&buf) {
                StatusParse::Ok(status) => break status,
                StatusParse::Again => self.read_more(conn, &mut buf, limit).await?,
                StatusParse::Error if settings.allow_http09 && !parser.saw_http_prefix() => {
                    tracing::debug!(request_id = %ctx.request_id, "Upstream sent no status line, passing response as HTTP/0.9");
                    return Ok((UpstreamHead::http09(settings), buf.freeze()));
                }
                StatusParse::Error => {
                    metrics::record_framing_violation("invalid_status_line");
                    let reason = if parser.saw_http_prefix() {
                        "upstream sent invalid status line"
                    } else {
                        "upstream sent no valid HTTP/1.0 header"
                    };
                    return Err(invalid_header(reason));
                }
            }
        };

        let mut processor = ResponseProcessor::new(settings, ctx, head_request);
        loop {
            match parser.parse_header_line(&buf) {
                HeaderParse::Header(line) => processor.header(&buf, &line)?,
                HeaderParse::HeadersDone => break,
                HeaderParse::Again => self.read_more(conn, &mut buf, limit).await?,
                HeaderParse::Error => {
                    metrics::record_framing_violation("invalid_header");
                    return Err(invalid_header("upstream sent invalid header"));
                }
            }
        }

        let head = processor.finish(&buf, &status)?;
        let rest = buf.split_off(parser.position()).freeze();
        Ok((head, rest))
    }

    async fn read_more(&self, conn: &mut UpstreamConnection, buf: &mut BytesMut, limit: usize) -> Result<(), GatewayError> {
        if buf.len() >= limit {
            return Err(invalid_header("upstream sent too big header"));
        }
        buf.reserve(limit - buf.len());
        let n = upstream_io(self.timeouts.read, "reading response header", conn.stream.read_buf(buf)).await?;
        if n == 0 {
            return Err(GatewayError::upstream(
                FailureKind::Error,
                "upstream prematurely closed connection while reading response header",
            ));
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn start_transfer(
        &self,
        settings: Arc<GatewaySettings>,
        ctx: &ProxyContext,
        peer: Peer,
        conn: UpstreamConnection,
        head: UpstreamHead,
        rest: Bytes,
        status_failure: Option<FailureKind>,
    ) -> ProxyResponse {
        let (tx, rx) = mpsc::channel(settings.buffers.max(1));
        let mode = if head.buffering {
            PumpMode::Buffered
        } else {
            PumpMode::Unbuffered
        };
        let pump = TransferPump::new(
            head.frame,
            mode,
            BufferPool::new(settings.buffer_size, settings.buffers),
            head.keepalive && settings.keepalive,
        );
        let peer_name = peer.name.clone();

        let transfer = Transfer {
            request_id: ctx.request_id.clone(),
            settings,
            peers: self.peers.clone(),
            pool: self.pool.clone(),
            read_timeout: self.timeouts.read,
            peer,
            conn,
            pump,
            rest,
            tx,
            spill: None,
            client_gone: false,
            status_failure,
        };
        tokio::spawn(transfer.run());

        ProxyResponse {
            head,
            body: rx,
            peer: peer_name,
        }
    }
}

fn invalid_header(reason: &str) -> GatewayError {
    GatewayError::upstream(FailureKind::InvalidHeader, reason)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flush {
    /// Send what the client can take right now.
    IfReady,
    /// The pool is exhausted: spill, or wait for the client.
    MakeRoom,
    /// Send everything.
    All,
}

/// Response body transfer, running in its own task.
struct Transfer {
    request_id: String,
    settings: Arc<GatewaySettings>,
    peers: Arc<dyn PeerSource>,
    pool: Arc<ConnectionPool>,
    read_timeout: Duration,
    peer: Peer,
    conn: UpstreamConnection,
    pump: TransferPump,
    /// Body bytes that arrived with the head.
    rest: Bytes,
    tx: mpsc::Sender<Result<Bytes, io::Error>>,
    spill: Option<SpillFile>,
    client_gone: bool,
    status_failure: Option<FailureKind>,
}

impl Transfer {
    async fn run(mut self) {
        let result = self.transfer().await;

        let outcome = match &result {
            Ok(()) => self.status_failure.map_or(Ok(()), Err),
            Err(e) => e.failure_kind().map_or(Ok(()), Err),
        };

        match result {
            Ok(()) => {
                tracing::debug!(
                    request_id = %self.request_id,
                    peer = %self.peer.name,
                    bytes = self.pump.forwarded(),
                    discarded = self.pump.discarded(),
                    spilled = self.spill.as_ref().map_or(0, SpillFile::written),
                    "Upstream response transferred"
                );
                if self.settings.keepalive && self.pump.keepalive() {
                    self.pool.put(self.conn);
                }
            }
            Err(GatewayError::ClientClosed) => {
                tracing::info!(request_id = %self.request_id, peer = %self.peer.name, "Client closed connection, upstream transfer aborted");
            }
            Err(e) => {
                tracing::error!(
                    request_id = %self.request_id,
                    peer = %self.peer.name,
                    error = %e,
                    bytes = self.pump.forwarded(),
                    "Upstream response body failed"
                );
                if let Some(kind) = e.failure_kind() {
                    metrics::record_upstream_failure(kind);
                }
                let _ = self.tx.send(Err(io::Error::other(e.to_string()))).await;
            }
        }

        self.peers.report_outcome(&self.peer, outcome);
    }

    async fn transfer(&mut self) -> Result<(), GatewayError> {
        let mut input = std::mem::take(&mut self.rest);
        loop {
            match self.pump.feed(&input)? {
                PumpStatus::FlushRequested { consumed } => {
                    input = input.slice(consumed..);
                    self.deliver(Flush::MakeRoom).await?;
                    continue;
                }
                PumpStatus::Done => return self.deliver(Flush::All).await,
                PumpStatus::NeedMore => {
                    self.pump.flush_partial();
                    self.deliver(Flush::IfReady).await?;
                }
            }

            input = self.read().await?;
            if input.is_empty() {
                self.pump.finish_eof()?;
                return self.deliver(Flush::All).await;
            }
        }
    }

    async fn read(&mut self) -> Result<Bytes, GatewayError> {
        let mut buf = BytesMut::with_capacity(self.settings.buffer_size);
        upstream_io(self.read_timeout, "reading response body", self.conn.stream.read_buf(&mut buf)).await?;
        Ok(buf.freeze())
    }

    fn has_pending(&self) -> bool {
        self.pump.has_output() || self.spill.as_ref().is_some_and(|s| s.pending() > 0)
    }

    async fn deliver(&mut self, flush: Flush) -> Result<(), GatewayError> {
        while self.has_pending() {
            if self.client_gone {
                while self.pump.next_output().is_some() {}
                self.spill = None;
                return Ok(());
            }

            let permit = match self.tx.clone().try_reserve_owned() {
                Ok(permit) => permit,
                Err(TrySendError::Closed(_)) => {
                    self.client_closed()?;
                    continue;
                }
                Err(TrySendError::Full(_)) => {
                    let block = match (self.pump.mode(), flush) {
                        (PumpMode::Unbuffered, _) | (_, Flush::All) => true,
                        (PumpMode::Buffered, Flush::IfReady) => false,
                        (PumpMode::Buffered, Flush::MakeRoom) => {
                            if self.spill_busy().await? {
                                return Ok(());
                            }
                            true
                        }
                    };
                    if !block {
                        return Ok(());
                    }
                    match self.tx.clone().reserve_owned().await {
                        Ok(permit) => permit,
                        Err(_) => {
                            self.client_closed()?;
                            continue;
                        }
                    }
                }
            };

            let Some(chunk) = self.next_chunk().await? else {
                break;
            };
            metrics::record_body_bytes("upstream_to_client", chunk.len());
            permit.send(Ok(chunk));
        }
        Ok(())
    }

    /// Oldest undelivered chunk: spilled data first, then memory.
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, GatewayError> {
        if let Some(spill) = self.spill.as_mut().filter(|s| s.pending() > 0) {
            return spill
                .read_chunk(self.settings.buffer_size)
                .await
                .map_err(|e| GatewayError::Internal(format!("reading spill file: {e}")));
        }
        Ok(self.pump.next_output())
    }

    /// Move busy buffers to the spill file. False when spilling is disabled
    /// or the file is full.
    async fn spill_busy(&mut self) -> Result<bool, GatewayError> {
        let limit = self.settings.max_temp_file_size;
        let busy = self.pump.busy_bytes() as u64;
        if limit == 0 || busy == 0 {
            return Ok(false);
        }

        if self.spill.is_none() {
            let spill = SpillFile::create(self.settings.temp_path.as_deref(), limit)
                .map_err(|e| GatewayError::Internal(format!("creating spill file: {e}")))?;
            self.spill = Some(spill);
        }
        let Some(spill) = self.spill.as_mut() else {
            return Ok(false);
        };
        if !spill.has_room(busy) {
            return Ok(false);
        }

        let bufs = self.pump.take_busy();
        spill
            .write(&bufs)
            .await
            .map_err(|e| GatewayError::Internal(format!("writing spill file: {e}")))?;
        Ok(true)
    }

    fn client_closed(&mut self) -> Result<(), GatewayError> {
        if !self.settings.ignore_client_abort {
            return Err(GatewayError::ClientClosed);
        }
        if !self.client_gone {
            tracing::info!(request_id = %self.request_id, "Client went away, reading upstream response to the end");
            self.client_gone = true;
        }
        Ok(())
    }
}
