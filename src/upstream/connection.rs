//! Codec-wrapped upstream connections and proxied request streams.
//!
//! # Responsibilities
//! - Parse requests arriving from the proxy and queue them as streams
//! - Drive responses (full, partial, withheld, error status) under scenario
//!   control
//! - Mirror the downstream driver's milestone waits from the server side
//!
//! # Design Decisions
//! - HTTP/1.1 response framing is chosen at `encode_headers`: explicit
//!   `content-length` passes through, end-at-headers emits `content-length:
//!   0`, open-ended bodies switch to chunked encoding so trailers work
//! - Unlike the downstream collector, request completion and reset are
//!   tracked independently here: the proxy may reset a stream whose request
//!   it already delivered in full (retry, downstream abort)

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use futures_util::future::poll_fn;
use h2::server::SendResponse;
use h2::SendStream;
use http::header::{CONTENT_LENGTH, COOKIE};
use http::{HeaderMap, HeaderValue, Method, Response, StatusCode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Notify;

use crate::client::http2::{reset_reason, send_all};
use crate::client::{filler_body, CodecKind, ConnState};
use crate::collector::ResetReason;
use crate::dispatch::wait_until;
use crate::error::Result;
use crate::http1::{
    encode_chunk, encode_last_chunk, encode_response_head, parse_request_head,
    request_body_framing, BodyDecoder, BodyEvent, RequestHead,
};
use crate::upstream::SharedQueue;

type H1Write = Arc<tokio::sync::Mutex<Option<OwnedWriteHalf>>>;

/// One upstream connection from the proxy, wrapped in a codec.
pub struct FakeHttpConnection {
    codec: CodecKind,
    streams: Arc<SharedQueue<FakeStream>>,
    conn: Arc<ConnState>,
    h1_write: Option<H1Write>,
    close_signal: Arc<Notify>,
    wait_timeout: Option<Duration>,
}

impl FakeHttpConnection {
    pub(crate) async fn new(
        socket: TcpStream,
        codec: CodecKind,
        wait_timeout: Option<Duration>,
    ) -> Result<Self> {
        let streams = SharedQueue::new();
        let conn = ConnState::new();
        let close_signal = Arc::new(Notify::new());
        let mut h1_write = None;

        match codec {
            CodecKind::Http1 => {
                let (read, write) = socket.into_split();
                let write: H1Write = Arc::new(tokio::sync::Mutex::new(Some(write)));
                h1_write = Some(Arc::clone(&write));
                tokio::spawn(h1_request_loop(
                    read,
                    write,
                    Arc::clone(&streams),
                    Arc::clone(&conn),
                    wait_timeout,
                ));
            }
            CodecKind::Http2 => {
                let connection = h2::server::handshake(socket).await?;
                tokio::spawn(h2_accept_loop(
                    connection,
                    Arc::clone(&streams),
                    Arc::clone(&conn),
                    Arc::clone(&close_signal),
                    wait_timeout,
                ));
            }
        }

        Ok(Self {
            codec,
            streams,
            conn,
            h1_write,
            close_signal,
            wait_timeout,
        })
    }

    pub fn codec(&self) -> CodecKind {
        self.codec
    }

    /// Block until the proxy opens the next stream on this connection.
    pub async fn wait_for_new_stream(&self) -> Result<FakeStream> {
        self.streams
            .pop_wait("new upstream stream", self.wait_timeout)
            .await
    }

    /// Close the connection from the upstream side.
    pub async fn close(&self) -> Result<()> {
        match self.codec {
            CodecKind::Http1 => {
                if let Some(write) = &self.h1_write {
                    if let Some(mut socket) = write.lock().await.take() {
                        let _ = socket.shutdown().await;
                    }
                }
            }
            CodecKind::Http2 => self.close_signal.notify_waiters(),
        }
        Ok(())
    }

    /// Block until the connection is fully torn down.
    pub async fn wait_for_disconnect(&self) -> Result<()> {
        wait_until(
            self.conn.signal(),
            "upstream disconnect",
            self.wait_timeout,
            || self.conn.disconnected(),
        )
        .await
    }
}

#[derive(Debug, Default)]
struct UpstreamStreamState {
    method: Option<Method>,
    path: Option<String>,
    headers: Option<HeaderMap>,
    body: Vec<u8>,
    trailers: Option<HeaderMap>,
    end_stream: bool,
    reset: Option<ResetReason>,
}

#[derive(Debug)]
struct StreamShared {
    state: Mutex<UpstreamStreamState>,
    signal: Notify,
}

impl StreamShared {
    fn new(head: Option<RequestHead>) -> Arc<Self> {
        let mut state = UpstreamStreamState::default();
        if let Some(head) = head {
            state.method = Some(head.method);
            state.path = Some(head.path);
            state.headers = Some(head.headers);
        }
        Arc::new(Self {
            state: Mutex::new(state),
            signal: Notify::new(),
        })
    }

    fn mark_end_stream(&self) {
        let mut state = self.state.lock().unwrap();
        if state.reset.is_none() {
            state.end_stream = true;
        }
        drop(state);
        self.signal.notify_waiters();
    }

    fn mark_reset(&self, reason: ResetReason) {
        let mut state = self.state.lock().unwrap();
        if state.reset.is_none() {
            state.reset = Some(reason);
        }
        drop(state);
        self.signal.notify_waiters();
    }
}

/// How the HTTP/1.1 side frames response data after `encode_headers`.
#[derive(Debug, Clone, Copy)]
enum H1ResponseFraming {
    Identity,
    Chunked,
}

enum Responder {
    Http1 {
        write: H1Write,
        framing: Mutex<Option<H1ResponseFraming>>,
    },
    Http2 {
        respond: tokio::sync::Mutex<SendResponse<Bytes>>,
        send: tokio::sync::Mutex<Option<SendStream<Bytes>>>,
    },
}

/// One request/response exchange as observed by the upstream.
pub struct FakeStream {
    shared: Arc<StreamShared>,
    responder: Responder,
    wait_timeout: Option<Duration>,
}

impl FakeStream {
    // --- request-side accessors ---

    pub fn method(&self) -> Option<Method> {
        self.shared.state.lock().unwrap().method.clone()
    }

    pub fn path(&self) -> Option<String> {
        self.shared.state.lock().unwrap().path.clone()
    }

    pub fn headers(&self) -> HeaderMap {
        self.shared
            .state
            .lock()
            .unwrap()
            .headers
            .clone()
            .unwrap_or_default()
    }

    /// All `cookie` values joined with `"; "`, preserving duplicate-key
    /// request semantics.
    pub fn cookie(&self) -> Option<String> {
        let headers = self.headers();
        let values: Vec<&str> = headers
            .get_all(COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect();
        if values.is_empty() {
            None
        } else {
            Some(values.join("; "))
        }
    }

    pub fn body_len(&self) -> usize {
        self.shared.state.lock().unwrap().body.len()
    }

    pub fn body(&self) -> Vec<u8> {
        self.shared.state.lock().unwrap().body.clone()
    }

    pub fn trailers(&self) -> Option<HeaderMap> {
        self.shared.state.lock().unwrap().trailers.clone()
    }

    /// Whether the request was completely received (end-of-stream observed).
    pub fn complete(&self) -> bool {
        self.shared.state.lock().unwrap().end_stream
    }

    pub fn reset(&self) -> bool {
        self.shared.state.lock().unwrap().reset.is_some()
    }

    // --- milestone waits ---

    pub async fn wait_for_headers_complete(&self) -> Result<()> {
        wait_until(
            &self.shared.signal,
            "request headers complete",
            self.wait_timeout,
            || self.shared.state.lock().unwrap().headers.is_some(),
        )
        .await
    }

    pub async fn wait_for_end_stream(&self) -> Result<()> {
        wait_until(
            &self.shared.signal,
            "request end-of-stream",
            self.wait_timeout,
            || self.shared.state.lock().unwrap().end_stream,
        )
        .await
    }

    /// Block until the peer resets this stream.
    ///
    /// On HTTP/2 the reset can arrive after the request body pump has
    /// finished, so this also watches the send side of the stream.
    pub async fn wait_for_reset(&self) -> Result<()> {
        if self.shared.state.lock().unwrap().reset.is_some() {
            return Ok(());
        }
        match &self.responder {
            Responder::Http1 { .. } => {
                wait_until(
                    &self.shared.signal,
                    "request reset",
                    self.wait_timeout,
                    || self.shared.state.lock().unwrap().reset.is_some(),
                )
                .await
            }
            Responder::Http2 { respond, send } => {
                let wait = self.wait_for_h2_reset(respond, send);
                match self.wait_timeout {
                    Some(limit) => tokio::time::timeout(limit, wait).await.map_err(|_| {
                        crate::error::HarnessError::WaitTimeout {
                            what: "request reset",
                        }
                    })?,
                    None => wait.await,
                }
            }
        }
    }

    async fn wait_for_h2_reset(
        &self,
        respond: &tokio::sync::Mutex<SendResponse<Bytes>>,
        send: &tokio::sync::Mutex<Option<SendStream<Bytes>>>,
    ) -> Result<()> {
        let reason = {
            let mut stream = send.lock().await;
            match stream.as_mut() {
                Some(stream) => poll_fn(|cx| stream.poll_reset(cx)).await?,
                None => {
                    drop(stream);
                    let mut respond = respond.lock().await;
                    poll_fn(|cx| respond.poll_reset(cx)).await?
                }
            }
        };
        tracing::debug!(?reason, "upstream stream reset by peer");
        self.shared.mark_reset(ResetReason::RemoteReset);
        Ok(())
    }

    // --- response driving ---

    /// Send response headers. With `end_stream` the response is complete.
    pub async fn encode_headers(
        &self,
        status: StatusCode,
        headers: HeaderMap,
        end_stream: bool,
    ) -> Result<()> {
        match &self.responder {
            Responder::Http1 { write, framing } => {
                let mut headers = headers;
                let chosen = if headers.contains_key(CONTENT_LENGTH) {
                    H1ResponseFraming::Identity
                } else if end_stream {
                    headers.insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
                    H1ResponseFraming::Identity
                } else {
                    headers.insert(
                        http::header::TRANSFER_ENCODING,
                        HeaderValue::from_static("chunked"),
                    );
                    H1ResponseFraming::Chunked
                };
                *framing.lock().unwrap() = Some(chosen);
                h1_write(write, &encode_response_head(status, &headers)).await
            }
            Responder::Http2 { respond, send, .. } => {
                let mut response = Response::builder()
                    .status(status)
                    .body(())
                    .expect("valid response head");
                *response.headers_mut() = headers;
                let stream = respond.lock().await.send_response(response, end_stream)?;
                if !end_stream {
                    *send.lock().await = Some(stream);
                }
                Ok(())
            }
        }
    }

    /// Send `size` bytes of filler response body.
    pub async fn encode_data(&self, size: usize, end_stream: bool) -> Result<()> {
        self.encode_data_buf(Bytes::from(filler_body(size)), end_stream)
            .await
    }

    /// Send exact response body bytes.
    pub async fn encode_data_buf(&self, data: Bytes, end_stream: bool) -> Result<()> {
        match &self.responder {
            Responder::Http1 { write, framing } => {
                let framing = (*framing.lock().unwrap()).ok_or(
                    crate::error::HarnessError::UnexpectedState(
                        "encode_data before encode_headers",
                    ),
                )?;
                let mut wire = Vec::with_capacity(data.len() + 16);
                match framing {
                    H1ResponseFraming::Identity => wire.extend_from_slice(&data),
                    H1ResponseFraming::Chunked => {
                        if !data.is_empty() {
                            wire.extend_from_slice(&encode_chunk(&data));
                        }
                        if end_stream {
                            wire.extend_from_slice(&encode_last_chunk(None));
                        }
                    }
                }
                h1_write(write, &wire).await
            }
            Responder::Http2 { send, .. } => {
                let mut guard = send.lock().await;
                let stream = guard
                    .as_mut()
                    .ok_or(crate::error::HarnessError::UnexpectedState(
                        "encode_data before encode_headers",
                    ))?;
                send_all(stream, data, end_stream).await
            }
        }
    }

    /// Reset the stream from the upstream side: RST_STREAM on HTTP/2, write
    /// shutdown on HTTP/1.1.
    pub async fn encode_reset(&self) -> Result<()> {
        match &self.responder {
            Responder::Http1 { write, .. } => {
                if let Some(mut socket) = write.lock().await.take() {
                    let _ = socket.shutdown().await;
                }
                Ok(())
            }
            Responder::Http2 { respond, send } => {
                let mut stream = send.lock().await;
                match stream.as_mut() {
                    Some(stream) => stream.send_reset(h2::Reason::CANCEL),
                    None => {
                        drop(stream);
                        respond.lock().await.send_reset(h2::Reason::CANCEL);
                    }
                }
                Ok(())
            }
        }
    }

    /// Send response trailers, ending the stream.
    pub async fn encode_trailers(&self, trailers: HeaderMap) -> Result<()> {
        match &self.responder {
            Responder::Http1 { write, .. } => {
                // Trailers require the chunked framing chosen for open-ended
                // bodies.
                h1_write(write, &encode_last_chunk(Some(&trailers))).await
            }
            Responder::Http2 { send, .. } => {
                let mut guard = send.lock().await;
                let stream = guard
                    .as_mut()
                    .ok_or(crate::error::HarnessError::UnexpectedState(
                        "encode_trailers before encode_headers",
                    ))?;
                stream.send_trailers(trailers)?;
                Ok(())
            }
        }
    }
}

async fn h1_write(write: &H1Write, wire: &[u8]) -> Result<()> {
    let mut guard = write.lock().await;
    let socket = guard
        .as_mut()
        .ok_or(crate::error::HarnessError::UnexpectedState(
            "write after upstream close",
        ))?;
    socket.write_all(wire).await?;
    socket.flush().await?;
    Ok(())
}

/// Parse proxied HTTP/1.1 requests off the socket, queuing one `FakeStream`
/// per request.
async fn h1_request_loop(
    mut read: OwnedReadHalf,
    write: H1Write,
    streams: Arc<SharedQueue<FakeStream>>,
    conn: Arc<ConnState>,
    wait_timeout: Option<Duration>,
) {
    let mut buf = BytesMut::with_capacity(16 * 1024);
    let mut current: Option<(Arc<StreamShared>, BodyDecoder)> = None;
    loop {
        loop {
            match &mut current {
                None => {
                    let parsed = match parse_request_head(&buf) {
                        Ok(parsed) => parsed,
                        Err(err) => {
                            tracing::warn!(error = %err, "upstream request parse failed");
                            conn.mark_disconnected();
                            return;
                        }
                    };
                    let Some((head, consumed)) = parsed else { break };
                    buf.advance(consumed);
                    let framing = match request_body_framing(&head.headers) {
                        Ok(framing) => framing,
                        Err(err) => {
                            tracing::warn!(error = %err, "bad upstream request framing");
                            conn.mark_disconnected();
                            return;
                        }
                    };
                    let decoder = BodyDecoder::new(framing);
                    let shared = StreamShared::new(Some(head));
                    let done = decoder.is_done();
                    if done {
                        shared.mark_end_stream();
                    }
                    streams.push(FakeStream {
                        shared: Arc::clone(&shared),
                        responder: Responder::Http1 {
                            write: Arc::clone(&write),
                            framing: Mutex::new(None),
                        },
                        wait_timeout,
                    });
                    if !done {
                        current = Some((shared, decoder));
                    }
                }
                Some((shared, decoder)) => {
                    let event = match decoder.decode(&mut buf) {
                        Ok(Some(event)) => event,
                        Ok(None) => break,
                        Err(err) => {
                            tracing::warn!(error = %err, "upstream body decode failed");
                            conn.mark_disconnected();
                            return;
                        }
                    };
                    match event {
                        BodyEvent::Data(data) => {
                            shared.state.lock().unwrap().body.extend_from_slice(&data);
                            shared.signal.notify_waiters();
                        }
                        BodyEvent::Trailers(trailers) => {
                            shared.state.lock().unwrap().trailers = Some(trailers);
                        }
                        BodyEvent::End => {}
                    }
                    if decoder.is_done() {
                        shared.mark_end_stream();
                        current = None;
                    }
                }
            }
        }
        match read.read_buf(&mut buf).await {
            Ok(0) | Err(_) => {
                if let Some((shared, _)) = &current {
                    // Connection died mid-request.
                    shared.mark_reset(ResetReason::ConnectionTermination);
                }
                conn.mark_disconnected();
                return;
            }
            Ok(_) => {}
        }
    }
}

/// Accept proxied HTTP/2 streams, queuing one `FakeStream` per request.
async fn h2_accept_loop(
    mut connection: h2::server::Connection<TcpStream, Bytes>,
    streams: Arc<SharedQueue<FakeStream>>,
    conn: Arc<ConnState>,
    close_signal: Arc<Notify>,
    wait_timeout: Option<Duration>,
) {
    loop {
        let accepted = tokio::select! {
            accepted = connection.accept() => accepted,
            // Local close: dropping the connection sends GOAWAY.
            _ = close_signal.notified() => {
                conn.mark_disconnected();
                return;
            }
        };
        match accepted {
            Some(Ok((request, respond))) => {
                let (parts, mut body) = request.into_parts();
                let shared = StreamShared::new(None);
                {
                    let mut state = shared.state.lock().unwrap();
                    state.method = Some(parts.method);
                    state.path = Some(parts.uri.path().to_string());
                    state.headers = Some(parts.headers);
                }
                shared.signal.notify_waiters();
                streams.push(FakeStream {
                    shared: Arc::clone(&shared),
                    responder: Responder::Http2 {
                        respond: tokio::sync::Mutex::new(respond),
                        send: tokio::sync::Mutex::new(None),
                    },
                    wait_timeout,
                });

                tokio::spawn(async move {
                    if body.is_end_stream() {
                        shared.mark_end_stream();
                        return;
                    }
                    loop {
                        match body.data().await {
                            Some(Ok(data)) => {
                                let _ = body.flow_control().release_capacity(data.len());
                                shared.state.lock().unwrap().body.extend_from_slice(&data);
                                shared.signal.notify_waiters();
                                if body.is_end_stream() {
                                    shared.mark_end_stream();
                                    return;
                                }
                            }
                            Some(Err(err)) => {
                                shared.mark_reset(reset_reason(&err));
                                return;
                            }
                            None => break,
                        }
                    }
                    match body.trailers().await {
                        Ok(Some(trailers)) => {
                            shared.state.lock().unwrap().trailers = Some(trailers);
                            shared.mark_end_stream();
                        }
                        Ok(None) => shared.mark_end_stream(),
                        Err(err) => shared.mark_reset(reset_reason(&err)),
                    }
                });
            }
            Some(Err(err)) => {
                tracing::debug!(error = %err, "h2 upstream connection ended");
                conn.mark_disconnected();
                return;
            }
            None => {
                conn.mark_disconnected();
                return;
            }
        }
    }
}
