//! HTTP/1.1 client codec.
//!
//! # Responsibilities
//! - Serialize requests with caller-controlled framing
//! - Parse responses incrementally and feed the attached collector
//! - Track connection lifecycle (connected, remote close)
//!
//! # Design Decisions
//! - Responses are matched to collectors in FIFO order, one in flight per
//!   request, which is all HTTP/1.1 without pipelining permits
//! - If the caller supplied explicit framing headers the head goes out
//!   verbatim; otherwise fixed bodies get `content-length` and streamed
//!   bodies get chunked encoding
//! - There is no stream reset on this codec: `send_reset` degrades to a
//!   connection close

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::{Buf, BytesMut};
use http::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderValue, Request};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::client::ConnState;
use crate::collector::ResponseCollector;
use crate::error::Result;
use crate::http1::{
    encode_chunk, encode_last_chunk, encode_request_head, parse_response_head,
    response_body_framing, BodyDecoder, BodyEvent,
};

type Inflight = Arc<Mutex<VecDeque<Arc<ResponseCollector>>>>;

/// Continuation handle for a request opened with `start_request`.
#[derive(Debug)]
pub struct H1RequestStream {
    /// Whether continuation data must be framed as chunks.
    chunked: bool,
}

/// Client side of one HTTP/1.1 connection.
#[derive(Debug)]
pub struct Http1Client {
    write: Arc<tokio::sync::Mutex<Option<OwnedWriteHalf>>>,
    inflight: Inflight,
    conn: Arc<ConnState>,
}

impl Http1Client {
    pub async fn connect(addr: SocketAddr, conn: Arc<ConnState>) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        conn.mark_connected();
        let (read, write) = stream.into_split();
        let inflight: Inflight = Arc::new(Mutex::new(VecDeque::new()));
        tokio::spawn(read_loop(read, Arc::clone(&inflight), Arc::clone(&conn)));
        Ok(Self {
            write: Arc::new(tokio::sync::Mutex::new(Some(write))),
            inflight,
            conn,
        })
    }

    pub async fn make_header_only_request(
        &self,
        request: &Request<()>,
        collector: &Arc<ResponseCollector>,
    ) -> Result<()> {
        self.enqueue(collector);
        self.write_all(&encode_request_head(request)).await
    }

    pub async fn make_request_with_body(
        &self,
        request: &Request<()>,
        body: &[u8],
        collector: &Arc<ResponseCollector>,
    ) -> Result<()> {
        self.enqueue(collector);
        let mut request = clone_head(request);
        if !has_explicit_framing(request.headers()) {
            request
                .headers_mut()
                .insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
        }
        let mut wire = encode_request_head(&request);
        wire.extend_from_slice(body);
        self.write_all(&wire).await
    }

    pub async fn start_request(
        &self,
        request: &Request<()>,
        collector: &Arc<ResponseCollector>,
    ) -> Result<H1RequestStream> {
        self.enqueue(collector);
        let mut request = clone_head(request);
        let chunked = !has_explicit_framing(request.headers());
        if chunked {
            request
                .headers_mut()
                .insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        }
        self.write_all(&encode_request_head(&request)).await?;
        Ok(H1RequestStream { chunked })
    }

    pub async fn send_data(
        &self,
        stream: &mut H1RequestStream,
        data: &[u8],
        end_stream: bool,
    ) -> Result<()> {
        let mut wire = Vec::with_capacity(data.len() + 16);
        if stream.chunked {
            if !data.is_empty() {
                wire.extend_from_slice(&encode_chunk(data));
            }
            if end_stream {
                wire.extend_from_slice(&encode_last_chunk(None));
            }
        } else {
            wire.extend_from_slice(data);
        }
        self.write_all(&wire).await
    }

    pub async fn send_trailers(
        &self,
        stream: &mut H1RequestStream,
        trailers: &HeaderMap,
    ) -> Result<()> {
        // Trailers only exist in the chunked trailer section on this codec.
        if stream.chunked {
            self.write_all(&encode_last_chunk(Some(trailers))).await?;
        }
        Ok(())
    }

    /// No stream-level reset exists; tear the connection down instead.
    pub async fn send_reset(&self, _stream: &mut H1RequestStream) -> Result<()> {
        self.close().await
    }

    pub async fn close(&self) -> Result<()> {
        if let Some(mut write) = self.write.lock().await.take() {
            let _ = write.shutdown().await;
        }
        Ok(())
    }

    fn enqueue(&self, collector: &Arc<ResponseCollector>) {
        self.inflight.lock().unwrap().push_back(Arc::clone(collector));
    }

    async fn write_all(&self, wire: &[u8]) -> Result<()> {
        let mut guard = self.write.lock().await;
        let write = guard
            .as_mut()
            .ok_or(crate::error::HarnessError::UnexpectedState(
                "write after connection close",
            ))?;
        write.write_all(wire).await?;
        write.flush().await?;
        Ok(())
    }
}

fn clone_head(request: &Request<()>) -> Request<()> {
    let mut cloned = Request::builder()
        .method(request.method().clone())
        .uri(request.uri().clone())
        .body(())
        .expect("cloning a valid request head");
    *cloned.headers_mut() = request.headers().clone();
    cloned
}

fn has_explicit_framing(headers: &HeaderMap) -> bool {
    headers.contains_key(CONTENT_LENGTH) || headers.contains_key(TRANSFER_ENCODING)
}

enum ReadPhase {
    Head,
    Body(BodyDecoder),
}

/// Parse responses off the socket and feed the FIFO collector queue until the
/// peer disconnects.
async fn read_loop(mut read: OwnedReadHalf, inflight: Inflight, conn: Arc<ConnState>) {
    let mut buf = BytesMut::with_capacity(16 * 1024);
    let mut phase = ReadPhase::Head;
    loop {
        if let Err(err) = drain_buffer(&mut buf, &mut phase, &inflight) {
            tracing::warn!(error = %err, "response parse failed, dropping connection");
            conn.mark_disconnected();
            return;
        }
        match read.read_buf(&mut buf).await {
            Ok(0) | Err(_) => {
                if let ReadPhase::Body(decoder) = &mut phase {
                    if let Ok(Some(BodyEvent::End)) = decoder.on_eof() {
                        if let Some(collector) = inflight.lock().unwrap().pop_front() {
                            collector.on_end_stream();
                        }
                    }
                }
                conn.mark_disconnected();
                return;
            }
            Ok(_) => {}
        }
    }
}

fn drain_buffer(buf: &mut BytesMut, phase: &mut ReadPhase, inflight: &Inflight) -> Result<()> {
    loop {
        match phase {
            ReadPhase::Head => {
                let Some((head, consumed)) = parse_response_head(buf)? else {
                    return Ok(());
                };
                buf.advance(consumed);
                let framing = response_body_framing(head.status, &head.headers)?;
                let decoder = BodyDecoder::new(framing);
                let done = decoder.is_done();
                let queue = inflight.lock().unwrap();
                match queue.front() {
                    Some(collector) => collector.on_headers(head.status, head.headers, done),
                    None => tracing::warn!("response received with no request in flight"),
                }
                drop(queue);
                if done {
                    inflight.lock().unwrap().pop_front();
                } else {
                    *phase = ReadPhase::Body(decoder);
                }
            }
            ReadPhase::Body(decoder) => {
                let Some(event) = decoder.decode(buf)? else {
                    return Ok(());
                };
                let done = decoder.is_done();
                if let Some(collector) = inflight.lock().unwrap().front() {
                    match event {
                        BodyEvent::Data(data) => collector.on_data(&data, done),
                        BodyEvent::Trailers(trailers) => collector.on_trailers(trailers),
                        BodyEvent::End => collector.on_end_stream(),
                    }
                }
                if done {
                    inflight.lock().unwrap().pop_front();
                    *phase = ReadPhase::Head;
                }
            }
        }
    }
}
