//! Codec-level downstream client driver.
//!
//! # Responsibilities
//! - Present one API over the HTTP/1.1 and HTTP/2 codecs
//! - Make connection setup synchronous: construction resolves only once the
//!   connection (and protocol handshake) is established
//! - Provide request construction end-to-end plus mid-stream continuation
//!
//! # Design Decisions
//! - The codecs diverge in how mid-stream errors manifest: HTTP/1.1 signals
//!   failure only by closing the connection, HTTP/2 can reset an individual
//!   stream. `CodecKind::error_signal` centralizes that divergence so
//!   scenarios consult it once instead of branching ad hoc

pub mod http1;
pub mod http2;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Request};
use tokio::sync::Notify;

use crate::collector::ResponseCollector;
use crate::dispatch::wait_until;
use crate::error::Result;

use self::http1::{H1RequestStream, Http1Client};
use self::http2::Http2Client;

/// HTTP protocol version driven by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecKind {
    Http1,
    Http2,
}

/// Which signal a scenario should expect when a proxied exchange fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownSignal {
    /// Connection-oriented codec: the whole connection closes.
    ConnectionClose,
    /// Multiplexed codec: the individual stream resets, the connection stays.
    StreamReset,
}

impl CodecKind {
    /// The teardown signal this codec uses for mid-stream errors.
    pub fn error_signal(self) -> TeardownSignal {
        match self {
            CodecKind::Http1 => TeardownSignal::ConnectionClose,
            CodecKind::Http2 => TeardownSignal::StreamReset,
        }
    }
}

/// Connection lifecycle flags shared with codec I/O tasks.
#[derive(Debug, Default)]
pub struct ConnState {
    flags: Mutex<ConnFlags>,
    signal: Notify,
}

#[derive(Debug, Default)]
struct ConnFlags {
    connected: bool,
    disconnected: bool,
}

impl ConnState {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn mark_connected(&self) {
        self.flags.lock().unwrap().connected = true;
        self.signal.notify_waiters();
    }

    pub(crate) fn mark_disconnected(&self) {
        self.flags.lock().unwrap().disconnected = true;
        self.signal.notify_waiters();
    }

    pub(crate) fn disconnected(&self) -> bool {
        self.flags.lock().unwrap().disconnected
    }

    pub(crate) fn signal(&self) -> &Notify {
        &self.signal
    }
}

/// Continuation handle for a request stream opened with `start_request`.
#[derive(Debug)]
pub enum RequestStream {
    Http1(H1RequestStream),
    Http2(h2::SendStream<Bytes>),
}

enum ClientCodec {
    Http1(Http1Client),
    Http2(Http2Client),
}

/// Wraps a client connection plus codec and drives requests end-to-end.
pub struct CodecClient {
    kind: CodecKind,
    codec: ClientCodec,
    conn: Arc<ConnState>,
    wait_timeout: Option<Duration>,
}

impl CodecClient {
    /// Connect to `addr` with the given codec. Resolves once the connection
    /// is fully established; any handshake failure surfaces as an error.
    pub async fn connect(
        addr: SocketAddr,
        kind: CodecKind,
        wait_timeout: Option<Duration>,
    ) -> Result<Self> {
        let conn = ConnState::new();
        tracing::debug!(%addr, ?kind, "connecting downstream client");
        let codec = match kind {
            CodecKind::Http1 => ClientCodec::Http1(Http1Client::connect(addr, Arc::clone(&conn)).await?),
            CodecKind::Http2 => ClientCodec::Http2(Http2Client::connect(addr, Arc::clone(&conn)).await?),
        };
        Ok(Self {
            kind,
            codec,
            conn,
            wait_timeout,
        })
    }

    pub fn kind(&self) -> CodecKind {
        self.kind
    }

    /// Send a complete request with no body. Callers wait on the collector
    /// separately.
    pub async fn make_header_only_request(
        &mut self,
        request: Request<()>,
        collector: &Arc<ResponseCollector>,
    ) -> Result<()> {
        match &mut self.codec {
            ClientCodec::Http1(client) => client.make_header_only_request(&request, collector).await,
            ClientCodec::Http2(client) => {
                client.start_stream(request, true, collector).await?;
                Ok(())
            }
        }
    }

    /// Send a complete request with `body_size` bytes of filler body.
    pub async fn make_request_with_body(
        &mut self,
        request: Request<()>,
        body_size: usize,
        collector: &Arc<ResponseCollector>,
    ) -> Result<()> {
        let body = filler_body(body_size);
        match &mut self.codec {
            ClientCodec::Http1(client) => {
                client.make_request_with_body(&request, &body, collector).await
            }
            ClientCodec::Http2(client) => {
                let mut stream = client.start_stream(request, false, collector).await?;
                client.send_data(&mut stream, Bytes::from(body), true).await
            }
        }
    }

    /// Send headers only (end-of-stream false) and return the open stream for
    /// manual continuation.
    pub async fn start_request(
        &mut self,
        request: Request<()>,
        collector: &Arc<ResponseCollector>,
    ) -> Result<RequestStream> {
        match &mut self.codec {
            ClientCodec::Http1(client) => Ok(RequestStream::Http1(
                client.start_request(&request, collector).await?,
            )),
            ClientCodec::Http2(client) => Ok(RequestStream::Http2(
                client.start_stream(request, false, collector).await?,
            )),
        }
    }

    /// Send `size` filler bytes on an open stream.
    pub async fn send_data(
        &mut self,
        stream: &mut RequestStream,
        size: usize,
        end_stream: bool,
    ) -> Result<()> {
        self.send_data_buf(stream, Bytes::from(filler_body(size)), end_stream)
            .await
    }

    /// Send exact bytes on an open stream.
    pub async fn send_data_buf(
        &mut self,
        stream: &mut RequestStream,
        data: Bytes,
        end_stream: bool,
    ) -> Result<()> {
        match (&mut self.codec, stream) {
            (ClientCodec::Http1(client), RequestStream::Http1(stream)) => {
                client.send_data(stream, &data, end_stream).await
            }
            (ClientCodec::Http2(client), RequestStream::Http2(stream)) => {
                client.send_data(stream, data, end_stream).await
            }
            _ => Err(crate::error::HarnessError::UnexpectedState(
                "request stream belongs to a different codec",
            )),
        }
    }

    /// Send trailers, ending the stream.
    pub async fn send_trailers(
        &mut self,
        stream: &mut RequestStream,
        trailers: HeaderMap,
    ) -> Result<()> {
        match (&mut self.codec, stream) {
            (ClientCodec::Http1(client), RequestStream::Http1(stream)) => {
                client.send_trailers(stream, &trailers).await
            }
            (ClientCodec::Http2(client), RequestStream::Http2(stream)) => {
                client.send_trailers(stream, trailers)
            }
            _ => Err(crate::error::HarnessError::UnexpectedState(
                "request stream belongs to a different codec",
            )),
        }
    }

    /// Reset an open stream: RST_STREAM on HTTP/2, connection close on
    /// HTTP/1.1.
    pub async fn send_reset(&mut self, stream: &mut RequestStream) -> Result<()> {
        match (&mut self.codec, stream) {
            (ClientCodec::Http1(client), RequestStream::Http1(stream)) => {
                client.send_reset(stream).await
            }
            (ClientCodec::Http2(client), RequestStream::Http2(stream)) => {
                client.send_reset(stream);
                Ok(())
            }
            _ => Err(crate::error::HarnessError::UnexpectedState(
                "request stream belongs to a different codec",
            )),
        }
    }

    /// Block until the connection transitions to remote-closed.
    pub async fn wait_for_disconnect(&mut self) -> Result<()> {
        wait_until(
            &self.conn.signal,
            "downstream disconnect",
            self.wait_timeout,
            || self.conn.disconnected(),
        )
        .await
    }

    /// Close the connection immediately.
    pub async fn close(&mut self) -> Result<()> {
        match &mut self.codec {
            ClientCodec::Http1(client) => client.close().await,
            ClientCodec::Http2(client) => {
                client.close();
                Ok(())
            }
        }
    }
}

/// Synthetic body content: `size` bytes of `'a'` filler.
pub fn filler_body(size: usize) -> Vec<u8> {
    vec![b'a'; size]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_signal_is_codec_specific() {
        assert_eq!(CodecKind::Http1.error_signal(), TeardownSignal::ConnectionClose);
        assert_eq!(CodecKind::Http2.error_signal(), TeardownSignal::StreamReset);
    }

    #[test]
    fn filler_body_is_exactly_sized() {
        assert_eq!(filler_body(0).len(), 0);
        let body = filler_body(1024);
        assert_eq!(body.len(), 1024);
        assert!(body.iter().all(|&b| b == b'a'));
    }
}
