//! HTTP/2 client codec, built directly on `h2` for stream-level control.
//!
//! # Responsibilities
//! - Drive the h2 connection task and surface its termination as a disconnect
//! - Open streams with explicit end-of-stream control and pump responses into
//!   collectors
//! - Expose mid-stream continuation: data (flow-control aware), trailers,
//!   reset
//!
//! # Design Decisions
//! - Each response is consumed by a spawned pump task so scenario code never
//!   polls the codec directly; milestones arrive through the collector
//! - Stream errors carrying an RST_STREAM reason map to `RemoteReset`;
//!   connection-level I/O failures map to `ConnectionTermination`

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::poll_fn;
use h2::client::SendRequest;
use h2::SendStream;
use http::{HeaderMap, Request};
use tokio::net::TcpStream;
use tokio::sync::oneshot;

use crate::client::ConnState;
use crate::collector::{ResetReason, ResponseCollector};
use crate::error::{HarnessError, Result};

/// Client side of one HTTP/2 connection.
#[derive(Debug)]
pub struct Http2Client {
    send: SendRequest<Bytes>,
    close_tx: Option<oneshot::Sender<()>>,
}

impl Http2Client {
    pub async fn connect(addr: SocketAddr, conn: Arc<ConnState>) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (send, connection) = h2::client::handshake(stream).await?;
        conn.mark_connected();

        let (close_tx, close_rx) = oneshot::channel();
        tokio::spawn(async move {
            tokio::select! {
                result = connection => {
                    if let Err(err) = result {
                        tracing::debug!(error = %err, "h2 connection ended");
                    }
                    conn.mark_disconnected();
                }
                // Local close: dropping the connection sends GOAWAY and
                // closes the socket.
                _ = close_rx => {}
            }
        });

        Ok(Self {
            send,
            close_tx: Some(close_tx),
        })
    }

    /// Open a new stream, attach the collector, and send headers.
    pub async fn start_stream(
        &mut self,
        request: Request<()>,
        end_stream: bool,
        collector: &Arc<ResponseCollector>,
    ) -> Result<SendStream<Bytes>> {
        poll_fn(|cx| self.send.poll_ready(cx)).await?;
        let (response, stream) = self.send.send_request(request, end_stream)?;

        let collector = Arc::clone(collector);
        tokio::spawn(async move {
            let response = match response.await {
                Ok(response) => response,
                Err(err) => {
                    collector.on_reset(reset_reason(&err));
                    return;
                }
            };
            let (parts, mut body) = response.into_parts();
            let end = body.is_end_stream();
            collector.on_headers(parts.status, parts.headers, end);
            if end {
                return;
            }
            loop {
                match body.data().await {
                    Some(Ok(data)) => {
                        let _ = body.flow_control().release_capacity(data.len());
                        let end = body.is_end_stream();
                        collector.on_data(&data, end);
                        if end {
                            return;
                        }
                    }
                    Some(Err(err)) => {
                        collector.on_reset(reset_reason(&err));
                        return;
                    }
                    None => break,
                }
            }
            match body.trailers().await {
                Ok(Some(trailers)) => collector.on_trailers(trailers),
                Ok(None) => collector.on_end_stream(),
                Err(err) => collector.on_reset(reset_reason(&err)),
            }
        });

        Ok(stream)
    }

    /// Send `data` on an open stream, waiting for flow-control capacity.
    pub async fn send_data(
        &self,
        stream: &mut SendStream<Bytes>,
        data: Bytes,
        end_stream: bool,
    ) -> Result<()> {
        send_all(stream, data, end_stream).await
    }

    pub fn send_trailers(&self, stream: &mut SendStream<Bytes>, trailers: HeaderMap) -> Result<()> {
        stream.send_trailers(trailers)?;
        Ok(())
    }

    pub fn send_reset(&self, stream: &mut SendStream<Bytes>) {
        stream.send_reset(h2::Reason::CANCEL);
    }

    pub fn close(&mut self) {
        if let Some(close_tx) = self.close_tx.take() {
            let _ = close_tx.send(());
        }
    }
}

impl Drop for Http2Client {
    fn drop(&mut self) {
        self.close();
    }
}

/// Send a whole buffer on an h2 stream, waiting for flow-control capacity as
/// needed. Shared between the client driver and the fake upstream.
pub(crate) async fn send_all(
    stream: &mut SendStream<Bytes>,
    data: Bytes,
    end_stream: bool,
) -> Result<()> {
    if data.is_empty() {
        stream.send_data(data, end_stream)?;
        return Ok(());
    }
    let mut data = data;
    while !data.is_empty() {
        stream.reserve_capacity(data.len());
        let capacity = poll_fn(|cx| stream.poll_capacity(cx))
            .await
            .ok_or(HarnessError::UnexpectedState("stream gone while sending"))??;
        if capacity == 0 {
            continue;
        }
        let chunk = data.split_to(capacity.min(data.len()));
        let last = data.is_empty();
        stream.send_data(chunk, end_stream && last)?;
    }
    Ok(())
}

/// Map an h2 stream error onto the harness reset taxonomy.
pub(crate) fn reset_reason(err: &h2::Error) -> ResetReason {
    if err.is_reset() || err.reason().is_some() {
        ResetReason::RemoteReset
    } else if err.is_io() || err.is_go_away() {
        ResetReason::ConnectionTermination
    } else {
        ResetReason::ConnectionFailure
    }
}
