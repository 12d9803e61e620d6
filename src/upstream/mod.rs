//! Simulated upstream endpoints.
//!
//! # Responsibilities
//! - Accept connections from the proxy under test on an ephemeral port
//! - Hand out codec-wrapped or raw views of accepted sockets on demand
//!
//! # Data Flow
//! ```text
//! Proxy connects
//!     → accept loop queues the raw socket
//!     → wait_for_http_connection() wraps it in the upstream codec
//!       (or wait_for_raw_connection() for byte-level scenarios)
//!     → FakeHttpConnection::wait_for_new_stream() yields one proxied request
//! ```

pub mod connection;
pub mod raw;

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

use crate::client::CodecKind;
use crate::dispatch::wait_until;
use crate::error::Result;

pub use connection::{FakeHttpConnection, FakeStream};
pub use raw::FakeRawConnection;

/// FIFO of items produced by background tasks and consumed by waits.
pub(crate) struct SharedQueue<T> {
    items: Mutex<VecDeque<T>>,
    signal: Notify,
}

impl<T> SharedQueue<T> {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            items: Mutex::new(VecDeque::new()),
            signal: Notify::new(),
        })
    }

    pub(crate) fn push(&self, item: T) {
        self.items.lock().unwrap().push_back(item);
        self.signal.notify_waiters();
    }

    pub(crate) async fn pop_wait(
        &self,
        what: &'static str,
        timeout: Option<Duration>,
    ) -> Result<T> {
        wait_until(&self.signal, what, timeout, || {
            !self.items.lock().unwrap().is_empty()
        })
        .await?;
        Ok(self
            .items
            .lock()
            .unwrap()
            .pop_front()
            .expect("queue non-empty after wait"))
    }
}

/// One simulated backend server, independently awaiting connections from the
/// proxy.
pub struct FakeUpstream {
    codec: CodecKind,
    local_addr: SocketAddr,
    sockets: Arc<SharedQueue<TcpStream>>,
    wait_timeout: Option<Duration>,
}

impl FakeUpstream {
    /// Bind a listener on an ephemeral loopback port and start accepting.
    pub async fn bind(codec: CodecKind, wait_timeout: Option<Duration>) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let local_addr = listener.local_addr()?;
        tracing::debug!(%local_addr, ?codec, "fake upstream listening");

        let sockets = SharedQueue::new();
        let accept_sockets = Arc::clone(&sockets);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((socket, peer)) => {
                        tracing::debug!(%peer, "fake upstream accepted connection");
                        let _ = socket.set_nodelay(true);
                        accept_sockets.push(socket);
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "fake upstream accept failed");
                        return;
                    }
                }
            }
        });

        Ok(Self {
            codec,
            local_addr,
            sockets,
            wait_timeout,
        })
    }

    pub fn codec(&self) -> CodecKind {
        self.codec
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Block until the proxy opens a connection, then wrap it in this
    /// upstream's codec.
    pub async fn wait_for_http_connection(&self) -> Result<FakeHttpConnection> {
        let socket = self
            .sockets
            .pop_wait("upstream http connection", self.wait_timeout)
            .await?;
        FakeHttpConnection::new(socket, self.codec, self.wait_timeout).await
    }

    /// Block until the proxy opens a connection, keeping it codec-free for
    /// byte-level scenarios.
    pub async fn wait_for_raw_connection(&self) -> Result<FakeRawConnection> {
        let socket = self
            .sockets
            .pop_wait("upstream raw connection", self.wait_timeout)
            .await?;
        Ok(FakeRawConnection::new(socket, self.wait_timeout))
    }
}
