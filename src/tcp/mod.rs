//! Raw TCP client driver.
//!
//! # Responsibilities
//! - Byte-exact control over the wire for raw HTTP parsing edge cases
//! - Track buffered writes (bytes submitted vs. drained) and confirm flush
//! - Accumulate inbound bytes for prefix waits and exact-response assertions
//!
//! # Design Decisions
//! - There is no native flush-complete callback on the socket write path, so
//!   the drain loop polls with an explicit iteration bound and fails with
//!   `WriteStall` instead of spinning forever
//! - `wait_for_data` short-circuits idempotently when the accumulated data
//!   already begins with the expected prefix

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::Notify;

use crate::dispatch::wait_until;
use crate::error::{HarnessError, Result};

const MAX_DRAIN_POLLS: u32 = 64;

/// Cumulative bytes handed to the write path versus bytes actually drained.
#[derive(Debug, Default)]
pub struct WriteTracker {
    submitted: u64,
    drained: u64,
}

impl WriteTracker {
    pub fn submitted(&self) -> u64 {
        self.submitted
    }

    pub fn drained(&self) -> u64 {
        self.drained
    }

    pub fn fully_drained(&self) -> bool {
        self.drained == self.submitted
    }

    fn submit(&mut self, bytes: usize) {
        self.submitted += bytes as u64;
    }

    fn drain(&mut self, bytes: usize) {
        self.drained += bytes as u64;
        debug_assert!(self.drained <= self.submitted);
    }
}

#[derive(Debug, Default)]
struct Inbound {
    data: Vec<u8>,
    disconnected: bool,
}

struct WriteSide {
    socket: Option<OwnedWriteHalf>,
    pending: Vec<u8>,
    tracker: WriteTracker,
}

/// Codec-agnostic client for tests that must see exact bytes on the wire.
pub struct RawTcpClient {
    write: tokio::sync::Mutex<WriteSide>,
    inbound: Arc<Mutex<Inbound>>,
    signal: Arc<Notify>,
    wait_timeout: Option<Duration>,
}

impl RawTcpClient {
    pub async fn connect(addr: SocketAddr, wait_timeout: Option<Duration>) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (mut read, write) = stream.into_split();

        let inbound = Arc::new(Mutex::new(Inbound::default()));
        let signal = Arc::new(Notify::new());
        let task_inbound = Arc::clone(&inbound);
        let task_signal = Arc::clone(&signal);
        tokio::spawn(async move {
            let mut buf = [0u8; 16 * 1024];
            loop {
                match read.read(&mut buf).await {
                    Ok(0) | Err(_) => {
                        task_inbound.lock().unwrap().disconnected = true;
                        task_signal.notify_waiters();
                        return;
                    }
                    Ok(n) => {
                        task_inbound.lock().unwrap().data.extend_from_slice(&buf[..n]);
                        task_signal.notify_waiters();
                    }
                }
            }
        });

        Ok(Self {
            write: tokio::sync::Mutex::new(WriteSide {
                socket: Some(write),
                pending: Vec::new(),
                tracker: WriteTracker::default(),
            }),
            inbound,
            signal,
            wait_timeout,
        })
    }

    /// Write through the buffered path, then poll until the tracked drained
    /// count catches up with the submitted count.
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        let mut side = self.write.lock().await;
        let side = &mut *side;
        side.tracker.submit(data.len());
        side.pending.extend_from_slice(data);

        let mut iterations = 0;
        while !side.tracker.fully_drained() {
            iterations += 1;
            if iterations > MAX_DRAIN_POLLS {
                return Err(HarnessError::WriteStall {
                    iterations: MAX_DRAIN_POLLS,
                });
            }
            let socket = side
                .socket
                .as_mut()
                .ok_or(HarnessError::UnexpectedState("write after close"))?;
            let pending = std::mem::take(&mut side.pending);
            let written = socket.write(&pending).await?;
            socket.flush().await?;
            side.pending = pending[written..].to_vec();
            side.tracker.drain(written);
        }
        Ok(())
    }

    /// Snapshot of everything received so far.
    pub fn data(&self) -> Vec<u8> {
        self.inbound.lock().unwrap().data.clone()
    }

    /// Block until accumulated inbound data begins with `expected`.
    /// Returns immediately if it already does.
    pub async fn wait_for_data(&self, expected: &[u8]) -> Result<()> {
        wait_until(&self.signal, "expected inbound data", self.wait_timeout, || {
            self.inbound.lock().unwrap().data.starts_with(expected)
        })
        .await
    }

    /// Block until at least one byte has arrived.
    pub async fn wait_for_any_data(&self) -> Result<()> {
        wait_until(&self.signal, "any inbound data", self.wait_timeout, || {
            !self.inbound.lock().unwrap().data.is_empty()
        })
        .await
    }

    /// Block until the remote end closes the connection.
    pub async fn wait_for_disconnect(&self) -> Result<()> {
        wait_until(&self.signal, "raw client disconnect", self.wait_timeout, || {
            self.inbound.lock().unwrap().disconnected
        })
        .await
    }

    /// Immediate, no-flush close of the socket.
    pub async fn close(&self) {
        if let Some(mut socket) = self.write.lock().await.socket.take() {
            let _ = socket.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_counts_submitted_and_drained() {
        let mut tracker = WriteTracker::default();
        assert!(tracker.fully_drained());
        tracker.submit(10);
        assert!(!tracker.fully_drained());
        tracker.drain(4);
        tracker.drain(6);
        assert!(tracker.fully_drained());
        assert_eq!(tracker.submitted(), 10);
        assert_eq!(tracker.drained(), 10);
    }
}
