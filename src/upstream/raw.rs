//! Codec-free upstream connection for byte-level scenarios.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::Notify;

use crate::dispatch::wait_until;
use crate::error::Result;

#[derive(Debug, Default)]
struct RawInbound {
    data: Vec<u8>,
    disconnected: bool,
}

/// Raw server-side view of a connection from the proxy. Used when a scenario
/// needs to answer with deliberately broken protocol bytes.
pub struct FakeRawConnection {
    inbound: Arc<Mutex<RawInbound>>,
    signal: Arc<Notify>,
    write: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    wait_timeout: Option<Duration>,
}

impl FakeRawConnection {
    pub(crate) fn new(socket: TcpStream, wait_timeout: Option<Duration>) -> Self {
        let (mut read, write) = socket.into_split();
        let inbound = Arc::new(Mutex::new(RawInbound::default()));
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

        Self {
            inbound,
            signal,
            write: tokio::sync::Mutex::new(Some(write)),
            wait_timeout,
        }
    }

    /// Block until at least `num_bytes` of request data have arrived.
    pub async fn wait_for_data(&self, num_bytes: usize) -> Result<()> {
        wait_until(&self.signal, "raw upstream data", self.wait_timeout, || {
            self.inbound.lock().unwrap().data.len() >= num_bytes
        })
        .await
    }

    /// Snapshot of everything the proxy has sent so far.
    pub fn data(&self) -> Vec<u8> {
        self.inbound.lock().unwrap().data.clone()
    }

    /// Write raw bytes back to the proxy.
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        let mut guard = self.write.lock().await;
        let socket = guard
            .as_mut()
            .ok_or(crate::error::HarnessError::UnexpectedState(
                "write after upstream close",
            ))?;
        socket.write_all(data).await?;
        socket.flush().await?;
        Ok(())
    }

    pub async fn wait_for_disconnect(&self) -> Result<()> {
        wait_until(
            &self.signal,
            "raw upstream disconnect",
            self.wait_timeout,
            || self.inbound.lock().unwrap().disconnected,
        )
        .await
    }

    pub async fn close(&self) {
        if let Some(mut socket) = self.write.lock().await.take() {
            let _ = socket.shutdown().await;
        }
    }
}
