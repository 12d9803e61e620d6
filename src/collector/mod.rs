//! Stream response collector.
//!
//! # Responsibilities
//! - Capture one response/stream lifecycle: headers, body bytes, trailers,
//!   terminal state
//! - Expose blocking waiters keyed on milestones (body length, end-of-stream,
//!   reset)
//!
//! # Design Decisions
//! - A stream reaches exactly one terminal state (`EndStream` xor `Reset`);
//!   mutation after terminal is ignored and asserted in debug builds
//! - At most one partial-body wait may be outstanding; overlapping waits are
//!   a harness programming error and panic
//! - A partial-body wait is released by end-of-stream even when fewer bytes
//!   than requested arrived, since no further bytes are coming

use std::sync::{Arc, Mutex};
use std::time::Duration;

use http::{HeaderMap, StatusCode};
use tokio::sync::Notify;

use crate::dispatch::wait_until;
use crate::error::Result;

/// Reason a stream was reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetReason {
    LocalReset,
    RemoteReset,
    ConnectionTermination,
    ConnectionFailure,
    Overflow,
}

/// Terminal state of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Terminal {
    EndStream,
    Reset(ResetReason),
}

#[derive(Debug, Default)]
struct CollectorState {
    status: Option<StatusCode>,
    headers: Option<HeaderMap>,
    body: Vec<u8>,
    trailers: Option<HeaderMap>,
    terminal: Option<Terminal>,
    body_wait_pending: bool,
}

impl CollectorState {
    fn terminal_reached(&self) -> bool {
        self.terminal.is_some()
    }
}

/// Captures one HTTP response's lifecycle and exposes milestone waiters.
///
/// Codec tasks feed the `on_*` sinks; scenario code blocks on the `wait_for_*`
/// methods and reads the accessors once unblocked.
#[derive(Debug)]
pub struct ResponseCollector {
    state: Mutex<CollectorState>,
    signal: Notify,
    wait_timeout: Option<Duration>,
}

impl ResponseCollector {
    pub fn new(wait_timeout: Option<Duration>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(CollectorState::default()),
            signal: Notify::new(),
            wait_timeout,
        })
    }

    // --- sinks driven by codec callbacks ---

    pub fn on_headers(&self, status: StatusCode, headers: HeaderMap, end_stream: bool) {
        let mut state = self.state.lock().unwrap();
        debug_assert!(!state.terminal_reached(), "headers after terminal state");
        if state.terminal_reached() {
            return;
        }
        tracing::debug!(%status, end_stream, "response headers received");
        state.status = Some(status);
        state.headers = Some(headers);
        if end_stream {
            state.terminal = Some(Terminal::EndStream);
        }
        drop(state);
        self.signal.notify_waiters();
    }

    pub fn on_data(&self, data: &[u8], end_stream: bool) {
        let mut state = self.state.lock().unwrap();
        debug_assert!(!state.terminal_reached(), "data after terminal state");
        if state.terminal_reached() {
            return;
        }
        state.body.extend_from_slice(data);
        if end_stream {
            state.terminal = Some(Terminal::EndStream);
        }
        drop(state);
        self.signal.notify_waiters();
    }

    pub fn on_trailers(&self, trailers: HeaderMap) {
        let mut state = self.state.lock().unwrap();
        debug_assert!(!state.terminal_reached(), "trailers after terminal state");
        if state.terminal_reached() {
            return;
        }
        state.trailers = Some(trailers);
        state.terminal = Some(Terminal::EndStream);
        drop(state);
        self.signal.notify_waiters();
    }

    pub fn on_end_stream(&self) {
        let mut state = self.state.lock().unwrap();
        if state.terminal_reached() {
            return;
        }
        state.terminal = Some(Terminal::EndStream);
        drop(state);
        self.signal.notify_waiters();
    }

    pub fn on_reset(&self, reason: ResetReason) {
        let mut state = self.state.lock().unwrap();
        debug_assert!(
            state.terminal != Some(Terminal::EndStream),
            "reset after end-of-stream"
        );
        if state.terminal_reached() {
            return;
        }
        tracing::debug!(?reason, "stream reset");
        state.terminal = Some(Terminal::Reset(reason));
        drop(state);
        self.signal.notify_waiters();
    }

    // --- milestone waiters ---

    /// Block until cumulative body length reaches `size` or the stream ends.
    ///
    /// # Panics
    /// Panics if another body-length wait is already pending on this
    /// collector.
    pub async fn wait_for_body_data(&self, size: usize) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            assert!(
                !state.body_wait_pending,
                "overlapping wait_for_body_data calls on one collector"
            );
            state.body_wait_pending = true;
        }
        let result = wait_until(&self.signal, "response body data", self.wait_timeout, || {
            let state = self.state.lock().unwrap();
            state.body.len() >= size || state.terminal_reached()
        })
        .await;
        self.state.lock().unwrap().body_wait_pending = false;
        result
    }

    /// Block until end-of-stream; immediate if already observed.
    pub async fn wait_for_end_stream(&self) -> Result<()> {
        wait_until(&self.signal, "response end-of-stream", self.wait_timeout, || {
            self.state.lock().unwrap().terminal == Some(Terminal::EndStream)
        })
        .await
    }

    /// Block until the stream is reset; immediate if already observed.
    pub async fn wait_for_reset(&self) -> Result<()> {
        wait_until(&self.signal, "response reset", self.wait_timeout, || {
            matches!(self.state.lock().unwrap().terminal, Some(Terminal::Reset(_)))
        })
        .await
    }

    // --- accessors ---

    pub fn complete(&self) -> bool {
        self.state.lock().unwrap().terminal == Some(Terminal::EndStream)
    }

    pub fn reset(&self) -> bool {
        matches!(self.state.lock().unwrap().terminal, Some(Terminal::Reset(_)))
    }

    pub fn reset_reason(&self) -> Option<ResetReason> {
        match self.state.lock().unwrap().terminal {
            Some(Terminal::Reset(reason)) => Some(reason),
            _ => None,
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        self.state.lock().unwrap().status
    }

    pub fn headers(&self) -> Option<HeaderMap> {
        self.state.lock().unwrap().headers.clone()
    }

    pub fn body(&self) -> Vec<u8> {
        self.state.lock().unwrap().body.clone()
    }

    pub fn body_len(&self) -> usize {
        self.state.lock().unwrap().body.len()
    }

    pub fn trailers(&self) -> Option<HeaderMap> {
        self.state.lock().unwrap().trailers.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collector() -> Arc<ResponseCollector> {
        ResponseCollector::new(Some(Duration::from_secs(1)))
    }

    #[tokio::test]
    async fn header_only_response_completes_with_empty_body() {
        let c = collector();
        c.on_headers(StatusCode::OK, HeaderMap::new(), true);
        c.wait_for_end_stream().await.unwrap();
        assert!(c.complete());
        assert_eq!(c.body_len(), 0);
        assert_eq!(c.status(), Some(StatusCode::OK));
    }

    #[tokio::test]
    async fn end_stream_wait_is_idempotent() {
        let c = collector();
        c.on_headers(StatusCode::OK, HeaderMap::new(), false);
        c.on_data(b"abc", true);
        c.wait_for_end_stream().await.unwrap();
        // Second wait must return immediately without re-blocking.
        c.wait_for_end_stream().await.unwrap();
        assert_eq!(c.body(), b"abc");
    }

    #[tokio::test]
    async fn partial_body_wait_released_by_end_of_stream() {
        let c = collector();
        c.on_headers(StatusCode::OK, HeaderMap::new(), false);
        let bg = Arc::clone(&c);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            bg.on_data(b"short", true);
        });
        // Asks for more bytes than will ever arrive.
        c.wait_for_body_data(512).await.unwrap();
        assert_eq!(c.body_len(), 5);
        assert!(c.complete());
    }

    #[tokio::test]
    async fn reset_wins_over_pending_end_stream_wait() {
        let c = collector();
        c.on_headers(StatusCode::OK, HeaderMap::new(), false);
        c.on_reset(ResetReason::RemoteReset);
        c.wait_for_reset().await.unwrap();
        assert!(c.reset());
        assert!(!c.complete());
        assert_eq!(c.reset_reason(), Some(ResetReason::RemoteReset));
    }

    #[tokio::test]
    async fn mutation_after_terminal_is_ignored() {
        let c = collector();
        c.on_headers(StatusCode::OK, HeaderMap::new(), false);
        c.on_data(b"body", true);
        let state_before = c.body();
        // Release-mode behavior: late frames are dropped silently.
        if !cfg!(debug_assertions) {
            c.on_data(b"late", false);
            assert_eq!(c.body(), state_before);
        }
    }

    #[tokio::test]
    #[should_panic(expected = "overlapping wait_for_body_data")]
    async fn overlapping_body_waits_panic() {
        let c = collector();
        // Simulate the second caller arriving while the first is pending.
        c.state.lock().unwrap().body_wait_pending = true;
        let _ = c.wait_for_body_data(1).await;
    }
}
