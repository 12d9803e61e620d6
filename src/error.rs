//! Harness error taxonomy.
//!
//! # Responsibilities
//! - Distinguish harness faults from proxy behavior under test
//! - Surface wait deadlines as errors instead of hangs
//!
//! # Design Decisions
//! - Protocol-level outcomes observed from the proxy (400/431/503, resets)
//!   are scenario data, never errors; only harness plumbing failures land here
//! - Programming-error preconditions (overlapping body waits, port registry
//!   misuse) panic instead of returning an error

use thiserror::Error;

/// Errors produced by the harness plumbing itself.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP/2 protocol error: {0}")]
    Http2(#[from] h2::Error),

    #[error("malformed HTTP/1.1 wire data: {0}")]
    WireParse(String),

    #[error("timed out waiting for {what}")]
    WaitTimeout { what: &'static str },

    #[error("buffered write failed to drain within {iterations} polls")]
    WriteStall { iterations: u32 },

    #[error("admin interface error: {0}")]
    Admin(String),

    #[error("invalid state: {0}")]
    UnexpectedState(&'static str),
}

impl From<reqwest::Error> for HarnessError {
    fn from(err: reqwest::Error) -> Self {
        HarnessError::Admin(err.to_string())
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, HarnessError>;
