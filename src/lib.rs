//! Deterministic correctness harness for an HTTP proxy.
//!
//! Drives a downstream HTTP/1.1 or HTTP/2 client and simulated upstream
//! servers against a proxy under test, sequencing every step explicitly so
//! scenario interleavings are reproducible. The proxy process itself is an
//! external collaborator observed only through its sockets and admin
//! interface.

pub mod admin;
pub mod client;
pub mod collector;
pub mod dispatch;
pub mod error;
pub mod headers;
pub mod http1;
pub mod observability;
pub mod ports;
pub mod scenario;
pub mod tcp;
pub mod upstream;

pub use client::{CodecClient, CodecKind, TeardownSignal};
pub use collector::{ResetReason, ResponseCollector};
pub use error::{HarnessError, Result};
pub use scenario::Harness;
pub use tcp::RawTcpClient;
pub use upstream::FakeUpstream;
