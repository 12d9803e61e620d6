//! Shared fixtures for the loopback integration tests.
//!
//! Both ends of every exchange here are harness code: the codec client is
//! pointed straight at a fake upstream, so driver behavior can be exercised
//! without a proxy in the middle.

// Each test binary uses a different subset of these fixtures.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use proxy_harness::collector::ResponseCollector;
use proxy_harness::upstream::FakeHttpConnection;
use proxy_harness::{CodecClient, CodecKind, FakeUpstream, Harness};

pub const TIMEOUT: Option<Duration> = Some(Duration::from_secs(5));

/// Harness whose "http" listener is the fake upstream itself.
pub async fn loopback_harness(codec: CodecKind) -> Harness {
    let mut harness = Harness::new(codec, codec)
        .await
        .expect("harness setup")
        .with_wait_timeout(TIMEOUT);
    let port = harness.upstream(0).port();
    harness.ports_mut().register("http", port);
    harness
}

pub fn collector() -> Arc<ResponseCollector> {
    ResponseCollector::new(TIMEOUT)
}

/// Connected HTTP/1.1 client/upstream pair.
pub async fn h1_pair() -> (CodecClient, FakeHttpConnection, FakeUpstream) {
    let upstream = FakeUpstream::bind(CodecKind::Http1, TIMEOUT)
        .await
        .expect("upstream bind");
    let client = CodecClient::connect(upstream.local_addr(), CodecKind::Http1, TIMEOUT)
        .await
        .expect("client connect");
    let connection = upstream
        .wait_for_http_connection()
        .await
        .expect("upstream connection");
    (client, connection, upstream)
}

/// Connected HTTP/2 client/upstream pair. The two handshakes depend on each
/// other, so they run concurrently.
pub async fn h2_pair() -> (CodecClient, FakeHttpConnection, FakeUpstream) {
    let upstream = FakeUpstream::bind(CodecKind::Http2, TIMEOUT)
        .await
        .expect("upstream bind");
    let (client, connection) = tokio::join!(
        CodecClient::connect(upstream.local_addr(), CodecKind::Http2, TIMEOUT),
        upstream.wait_for_http_connection(),
    );
    (
        client.expect("client connect"),
        connection.expect("upstream connection"),
        upstream,
    )
}
