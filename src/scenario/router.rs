//! Routed-exchange scenarios.
//!
//! Each scenario drives one shape of proxied traffic end to end and asserts
//! the proxy's externally visible behavior: what reached the upstream, what
//! came back downstream, and which side tore what down. Scenarios that differ
//! by codec consult `error_signal()` once instead of branching ad hoc.

use http::{HeaderMap, HeaderValue, Method, StatusCode};

use crate::client::{CodecKind, TeardownSignal};
use crate::collector::ResetReason;
use crate::error::Result;
use crate::headers;

use super::{single_request, step, Harness};
use futures_util::FutureExt;

/// Exact body the proxy serves when the upstream fails before response
/// headers arrived.
pub const UPSTREAM_CONNECT_ERROR_BODY: &[u8] =
    b"upstream connect error or disconnect/reset before headers";

/// Request header selecting the proxy's status-based retry policy.
pub const RETRY_POLICY_HEADER: &str = "x-proxy-retry-on";
/// Request header selecting the proxy's gRPC-status retry policy.
pub const GRPC_RETRY_POLICY_HEADER: &str = "x-proxy-retry-grpc-on";

const DEFAULT_PATH: &str = "/test/long/url";

fn filler_header(size: usize) -> HeaderValue {
    HeaderValue::from_str(&"a".repeat(size)).expect("ascii filler header")
}

/// Complete request/response exchange with bodies in both directions,
/// optionally padded with a 4 KiB request header.
pub async fn request_and_response_with_body(
    harness: &mut Harness,
    request_size: usize,
    response_size: usize,
    big_header: bool,
) -> Result<()> {
    let mut request =
        headers::request_with_headers(Method::POST, DEFAULT_PATH, &[("x-forwarded-for", "10.0.0.1")]);
    if big_header {
        request.headers_mut().insert("big", filler_header(4096));
    }

    harness
        .execute_actions(vec![
            step(|h| h.connect().boxed_local()),
            step(move |h| {
                async move {
                    h.send_request_and_wait_for_response(request, request_size, response_size)
                        .await
                }
                .boxed_local()
            }),
            step(|h| h.cleanup_upstream_and_downstream().boxed_local()),
        ])
        .await?;

    let upstream_request = harness.upstream_request();
    assert!(upstream_request.complete());
    assert_eq!(upstream_request.body_len(), request_size);

    let response = harness.response();
    assert!(response.complete());
    assert_eq!(response.status(), Some(StatusCode::OK));
    assert_eq!(response.body().len(), response_size);
    Ok(())
}

/// Header-only request answered by a header-only response.
pub async fn header_only_request_and_response(harness: &mut Harness) -> Result<()> {
    harness
        .execute_actions(vec![
            step(|h| h.connect().boxed_local()),
            step(|h| {
                async move {
                    let request = headers::request(Method::GET, DEFAULT_PATH);
                    h.send_request_and_wait_for_response(request, 0, 0).await
                }
                .boxed_local()
            }),
            step(|h| async move { h.client_mut().close().await }.boxed_local()),
        ])
        .await?;

    let connection = harness.upstream_connection();
    connection.close().await?;
    connection.wait_for_disconnect().await?;

    let upstream_request = harness.upstream_request();
    assert!(upstream_request.complete());
    assert_eq!(upstream_request.body_len(), 0);

    let response = harness.response();
    assert!(response.complete());
    assert_eq!(response.status(), Some(StatusCode::OK));
    assert_eq!(response.body().len(), 0);
    Ok(())
}

/// Request for an unrouted path produces a 404 without involving upstreams.
pub async fn not_found(harness: &Harness) -> Result<()> {
    let response = single_request(
        harness.listener_addr("http"),
        harness.downstream_codec(),
        headers::request(Method::GET, "/notfound"),
        b"",
        harness.wait_timeout(),
    )
    .await?;
    assert!(response.complete());
    assert_eq!(response.status(), Some(StatusCode::NOT_FOUND));
    Ok(())
}

pub async fn not_found_with_body(harness: &Harness) -> Result<()> {
    let response = single_request(
        harness.listener_addr("http"),
        harness.downstream_codec(),
        headers::request(Method::POST, "/notfound"),
        b"foo",
        harness.wait_timeout(),
    )
    .await?;
    assert!(response.complete());
    assert_eq!(response.status(), Some(StatusCode::NOT_FOUND));
    Ok(())
}

/// Host configured for redirection gets a 301 pointing at the secure scheme.
pub async fn redirect(harness: &Harness) -> Result<()> {
    let response = single_request(
        harness.listener_addr("http"),
        harness.downstream_codec(),
        headers::request_to(Method::GET, "www.redirect.com", "/foo"),
        b"",
        harness.wait_timeout(),
    )
    .await?;
    assert!(response.complete());
    assert_eq!(response.status(), Some(StatusCode::MOVED_PERMANENTLY));
    let headers = response.headers().expect("response headers present");
    assert_eq!(
        headers.get(http::header::LOCATION).map(|v| v.as_bytes()),
        Some(&b"https://www.redirect.com/foo"[..])
    );
    Ok(())
}

/// Upstream drops its connection while the request is still open: the proxy
/// synthesizes a 503 with the exact fallback body.
pub async fn upstream_disconnect_before_request_complete(harness: &mut Harness) -> Result<()> {
    harness.connect().await?;
    harness
        .start_request(headers::request(Method::GET, DEFAULT_PATH))
        .await?;
    harness.establish_upstream_connection().await?;
    harness.wait_for_new_upstream_stream().await?;
    harness.upstream_request().wait_for_headers_complete().await?;
    harness.upstream_connection().close().await?;
    harness.upstream_connection().wait_for_disconnect().await?;
    harness.response().wait_for_end_stream().await?;
    match harness.downstream_codec().error_signal() {
        TeardownSignal::ConnectionClose => harness.client_mut().wait_for_disconnect().await?,
        TeardownSignal::StreamReset => harness.client_mut().close().await?,
    }

    let upstream_request = harness.upstream_request();
    assert!(!upstream_request.complete());
    assert_eq!(upstream_request.body_len(), 0);

    let response = harness.response();
    assert!(response.complete());
    assert_eq!(response.status(), Some(StatusCode::SERVICE_UNAVAILABLE));
    assert_eq!(response.body(), UPSTREAM_CONNECT_ERROR_BODY);
    Ok(())
}

/// Upstream drops after response headers: downstream sees an incomplete
/// response terminated by the codec's teardown signal.
pub async fn upstream_disconnect_before_response_complete(harness: &mut Harness) -> Result<()> {
    harness.connect().await?;
    let collector = harness.new_response();
    harness
        .client_mut()
        .make_header_only_request(headers::request(Method::GET, DEFAULT_PATH), &collector)
        .await?;
    harness.wait_for_next_upstream_request().await?;
    harness
        .upstream_request()
        .encode_headers(StatusCode::OK, HeaderMap::new(), false)
        .await?;
    harness.upstream_connection().close().await?;
    harness.upstream_connection().wait_for_disconnect().await?;
    match harness.downstream_codec().error_signal() {
        TeardownSignal::ConnectionClose => harness.client_mut().wait_for_disconnect().await?,
        TeardownSignal::StreamReset => {
            collector.wait_for_reset().await?;
            harness.client_mut().close().await?;
        }
    }

    let upstream_request = harness.upstream_request();
    assert!(upstream_request.complete());
    assert_eq!(upstream_request.body_len(), 0);

    assert!(!collector.complete());
    assert_eq!(collector.status(), Some(StatusCode::OK));
    assert_eq!(collector.body_len(), 0);
    Ok(())
}

/// Downstream drops mid-request: the proxy tears down the upstream side with
/// the upstream codec's teardown signal.
pub async fn downstream_disconnect_before_request_complete(harness: &mut Harness) -> Result<()> {
    harness.connect().await?;
    harness
        .start_request(headers::request(Method::GET, DEFAULT_PATH))
        .await?;
    harness.establish_upstream_connection().await?;
    harness.wait_for_new_upstream_stream().await?;
    harness.upstream_request().wait_for_headers_complete().await?;
    harness.client_mut().close().await?;
    match harness.upstream_codec().error_signal() {
        TeardownSignal::ConnectionClose => {
            harness.upstream_connection().wait_for_disconnect().await?
        }
        TeardownSignal::StreamReset => {
            harness.upstream_request().wait_for_reset().await?;
            harness.upstream_connection().close().await?;
            harness.upstream_connection().wait_for_disconnect().await?;
        }
    }

    let upstream_request = harness.upstream_request();
    assert!(!upstream_request.complete());
    assert_eq!(upstream_request.body_len(), 0);
    assert!(!harness.response().complete());
    Ok(())
}

/// Downstream drops after receiving part of the response body.
pub async fn downstream_disconnect_before_response_complete(harness: &mut Harness) -> Result<()> {
    harness.connect().await?;
    let collector = harness.new_response();
    harness
        .client_mut()
        .make_header_only_request(headers::request(Method::GET, DEFAULT_PATH), &collector)
        .await?;
    harness.wait_for_next_upstream_request().await?;
    harness
        .upstream_request()
        .encode_headers(StatusCode::OK, HeaderMap::new(), false)
        .await?;
    harness.upstream_request().encode_data(512, false).await?;
    collector.wait_for_body_data(512).await?;
    harness.client_mut().close().await?;
    match harness.upstream_codec().error_signal() {
        TeardownSignal::ConnectionClose => {
            harness.upstream_connection().wait_for_disconnect().await?
        }
        TeardownSignal::StreamReset => {
            harness.upstream_request().wait_for_reset().await?;
            harness.upstream_connection().close().await?;
            harness.upstream_connection().wait_for_disconnect().await?;
        }
    }

    let upstream_request = harness.upstream_request();
    assert!(upstream_request.complete());
    assert_eq!(upstream_request.body_len(), 0);

    assert!(!collector.complete());
    assert_eq!(collector.status(), Some(StatusCode::OK));
    assert_eq!(collector.body_len(), 512);
    Ok(())
}

/// Downstream resets the stream after partial response data, with duplicate
/// `cookie` headers on the request to check concatenation on the way through.
pub async fn downstream_reset_before_response_complete(harness: &mut Harness) -> Result<()> {
    harness.connect_with("http", CodecKind::Http2).await?;
    let request = headers::request_with_headers(
        Method::GET,
        DEFAULT_PATH,
        &[("cookie", "a=b"), ("cookie", "c=d")],
    );
    harness.start_request(request).await?;
    harness.send_data(0, true).await?;
    harness.wait_for_next_upstream_request().await?;
    assert_eq!(harness.upstream_request().cookie().as_deref(), Some("a=b; c=d"));

    harness
        .upstream_request()
        .encode_headers(StatusCode::OK, HeaderMap::new(), false)
        .await?;
    harness.upstream_request().encode_data(512, false).await?;
    let collector = harness.response();
    collector.wait_for_body_data(512).await?;
    harness.send_reset().await?;
    match harness.upstream_codec().error_signal() {
        TeardownSignal::ConnectionClose => {
            harness.upstream_connection().wait_for_disconnect().await?
        }
        TeardownSignal::StreamReset => {
            harness.upstream_request().wait_for_reset().await?;
            harness.upstream_connection().close().await?;
            harness.upstream_connection().wait_for_disconnect().await?;
        }
    }
    harness.client_mut().close().await?;

    let upstream_request = harness.upstream_request();
    assert!(upstream_request.complete());
    assert_eq!(upstream_request.body_len(), 0);

    assert!(!collector.complete());
    assert_eq!(collector.status(), Some(StatusCode::OK));
    assert_eq!(collector.body_len(), 512);
    Ok(())
}

/// Upstream answers completely while the request is still open; the proxy
/// delivers the response and then tears the half-open exchange down.
pub async fn upstream_response_before_request_complete(harness: &mut Harness) -> Result<()> {
    harness.connect().await?;
    harness
        .start_request(headers::request(Method::GET, DEFAULT_PATH))
        .await?;
    harness.establish_upstream_connection().await?;
    harness.wait_for_new_upstream_stream().await?;
    harness.upstream_request().wait_for_headers_complete().await?;
    harness
        .upstream_request()
        .encode_headers(StatusCode::OK, HeaderMap::new(), false)
        .await?;
    harness.upstream_request().encode_data(512, true).await?;
    harness.response().wait_for_end_stream().await?;
    match harness.upstream_codec().error_signal() {
        TeardownSignal::ConnectionClose => {
            harness.upstream_connection().wait_for_disconnect().await?
        }
        TeardownSignal::StreamReset => {
            harness.upstream_request().wait_for_reset().await?;
            harness.upstream_connection().close().await?;
            harness.upstream_connection().wait_for_disconnect().await?;
        }
    }
    match harness.downstream_codec().error_signal() {
        TeardownSignal::ConnectionClose => harness.client_mut().wait_for_disconnect().await?,
        TeardownSignal::StreamReset => harness.client_mut().close().await?,
    }

    let upstream_request = harness.upstream_request();
    assert!(!upstream_request.complete());
    assert_eq!(upstream_request.body_len(), 0);

    let response = harness.response();
    assert!(response.complete());
    assert_eq!(response.status(), Some(StatusCode::OK));
    assert_eq!(response.body().len(), 512);
    Ok(())
}

/// First attempt fails with a 503; with the retry policy requested, the proxy
/// must reconnect (connection-oriented upstream) or reset-and-reuse
/// (multiplexed upstream) and the retried request must succeed.
pub async fn retry_on_5xx(harness: &mut Harness) -> Result<()> {
    harness.connect().await?;
    let request = headers::request_with_headers(
        Method::GET,
        DEFAULT_PATH,
        &[("x-forwarded-for", "10.0.0.1"), (RETRY_POLICY_HEADER, "5xx")],
    );
    let collector = harness.new_response();
    harness
        .client_mut()
        .make_request_with_body(request, 1024, &collector)
        .await?;
    harness.wait_for_next_upstream_request().await?;
    harness
        .upstream_request()
        .encode_headers(StatusCode::SERVICE_UNAVAILABLE, HeaderMap::new(), false)
        .await?;
    retry_reconnect(harness).await?;

    harness.wait_for_next_upstream_request().await?;
    harness
        .upstream_request()
        .encode_headers(StatusCode::OK, HeaderMap::new(), false)
        .await?;
    harness.upstream_request().encode_data(512, true).await?;
    collector.wait_for_end_stream().await?;

    let upstream_request = harness.upstream_request();
    assert!(upstream_request.complete());
    assert_eq!(upstream_request.body_len(), 1024);

    assert!(collector.complete());
    assert_eq!(collector.status(), Some(StatusCode::OK));
    assert_eq!(collector.body_len(), 512);

    harness.cleanup_upstream_and_downstream().await
}

/// gRPC-flavored retry: the failure is a trailer-carried `grpc-status`, not
/// an HTTP status, and the retried response carries its own trailers.
pub async fn grpc_retry(harness: &mut Harness) -> Result<()> {
    let response_trailers =
        headers::header_map(&[("response1", "trailer1"), ("grpc-status", "0")]);

    harness.connect_with("http", CodecKind::Http2).await?;
    let request = headers::request_with_headers(
        Method::POST,
        DEFAULT_PATH,
        &[
            ("x-forwarded-for", "10.0.0.1"),
            (GRPC_RETRY_POLICY_HEADER, "cancelled"),
        ],
    );
    harness.start_request(request).await?;
    harness.send_data(1024, true).await?;
    harness.wait_for_next_upstream_request().await?;
    harness
        .upstream_request()
        .encode_headers(
            StatusCode::OK,
            headers::header_map(&[("grpc-status", "1")]),
            false,
        )
        .await?;
    retry_reconnect(harness).await?;

    harness.wait_for_next_upstream_request().await?;
    let upstream_h2 = harness.upstream_codec() == CodecKind::Http2;
    harness
        .upstream_request()
        .encode_headers(StatusCode::OK, HeaderMap::new(), false)
        .await?;
    harness.upstream_request().encode_data(512, !upstream_h2).await?;
    if upstream_h2 {
        harness
            .upstream_request()
            .encode_trailers(response_trailers.clone())
            .await?;
    }
    let collector = harness.response();
    collector.wait_for_end_stream().await?;

    let upstream_request = harness.upstream_request();
    assert!(upstream_request.complete());
    assert_eq!(upstream_request.body_len(), 1024);

    assert!(collector.complete());
    assert_eq!(collector.status(), Some(StatusCode::OK));
    assert_eq!(collector.body_len(), 512);
    if upstream_h2 {
        assert_eq!(collector.trailers(), Some(response_trailers));
    }

    harness.client_mut().close().await?;
    harness.upstream_connection().close().await?;
    harness.upstream_connection().wait_for_disconnect().await
}

/// Between retry attempts the proxy either abandons the failed connection or
/// just the failed stream, depending on the upstream codec.
async fn retry_reconnect(harness: &mut Harness) -> Result<()> {
    match harness.upstream_codec().error_signal() {
        TeardownSignal::ConnectionClose => {
            harness.upstream_connection().wait_for_disconnect().await?;
            harness.upstream_connection = None;
        }
        TeardownSignal::StreamReset => harness.upstream_request().wait_for_reset().await?,
    }
    Ok(())
}

/// Two sequential exchanges on one downstream connection, sharing the
/// upstream connection.
pub async fn two_requests(harness: &mut Harness) -> Result<()> {
    harness.connect().await?;

    let collector = harness.new_response();
    harness
        .client_mut()
        .make_request_with_body(headers::request(Method::GET, DEFAULT_PATH), 1024, &collector)
        .await?;
    harness.wait_for_next_upstream_request().await?;
    harness
        .upstream_request()
        .encode_headers(StatusCode::OK, HeaderMap::new(), false)
        .await?;
    harness.upstream_request().encode_data(512, true).await?;
    collector.wait_for_end_stream().await?;
    assert!(harness.upstream_request().complete());
    assert_eq!(harness.upstream_request().body_len(), 1024);
    assert!(collector.complete());
    assert_eq!(collector.status(), Some(StatusCode::OK));
    assert_eq!(collector.body_len(), 512);

    let collector = harness.new_response();
    harness
        .client_mut()
        .make_request_with_body(headers::request(Method::GET, DEFAULT_PATH), 512, &collector)
        .await?;
    harness.wait_for_next_upstream_request().await?;
    harness
        .upstream_request()
        .encode_headers(StatusCode::OK, HeaderMap::new(), false)
        .await?;
    harness.upstream_request().encode_data(1024, true).await?;
    collector.wait_for_end_stream().await?;
    assert!(harness.upstream_request().complete());
    assert_eq!(harness.upstream_request().body_len(), 512);
    assert!(collector.complete());
    assert_eq!(collector.status(), Some(StatusCode::OK));
    assert_eq!(collector.body_len(), 1024);

    harness.cleanup_upstream_and_downstream().await
}

/// Trailers survive the round trip in both directions.
pub async fn trailers(harness: &mut Harness, request_size: usize, response_size: usize) -> Result<()> {
    let request_trailers =
        headers::header_map(&[("request1", "trailer1"), ("request2", "trailer2")]);
    let response_trailers =
        headers::header_map(&[("response1", "trailer1"), ("response2", "trailer2")]);

    harness.connect_with("http", CodecKind::Http2).await?;
    harness
        .start_request(headers::request(Method::POST, DEFAULT_PATH))
        .await?;
    harness.send_data(request_size, false).await?;
    harness.send_trailers(request_trailers.clone()).await?;
    harness.wait_for_next_upstream_request().await?;
    harness
        .upstream_request()
        .encode_headers(StatusCode::OK, HeaderMap::new(), false)
        .await?;
    harness.upstream_request().encode_data(response_size, false).await?;
    harness
        .upstream_request()
        .encode_trailers(response_trailers.clone())
        .await?;
    let collector = harness.response();
    collector.wait_for_end_stream().await?;
    harness.cleanup_upstream_and_downstream().await?;

    let upstream_h2 = harness.upstream_codec() == CodecKind::Http2;
    let upstream_request = harness.upstream_request();
    assert!(upstream_request.complete());
    assert_eq!(upstream_request.body_len(), request_size);
    if upstream_h2 {
        assert_eq!(upstream_request.trailers(), Some(request_trailers));
    }

    assert!(collector.complete());
    assert_eq!(collector.status(), Some(StatusCode::OK));
    assert_eq!(collector.body_len(), response_size);
    if upstream_h2 {
        assert_eq!(collector.trailers(), Some(response_trailers));
    }
    Ok(())
}

/// Explicit `content-length: 0` is valid and routes normally.
pub async fn valid_zero_length_content(harness: &mut Harness) -> Result<()> {
    harness
        .execute_actions(vec![
            step(|h| h.connect().boxed_local()),
            step(|h| {
                async move {
                    let request = headers::request_with_headers(
                        Method::POST,
                        DEFAULT_PATH,
                        &[("content-length", "0")],
                    );
                    h.send_request_and_wait_for_response(request, 0, 0).await
                }
                .boxed_local()
            }),
            step(|h| h.cleanup_upstream_and_downstream().boxed_local()),
        ])
        .await?;

    let response = harness.response();
    assert!(response.complete());
    assert_eq!(response.status(), Some(StatusCode::OK));
    Ok(())
}

/// Malformed `content-length: -1` is rejected at the downstream codec.
pub async fn invalid_content_length(harness: &mut Harness) -> Result<()> {
    rejected_request_framing(harness, "-1").await
}

/// Conflicting `content-length: 3,2` is rejected at the downstream codec.
pub async fn multiple_content_lengths(harness: &mut Harness) -> Result<()> {
    rejected_request_framing(harness, "3,2").await
}

async fn rejected_request_framing(harness: &mut Harness, content_length: &str) -> Result<()> {
    harness.connect().await?;
    let request = headers::request_with_headers(
        Method::POST,
        DEFAULT_PATH,
        &[("content-length", content_length)],
    );
    harness.start_request(request).await?;
    let collector = harness.response();
    match harness.downstream_codec().error_signal() {
        TeardownSignal::ConnectionClose => {
            harness.client_mut().wait_for_disconnect().await?;
            assert!(collector.complete());
            assert_eq!(collector.status(), Some(StatusCode::BAD_REQUEST));
        }
        TeardownSignal::StreamReset => {
            collector.wait_for_reset().await?;
            harness.client_mut().close().await?;
            assert!(collector.reset());
            assert_eq!(collector.reset_reason(), Some(ResetReason::RemoteReset));
        }
    }
    Ok(())
}

/// 60 KiB of request header data gets a 431 and a connection teardown.
pub async fn overly_long_headers(harness: &mut Harness) -> Result<()> {
    let mut request = headers::request(Method::GET, DEFAULT_PATH);
    request.headers_mut().insert("big", filler_header(60 * 1024));

    harness.connect().await?;
    harness.start_request(request).await?;
    harness.client_mut().wait_for_disconnect().await?;

    let response = harness.response();
    assert!(response.complete());
    assert_eq!(
        response.status(),
        Some(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE)
    );
    Ok(())
}

/// Upstream answers with non-HTTP garbage; the proxy must fail the exchange
/// as a 503 and drop the downstream connection.
pub async fn upstream_protocol_error(harness: &mut Harness) -> Result<()> {
    harness.connect_with("http", CodecKind::Http1).await?;
    harness
        .start_request(headers::request(Method::GET, DEFAULT_PATH))
        .await?;
    let upstream_connection = harness.upstream(0).wait_for_raw_connection().await?;
    // Enough to cover the proxied request head.
    upstream_connection.wait_for_data(64).await?;
    upstream_connection.write(b"bad protocol data!").await?;
    upstream_connection.wait_for_disconnect().await?;
    harness.client_mut().wait_for_disconnect().await?;

    let response = harness.response();
    assert!(response.complete());
    assert_eq!(response.status(), Some(StatusCode::SERVICE_UNAVAILABLE));
    Ok(())
}
