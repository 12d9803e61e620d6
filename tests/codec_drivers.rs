//! Driver-level loopback coverage: the codec client talks directly to the
//! fake upstream, so both halves of each protocol path get exercised against
//! each other.

mod common;

use http::{HeaderMap, Method, StatusCode};
use proxy_harness::{headers, ResetReason};

#[tokio::test]
async fn h1_partial_body_wait_is_released_by_end_of_stream() {
    let (mut client, connection, _upstream) = common::h1_pair().await;
    let response = common::collector();
    client
        .make_header_only_request(headers::request(Method::GET, "/partial"), &response)
        .await
        .unwrap();

    let request = connection.wait_for_new_stream().await.unwrap();
    request.wait_for_end_stream().await.unwrap();
    request
        .encode_headers(StatusCode::OK, HeaderMap::new(), false)
        .await
        .unwrap();
    request.encode_data(256, true).await.unwrap();

    // Asks for more than will ever arrive; end-of-stream must release it.
    response.wait_for_body_data(1024).await.unwrap();
    assert_eq!(response.body_len(), 256);
    assert!(response.complete());

    // Idempotent once terminal.
    response.wait_for_end_stream().await.unwrap();
    response.wait_for_end_stream().await.unwrap();
}

#[tokio::test]
async fn h2_header_only_round_trip() {
    let (mut client, connection, _upstream) = common::h2_pair().await;
    let response = common::collector();
    client
        .make_header_only_request(headers::request(Method::GET, "/ping"), &response)
        .await
        .unwrap();

    let request = connection.wait_for_new_stream().await.unwrap();
    request.wait_for_end_stream().await.unwrap();
    assert_eq!(request.method(), Some(Method::GET));
    assert_eq!(request.path().as_deref(), Some("/ping"));
    assert_eq!(request.body_len(), 0);

    request
        .encode_headers(StatusCode::OK, HeaderMap::new(), true)
        .await
        .unwrap();
    response.wait_for_end_stream().await.unwrap();
    assert_eq!(response.status(), Some(StatusCode::OK));
    assert_eq!(response.body_len(), 0);
}

#[tokio::test]
async fn h2_bodies_and_trailers_round_trip() {
    let request_trailers = headers::header_map(&[("request1", "trailer1")]);
    let response_trailers = headers::header_map(&[("response1", "trailer1")]);

    let (mut client, connection, _upstream) = common::h2_pair().await;
    let response = common::collector();
    let mut stream = client
        .start_request(headers::request(Method::POST, "/stream"), &response)
        .await
        .unwrap();
    client.send_data(&mut stream, 64, false).await.unwrap();
    client
        .send_trailers(&mut stream, request_trailers.clone())
        .await
        .unwrap();

    let request = connection.wait_for_new_stream().await.unwrap();
    request.wait_for_end_stream().await.unwrap();
    assert_eq!(request.body_len(), 64);
    assert_eq!(request.trailers(), Some(request_trailers));

    request
        .encode_headers(StatusCode::OK, HeaderMap::new(), false)
        .await
        .unwrap();
    request.encode_data(128, false).await.unwrap();
    request
        .encode_trailers(response_trailers.clone())
        .await
        .unwrap();

    response.wait_for_end_stream().await.unwrap();
    assert!(response.complete());
    assert_eq!(response.body_len(), 128);
    assert_eq!(response.trailers(), Some(response_trailers));
}

#[tokio::test]
async fn h2_client_reset_reaches_the_upstream_stream() {
    let (mut client, connection, _upstream) = common::h2_pair().await;
    let response = common::collector();
    let mut stream = client
        .start_request(headers::request(Method::POST, "/reset"), &response)
        .await
        .unwrap();

    let request = connection.wait_for_new_stream().await.unwrap();
    client.send_reset(&mut stream).await.unwrap();
    request.wait_for_reset().await.unwrap();
    assert!(request.reset());
    assert!(!request.complete());
}

#[tokio::test]
async fn h2_upstream_reset_reaches_the_client_stream() {
    let (mut client, connection, _upstream) = common::h2_pair().await;
    let response = common::collector();
    client
        .start_request(headers::request(Method::POST, "/reset"), &response)
        .await
        .unwrap();

    let request = connection.wait_for_new_stream().await.unwrap();
    request.encode_reset().await.unwrap();

    response.wait_for_reset().await.unwrap();
    assert!(response.reset());
    assert!(!response.complete());
    assert_eq!(response.reset_reason(), Some(ResetReason::RemoteReset));
}

#[tokio::test]
async fn h2_reset_after_complete_request_is_still_observed() {
    let (mut client, connection, _upstream) = common::h2_pair().await;
    let response = common::collector();
    let mut stream = client
        .start_request(headers::request(Method::POST, "/late-reset"), &response)
        .await
        .unwrap();
    client.send_data(&mut stream, 32, true).await.unwrap();

    let request = connection.wait_for_new_stream().await.unwrap();
    request.wait_for_end_stream().await.unwrap();
    assert!(request.complete());

    client.send_reset(&mut stream).await.unwrap();
    request.wait_for_reset().await.unwrap();
    assert!(request.complete());
    assert!(request.reset());
}

#[tokio::test]
async fn h1_explicit_framing_headers_pass_through_verbatim() {
    let (mut client, connection, _upstream) = common::h1_pair().await;
    let response = common::collector();
    let request = headers::request_with_headers(
        Method::POST,
        "/framed",
        &[("content-length", "5")],
    );
    let mut stream = client.start_request(request, &response).await.unwrap();
    client
        .send_data_buf(&mut stream, bytes::Bytes::from_static(b"hello"), true)
        .await
        .unwrap();

    let upstream_request = connection.wait_for_new_stream().await.unwrap();
    upstream_request.wait_for_end_stream().await.unwrap();
    assert_eq!(upstream_request.body(), b"hello");
    // The caller's framing header went out untouched; no chunked encoding.
    assert_eq!(
        upstream_request
            .headers()
            .get(http::header::CONTENT_LENGTH)
            .map(|v| v.as_bytes()),
        Some(&b"5"[..])
    );
    assert!(!upstream_request
        .headers()
        .contains_key(http::header::TRANSFER_ENCODING));
}
