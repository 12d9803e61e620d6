//! Byte-level loopback: the raw TCP client against the codec-free upstream
//! connection.

mod common;

use proxy_harness::{CodecKind, FakeUpstream, RawTcpClient};

const RAW_RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok";

#[tokio::test]
async fn raw_bytes_cross_in_both_directions() {
    let upstream = FakeUpstream::bind(CodecKind::Http1, common::TIMEOUT)
        .await
        .unwrap();
    let client = RawTcpClient::connect(upstream.local_addr(), common::TIMEOUT)
        .await
        .unwrap();
    let connection = upstream.wait_for_raw_connection().await.unwrap();

    client.write(b"GET / HTTP/1.1\r\nHost: host\r\n\r\n").await.unwrap();
    connection.wait_for_data(16).await.unwrap();
    assert!(connection.data().starts_with(b"GET / HTTP/1.1\r\n"));

    connection.write(RAW_RESPONSE).await.unwrap();
    client.wait_for_data(b"HTTP/1.1 200 OK\r\n").await.unwrap();
    assert_eq!(client.data(), RAW_RESPONSE);

    connection.close().await;
    client.wait_for_disconnect().await.unwrap();

    client.close().await;
    connection.wait_for_disconnect().await.unwrap();
}

#[tokio::test]
async fn wait_for_any_data_fires_on_first_bytes() {
    let upstream = FakeUpstream::bind(CodecKind::Http1, common::TIMEOUT)
        .await
        .unwrap();
    let client = RawTcpClient::connect(upstream.local_addr(), common::TIMEOUT)
        .await
        .unwrap();
    let connection = upstream.wait_for_raw_connection().await.unwrap();

    connection.write(b"x").await.unwrap();
    client.wait_for_any_data().await.unwrap();
    assert_eq!(client.data(), b"x");
}
