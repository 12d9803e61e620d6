//! Byte-level protocol-edge scenarios.
//!
//! These drive the proxy's HTTP/1.1 parser with raw bytes and assert the
//! exact response bytes, so nothing here goes through a codec. Two exchange
//! shapes exist: reject paths where the proxy closes the connection (read
//! until disconnect) and answer paths where the client closes after the
//! first response bytes.

use crate::error::Result;
use crate::headers::normalize_date;
use crate::tcp::RawTcpClient;

use super::Harness;

/// The proxy's exact reject response for unparseable requests.
pub const BAD_REQUEST_RESPONSE: &[u8] =
    b"HTTP/1.1 400 Bad Request\r\ncontent-length: 0\r\nconnection: close\r\n\r\n";

/// Write `raw` and read until the proxy closes, returning everything
/// received.
async fn send_raw_until_close(harness: &Harness, port_name: &str, raw: &[u8]) -> Result<Vec<u8>> {
    let client = RawTcpClient::connect(harness.listener_addr(port_name), harness.wait_timeout()).await?;
    client.write(raw).await?;
    client.wait_for_disconnect().await?;
    Ok(client.data())
}

/// Write `raw`, wait for the first response bytes, then close from our side.
async fn send_raw_and_take_first(harness: &Harness, port_name: &str, raw: &[u8]) -> Result<Vec<u8>> {
    let client = RawTcpClient::connect(harness.listener_addr(port_name), harness.wait_timeout()).await?;
    client.write(raw).await?;
    client.wait_for_any_data().await?;
    client.close().await;
    Ok(client.data())
}

pub async fn bad_first_line(harness: &Harness) -> Result<()> {
    let response = send_raw_until_close(harness, "http", b"hello").await?;
    assert_eq!(response, BAD_REQUEST_RESPONSE);
    Ok(())
}

pub async fn missing_delimiter(harness: &Harness) -> Result<()> {
    let response =
        send_raw_until_close(harness, "http", b"GET / HTTP/1.1\r\nHost: host\r\nfoo bar\r\n\r\n")
            .await?;
    assert_eq!(response, BAD_REQUEST_RESPONSE);
    Ok(())
}

pub async fn invalid_character_in_first_line(harness: &Harness) -> Result<()> {
    let response =
        send_raw_until_close(harness, "http", b"GE(T / HTTP/1.1\r\nHost: host\r\n\r\n").await?;
    assert_eq!(response, BAD_REQUEST_RESPONSE);
    Ok(())
}

pub async fn low_version(harness: &Harness) -> Result<()> {
    let response =
        send_raw_until_close(harness, "http", b"GET / HTTP/0.8\r\nHost: host\r\n\r\n").await?;
    assert_eq!(response, BAD_REQUEST_RESPONSE);
    Ok(())
}

/// HTTP/1.0 is not served; the proxy demands an upgrade.
pub async fn http10_request(harness: &Harness) -> Result<()> {
    let response = send_raw_and_take_first(harness, "http", b"GET / HTTP/1.0\r\n\r\n").await?;
    assert!(response.starts_with(b"HTTP/1.1 426 Upgrade Required\r\n"));
    Ok(())
}

pub async fn no_host(harness: &Harness) -> Result<()> {
    let response = send_raw_and_take_first(harness, "http", b"GET / HTTP/1.1\r\n\r\n").await?;
    assert!(response.starts_with(b"HTTP/1.1 400 Bad Request\r\n"));
    Ok(())
}

/// An absolute request URL is routable on the forwarding listener.
pub async fn absolute_path(harness: &Harness) -> Result<()> {
    let response = send_raw_and_take_first(
        harness,
        "http_forward",
        b"GET http://www.redirect.com HTTP/1.1\r\nHost: host\r\n\r\n",
    )
    .await?;
    assert!(!response.starts_with(b"HTTP/1.1 404 Not Found\r\n"));
    Ok(())
}

pub async fn absolute_path_with_port(harness: &Harness) -> Result<()> {
    let response = send_raw_and_take_first(
        harness,
        "http_forward",
        b"GET http://www.namewithport.com:1234 HTTP/1.1\r\nHost: host\r\n\r\n",
    )
    .await?;
    assert!(!response.starts_with(b"HTTP/1.1 404 Not Found\r\n"));
    Ok(())
}

/// Dropping the port changes the matched domain, so the route disappears.
pub async fn absolute_path_without_port(harness: &Harness) -> Result<()> {
    let response = send_raw_and_take_first(
        harness,
        "http_forward",
        b"GET http://www.namewithport.com HTTP/1.1\r\nHost: host\r\n\r\n",
    )
    .await?;
    assert!(response.starts_with(b"HTTP/1.1 404 Not Found\r\n"));
    Ok(())
}

/// An absolute URL for an unrouted domain on the plain listener is a 404.
pub async fn bad_path(harness: &Harness) -> Result<()> {
    let response = send_raw_and_take_first(
        harness,
        "http",
        b"GET http://api.example.com HTTP/1.1\r\nHost: host\r\n\r\n",
    )
    .await?;
    assert!(response.starts_with(b"HTTP/1.1 404 Not Found\r\n"));
    Ok(())
}

/// Relative URLs behave identically whether or not the listener accepts
/// absolute ones.
pub async fn relative_url_equivalence(harness: &Harness) -> Result<()> {
    equivalent(harness, b"GET /foo/bar HTTP/1.1\r\nHost: host\r\n\r\n").await
}

/// CONNECT behaves identically on both listeners.
pub async fn connect_equivalence(harness: &Harness) -> Result<()> {
    equivalent(harness, b"CONNECT www.somewhere.com:80 HTTP/1.1\r\nHost: host\r\n\r\n").await
}

/// Send the identical raw request to both listeners and require
/// byte-identical responses once the volatile `date` header is normalized.
async fn equivalent(harness: &Harness, raw: &[u8]) -> Result<()> {
    let first = send_raw_and_take_first(harness, "http", raw).await?;
    let second = send_raw_and_take_first(harness, "http_forward", raw).await?;
    assert_eq!(
        normalize_date(&String::from_utf8_lossy(&first)),
        normalize_date(&String::from_utf8_lossy(&second))
    );
    Ok(())
}
