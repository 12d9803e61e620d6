//! HTTP/1.1 wire framing.
//!
//! # Responsibilities
//! - Serialize request and response heads byte-exactly
//! - Parse heads incrementally from a receive buffer
//! - Decode message bodies (content-length, chunked with trailers, read-to-EOF)
//!
//! # Design Decisions
//! - Heads are serialized from `http` types but never validated beyond what
//!   the type system enforces; scenarios deliberately send invalid framing
//!   headers (`content-length: -1`) and the codec must pass them through
//! - Shared between the downstream client driver and the fake upstream, which
//!   parse responses and requests respectively

use bytes::{Buf, BytesMut};
use http::header::{HeaderName, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderValue, Method, Request, StatusCode};

use crate::error::{HarnessError, Result};

const MAX_HEADERS: usize = 128;

/// How a message body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// No body follows the head.
    None,
    ContentLength(u64),
    Chunked,
    /// Body runs until the peer closes the connection (responses only).
    ToEof,
}

/// Parsed request head, as seen by the fake upstream.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
}

/// Parsed response head, as seen by the client driver.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

/// Select body framing for an incoming request head.
pub fn request_body_framing(headers: &HeaderMap) -> Result<BodyFraming> {
    framing_from_headers(headers, BodyFraming::None)
}

/// Select body framing for an incoming response head.
pub fn response_body_framing(status: StatusCode, headers: &HeaderMap) -> Result<BodyFraming> {
    if status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        return Ok(BodyFraming::None);
    }
    framing_from_headers(headers, BodyFraming::ToEof)
}

fn framing_from_headers(headers: &HeaderMap, fallback: BodyFraming) -> Result<BodyFraming> {
    if let Some(te) = headers.get(TRANSFER_ENCODING) {
        let te = te
            .to_str()
            .map_err(|_| HarnessError::WireParse("non-ASCII transfer-encoding".into()))?;
        if te.to_ascii_lowercase().contains("chunked") {
            return Ok(BodyFraming::Chunked);
        }
    }
    if let Some(cl) = headers.get(CONTENT_LENGTH) {
        let cl = cl
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .ok_or_else(|| HarnessError::WireParse("unparseable content-length".into()))?;
        return Ok(BodyFraming::ContentLength(cl));
    }
    Ok(fallback)
}

// --- head serialization ---

/// Serialize a request head. A `host` header is synthesized from the URI
/// authority when absent; everything else goes out exactly as given.
pub fn encode_request_head(request: &Request<()>) -> Vec<u8> {
    let path = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let mut out = format!("{} {} HTTP/1.1\r\n", request.method(), path).into_bytes();
    if !request.headers().contains_key(HOST) {
        if let Some(authority) = request.uri().authority() {
            out.extend_from_slice(format!("host: {authority}\r\n").as_bytes());
        }
    }
    encode_header_lines(request.headers(), &mut out);
    out.extend_from_slice(b"\r\n");
    out
}

/// Serialize a response head.
pub fn encode_response_head(status: StatusCode, headers: &HeaderMap) -> Vec<u8> {
    let reason = status.canonical_reason().unwrap_or("");
    let mut out = format!("HTTP/1.1 {} {}\r\n", status.as_u16(), reason).into_bytes();
    encode_header_lines(headers, &mut out);
    out.extend_from_slice(b"\r\n");
    out
}

fn encode_header_lines(headers: &HeaderMap, out: &mut Vec<u8>) {
    for (name, value) in headers.iter() {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
}

/// Serialize one data chunk in chunked transfer encoding.
pub fn encode_chunk(data: &[u8]) -> Vec<u8> {
    let mut out = format!("{:x}\r\n", data.len()).into_bytes();
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
    out
}

/// Serialize the chunked terminator, with an optional trailer section.
pub fn encode_last_chunk(trailers: Option<&HeaderMap>) -> Vec<u8> {
    let mut out = b"0\r\n".to_vec();
    if let Some(trailers) = trailers {
        encode_header_lines(trailers, &mut out);
    }
    out.extend_from_slice(b"\r\n");
    out
}

// --- head parsing ---

/// Try to parse a request head from the front of `buf`.
///
/// Returns the head and consumed byte count, or `None` if more data is
/// needed.
pub fn parse_request_head(buf: &[u8]) -> Result<Option<(RequestHead, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut headers);
    match parsed.parse(buf) {
        Ok(httparse::Status::Complete(consumed)) => {
            let method = parsed
                .method
                .and_then(|m| Method::from_bytes(m.as_bytes()).ok())
                .ok_or_else(|| HarnessError::WireParse("bad request method".into()))?;
            let path = parsed.path.unwrap_or("/").to_string();
            let headers = collect_headers(parsed.headers)?;
            Ok(Some((RequestHead { method, path, headers }, consumed)))
        }
        Ok(httparse::Status::Partial) => Ok(None),
        Err(err) => Err(HarnessError::WireParse(err.to_string())),
    }
}

/// Try to parse a response head from the front of `buf`.
pub fn parse_response_head(buf: &[u8]) -> Result<Option<(ResponseHead, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Response::new(&mut headers);
    match parsed.parse(buf) {
        Ok(httparse::Status::Complete(consumed)) => {
            let status = parsed
                .code
                .and_then(|c| StatusCode::from_u16(c).ok())
                .ok_or_else(|| HarnessError::WireParse("bad response status".into()))?;
            let headers = collect_headers(parsed.headers)?;
            Ok(Some((ResponseHead { status, headers }, consumed)))
        }
        Ok(httparse::Status::Partial) => Ok(None),
        Err(err) => Err(HarnessError::WireParse(err.to_string())),
    }
}

fn collect_headers(raw: &[httparse::Header<'_>]) -> Result<HeaderMap> {
    let mut map = HeaderMap::with_capacity(raw.len());
    for header in raw {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|_| HarnessError::WireParse(format!("bad header name {:?}", header.name)))?;
        let value = HeaderValue::from_bytes(header.value)
            .map_err(|_| HarnessError::WireParse("bad header value".into()))?;
        map.append(name, value);
    }
    Ok(map)
}

// --- body decoding ---

/// Progress events emitted while decoding a message body.
#[derive(Debug, PartialEq)]
pub enum BodyEvent {
    Data(Vec<u8>),
    Trailers(HeaderMap),
    End,
}

#[derive(Debug)]
enum ChunkPhase {
    Size,
    Data { remaining: u64 },
    DataCrlf,
    Trailers,
}

/// Incremental body decoder for one message.
#[derive(Debug)]
pub struct BodyDecoder {
    framing: BodyFraming,
    chunk_phase: ChunkPhase,
    remaining: u64,
    done: bool,
}

impl BodyDecoder {
    pub fn new(framing: BodyFraming) -> Self {
        let remaining = match framing {
            BodyFraming::ContentLength(n) => n,
            _ => 0,
        };
        Self {
            framing,
            chunk_phase: ChunkPhase::Size,
            remaining,
            done: matches!(framing, BodyFraming::None)
                || matches!(framing, BodyFraming::ContentLength(0)),
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Consume decodable bytes from `buf`. Returns `None` when more input is
    /// needed; emits `BodyEvent::End` exactly once when the body completes.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<BodyEvent>> {
        if self.done {
            return Ok(None);
        }
        match self.framing {
            BodyFraming::None => unreachable!("no-body framing is done at construction"),
            BodyFraming::ContentLength(_) => {
                if buf.is_empty() {
                    return Ok(None);
                }
                let take = (self.remaining).min(buf.len() as u64) as usize;
                let data = buf.split_to(take).to_vec();
                self.remaining -= take as u64;
                if self.remaining == 0 {
                    self.done = true;
                }
                Ok(Some(BodyEvent::Data(data)))
            }
            BodyFraming::ToEof => {
                if buf.is_empty() {
                    return Ok(None);
                }
                let data = buf.split_to(buf.len()).to_vec();
                Ok(Some(BodyEvent::Data(data)))
            }
            BodyFraming::Chunked => self.decode_chunked(buf),
        }
    }

    /// Signal remote close. Read-to-EOF bodies complete here; anything else
    /// left mid-body is a truncated message.
    pub fn on_eof(&mut self) -> Result<Option<BodyEvent>> {
        if self.done {
            return Ok(None);
        }
        match self.framing {
            BodyFraming::ToEof => {
                self.done = true;
                Ok(Some(BodyEvent::End))
            }
            _ => Err(HarnessError::WireParse("connection closed mid-body".into())),
        }
    }

    fn decode_chunked(&mut self, buf: &mut BytesMut) -> Result<Option<BodyEvent>> {
        loop {
            match self.chunk_phase {
                ChunkPhase::Size => {
                    let Some(line) = take_line(buf) else {
                        return Ok(None);
                    };
                    let size_text = line.split(';').next().unwrap_or("").trim();
                    let size = u64::from_str_radix(size_text, 16).map_err(|_| {
                        HarnessError::WireParse(format!("bad chunk size {size_text:?}"))
                    })?;
                    if size == 0 {
                        self.chunk_phase = ChunkPhase::Trailers;
                    } else {
                        self.chunk_phase = ChunkPhase::Data { remaining: size };
                    }
                }
                ChunkPhase::Data { remaining } => {
                    if buf.is_empty() {
                        return Ok(None);
                    }
                    let take = remaining.min(buf.len() as u64) as usize;
                    let data = buf.split_to(take).to_vec();
                    let left = remaining - take as u64;
                    self.chunk_phase = if left == 0 {
                        ChunkPhase::DataCrlf
                    } else {
                        ChunkPhase::Data { remaining: left }
                    };
                    return Ok(Some(BodyEvent::Data(data)));
                }
                ChunkPhase::DataCrlf => {
                    if buf.len() < 2 {
                        return Ok(None);
                    }
                    if &buf[..2] != b"\r\n" {
                        return Err(HarnessError::WireParse("missing chunk CRLF".into()));
                    }
                    buf.advance(2);
                    self.chunk_phase = ChunkPhase::Size;
                }
                ChunkPhase::Trailers => {
                    // Collect trailer lines up to the blank line, if present.
                    let Some(section_len) = trailer_section_len(buf) else {
                        return Ok(None);
                    };
                    let section = buf.split_to(section_len);
                    self.done = true;
                    let trailers = parse_trailer_lines(&section)?;
                    if trailers.is_empty() {
                        return Ok(Some(BodyEvent::End));
                    }
                    return Ok(Some(BodyEvent::Trailers(trailers)));
                }
            }
        }
    }
}

/// Take one CRLF-terminated line off the front of `buf`, sans terminator.
fn take_line(buf: &mut BytesMut) -> Option<String> {
    let pos = buf.windows(2).position(|w| w == b"\r\n")?;
    let line = String::from_utf8_lossy(&buf[..pos]).into_owned();
    buf.advance(pos + 2);
    Some(line)
}

/// Length of the trailer section including its terminating blank line, or
/// `None` if the section is not yet complete in `buf`.
fn trailer_section_len(buf: &[u8]) -> Option<usize> {
    if buf.starts_with(b"\r\n") {
        return Some(2);
    }
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn parse_trailer_lines(section: &[u8]) -> Result<HeaderMap> {
    let mut map = HeaderMap::new();
    let text = String::from_utf8_lossy(section);
    for line in text.split("\r\n").filter(|l| !l.is_empty()) {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| HarnessError::WireParse(format!("bad trailer line {line:?}")))?;
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|_| HarnessError::WireParse("bad trailer name".into()))?;
        let value = HeaderValue::from_str(value.trim())
            .map_err(|_| HarnessError::WireParse("bad trailer value".into()))?;
        map.append(name, value);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_head_round_trip() {
        let request = Request::builder()
            .method(Method::GET)
            .uri("http://host/test/long/url")
            .header("x-custom", "1")
            .body(())
            .unwrap();
        let wire = encode_request_head(&request);
        let text = String::from_utf8(wire.clone()).unwrap();
        assert!(text.starts_with("GET /test/long/url HTTP/1.1\r\n"));
        assert!(text.contains("host: host\r\n"));
        assert!(text.ends_with("\r\n\r\n"));

        let (head, consumed) = parse_request_head(&wire).unwrap().unwrap();
        assert_eq!(consumed, wire.len());
        assert_eq!(head.method, Method::GET);
        assert_eq!(head.path, "/test/long/url");
        assert_eq!(head.headers.get("x-custom").unwrap(), "1");
    }

    #[test]
    fn invalid_framing_headers_serialize_verbatim() {
        let request = Request::builder()
            .method(Method::POST)
            .uri("http://host/test/long/url")
            .header("content-length", "-1")
            .body(())
            .unwrap();
        let text = String::from_utf8(encode_request_head(&request)).unwrap();
        assert!(text.contains("content-length: -1\r\n"));
    }

    #[test]
    fn partial_head_asks_for_more() {
        assert!(parse_response_head(b"HTTP/1.1 200 OK\r\ncont").unwrap().is_none());
    }

    #[test]
    fn response_framing_selection() {
        let mut headers = HeaderMap::new();
        assert_eq!(
            response_body_framing(StatusCode::OK, &headers).unwrap(),
            BodyFraming::ToEof
        );
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("12"));
        assert_eq!(
            response_body_framing(StatusCode::OK, &headers).unwrap(),
            BodyFraming::ContentLength(12)
        );
        headers.remove(CONTENT_LENGTH);
        headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        assert_eq!(
            response_body_framing(StatusCode::OK, &headers).unwrap(),
            BodyFraming::Chunked
        );
        assert_eq!(
            response_body_framing(StatusCode::NO_CONTENT, &headers).unwrap(),
            BodyFraming::None
        );
    }

    #[test]
    fn content_length_body_decodes_and_completes() {
        let mut decoder = BodyDecoder::new(BodyFraming::ContentLength(5));
        let mut buf = BytesMut::from(&b"hello remainder"[..]);
        assert_eq!(
            decoder.decode(&mut buf).unwrap(),
            Some(BodyEvent::Data(b"hello".to_vec()))
        );
        assert!(decoder.is_done());
        assert_eq!(&buf[..], b" remainder");
    }

    #[test]
    fn chunked_body_with_trailers() {
        let mut decoder = BodyDecoder::new(BodyFraming::Chunked);
        let mut buf = BytesMut::from(&b"4\r\nwiki\r\n0\r\nresponse1: trailer1\r\n\r\n"[..]);
        assert_eq!(
            decoder.decode(&mut buf).unwrap(),
            Some(BodyEvent::Data(b"wiki".to_vec()))
        );
        match decoder.decode(&mut buf).unwrap() {
            Some(BodyEvent::Trailers(trailers)) => {
                assert_eq!(trailers.get("response1").unwrap(), "trailer1");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(decoder.is_done());
    }

    #[test]
    fn chunked_body_without_trailers_ends() {
        let mut decoder = BodyDecoder::new(BodyFraming::Chunked);
        let mut buf = BytesMut::from(&b"3\r\nabc\r\n0\r\n\r\n"[..]);
        assert_eq!(
            decoder.decode(&mut buf).unwrap(),
            Some(BodyEvent::Data(b"abc".to_vec()))
        );
        assert_eq!(decoder.decode(&mut buf).unwrap(), Some(BodyEvent::End));
    }

    #[test]
    fn chunked_split_across_reads() {
        let mut decoder = BodyDecoder::new(BodyFraming::Chunked);
        let mut buf = BytesMut::from(&b"4\r\nwi"[..]);
        assert_eq!(
            decoder.decode(&mut buf).unwrap(),
            Some(BodyEvent::Data(b"wi".to_vec()))
        );
        assert_eq!(decoder.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b"ki\r\n0\r\n\r\n");
        assert_eq!(
            decoder.decode(&mut buf).unwrap(),
            Some(BodyEvent::Data(b"ki".to_vec()))
        );
        assert_eq!(decoder.decode(&mut buf).unwrap(), Some(BodyEvent::End));
    }

    #[test]
    fn to_eof_body_ends_on_close() {
        let mut decoder = BodyDecoder::new(BodyFraming::ToEof);
        let mut buf = BytesMut::from(&b"partial"[..]);
        assert_eq!(
            decoder.decode(&mut buf).unwrap(),
            Some(BodyEvent::Data(b"partial".to_vec()))
        );
        assert_eq!(decoder.on_eof().unwrap(), Some(BodyEvent::End));
    }

    #[test]
    fn chunk_encoding_round_trip() {
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&encode_chunk(b"abcde"));
        wire.extend_from_slice(&encode_last_chunk(None));
        let mut decoder = BodyDecoder::new(BodyFraming::Chunked);
        assert_eq!(
            decoder.decode(&mut wire).unwrap(),
            Some(BodyEvent::Data(b"abcde".to_vec()))
        );
        assert_eq!(decoder.decode(&mut wire).unwrap(), Some(BodyEvent::End));
    }
}
