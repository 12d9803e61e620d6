//! Request/response head builders and wire-text helpers shared by scenarios.

use http::{HeaderMap, HeaderName, HeaderValue, Method, Request};

/// Fixed sentinel substituted for the volatile `date` header when comparing
/// responses byte-for-byte.
pub const DATE_SENTINEL: &str = "date: Mon, 01 Jan 2017 00:00:00 GMT";

/// Build a request head for `path` against the default test authority.
pub fn request(method: Method, path: &str) -> Request<()> {
    request_to(method, "host", path)
}

/// Build a request head addressed to an explicit authority.
pub fn request_to(method: Method, authority: &str, path: &str) -> Request<()> {
    Request::builder()
        .method(method)
        .uri(format!("http://{authority}{path}"))
        .body(())
        .expect("valid request head")
}

/// Build a request head with extra headers appended (duplicates preserved).
pub fn request_with_headers(
    method: Method,
    path: &str,
    extra: &[(&str, &str)],
) -> Request<()> {
    let mut built = request(method, path);
    for (name, value) in extra {
        built.headers_mut().append(
            name.parse::<HeaderName>().expect("valid header name"),
            HeaderValue::from_str(value).expect("valid header value"),
        );
    }
    built
}

/// Build a header map from name/value pairs (duplicates preserved).
pub fn header_map(entries: &[(&str, &str)]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in entries {
        map.append(
            name.parse::<HeaderName>().expect("valid header name"),
            HeaderValue::from_str(value).expect("valid header value"),
        );
    }
    map
}

/// Replace any `date` header line with a fixed sentinel so two responses can
/// be compared byte-for-byte.
pub fn normalize_date(response: &str) -> String {
    response
        .split("\r\n")
        .map(|line| {
            if line.len() >= 5 && line[..5].eq_ignore_ascii_case("date:") {
                DATE_SENTINEL
            } else {
                line
            }
        })
        .collect::<Vec<_>>()
        .join("\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_date_replaces_only_date_lines() {
        let input = "HTTP/1.1 200 OK\r\ndate: Tue, 25 Aug 2026 10:00:00 GMT\r\nserver: proxy\r\n\r\n";
        let normalized = normalize_date(input);
        assert!(normalized.contains(DATE_SENTINEL));
        assert!(normalized.contains("server: proxy"));
        assert!(!normalized.contains("2026"));
    }

    #[test]
    fn normalize_date_is_case_insensitive() {
        let input = "Date: Tue, 25 Aug 2026 10:00:00 GMT\r\n";
        assert!(normalize_date(input).contains(DATE_SENTINEL));
    }

    #[test]
    fn duplicate_headers_are_preserved_in_order() {
        let built = request_with_headers(
            Method::GET,
            "/test/long/url",
            &[("cookie", "a=b"), ("cookie", "c=d")],
        );
        let cookies: Vec<_> = built.headers().get_all("cookie").iter().collect();
        assert_eq!(cookies, vec!["a=b", "c=d"]);
    }
}
