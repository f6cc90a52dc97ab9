//! Minimal HTTP/1.1 framing for the status server.
//!
//! # Request handling
//!
//! Only the request line is interpreted. Headers are accumulated up to the
//! blank-line terminator so the peer sees an orderly close, but their
//! contents are ignored. The target must be in origin form (`/path?query`).
//!
//! # Responses
//!
//! Every response carries an exact `Content-Length` and `Connection: close`;
//! one request is served per connection.

use url::form_urlencoded;

use crate::error::{ProtocolError, Result};

/// Blank line separating the header block from the body.
pub const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Content type of the status JSON endpoint.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Content type of the HTML viewer page.
pub const CONTENT_TYPE_HTML: &str = "text/html; charset=utf-8";

/// Content type of short diagnostic bodies.
pub const CONTENT_TYPE_TEXT: &str = "text/plain; charset=utf-8";

/// Returns the offset just past the header terminator, if present.
pub fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_TERMINATOR.len())
        .position(|window| window == HEADER_TERMINATOR)
        .map(|pos| pos + HEADER_TERMINATOR.len())
}

/// A parsed request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    method: String,
    path: String,
    query: Vec<(String, String)>,
}

impl HttpRequest {
    /// Parses the request line at the start of `buf`.
    ///
    /// The line may end with `\r\n`, `\n`, or the end of the buffer. The
    /// HTTP version token is optional so that bare `GET /path` requests still
    /// get a response.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let line_end = buf
            .iter()
            .position(|&b| b == b'\n')
            .unwrap_or(buf.len());
        let line = std::str::from_utf8(&buf[..line_end])
            .map_err(|_| ProtocolError::InvalidEncoding)?
            .trim_end_matches('\r');

        if line.trim().is_empty() {
            return Err(ProtocolError::MissingRequestLine);
        }

        let mut parts = line.split_ascii_whitespace();
        let (method, target) = match (parts.next(), parts.next()) {
            (Some(method), Some(target)) => (method, target),
            _ => return Err(ProtocolError::MalformedRequestLine(line.to_string())),
        };

        match parts.next() {
            None => {}
            Some(version) if version.starts_with("HTTP/") && parts.next().is_none() => {}
            Some(_) => return Err(ProtocolError::MalformedRequestLine(line.to_string())),
        }

        if !target.starts_with('/') {
            return Err(ProtocolError::InvalidTarget(target.to_string()));
        }

        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path, query),
            None => (target, ""),
        };

        let query = form_urlencoded::parse(query.as_bytes())
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        Ok(Self {
            method: method.to_string(),
            path: path.to_string(),
            query,
        })
    }

    /// Returns the request method, as sent.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Returns the path component of the target, without the query string.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the first decoded value of query parameter `name`.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

/// HTTP status codes the server emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    /// 200 OK
    Ok,
    /// 400 Bad Request
    BadRequest,
    /// 403 Forbidden
    Forbidden,
}

impl StatusCode {
    /// Returns the numeric code.
    pub fn as_u16(self) -> u16 {
        match self {
            StatusCode::Ok => 200,
            StatusCode::BadRequest => 400,
            StatusCode::Forbidden => 403,
        }
    }

    /// Returns the canonical reason phrase.
    pub fn reason(self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::BadRequest => "Bad Request",
            StatusCode::Forbidden => "Forbidden",
        }
    }
}

/// A complete response, ready to be written and followed by a close.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    status: StatusCode,
    content_type: &'static str,
    body: Vec<u8>,
}

impl HttpResponse {
    /// Creates a response with an arbitrary status and body.
    pub fn new(status: StatusCode, content_type: &'static str, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            content_type,
            body: body.into(),
        }
    }

    /// `200` with a JSON body.
    pub fn json(body: impl Into<Vec<u8>>) -> Self {
        Self::new(StatusCode::Ok, CONTENT_TYPE_JSON, body)
    }

    /// `200` with an HTML body.
    pub fn html(body: impl Into<Vec<u8>>) -> Self {
        Self::new(StatusCode::Ok, CONTENT_TYPE_HTML, body)
    }

    /// `403` with the plain-text body `Forbidden`.
    pub fn forbidden() -> Self {
        Self::new(StatusCode::Forbidden, CONTENT_TYPE_TEXT, "Forbidden")
    }

    /// `400` with the plain-text body `Bad Request`.
    pub fn bad_request() -> Self {
        Self::new(StatusCode::BadRequest, CONTENT_TYPE_TEXT, "Bad Request")
    }

    /// Returns the status code.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Returns the `Content-Type` header value.
    pub fn content_type(&self) -> &'static str {
        self.content_type
    }

    /// Returns the body bytes.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Encodes the status line, headers and body.
    pub fn to_bytes(&self) -> Vec<u8> {
        let head = format!(
            "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            self.status.as_u16(),
            self.status.reason(),
            self.content_type,
            self.body.len()
        );

        let mut out = Vec::with_capacity(head.len() + self.body.len());
        out.extend_from_slice(head.as_bytes());
        out.extend_from_slice(&self.body);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_get() {
        let req = HttpRequest::parse(b"GET /stats?key=abc HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
        assert_eq!(req.method(), "GET");
        assert_eq!(req.path(), "/stats");
        assert_eq!(req.query_param("key"), Some("abc"));
    }

    #[test]
    fn test_parse_without_query() {
        let req = HttpRequest::parse(b"GET /foo HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(req.path(), "/foo");
        assert_eq!(req.query_param("key"), None);
    }

    #[test]
    fn test_parse_without_version() {
        let req = HttpRequest::parse(b"GET /").unwrap();
        assert_eq!(req.path(), "/");
    }

    #[test]
    fn test_parse_bare_newline() {
        let req = HttpRequest::parse(b"GET /?key=k HTTP/1.0\n\n").unwrap();
        assert_eq!(req.query_param("key"), Some("k"));
    }

    #[test]
    fn test_parse_decodes_query() {
        let req = HttpRequest::parse(b"GET /?key=a%2Bb&x=1 HTTP/1.1\r\n").unwrap();
        assert_eq!(req.query_param("key"), Some("a+b"));
        assert_eq!(req.query_param("x"), Some("1"));
    }

    #[test]
    fn test_parse_first_duplicate_wins() {
        let req = HttpRequest::parse(b"GET /?key=first&key=second HTTP/1.1\r\n").unwrap();
        assert_eq!(req.query_param("key"), Some("first"));
    }

    #[test]
    fn test_parse_empty_key_value() {
        let req = HttpRequest::parse(b"GET /?key= HTTP/1.1\r\n").unwrap();
        assert_eq!(req.query_param("key"), Some(""));
    }

    #[test]
    fn test_parse_empty_buffer() {
        assert_eq!(HttpRequest::parse(b""), Err(ProtocolError::MissingRequestLine));
        assert_eq!(
            HttpRequest::parse(b"\r\n\r\n"),
            Err(ProtocolError::MissingRequestLine)
        );
    }

    #[test]
    fn test_parse_single_token() {
        assert!(matches!(
            HttpRequest::parse(b"GET\r\n"),
            Err(ProtocolError::MalformedRequestLine(_))
        ));
    }

    #[test]
    fn test_parse_garbage_version() {
        assert!(matches!(
            HttpRequest::parse(b"GET / FOO BAR\r\n"),
            Err(ProtocolError::MalformedRequestLine(_))
        ));
    }

    #[test]
    fn test_parse_absolute_target_rejected() {
        assert!(matches!(
            HttpRequest::parse(b"GET http://host/stats HTTP/1.1\r\n"),
            Err(ProtocolError::InvalidTarget(_))
        ));
        assert!(matches!(
            HttpRequest::parse(b"OPTIONS * HTTP/1.1\r\n"),
            Err(ProtocolError::InvalidTarget(_))
        ));
    }

    #[test]
    fn test_parse_invalid_utf8() {
        assert_eq!(
            HttpRequest::parse(b"GET /\xff\xfe HTTP/1.1\r\n"),
            Err(ProtocolError::InvalidEncoding)
        );
    }

    #[test]
    fn test_find_header_end() {
        assert_eq!(find_header_end(b"GET / HTTP/1.1\r\n\r\n"), Some(18));
        assert_eq!(find_header_end(b"GET / HTTP/1.1\r\n"), None);
        assert_eq!(find_header_end(b""), None);
    }

    #[test]
    fn test_response_bytes() {
        let resp = HttpResponse::forbidden();
        let bytes = resp.to_bytes();
        let text = String::from_utf8(bytes).unwrap();

        assert!(text.starts_with("HTTP/1.1 403 Forbidden\r\n"));
        assert!(text.contains("Content-Type: text/plain; charset=utf-8\r\n"));
        assert!(text.contains("Content-Length: 9\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.ends_with("\r\n\r\nForbidden"));
    }

    #[test]
    fn test_content_length_counts_bytes_not_chars() {
        let resp = HttpResponse::html("é");
        let text = String::from_utf8(resp.to_bytes()).unwrap();
        assert!(text.contains("Content-Length: 2\r\n"));
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(StatusCode::Ok.as_u16(), 200);
        assert_eq!(StatusCode::BadRequest.as_u16(), 400);
        assert_eq!(StatusCode::Forbidden.reason(), "Forbidden");
    }
}
