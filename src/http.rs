//! HTTP primitives: methods, status phrases, requests, responses.

use std::fmt;

use chrono::{TimeZone, Utc};

pub const CRLF: &str = "\r\n";
pub const HTTP_VERSION: &str = "HTTP/1.1";

/// The request methods this server understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Head,
}

impl Method {
    /// Map a request-line token to a method. Unknown tokens map to `None`
    /// and are surfaced as 501 by the caller.
    pub fn from_token(token: &str) -> Option<Method> {
        match token {
            "GET" => Some(Method::Get),
            "POST" => Some(Method::Post),
            "PUT" => Some(Method::Put),
            "DELETE" => Some(Method::Delete),
            "HEAD" => Some(Method::Head),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Head => "HEAD",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reason phrase for a status code.
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        416 => "Range Not Satisfiable",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        _ => "Unknown",
    }
}

pub fn is_redirect(status: u16) -> bool {
    matches!(status, 301 | 302 | 303 | 307 | 308)
}

pub fn is_client_error(status: u16) -> bool {
    (400..500).contains(&status)
}

pub fn is_server_error(status: u16) -> bool {
    (500..600).contains(&status)
}

/// Return index of first occurrence of `needle` in `haystack`.
pub fn find_subslice(needle: &[u8], haystack: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn header_name_matches(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// A parsed request: start line tokens plus headers. The body is filled in
/// by the connection once `Content-Length` bytes have arrived.
#[derive(Debug, Clone, Default)]
pub struct Request {
    pub method: String,
    pub uri: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Request {
    /// Parse the request line and headers out of `buffer[..headers_end]`.
    /// Returns `None` for anything malformed: a start line that is not
    /// exactly three tokens, a header line without a colon or with an empty
    /// or space-ridden name.
    pub fn parse(buffer: &[u8], headers_end: usize) -> Option<Request> {
        let head = std::str::from_utf8(&buffer[..headers_end]).ok()?;

        let mut lines = head.split("\r\n").flat_map(|l| l.split('\n'));

        let start_line = lines.next()?;
        let tokens: Vec<&str> = start_line.split(' ').collect();
        if tokens.len() != 3 || tokens.iter().any(|t| t.is_empty()) {
            return None;
        }

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let colon = line.find(':')?;
            let name = line[..colon].trim();
            if name.is_empty() || name.contains(' ') {
                return None;
            }
            let value = line[colon + 1..].trim();
            headers.push((name.to_string(), value.to_string()));
        }

        Some(Request {
            method: tokens[0].to_string(),
            uri: tokens[1].to_string(),
            version: tokens[2].to_string(),
            headers,
            body: Vec::new(),
        })
    }

    /// Case-insensitive header lookup; first match wins.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| header_name_matches(n, name))
            .map(|(_, v)| v.as_str())
    }
}

/// A response being built. Headers keep insertion order.
#[derive(Debug, Clone)]
pub struct Response {
    pub version: String,
    pub status: u16,
    /// Overrides the standard reason phrase (set from a CGI `Status:`
    /// header).
    pub reason: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new() -> Response {
        Response {
            version: HTTP_VERSION.to_string(),
            status: 200,
            reason: None,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn add_header(&mut self, name: &str, value: &str) {
        self.headers.push((name.to_string(), value.to_string()));
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| header_name_matches(n, name))
            .map(|(_, v)| v.as_str())
    }

    pub fn status_line(&self) -> String {
        let reason = self
            .reason
            .as_deref()
            .unwrap_or_else(|| reason_phrase(self.status));
        format!("{} {} {}", self.version, self.status, reason)
    }

    /// Status line, headers and the blank separator line; no body.
    pub fn serialize_headers(&self) -> Vec<u8> {
        let mut out = String::new();
        out.push_str(&self.status_line());
        out.push_str(CRLF);
        for (name, value) in &self.headers {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str(CRLF);
        }
        out.push_str(CRLF);
        out.into_bytes()
    }

    /// The complete wire form including the body.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = self.serialize_headers();
        out.extend_from_slice(&self.body);
        out
    }
}

impl Default for Response {
    fn default() -> Response {
        Response::new()
    }
}

/// RFC1123 formatted date.
pub struct HttpDate(pub i64);

impl fmt::Display for HttpDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let datetime = Utc.timestamp(self.0, 0);
        write!(f, "{}", datetime.format("%a, %d %b %Y %H:%M:%S GMT"))
    }
}

/// Escape < > & ' " into HTML entities.
pub struct HtmlEscaped<'a>(pub &'a str);

impl<'a> fmt::Display for HtmlEscaped<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for c in self.0.chars() {
            match c {
                '<' => write!(f, "&lt;")?,
                '>' => write!(f, "&gt;")?,
                '&' => write!(f, "&amp;")?,
                '\'' => write!(f, "&apos;")?,
                '"' => write!(f, "&quot;")?,
                c => write!(f, "{}", c)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use test_case::test_case;

    #[test]
    fn parse_request_works() {
        let raw = b"GET /index.html HTTP/1.1\r\nHost: localhost\r\nAccept: */*\r\n\r\n";
        let end = find_subslice(b"\r\n\r\n", raw).unwrap();
        let request = Request::parse(raw, end).unwrap();
        assert_eq!(request.method, "GET");
        assert_eq!(request.uri, "/index.html");
        assert_eq!(request.version, "HTTP/1.1");
        assert_eq!(request.header("host"), Some("localhost"));
        assert_eq!(request.header("ACCEPT"), Some("*/*"));
        assert_eq!(request.header("missing"), None);
    }

    #[test_case(b"GET /\r\n\r\n" ; "two tokens")]
    #[test_case(b"GET / HTTP/1.1 extra\r\n\r\n" ; "four tokens")]
    #[test_case(b"GET  / HTTP/1.1\r\n\r\n" ; "empty token")]
    #[test_case(b"GET / HTTP/1.1\r\nNoColonHere\r\n\r\n" ; "header without colon")]
    #[test_case(b"GET / HTTP/1.1\r\n: value\r\n\r\n" ; "empty header name")]
    #[test_case(b"GET / HTTP/1.1\r\nBad Name: value\r\n\r\n" ; "space in header name")]
    fn parse_request_rejects_malformed(raw: &[u8]) {
        let end = find_subslice(b"\r\n\r\n", raw).unwrap();
        assert!(Request::parse(raw, end).is_none());
    }

    #[test]
    fn parse_request_tolerates_bare_lf() {
        let raw = b"GET / HTTP/1.0\nHost: a\n\r\n\r\n";
        let end = find_subslice(b"\r\n\r\n", raw).unwrap();
        let request = Request::parse(raw, end).unwrap();
        assert_eq!(request.version, "HTTP/1.0");
        assert_eq!(request.header("Host"), Some("a"));
    }

    #[test]
    fn serialize_response_works() {
        let mut response = Response::new();
        response.status = 404;
        response.add_header("Content-Type", "text/plain");
        response.add_header("Content-Length", "5");
        response.body = b"oops\n".to_vec();
        let wire = String::from_utf8(response.serialize()).unwrap();
        assert_eq!(
            wire,
            "HTTP/1.1 404 Not Found\r\nContent-Type: text/plain\r\nContent-Length: 5\r\n\r\noops\n"
        );
    }

    #[test]
    fn find_subslice_works() {
        assert_eq!(find_subslice(b"\r\n\r\n", b"abc\r\n\r\ndef"), Some(3));
        assert_eq!(find_subslice(b"zz", b"abc"), None);
        assert_eq!(find_subslice(b"abc", b"ab"), None);
    }

    #[test]
    fn html_escaped_works() {
        assert_eq!(
            HtmlEscaped("foo<>&'\"").to_string(),
            "foo&lt;&gt;&amp;&apos;&quot;"
        );
    }

    #[test]
    fn http_date_works() {
        assert_eq!(
            HttpDate(1622040683).to_string(),
            "Wed, 26 May 2021 14:51:23 GMT"
        );
    }

    #[test]
    fn reason_phrase_covers_config_codes() {
        for &code in &[301u16, 302, 303, 307, 308] {
            assert!(is_redirect(code), "{}", code);
            assert_ne!(reason_phrase(code), "Unknown");
        }
        assert!(!is_redirect(304));
        assert!(is_client_error(404) && !is_client_error(500));
        assert!(is_server_error(504) && !is_server_error(499));
    }
}
