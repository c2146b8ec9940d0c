//! URI parsing, percent coding and path normalisation.

/// Convert hex digit to integer.
fn hex_to_digit(hex: u8) -> Option<u8> {
    match hex {
        b'0'..=b'9' => Some(hex - b'0'),
        b'A'..=b'F' => Some(hex - b'A' + 10),
        b'a'..=b'f' => Some(hex - b'a' + 10),
        _ => None,
    }
}

/// Is this an RFC3986 "unreserved character"?
fn is_unreserved(c: u8) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, b'-' | b'.' | b'_' | b'~')
}

/// Encode a string to be an RFC3986-compliant URL part.
pub fn encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for &c in s.as_bytes() {
        if is_unreserved(c) {
            out.push(c as char);
        } else {
            out.push_str(&format!("%{:02X}", c));
        }
    }
    out
}

/// Decode %XX escapes into raw bytes. Malformed escapes pass through
/// unchanged. With `plus_as_space`, `+` decodes to a space (query context).
pub fn decode_bytes(s: &str, plus_as_space: bool) -> Vec<u8> {
    let raw = s.as_bytes();
    let mut decoded = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        let c = raw[i];
        if c == b'%' && i + 2 < raw.len() {
            if let (Some(high), Some(low)) = (hex_to_digit(raw[i + 1]), hex_to_digit(raw[i + 2])) {
                decoded.push((high << 4) | low);
                i += 3;
                continue;
            }
        }
        if c == b'+' && plus_as_space {
            decoded.push(b' ');
        } else {
            decoded.push(c);
        }
        i += 1;
    }
    decoded
}

/// Percent-decode a path component. `+` stays literal.
pub fn decode_path(s: &str) -> String {
    String::from_utf8_lossy(&decode_bytes(s, false)).into_owned()
}

/// Percent-decode a query component. `+` becomes a space.
pub fn decode_query(s: &str) -> String {
    String::from_utf8_lossy(&decode_bytes(s, true)).into_owned()
}

/// A parsed request target: either `scheme://authority/path?query#fragment`
/// or an origin-form `/path?query#fragment`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uri {
    pub scheme: String,
    pub host: String,
    pub port: Option<u16>,
    pub path: String,
    pub query: String,
    pub fragment: String,
}

impl Uri {
    /// Parse a URI string. Returns `None` for anything invalid: an empty
    /// input, an empty path, or a malformed port.
    pub fn parse(input: &str) -> Option<Uri> {
        if input.is_empty() {
            return None;
        }

        let mut scheme = String::new();
        let mut host = String::new();
        let mut port = None;
        let mut remaining = input;

        if let Some(pos) = remaining.find("://") {
            scheme = remaining[..pos].to_string();
            remaining = &remaining[pos + 3..];

            let (authority, rest) = match remaining.find('/') {
                Some(path_start) => (&remaining[..path_start], &remaining[path_start..]),
                None => (remaining, "/"),
            };
            remaining = rest;

            match authority.rfind(':') {
                Some(port_pos) => {
                    let port_str = &authority[port_pos + 1..];
                    if port_str.is_empty() {
                        return None;
                    }
                    let port_val: u64 = port_str.parse().ok()?;
                    if port_val < 1 || port_val > 65535 {
                        return None;
                    }
                    host = authority[..port_pos].to_string();
                    port = Some(port_val as u16);
                }
                None => host = authority.to_string(),
            }
        }

        let mut remaining = remaining.to_string();

        // Fragment is extracted before the query string.
        let mut fragment = String::new();
        if let Some(pos) = remaining.find('#') {
            fragment = remaining[pos + 1..].to_string();
            remaining.truncate(pos);
        }

        let mut query = String::new();
        if let Some(pos) = remaining.find('?') {
            query = remaining[pos + 1..].to_string();
            remaining.truncate(pos);
        }

        if remaining.is_empty() {
            return None;
        }

        Some(Uri {
            scheme,
            host,
            port,
            path: remaining,
            query,
            fragment,
        })
    }

    /// Rebuild the canonical string form of the URI.
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        if !self.scheme.is_empty() {
            out.push_str(&self.scheme);
            out.push_str("://");
            if !self.host.is_empty() {
                out.push_str(&self.host);
                if let Some(port) = self.port {
                    out.push_str(&format!(":{}", port));
                }
            }
        }
        out.push_str(&self.path);
        if !self.query.is_empty() {
            out.push('?');
            out.push_str(&self.query);
        }
        if !self.fragment.is_empty() {
            out.push('#');
            out.push_str(&self.fragment);
        }
        out
    }

    /// The percent-decoded path.
    pub fn decoded_path(&self) -> String {
        decode_path(&self.path)
    }

    /// True if the decoded path attempts to climb out of its root with a
    /// `..` segment.
    pub fn has_path_traversal(&self) -> bool {
        let decoded = self.decoded_path();
        decoded == ".."
            || decoded.starts_with("../")
            || decoded.ends_with("/..")
            || decoded.contains("/../")
    }
}

/// Resolve `.` and `..` segments against an anchor rooted at `/`. A `..` at
/// the root is absorbed. A trailing slash in the input is preserved unless
/// the result is `/` itself.
pub fn normalize_path(path: &str) -> String {
    if path.is_empty() {
        return "/".to_string();
    }

    let decoded = decode_path(path);
    let absolute = decoded.starts_with('/');

    let mut segments: Vec<&str> = Vec::new();
    for segment in decoded.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }

    let mut result = String::new();
    for (i, segment) in segments.iter().enumerate() {
        if absolute || i > 0 {
            result.push('/');
        }
        result.push_str(segment);
    }
    if result.is_empty() {
        result.push('/');
    }

    // The raw input decides the trailing slash; an encoded %2F is data.
    if result.len() > 1 && path.ends_with('/') {
        result.push('/');
    }
    result
}
