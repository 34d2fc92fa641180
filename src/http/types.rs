//! Core HTTP protocol types and utilities.

use std::borrow::Cow;

/// Insertion-ordered header collection.
///
/// Names compare case-insensitively (per
/// [RFC 7230](https://tools.ietf.org/html/rfc7230#section-3.2)) for both
/// lookup and replacement, while the stored spelling is whatever the last
/// write used — responses serialise names exactly as the handler wrote them.
/// Lookup is a linear scan; header counts are bounded by
/// [`ReqLimits::header_count`](crate::limits::ReqLimits::header_count).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a header; a later write under the same name (any case)
    /// replaces both the stored spelling and the value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self
            .entries
            .iter_mut()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(&name))
        {
            Some(entry) => *entry = (name, value),
            None => self.entries.push((name, value)),
        }
    }

    /// Case-insensitive lookup.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Headers in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.entries
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }
}

/// Strict non-negative decimal parse, used for `Content-Length`.
pub(crate) fn ascii_to_usize(bytes: &[u8]) -> Option<usize> {
    if bytes.is_empty() {
        return None;
    }

    let mut result: usize = 0;
    for &byte in bytes {
        if !byte.is_ascii_digit() {
            return None;
        }
        result = result
            .checked_mul(10)?
            .checked_add((byte - b'0') as usize)?;
    }
    Some(result)
}

/// Canonical reason phrase for a status code, or the decimal code itself when
/// the code is unassigned.
///
/// # Examples
///
/// ```
/// use uniserve::status_message;
///
/// assert_eq!(status_message(200), "OK");
/// assert_eq!(status_message(404), "Not Found");
/// assert_eq!(status_message(799), "799");
/// ```
pub fn status_message(code: u16) -> Cow<'static, str> {
    let message = match code {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        203 => "Non-Authoritative Information",
        204 => "No Content",
        205 => "Reset Content",
        206 => "Partial Content",
        300 => "Multiple Choices",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        402 => "Payment Required",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        409 => "Conflict",
        410 => "Gone",
        411 => "Length Required",
        412 => "Precondition Failed",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        415 => "Unsupported Media Type",
        416 => "Range Not Satisfiable",
        417 => "Expectation Failed",
        421 => "Misdirected Request",
        425 => "Too Early",
        426 => "Upgrade Required",
        428 => "Precondition Required",
        429 => "Too Many Requests",
        431 => "Request Header Fields Too Large",
        451 => "Unavailable For Legal Reasons",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        _ => return Cow::Owned(code.to_string()),
    };
    Cow::Borrowed(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_case_insensitive_both_ways() {
        let mut headers = HeaderMap::new();
        headers.set("Content-Type", "text/plain");

        assert_eq!(headers.get("content-type"), Some("text/plain"));
        assert_eq!(headers.get("CONTENT-TYPE"), Some("text/plain"));

        headers.set("X-Id", "1");
        assert_eq!(headers.get("x-id"), Some("1"));
    }

    #[test]
    fn last_write_wins_and_keeps_its_spelling() {
        let mut headers = HeaderMap::new();
        headers.set("host", "a");
        headers.set("HOST", "b");

        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("Host"), Some("b"));
        assert_eq!(headers.iter().next(), Some(("HOST", "b")));
    }

    #[test]
    fn iteration_preserves_insertion_order() {
        let mut headers = HeaderMap::new();
        headers.set("b", "2");
        headers.set("a", "1");
        headers.set("c", "3");

        let names: Vec<&str> = headers.iter().map(|(name, _)| name).collect();
        assert_eq!(names, ["b", "a", "c"]);
    }

    #[test]
    fn decimal_parse_rejects_junk() {
        assert_eq!(ascii_to_usize(b"0"), Some(0));
        assert_eq!(ascii_to_usize(b"10485760"), Some(10 * 1024 * 1024));
        assert_eq!(ascii_to_usize(b""), None);
        assert_eq!(ascii_to_usize(b"-1"), None);
        assert_eq!(ascii_to_usize(b"1 2"), None);
        assert_eq!(ascii_to_usize(b"99999999999999999999999"), None);
    }

    #[test]
    fn reason_phrases() {
        for (code, reason) in [
            (100, "Continue"),
            (101, "Switching Protocols"),
            (200, "OK"),
            (201, "Created"),
            (204, "No Content"),
            (301, "Moved Permanently"),
            (304, "Not Modified"),
            (400, "Bad Request"),
            (401, "Unauthorized"),
            (403, "Forbidden"),
            (404, "Not Found"),
            (405, "Method Not Allowed"),
            (500, "Internal Server Error"),
        ] {
            assert_eq!(status_message(code), reason);
        }
        assert_eq!(status_message(612), "612");
    }
}
