use crate::{
    errors::ServeError,
    http::{
        query::{url_decode, Query},
        types::{ascii_to_usize, HeaderMap},
    },
    limits::ReqLimits,
};
use std::{borrow::Cow, mem};

/// A fully parsed HTTP request, immutable after construction.
///
/// Built by the connection once its [`Parser`] reaches the terminal state,
/// then handed to the user handler together with the
/// [`Response`](crate::Response).
#[derive(Debug, PartialEq)]
pub struct Request {
    method: String,
    url: String,
    path: String,
    query: Query,
    version: String,
    headers: HeaderMap,
    body: Vec<u8>,
    remote_address: String,
}

impl Request {
    /// Request method, e.g. `GET`.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Raw request URL in its encoded form, path and query combined.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Request path, without the query string.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// First query value recorded under `name`. Keys and values are
    /// percent-decoded; duplicates keep insertion order.
    pub fn query(&self, name: &str) -> Option<&str> {
        self.query.get(name)
    }

    /// All query pairs in insertion order.
    pub fn query_pairs(&self) -> &[(String, String)] {
        self.query.pairs()
    }

    /// HTTP version, `"1.1"` or `"1.0"`.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Header lookup, case-insensitive.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Body decoded as UTF-8, with invalid sequences replaced.
    pub fn body_string(&self) -> Cow<'_, str> {
        match simdutf8::basic::from_utf8(&self.body) {
            Ok(text) => Cow::Borrowed(text),
            Err(_) => String::from_utf8_lossy(&self.body),
        }
    }

    /// Peer address, e.g. `127.0.0.1:54321`.
    pub fn remote_address(&self) -> &str {
        &self.remote_address
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Method,
    Path,
    QueryKey,
    QueryValue,
    HttpLiteral,
    VersionMajor,
    VersionMinor,
    RequestLineLf,
    HeaderKey,
    HeaderSpace,
    HeaderValue,
    HeaderLf,
    BlankLf,
    Body,
    Final,
}

const HTTP_LITERAL: &[u8] = b"HTTP/";

/// Byte-fed HTTP/1.1 request parser.
///
/// Fed one byte at a time, so reads may be fragmented at arbitrary
/// boundaries. [`feed`](Parser::feed) reports `true` when the byte completed
/// a request; the caller then takes the accumulated fields with
/// [`take_request`](Parser::take_request), calls [`reset`](Parser::reset),
/// and keeps feeding any remaining bytes of the same chunk.
///
/// Every accumulator is checked against [`ReqLimits`] before it grows;
/// violations and grammar errors fail with [`ServeError::BadRequest`].
pub(crate) struct Parser {
    limits: ReqLimits,
    state: State,

    method: String,
    url: String,
    path: String,
    query: Query,
    version: String,
    headers: HeaderMap,
    body: Vec<u8>,
    content_length: usize,

    buf: Vec<u8>,
    url_buf: Vec<u8>,
    version_buf: Vec<u8>,
    key_buf: Vec<u8>,
    val_buf: Vec<u8>,
}

impl Parser {
    pub(crate) fn new(limits: &ReqLimits) -> Self {
        Self {
            limits: limits.clone(),
            state: State::Method,
            method: String::new(),
            url: String::new(),
            path: String::new(),
            query: Query::default(),
            version: String::new(),
            headers: HeaderMap::new(),
            body: Vec::new(),
            content_length: 0,
            buf: Vec::new(),
            url_buf: Vec::new(),
            version_buf: Vec::new(),
            key_buf: Vec::new(),
            val_buf: Vec::new(),
        }
    }

    /// Consumes one byte. Returns `true` once the request is complete.
    pub(crate) fn feed(&mut self, byte: u8) -> Result<bool, ServeError> {
        // A state change may hand the byte back for redelivery, at most once.
        let mut pending = Some(byte);
        while let Some(byte) = pending.take() {
            pending = self.step(byte)?;
        }
        Ok(self.state == State::Final)
    }

    /// Moves the accumulated fields out. Only meaningful in the terminal
    /// state; the caller resets the parser afterwards.
    pub(crate) fn take_request(&mut self, remote_address: String) -> Request {
        debug_assert_eq!(self.state, State::Final);
        Request {
            method: mem::take(&mut self.method),
            url: mem::take(&mut self.url),
            path: mem::take(&mut self.path),
            query: mem::take(&mut self.query),
            version: mem::take(&mut self.version),
            headers: mem::take(&mut self.headers),
            body: mem::take(&mut self.body),
            remote_address,
        }
    }

    /// Returns to the initial state with every accumulator cleared, ready for
    /// the next request on the same connection.
    pub(crate) fn reset(&mut self) {
        self.state = State::Method;
        self.method.clear();
        self.url.clear();
        self.path.clear();
        self.query = Query::default();
        self.version.clear();
        self.headers = HeaderMap::new();
        self.body.clear();
        self.content_length = 0;
        self.buf.clear();
        self.url_buf.clear();
        self.version_buf.clear();
        self.key_buf.clear();
        self.val_buf.clear();
    }

    fn step(&mut self, byte: u8) -> Result<Option<u8>, ServeError> {
        match self.state {
            State::Method => match byte {
                b' ' => {
                    if self.buf.is_empty() {
                        return Err(ServeError::BadRequest("request method is empty"));
                    }
                    self.method = commit_utf8(&mut self.buf, "method is not valid utf-8")?;
                    self.state = State::Path;
                }
                byte if is_ctl(byte) => {
                    return Err(ServeError::BadRequest("control byte in request line"));
                }
                byte => {
                    if self.buf.len() >= self.limits.method_len {
                        return Err(ServeError::BadRequest("request method too long"));
                    }
                    self.buf.push(byte);
                }
            },

            State::Path => match byte {
                b' ' => {
                    if self.buf.is_empty() {
                        return Err(ServeError::BadRequest("request path is empty"));
                    }
                    self.path = commit_utf8(&mut self.buf, "path is not valid utf-8")?;
                    self.state = State::HttpLiteral;
                }
                b'?' => {
                    if self.buf.is_empty() {
                        return Err(ServeError::BadRequest("request path is empty"));
                    }
                    self.path = commit_utf8(&mut self.buf, "path is not valid utf-8")?;
                    self.push_url(byte)?;
                    self.state = State::QueryKey;
                }
                byte if is_ctl(byte) => {
                    return Err(ServeError::BadRequest("control byte in request line"));
                }
                byte => {
                    self.push_url(byte)?;
                    self.buf.push(byte);
                }
            },

            State::QueryKey => match byte {
                b'=' => {
                    self.push_url(byte)?;
                    self.state = State::QueryValue;
                }
                b'&' => {
                    self.push_url(byte)?;
                    self.commit_query_pair()?;
                }
                b' ' => {
                    if !self.key_buf.is_empty() {
                        self.commit_query_pair()?;
                    } else if !self.query.is_empty() {
                        // An empty key buffer after a committed pair means the
                        // query ended in a bare `&`; only a bare `?` is exempt.
                        return Err(ServeError::BadRequest("query parameter has an empty key"));
                    }
                    self.state = State::HttpLiteral;
                }
                byte if is_ctl(byte) => {
                    return Err(ServeError::BadRequest("control byte in request line"));
                }
                byte => {
                    self.push_url(byte)?;
                    self.key_buf.push(byte);
                }
            },

            State::QueryValue => match byte {
                b'&' => {
                    self.push_url(byte)?;
                    self.commit_query_pair()?;
                    self.state = State::QueryKey;
                }
                b' ' => {
                    self.commit_query_pair()?;
                    self.state = State::HttpLiteral;
                }
                byte if is_ctl(byte) => {
                    return Err(ServeError::BadRequest("control byte in request line"));
                }
                byte => {
                    self.push_url(byte)?;
                    self.val_buf.push(byte);
                }
            },

            State::HttpLiteral => {
                self.push_version(byte)?;
                if byte != HTTP_LITERAL[self.version_buf.len() - 1] {
                    return Err(ServeError::BadRequest("malformed http version"));
                }
                if self.version_buf.len() == HTTP_LITERAL.len() {
                    self.state = State::VersionMajor;
                }
            }

            State::VersionMajor => match byte {
                b'0'..=b'9' => self.push_version(byte)?,
                b'.' => {
                    if !self.version_ends_with_digit() {
                        return Err(ServeError::BadRequest("malformed http version"));
                    }
                    self.push_version(byte)?;
                    self.state = State::VersionMinor;
                }
                _ => return Err(ServeError::BadRequest("malformed http version")),
            },

            State::VersionMinor => match byte {
                b'0'..=b'9' => self.push_version(byte)?,
                b'\r' => {
                    if !self.version_ends_with_digit() {
                        return Err(ServeError::BadRequest("malformed http version"));
                    }
                    self.state = State::RequestLineLf;
                }
                _ => return Err(ServeError::BadRequest("malformed http version")),
            },

            State::RequestLineLf => match byte {
                b'\n' => {
                    self.url = commit_utf8(&mut self.url_buf, "url is not valid utf-8")?;
                    let digits = self.version_buf.split_off(HTTP_LITERAL.len());
                    self.version = String::from_utf8(digits)
                        .map_err(|_| ServeError::BadRequest("malformed http version"))?;
                    self.version_buf.clear();
                    self.state = State::HeaderKey;
                }
                _ => {
                    return Err(ServeError::BadRequest(
                        "carriage return not followed by line feed",
                    ))
                }
            },

            State::HeaderKey => match byte {
                b'\r' => {
                    if !self.key_buf.is_empty() {
                        return Err(ServeError::BadRequest("truncated header line"));
                    }
                    self.state = State::BlankLf;
                }
                b'\n' => return Err(ServeError::BadRequest("lone line feed in headers")),
                b':' => {
                    if self.key_buf.is_empty() {
                        return Err(ServeError::BadRequest("header name is empty"));
                    }
                    self.state = State::HeaderSpace;
                }
                byte if is_ctl(byte) => {
                    return Err(ServeError::BadRequest("control byte in header name"));
                }
                byte => {
                    if self.key_buf.len() >= self.limits.header_name_len {
                        return Err(ServeError::BadRequest("header name too long"));
                    }
                    self.key_buf.push(byte);
                }
            },

            State::HeaderSpace => match byte {
                b' ' | b'\t' => {}
                b'\r' => {
                    // No value bytes at all: commit the header as empty.
                    self.commit_header()?;
                    self.state = State::HeaderLf;
                }
                byte => {
                    self.state = State::HeaderValue;
                    return Ok(Some(byte));
                }
            },

            State::HeaderValue => match byte {
                b'\r' => {
                    self.commit_header()?;
                    self.state = State::HeaderLf;
                }
                b'\n' => return Err(ServeError::BadRequest("lone line feed in headers")),
                b'\t' => {
                    if self.val_buf.len() >= self.limits.header_value_len {
                        return Err(ServeError::BadRequest("header value too long"));
                    }
                    self.val_buf.push(byte);
                }
                byte if is_ctl(byte) => {
                    return Err(ServeError::BadRequest("control byte in header value"));
                }
                byte => {
                    if self.val_buf.len() >= self.limits.header_value_len {
                        return Err(ServeError::BadRequest("header value too long"));
                    }
                    self.val_buf.push(byte);
                }
            },

            State::HeaderLf => match byte {
                b'\n' => self.state = State::HeaderKey,
                _ => {
                    return Err(ServeError::BadRequest(
                        "carriage return not followed by line feed",
                    ))
                }
            },

            State::BlankLf => match byte {
                b'\n' => self.end_of_headers()?,
                _ => {
                    return Err(ServeError::BadRequest(
                        "carriage return not followed by line feed",
                    ))
                }
            },

            State::Body => {
                self.body.push(byte);
                if self.body.len() == self.content_length {
                    self.state = State::Final;
                }
            }

            State::Final => {
                debug_assert!(false, "byte fed after the request completed");
            }
        }

        Ok(None)
    }

    fn end_of_headers(&mut self) -> Result<(), ServeError> {
        if self.headers.contains("transfer-encoding") {
            return Err(ServeError::BadRequest("transfer-encoding is not supported"));
        }
        if self.version == "1.1" && !self.headers.contains("host") {
            return Err(ServeError::BadRequest("missing host header"));
        }

        match self.headers.get("content-length") {
            Some(value) => {
                let length = ascii_to_usize(value.as_bytes())
                    .ok_or(ServeError::BadRequest("invalid content-length"))?;
                if length > self.limits.body_len {
                    return Err(ServeError::BadRequest("request body too large"));
                }
                if length == 0 {
                    self.state = State::Final;
                } else {
                    self.content_length = length;
                    self.state = State::Body;
                }
            }
            None => self.state = State::Final,
        }
        Ok(())
    }

    fn commit_query_pair(&mut self) -> Result<(), ServeError> {
        if self.key_buf.is_empty() {
            return Err(ServeError::BadRequest("query parameter has an empty key"));
        }
        let key = commit_utf8(&mut self.key_buf, "query is not valid utf-8")?;
        let value = commit_utf8(&mut self.val_buf, "query is not valid utf-8")?;
        self.query.push(url_decode(&key)?, url_decode(&value)?);
        Ok(())
    }

    fn commit_header(&mut self) -> Result<(), ServeError> {
        if self.headers.len() >= self.limits.header_count {
            return Err(ServeError::BadRequest("too many headers"));
        }
        let name = commit_utf8(&mut self.key_buf, "header name is not valid utf-8")?;
        let value = commit_utf8(&mut self.val_buf, "header value is not valid utf-8")?;
        self.headers.set(name, value);
        Ok(())
    }

    fn push_url(&mut self, byte: u8) -> Result<(), ServeError> {
        if self.url_buf.len() >= self.limits.url_len {
            return Err(ServeError::BadRequest("request url too long"));
        }
        self.url_buf.push(byte);
        Ok(())
    }

    fn push_version(&mut self, byte: u8) -> Result<(), ServeError> {
        if self.version_buf.len() >= self.limits.version_len {
            return Err(ServeError::BadRequest("http version too long"));
        }
        self.version_buf.push(byte);
        Ok(())
    }

    fn version_ends_with_digit(&self) -> bool {
        self.version_buf.last().is_some_and(u8::is_ascii_digit)
    }
}

fn commit_utf8(buf: &mut Vec<u8>, what: &'static str) -> Result<String, ServeError> {
    String::from_utf8(mem::take(buf)).map_err(|_| ServeError::BadRequest(what))
}

fn is_ctl(byte: u8) -> bool {
    byte <= 0x1F || byte == 0x7F
}
