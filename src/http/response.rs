//! HTTP response builder and writer.

use crate::{
    http::types::{status_message, HeaderMap},
    runtime::{
        deferred::{Deferred, DeferredUnit},
        event_loop::EventLoop,
    },
};
use chrono::Utc;
use std::{cell::RefCell, rc::Rc};

type WireWriter = Box<dyn FnOnce(&[u8]) + 'static>;
type FinishHook = Box<dyn FnOnce(bool) + 'static>;

struct ResponseInner {
    status: u16,
    reason: String,
    headers: HeaderMap,
    version: String,
    request_connection: Option<String>,
    force_close: bool,
    headers_sent: bool,
    writer: Option<WireWriter>,
    on_finish: Option<FinishHook>,
}

/// Response under construction, mutable until the first send.
///
/// Created by the server for every parsed request and passed to the handler.
/// Handles are cheap clones sharing one response, so a handler may stash one
/// in a timer callback and finish the exchange later.
///
/// All sending methods funnel into [`end`](Response::end), which serialises
/// and writes exactly once: after that the response is *sent*, and further
/// send calls are no-ops returning an already-completed deferred.
///
/// # Examples
///
/// ```no_run
/// use uniserve::{create_server, EventLoop, Request, Response};
///
/// let lp = EventLoop::new().unwrap();
/// let server = create_server(&lp, |_req: Request, res: Response| {
///     res.status(201).set("X-Served-By", "uniserve");
///     res.send_json(r#"{"created":true}"#)
/// });
/// ```
#[derive(Clone)]
pub struct Response {
    lp: EventLoop,
    inner: Rc<RefCell<ResponseInner>>,
}

impl Response {
    pub(crate) fn new(
        lp: &EventLoop,
        version: String,
        request_connection: Option<String>,
    ) -> Self {
        Self {
            lp: lp.clone(),
            inner: Rc::new(RefCell::new(ResponseInner {
                status: 200,
                reason: status_message(200).into_owned(),
                headers: HeaderMap::new(),
                version,
                request_connection,
                force_close: false,
                headers_sent: false,
                writer: None,
                on_finish: None,
            })),
        }
    }

    // Connection hooks: `writer` receives the serialised bytes, `on_finish`
    // the keep-alive verdict. Both fire exactly once, from `end`.
    pub(crate) fn wire(
        &self,
        writer: impl FnOnce(&[u8]) + 'static,
        on_finish: impl FnOnce(bool) + 'static,
    ) {
        let mut inner = self.inner.borrow_mut();
        inner.writer = Some(Box::new(writer));
        inner.on_finish = Some(Box::new(on_finish));
    }

    /// Sets the status code; the reason phrase follows from
    /// [`status_message`]. A no-op once the response is sent.
    pub fn status(&self, code: u16) -> &Self {
        let mut inner = self.inner.borrow_mut();
        if !inner.headers_sent {
            inner.status = code;
            inner.reason = status_message(code).into_owned();
        }
        self
    }

    /// Sets a header; a later write under the same name (any case) wins.
    /// A no-op once the response is sent.
    pub fn set(&self, name: &str, value: &str) -> &Self {
        let mut inner = self.inner.borrow_mut();
        if !inner.headers_sent {
            inner.headers.set(name, value);
        }
        self
    }

    /// Forces the connection to close after this response, regardless of what
    /// keep-alive negotiation would decide. The server uses this for its
    /// failure answers; handlers may call it too. A no-op once the response
    /// is sent.
    pub fn close(&self) -> &Self {
        let mut inner = self.inner.borrow_mut();
        if !inner.headers_sent {
            inner.force_close = true;
        }
        self
    }

    /// Sets the status code and a batch of headers in one call.
    pub fn write_head(&self, code: u16, headers: &[(&str, &str)]) -> &Self {
        self.status(code);
        for (name, value) in headers {
            self.set(name, value);
        }
        self
    }

    /// Sends a plain-text body, defaulting `Content-Type` to
    /// `text/plain; charset=UTF-8` unless one was already set.
    pub fn send(&self, text: &str) -> DeferredUnit {
        self.default_content_type("text/plain; charset=UTF-8");
        self.end(text.as_bytes())
    }

    /// Sends an HTML body (`text/html; charset=UTF-8`).
    pub fn send_html(&self, html: &str) -> DeferredUnit {
        self.default_content_type("text/html; charset=UTF-8");
        self.end(html.as_bytes())
    }

    /// Sends a JSON body (`application/json; charset=UTF-8`).
    pub fn send_json(&self, json: &str) -> DeferredUnit {
        self.default_content_type("application/json; charset=UTF-8");
        self.end(json.as_bytes())
    }

    /// Sets `code` and sends its reason phrase as the body.
    pub fn send_status(&self, code: u16) -> DeferredUnit {
        self.status(code);
        let reason = self.inner.borrow().reason.clone();
        self.send(&reason)
    }

    /// Serialises and writes the response: the single egress point.
    ///
    /// Defaults the `Date` header (RFC 1123, GMT), sets `Content-Length`,
    /// negotiates `Connection` (the request's header cannot override a server
    /// decision to close), writes the status line, headers in insertion
    /// order, and the body as one contiguous attempt, then reports the
    /// keep-alive verdict to the connection. Write failures are swallowed —
    /// the peer may already be gone.
    pub fn end(&self, body: &[u8]) -> DeferredUnit {
        let (wire, writer, on_finish, keep_alive) = {
            let mut inner = self.inner.borrow_mut();
            if inner.headers_sent {
                return Deferred::resolved(&self.lp, ());
            }
            inner.headers_sent = true;

            if inner.headers.get("date").is_none() {
                let now = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
                inner.headers.set("Date", now);
            }
            inner.headers.set("Content-Length", body.len().to_string());

            let keep_alive = !inner.force_close
                && negotiate_keep_alive(&inner.version, inner.request_connection.as_deref());
            inner
                .headers
                .set("Connection", if keep_alive { "keep-alive" } else { "close" });

            let mut wire = Vec::with_capacity(128 + body.len());
            wire.extend_from_slice(
                format!("HTTP/{} {} {}\r\n", inner.version, inner.status, inner.reason)
                    .as_bytes(),
            );
            for (name, value) in inner.headers.iter() {
                wire.extend_from_slice(name.as_bytes());
                wire.extend_from_slice(b": ");
                wire.extend_from_slice(value.as_bytes());
                wire.extend_from_slice(b"\r\n");
            }
            wire.extend_from_slice(b"\r\n");
            wire.extend_from_slice(body);

            (wire, inner.writer.take(), inner.on_finish.take(), keep_alive)
        };

        if let Some(writer) = writer {
            writer(&wire);
        }
        if let Some(on_finish) = on_finish {
            on_finish(keep_alive);
        }
        Deferred::resolved(&self.lp, ())
    }

    pub fn is_sent(&self) -> bool {
        self.inner.borrow().headers_sent
    }

    fn default_content_type(&self, value: &str) {
        let mut inner = self.inner.borrow_mut();
        if !inner.headers_sent && inner.headers.get("content-type").is_none() {
            inner.headers.set("Content-Type", value);
        }
    }
}

/// HTTP/1.1 keeps the connection unless the request said `Connection: close`;
/// HTTP/1.0 closes unless the request said `Connection: keep-alive`.
fn negotiate_keep_alive(version: &str, connection: Option<&str>) -> bool {
    let connection = connection.map(str::to_ascii_lowercase).unwrap_or_default();
    match version {
        "1.1" => !connection.contains("close"),
        "1.0" => connection.contains("keep-alive"),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn wired(version: &str, connection: Option<&str>) -> (Response, Wire, Finish) {
        let lp = EventLoop::new().unwrap();
        let response = Response::new(&lp, version.into(), connection.map(str::to_owned));

        let wire: Wire = Rc::new(RefCell::new(Vec::new()));
        let finish: Finish = Rc::new(Cell::new(None));
        let wire2 = wire.clone();
        let finish2 = finish.clone();
        response.wire(
            move |bytes| wire2.borrow_mut().extend_from_slice(bytes),
            move |keep_alive| finish2.set(Some(keep_alive)),
        );
        (response, wire, finish)
    }

    type Wire = Rc<RefCell<Vec<u8>>>;
    type Finish = Rc<Cell<Option<bool>>>;

    fn wire_text(wire: &Wire) -> String {
        String::from_utf8(wire.borrow().clone()).unwrap()
    }

    #[test]
    fn send_round_trips_the_body() {
        let (response, wire, finish) = wired("1.1", None);
        response.send("hello");

        let text = wire_text(&wire);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Type: text/plain; charset=UTF-8\r\n"));
        assert!(text.contains("Content-Length: 5\r\n"));
        assert!(text.contains("Date: "));
        assert!(text.ends_with("\r\n\r\nhello"));
        assert_eq!(finish.get(), Some(true));
        assert!(response.is_sent());
    }

    #[test]
    fn content_length_counts_utf8_bytes() {
        let (response, wire, _) = wired("1.1", None);
        response.send("héllo");
        assert!(wire_text(&wire).contains("Content-Length: 6\r\n"));
    }

    #[test]
    fn explicit_content_type_is_kept() {
        let (response, wire, _) = wired("1.1", None);
        response.set("content-type", "application/xml");
        response.send("<x/>");

        let text = wire_text(&wire);
        assert!(text.contains("content-type: application/xml\r\n"));
        assert!(!text.contains("text/plain"));
    }

    #[test]
    fn json_and_html_variants() {
        let (response, wire, _) = wired("1.1", None);
        response.send_json(r#"{"ok":true}"#);
        let text = wire_text(&wire);
        assert!(text.contains("Content-Type: application/json; charset=UTF-8\r\n"));
        assert!(text.ends_with(r#"{"ok":true}"#));

        let (response, wire, _) = wired("1.1", None);
        response.send_html("<p>hi</p>");
        assert!(wire_text(&wire).contains("Content-Type: text/html; charset=UTF-8\r\n"));
    }

    #[test]
    fn end_happens_exactly_once() {
        let (response, wire, finish) = wired("1.1", None);
        response.send("first");
        let len = wire.borrow().len();
        finish.set(None);

        let again = response.send("second");
        assert!(again.is_settled());
        assert_eq!(wire.borrow().len(), len, "nothing more written");
        assert_eq!(finish.get(), None, "finish hook not re-run");

        // Mutations after the send are no-ops too.
        response.status(500).set("X-Late", "1");
        assert!(!wire_text(&wire).contains("X-Late"));
    }

    #[test]
    fn keep_alive_negotiation() {
        let cases = [
            ("1.1", None, true),
            ("1.1", Some("close"), false),
            ("1.1", Some("Close"), false),
            ("1.1", Some("keep-alive"), true),
            ("1.0", None, false),
            ("1.0", Some("keep-alive"), true),
            ("1.0", Some("Keep-Alive"), true),
        ];

        for (version, connection, expected) in cases {
            let (response, wire, finish) = wired(version, connection);
            response.send("x");

            assert_eq!(finish.get(), Some(expected), "{} {:?}", version, connection);
            let header = if expected { "Connection: keep-alive\r\n" } else { "Connection: close\r\n" };
            assert!(wire_text(&wire).contains(header));
        }
    }

    #[test]
    fn forced_close_overrides_negotiation() {
        // HTTP/1.1 with no request header would negotiate keep-alive.
        let (response, wire, finish) = wired("1.1", None);
        response.close().status(500).send("boom");

        assert_eq!(finish.get(), Some(false));
        assert!(wire_text(&wire).contains("Connection: close\r\n"));

        let (response, wire, finish) = wired("1.1", Some("keep-alive"));
        response.close();
        response.send("x");
        assert_eq!(finish.get(), Some(false));
        assert!(wire_text(&wire).contains("Connection: close\r\n"));
    }

    #[test]
    fn status_updates_the_reason_phrase() {
        let (response, wire, _) = wired("1.1", None);
        response.status(404).send("not found");
        assert!(wire_text(&wire).starts_with("HTTP/1.1 404 Not Found\r\n"));

        let (response, wire, _) = wired("1.1", None);
        response.status(799).send("?");
        assert!(wire_text(&wire).starts_with("HTTP/1.1 799 799\r\n"));
    }

    #[test]
    fn send_status_uses_the_reason_as_body() {
        let (response, wire, _) = wired("1.1", None);
        response.send_status(404);

        let text = wire_text(&wire);
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(text.ends_with("\r\n\r\nNot Found"));
    }

    #[test]
    fn write_head_sets_code_and_headers_in_order() {
        let (response, wire, _) = wired("1.1", None);
        response.write_head(201, &[("X-A", "1"), ("X-B", "2")]);
        response.end(b"");

        let text = wire_text(&wire);
        assert!(text.starts_with("HTTP/1.1 201 Created\r\n"));
        let a = text.find("X-A: 1").unwrap();
        let b = text.find("X-B: 2").unwrap();
        assert!(a < b);
    }

    #[test]
    fn handler_supplied_date_is_preserved() {
        let (response, wire, _) = wired("1.1", None);
        response.set("Date", "Thu, 01 Jan 1970 00:00:00 GMT");
        response.send("x");
        assert!(wire_text(&wire).contains("Date: Thu, 01 Jan 1970 00:00:00 GMT\r\n"));
    }
}
