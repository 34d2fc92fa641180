use crate::{
    errors::ServeError,
    http::{
        request::{Parser, Request},
        response::Response,
    },
    runtime::{
        deferred::Deferred,
        event_loop::{panic_message, EventLoop, Ready, TimerHandle},
    },
    server::acceptor::Server,
};
use mio::{net::TcpStream, Interest, Token};
use std::{
    cell::{Cell, RefCell},
    io::{self, Read, Write},
    net::SocketAddr,
    panic::{self, AssertUnwindSafe},
    rc::Rc,
};

/// Per-socket state: the read buffer, a parser instance, the idle watchdog,
/// and the bookkeeping that ties a socket's lifetime to the loop's ref count.
///
/// Lifecycle: created on accept, destroyed through exactly one path —
/// [`teardown`](Connection::teardown) cancels the idle timer, deregisters the
/// socket, and releases the connection's loop ref; the server then drops it
/// from the live set.
#[derive(Clone)]
pub(crate) struct Connection {
    inner: Rc<ConnInner>,
}

struct ConnInner {
    token: Cell<Token>,
    stream: RefCell<TcpStream>,
    parser: RefCell<Parser>,
    read_buf: RefCell<Vec<u8>>,
    idle: RefCell<Option<TimerHandle>>,
    remote: String,
    closed: Cell<bool>,
    in_flight: Cell<usize>,
}

impl Connection {
    /// Accept-side setup: registers for read readiness, takes a loop ref,
    /// joins the server's live set, and arms the idle watchdog.
    pub(crate) fn open(server: &Server, stream: TcpStream, remote: SocketAddr) {
        let lp = server.lp().clone();
        let conn = Connection {
            inner: Rc::new(ConnInner {
                token: Cell::new(Token(0)),
                stream: RefCell::new(stream),
                parser: RefCell::new(Parser::new(server.req_limits())),
                read_buf: RefCell::new(vec![0; server.conn_limits().read_buffer]),
                idle: RefCell::new(None),
                remote: remote.to_string(),
                closed: Cell::new(false),
                in_flight: Cell::new(0),
            }),
        };

        let registered = {
            let callback_conn = conn.clone();
            let callback_server = server.clone();
            lp.register(
                &mut *conn.inner.stream.borrow_mut(),
                Interest::READABLE,
                Rc::new(move |ready: Ready| {
                    if ready.readable {
                        callback_conn.on_readable(&callback_server);
                    }
                }),
            )
        };
        let token = match registered {
            Ok(token) => token,
            Err(err) => {
                log::error!("failed to register connection from {}: {}", conn.inner.remote, err);
                return;
            }
        };

        conn.inner.token.set(token);
        lp.add_ref();
        server.insert_connection(token, conn.clone());
        conn.rearm_idle(server);
        log::debug!("connection from {} opened as {:?}", conn.inner.remote, token);
    }

    pub(crate) fn token(&self) -> Token {
        self.inner.token.get()
    }

    pub(crate) fn remote(&self) -> &str {
        &self.inner.remote
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.inner.in_flight.get()
    }

    /// First half of the single destruction path; the caller removes the
    /// connection from the live set afterwards. Returns `false` when another
    /// path got here first.
    pub(crate) fn teardown(&self, lp: &EventLoop) -> bool {
        if self.inner.closed.replace(true) {
            return false;
        }
        if let Some(handle) = self.inner.idle.borrow_mut().take() {
            handle.cancel();
        }
        let stream = &mut *self.inner.stream.borrow_mut();
        lp.deregister(self.inner.token.get(), stream);
        // Cancelled-timer tombstones may keep this state alive briefly, so
        // the peer gets its FIN now rather than at the last drop.
        let _ = stream.shutdown(std::net::Shutdown::Both);
        lp.unref();
        true
    }

    fn on_readable(&self, server: &Server) {
        if self.inner.closed.get() {
            return;
        }
        self.rearm_idle(server);

        // Readiness is edge-style: drain the socket until it would block.
        loop {
            let read = {
                let mut stream = self.inner.stream.borrow_mut();
                let mut buf = self.inner.read_buf.borrow_mut();
                stream.read(&mut buf[..])
            };
            match read {
                Ok(0) => {
                    server.close_connection(self, &ServeError::PeerClosed.to_string());
                    return;
                }
                Ok(count) => {
                    let chunk = self.inner.read_buf.borrow()[..count].to_vec();
                    if !self.consume(server, &chunk) {
                        return;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    server.close_connection(self, &ServeError::from(err).to_string());
                    return;
                }
            }
        }
    }

    /// Feeds a chunk byte-by-byte, dispatching every completed request and
    /// resetting the parser in between, so back-to-back pipelined bytes in
    /// one chunk all get served. Returns `false` once the connection closed.
    fn consume(&self, server: &Server, bytes: &[u8]) -> bool {
        for &byte in bytes {
            if self.inner.closed.get() {
                return false;
            }
            let complete = match self.inner.parser.borrow_mut().feed(byte) {
                Ok(complete) => complete,
                Err(err) => {
                    log::debug!("parse failure from {}: {}", self.inner.remote, err);
                    if let Some(wire) = err.as_http() {
                        self.write_best_effort(&wire);
                    }
                    server.close_connection(self, &err.to_string());
                    return false;
                }
            };
            if complete {
                let request = {
                    let mut parser = self.inner.parser.borrow_mut();
                    let request = parser.take_request(self.inner.remote.clone());
                    parser.reset();
                    request
                };
                self.dispatch(server, request);
            }
        }
        true
    }

    fn dispatch(&self, server: &Server, request: Request) {
        let lp = server.lp();
        log::trace!(
            "{} {} from {}",
            request.method(),
            request.url(),
            self.inner.remote
        );

        let response = Response::new(
            lp,
            request.version().to_string(),
            request.get("connection").map(str::to_owned),
        );
        self.inner.in_flight.set(self.inner.in_flight.get() + 1);

        let writer_conn = self.clone();
        let finish_conn = self.clone();
        let finish_server = server.clone();
        response.wire(
            move |bytes| writer_conn.write_best_effort(bytes),
            move |keep_alive| {
                let inner = &finish_conn.inner;
                inner.in_flight.set(inner.in_flight.get().saturating_sub(1));
                if keep_alive && !finish_server.is_closing() && !inner.closed.get() {
                    finish_conn.rearm_idle(&finish_server);
                } else {
                    finish_server.close_connection(&finish_conn, "response complete");
                }
            },
        );

        // A synchronous handler panic becomes a rejected deferred, so the
        // recovery below covers both failure shapes.
        let handler = server.handler();
        let completion = {
            let response = response.clone();
            match panic::catch_unwind(AssertUnwindSafe(|| handler.handle(request, response))) {
                Ok(completion) => completion,
                Err(payload) => Deferred::rejected(
                    lp,
                    ServeError::Handler(panic_message(payload.as_ref()).to_owned()),
                ),
            }
        };

        completion.on_settle(move |result| {
            if let Err(err) = result {
                log::error!("handler failed: {}", err);
                if !response.is_sent() {
                    response.close().status(500).send(&err.to_string());
                }
            }
        });
    }

    // One contiguous write attempt; failures are swallowed because the peer
    // may already be gone.
    fn write_best_effort(&self, mut bytes: &[u8]) {
        if self.inner.closed.get() {
            return;
        }
        let mut stream = self.inner.stream.borrow_mut();
        while !bytes.is_empty() {
            match stream.write(bytes) {
                Ok(0) => break,
                Ok(count) => bytes = &bytes[count..],
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    log::debug!(
                        "write to {} failed, dropping {} bytes: {}",
                        self.inner.remote,
                        bytes.len(),
                        err
                    );
                    break;
                }
            }
        }
    }

    fn rearm_idle(&self, server: &Server) {
        if let Some(handle) = self.inner.idle.borrow_mut().take() {
            handle.cancel();
        }
        let watchdog_conn = self.clone();
        let watchdog_server = server.clone();
        let handle = server.lp().set_timeout(server.conn_limits().idle_timeout, move || {
            watchdog_server.close_connection(
                &watchdog_conn,
                &ServeError::IdleTimeout.to_string(),
            );
        });
        self.inner.idle.borrow_mut().replace(handle);
    }
}
