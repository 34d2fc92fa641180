use crate::{
    errors::ServeError,
    http::{request::Request, response::Response},
    limits::{ConnLimits, ReqLimits},
    runtime::{
        deferred::DeferredUnit,
        event_loop::{EventLoop, Ready},
    },
    server::connection::Connection,
};
use mio::{net::TcpListener, Interest, Token};
use socket2::{Domain, Protocol, Socket, Type};
use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    io,
    net::{IpAddr, SocketAddr},
    rc::Rc,
};

/// A request handler: receives the parsed [`Request`] and a [`Response`],
/// and returns a deferred completion token.
///
/// Closures of the matching shape implement it directly. Resolve the
/// deferred when the work is done; rejecting it (or panicking) routes
/// through the server's recovery, which answers `500` when the response is
/// still unsent and closes the connection.
///
/// # Examples
///
/// ```no_run
/// use uniserve::{create_server, EventLoop, Request, Response};
/// use std::time::Duration;
///
/// let lp = EventLoop::new().unwrap();
/// let delayed = lp.clone();
/// let server = create_server(&lp, move |_req: Request, res: Response| {
///     // Finish the exchange from a timer: the response handle is a cheap
///     // clone and the deferred tells the server when the handler is done.
///     delayed.set_timeout(Duration::from_millis(50), move || {
///         res.send("took a while");
///     });
///     uniserve::Deferred::resolved(&delayed, ())
/// });
/// ```
pub trait Handler: 'static {
    fn handle(&self, request: Request, response: Response) -> DeferredUnit;
}

impl<F> Handler for F
where
    F: Fn(Request, Response) -> DeferredUnit + 'static,
{
    fn handle(&self, request: Request, response: Response) -> DeferredUnit {
        self(request, response)
    }
}

/// Creates a [`Server`] with default limits.
pub fn create_server(lp: &EventLoop, handler: impl Handler) -> Server {
    Server::new(lp, handler)
}

type DrainHook = Box<dyn FnOnce() + 'static>;

struct ServerInner {
    lp: EventLoop,
    handler: Rc<dyn Handler>,
    req_limits: ReqLimits,
    conn_limits: ConnLimits,
    listener: RefCell<Option<TcpListener>>,
    listen_token: Cell<Option<Token>>,
    actual_port: Cell<u16>,
    connections: RefCell<HashMap<Token, Connection>>,
    closing: Cell<bool>,
    on_drain: RefCell<Option<DrainHook>>,
}

/// HTTP/1.1 server: a listening socket plus the set of live connections,
/// driven entirely by one [`EventLoop`].
///
/// The listening socket holds one loop ref while open and each live
/// connection holds one, so [`EventLoop::run`] keeps going exactly as long
/// as the server has work. [`close`](Server::close) drains gracefully:
/// accepts stop at once, idle keep-alive connections close immediately, and
/// connections with an in-flight request deliver their response first.
///
/// Handles are cheap clones sharing one server, so a handler may capture one
/// and call [`close`](Server::close) from inside the loop.
///
/// # Examples
///
/// ```no_run
/// use uniserve::{create_server, EventLoop, Request, Response};
///
/// let lp = EventLoop::new().unwrap();
/// let server = create_server(&lp, |_req: Request, res: Response| res.send("hello"));
/// server.listen(8080, "127.0.0.1", || println!("ready")).unwrap();
/// lp.run();
/// ```
#[derive(Clone)]
pub struct Server {
    inner: Rc<ServerInner>,
}

impl Server {
    /// Creates a server with default [`ReqLimits`] and [`ConnLimits`].
    pub fn new(lp: &EventLoop, handler: impl Handler) -> Self {
        Self::with_limits(lp, handler, ReqLimits::default(), ConnLimits::default())
    }

    /// Creates a server with explicit limits.
    pub fn with_limits(
        lp: &EventLoop,
        handler: impl Handler,
        req_limits: ReqLimits,
        conn_limits: ConnLimits,
    ) -> Self {
        Server {
            inner: Rc::new(ServerInner {
                lp: lp.clone(),
                handler: Rc::new(handler),
                req_limits,
                conn_limits,
                listener: RefCell::new(None),
                listen_token: Cell::new(None),
                actual_port: Cell::new(0),
                connections: RefCell::new(HashMap::new()),
                closing: Cell::new(false),
                on_drain: RefCell::new(None),
            }),
        }
    }

    /// Binds the listening socket (`SO_REUSEADDR`, non-blocking) and starts
    /// accepting. `on_listening` runs as a microtask, so it fires after this
    /// call returns. Port `0` asks the OS for a free port; see
    /// [`actual_port`](Server::actual_port).
    pub fn listen(
        &self,
        port: u16,
        host: &str,
        on_listening: impl FnOnce() + 'static,
    ) -> Result<(), ServeError> {
        if self.inner.listener.borrow().is_some() || self.inner.closing.get() {
            return Err(ServeError::Listener(io::ErrorKind::AlreadyExists));
        }
        let ip: IpAddr = host
            .parse()
            .map_err(|_| ServeError::Listener(io::ErrorKind::InvalidInput))?;
        let addr = SocketAddr::new(ip, port);

        let listener = bind_listener(addr).map_err(|err| {
            log::error!("bind to {} failed: {}", addr, err);
            ServeError::Listener(err.kind())
        })?;
        let mut listener = TcpListener::from_std(listener);
        let local = listener
            .local_addr()
            .map_err(|err| ServeError::Listener(err.kind()))?;

        let accept_server = self.clone();
        let token = self
            .inner
            .lp
            .register(
                &mut listener,
                Interest::READABLE,
                Rc::new(move |ready: Ready| {
                    if ready.readable {
                        accept_server.accept_ready();
                    }
                }),
            )
            .map_err(|err| ServeError::Listener(err.kind()))?;

        self.inner.actual_port.set(local.port());
        self.inner.listen_token.set(Some(token));
        self.inner.listener.borrow_mut().replace(listener);
        self.inner.lp.add_ref();
        self.inner.lp.next_tick(on_listening);
        log::debug!("listening on {}", local);
        Ok(())
    }

    /// The bound port — useful after listening on port `0`.
    pub fn actual_port(&self) -> u16 {
        self.inner.actual_port.get()
    }

    /// Stops accepting and drains: the listening socket closes now, idle
    /// connections close now, and connections with an in-flight request close
    /// once their response is delivered. `on_drain` runs as a microtask when
    /// the live set is empty (possibly immediately). Idempotent — only the
    /// first call's `on_drain` is kept.
    pub fn close(&self, on_drain: impl FnOnce() + 'static) {
        if self.inner.closing.replace(true) {
            return;
        }
        log::debug!("server closing");
        self.inner.on_drain.borrow_mut().replace(Box::new(on_drain));

        if let Some(mut listener) = self.inner.listener.borrow_mut().take() {
            if let Some(token) = self.inner.listen_token.take() {
                self.inner.lp.deregister(token, &mut listener);
            }
            self.inner.lp.unref();
        }

        // Snapshot: closing mutates the live set while we walk it.
        let snapshot: Vec<Connection> = self.inner.connections.borrow().values().cloned().collect();
        for conn in snapshot {
            if conn.in_flight() == 0 {
                self.close_connection(&conn, "server shutdown");
            }
        }
        self.maybe_drain();
    }

    fn accept_ready(&self) {
        loop {
            let accepted = match self.inner.listener.borrow_mut().as_mut() {
                Some(listener) => listener.accept(),
                None => return,
            };
            match accepted {
                Ok((stream, remote)) => Connection::open(self, stream, remote),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    log::error!("accept failed: {}", err);
                    break;
                }
            }
        }
    }

    pub(crate) fn close_connection(&self, conn: &Connection, reason: &str) {
        if !conn.teardown(&self.inner.lp) {
            return;
        }
        self.inner.connections.borrow_mut().remove(&conn.token());
        log::debug!("connection {} closed ({})", conn.remote(), reason);
        self.maybe_drain();
    }

    fn maybe_drain(&self) {
        if !self.inner.closing.get() || !self.inner.connections.borrow().is_empty() {
            return;
        }
        if let Some(hook) = self.inner.on_drain.borrow_mut().take() {
            self.inner.lp.next_tick(hook);
        }
    }

    pub(crate) fn insert_connection(&self, token: Token, conn: Connection) {
        self.inner.connections.borrow_mut().insert(token, conn);
    }

    pub(crate) fn lp(&self) -> &EventLoop {
        &self.inner.lp
    }

    pub(crate) fn handler(&self) -> Rc<dyn Handler> {
        self.inner.handler.clone()
    }

    pub(crate) fn req_limits(&self) -> &ReqLimits {
        &self.inner.req_limits
    }

    pub(crate) fn conn_limits(&self) -> &ConnLimits {
        &self.inner.conn_limits
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.inner.closing.get()
    }
}

fn bind_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}
