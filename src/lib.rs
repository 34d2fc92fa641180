//! uniserve - single-threaded event-loop HTTP/1.1 server
//!
//! A lightweight HTTP/1.1 server built around a cooperative event loop with
//! strict ordering between microtasks, timers, immediates, and I/O readiness,
//! in the style of the browser/runtime event-loop model. Handlers return a
//! deferred completion token and everything — parsing, timers, handler code,
//! response writes — runs on the one thread that called
//! [`EventLoop::run`].
//!
//! # Scheduling model
//!
//! - **Microtasks** ([`EventLoop::next_tick`]) drain to empty before any
//!   macrotask, and again after every individual timer, I/O callback, and
//!   immediate.
//! - **Timers** ([`EventLoop::set_timeout`], [`EventLoop::set_interval`])
//!   fire in deadline order with a stable insertion-order tie-break.
//! - **Immediates** ([`EventLoop::set_immediate`]) run after the I/O poll.
//! - **Liveness** is a reference count: the listening socket, every live
//!   connection, and every armed timeout hold one ref each; `run` returns
//!   when the count reaches zero with nothing queued.
//!
//! # Quick Start
//!
//! ```no_run
//! use uniserve::{create_server, EventLoop, Request, Response};
//!
//! let lp = EventLoop::new().unwrap();
//! let server = create_server(&lp, |_req: Request, res: Response| res.send("Hello World!"));
//!
//! server
//!     .listen(8080, "127.0.0.1", || println!("listening on http://127.0.0.1:8080"))
//!     .unwrap();
//! lp.run();
//! ```
//!
//! # Protocol support
//!
//! HTTP/1.1 with keep-alive, plus HTTP/1.0 for legacy clients. Requests with
//! `Transfer-Encoding` are rejected — bodies are governed by
//! `Content-Length` only. Responses always carry `Date`, `Content-Length`,
//! and `Connection`.
//!
//! Parsing limits and the per-connection idle timeout are configurable
//! through [`limits`]; the defaults are deliberately conservative.

pub(crate) mod http {
    pub(crate) mod query;
    pub(crate) mod request;
    pub(crate) mod response;
    pub(crate) mod types;
}
pub(crate) mod runtime {
    pub(crate) mod deferred;
    pub(crate) mod event_loop;
    pub(crate) mod timer;
}
pub(crate) mod server {
    pub(crate) mod acceptor;
    pub(crate) mod connection;
}
pub(crate) mod errors;
pub mod limits;

pub use crate::{
    errors::ServeError,
    http::{
        query::{url_decode, Query},
        request::Request,
        response::Response,
        types::{status_message, HeaderMap},
    },
    runtime::{
        deferred::{Deferred, DeferredUnit},
        event_loop::{EventLoop, RemoteHandle, TimerHandle},
    },
    server::acceptor::{create_server, Handler, Server},
};
