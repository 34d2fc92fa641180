//! Parsing and connection limits with conservative defaults.
//!
//! Default limits are intentionally strict: every parser accumulator is
//! bounded, so a misbehaving client cannot grow server-side buffers past the
//! configured maxima, and every connection carries an idle watchdog.
//!
//! # Examples
//!
//! ```no_run
//! use uniserve::{limits::{ConnLimits, ReqLimits}, EventLoop, Server};
//! use std::time::Duration;
//!
//! let lp = EventLoop::new().unwrap();
//! let server = Server::with_limits(
//!     &lp,
//!     |_req: uniserve::Request, res: uniserve::Response| res.send("ok"),
//!     ReqLimits {
//!         body_len: 64 * 1024, // 64 KiB is plenty for this service
//!         ..ReqLimits::default()
//!     },
//!     ConnLimits {
//!         idle_timeout: Duration::from_secs(5),
//!         ..ConnLimits::default()
//!     },
//! );
//! server.listen(8080, "127.0.0.1", || {}).unwrap();
//! lp.run();
//! ```

use std::time::Duration;

/// Request-parsing limits, enforced while bytes accumulate.
///
/// Exceeding any limit fails the request with
/// [`ServeError::BadRequest`](crate::ServeError::BadRequest): the connection
/// answers `400` and closes.
#[derive(Debug, Clone)]
pub struct ReqLimits {
    /// Maximum request-method length in bytes (default: `16`).
    pub method_len: usize,

    /// Maximum request-URL length in bytes, path and query combined, in the
    /// raw encoded form (default: `8192`).
    pub url_len: usize,

    /// Maximum HTTP-version literal length in bytes, including the `HTTP/`
    /// prefix (default: `16`).
    pub version_len: usize,

    /// Maximum header-name length in bytes (default: `256`).
    pub header_name_len: usize,

    /// Maximum header-value length in bytes (default: `8192`).
    pub header_value_len: usize,

    /// Maximum number of headers per request (default: `100`).
    pub header_count: usize,

    /// Maximum request-body length in bytes; also the upper bound accepted in
    /// `Content-Length` (default: `10485760`, 10 MiB).
    pub body_len: usize,
}

impl Default for ReqLimits {
    fn default() -> Self {
        Self {
            method_len: 16,
            url_len: 8192,
            version_len: 16,
            header_name_len: 256,
            header_value_len: 8192,
            header_count: 100,
            body_len: 10 * 1024 * 1024,
        }
    }
}

/// Per-connection transport limits.
#[derive(Debug, Clone)]
pub struct ConnLimits {
    /// Size of the per-connection read buffer in bytes (default: `8192`).
    pub read_buffer: usize,

    /// How long a connection may stay silent before it is closed
    /// (default: `30s`). The watchdog rearms on every read and on every
    /// keep-alive response.
    pub idle_timeout: Duration,
}

impl Default for ConnLimits {
    fn default() -> Self {
        Self {
            read_buffer: 8192,
            idle_timeout: Duration::from_secs(30),
        }
    }
}
