use std::{error, fmt, io};

/// Failure classes produced while serving a connection.
///
/// The surfacing policy is fixed per variant: parse violations answer with a
/// `400` and close, handler failures answer with a `500` and close (only when
/// the response has not been sent yet), and the remaining transport-level
/// variants close the connection silently. [`ServeError::Listener`] is the one
/// variant returned to the caller, from [`Server::listen`](crate::Server::listen).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServeError {
    /// The request violated the HTTP/1.1 grammar or a configured limit.
    BadRequest(&'static str),
    /// The user handler rejected its deferred, or panicked synchronously.
    Handler(String),
    /// A socket read or write failed.
    Io(io::ErrorKind),
    /// The peer closed its side of the connection.
    PeerClosed,
    /// No traffic arrived within the idle window.
    IdleTimeout,
    /// Binding or registering the listening socket failed.
    Listener(io::ErrorKind),
}

impl ServeError {
    /// Shorthand for a handler failure carrying a message.
    pub fn handler(message: impl Into<String>) -> Self {
        ServeError::Handler(message.into())
    }

    // Pre-rendered wire response for errors that answer the client before the
    // connection closes. Transport-level errors yield None: those close silently.
    pub(crate) fn as_http(&self) -> Option<Vec<u8>> {
        let (code, reason) = match self {
            ServeError::BadRequest(_) => (400, "Bad Request"),
            ServeError::Handler(_) => (500, "Internal Server Error"),
            _ => return None,
        };

        let body = self.to_string();
        Some(
            format!(
                "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                code,
                reason,
                body.len(),
                body,
            )
            .into_bytes(),
        )
    }
}

impl error::Error for ServeError {}

impl fmt::Display for ServeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServeError::BadRequest(detail) => write!(f, "bad request: {}", detail),
            ServeError::Handler(message) => write!(f, "{}", message),
            ServeError::Io(kind) => write!(f, "i/o error: {}", kind),
            ServeError::PeerClosed => write!(f, "peer closed the connection"),
            ServeError::IdleTimeout => write!(f, "connection idle timeout expired"),
            ServeError::Listener(kind) => write!(f, "listener failure: {}", kind),
        }
    }
}

impl From<io::Error> for ServeError {
    fn from(err: io::Error) -> Self {
        ServeError::Io(err.kind())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handler_message_is_the_display() {
        let err = ServeError::handler("async boom");
        assert_eq!(err.to_string(), "async boom");
    }

    #[test]
    fn bad_request_renders_a_400() {
        let wire = ServeError::BadRequest("lone line feed").as_http().unwrap();
        let text = String::from_utf8(wire).unwrap();
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.ends_with("bad request: lone line feed"));
    }

    #[test]
    fn transport_errors_have_no_wire_form() {
        assert_eq!(ServeError::PeerClosed.as_http(), None);
        assert_eq!(ServeError::IdleTimeout.as_http(), None);
        assert_eq!(ServeError::Io(io::ErrorKind::BrokenPipe).as_http(), None);
    }
}
