//! Local inter-process message bus.
//!
//! A single broker daemon listens on a UNIX domain socket; every client
//! keeps one long-lived connection and multiplexes registrations, method
//! calls and event subscriptions over it. Three primitives are provided:
//!
//! * publish a named object with callable methods ([`ipc::Client::add`]),
//! * call a method on a peer-owned object ([`ipc::Client::call`]),
//! * broadcast named events to subscribers ([`ipc::Client::send`] /
//!   [`ipc::Client::listen`]).
//!
//! The wire protocol is length-prefixed, type-tagged JSON (see [`codec`]).
//! Replies are correlated by a per-request UUID; the broker routes a method
//! result back to the calling connection by a broker-stamped connection
//! handle, so the reply travels over a different connection than the
//! request that produced it.

use std::fmt;
use std::time::Duration;

pub mod codec;

#[cfg(feature = "broker")]
pub mod broker;

#[cfg(feature = "ipc")]
pub mod ipc;

/// Well-known broker socket path.
pub const DEFAULT_SOCK_PATH: &str = "/var/tmp/ubus.sock";

pub const DEFAULT_BACKLOG: usize = 32;

/// Default reply wait for registrations, calls and subscriptions.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Per-connection outbound frame queue capacity.
pub const DEFAULT_QUEUE_SIZE: usize = 8192;

/// Per-connection I/O buffer size.
pub const DEFAULT_BUF_SIZE: usize = 16384;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ErrorKind {
    /// No such object, method or subscriber on the other side.
    NotRegistered,
    /// The requested name is already taken.
    Busy,
    /// Malformed arguments or payload.
    Data,
    Io,
    /// Orderly close by the peer.
    Eof,
    Timeout,
    /// The connection is closed or was never opened.
    NotConnected,
}

impl ErrorKind {
    fn as_str(&self) -> &str {
        match self {
            ErrorKind::NotRegistered => "not registered",
            ErrorKind::Busy => "busy",
            ErrorKind::Data => "data error",
            ErrorKind::Io => "io error",
            ErrorKind::Eof => "eof",
            ErrorKind::Timeout => "timeout",
            ErrorKind::NotConnected => "not connected",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl fmt::Display) -> Self {
        Self {
            kind,
            message: Some(message.to_string()),
        }
    }
    #[inline]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
    pub fn data(message: impl fmt::Display) -> Self {
        Self::new(ErrorKind::Data, message)
    }
    pub fn busy(message: impl fmt::Display) -> Self {
        Self::new(ErrorKind::Busy, message)
    }
    pub fn not_registered(message: impl fmt::Display) -> Self {
        Self::new(ErrorKind::NotRegistered, message)
    }
    pub fn io(message: impl fmt::Display) -> Self {
        Self::new(ErrorKind::Io, message)
    }
    pub fn timeout() -> Self {
        Self {
            kind: ErrorKind::Timeout,
            message: None,
        }
    }
    pub fn not_connected() -> Self {
        Self {
            kind: ErrorKind::NotConnected,
            message: None,
        }
    }
    pub fn eof() -> Self {
        Self {
            kind: ErrorKind::Eof,
            message: None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message {
            Some(ref message) => write!(f, "{}: {}", self.kind, message),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Self {
                kind: ErrorKind::Eof,
                message: None,
            }
        } else {
            Self::new(ErrorKind::Io, e)
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::new(ErrorKind::Data, e)
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::timeout()
    }
}

impl<T> From<async_channel::SendError<T>> for Error {
    fn from(_: async_channel::SendError<T>) -> Self {
        Self::new(ErrorKind::Io, "peer queue closed")
    }
}

#[cfg(feature = "broker")]
impl From<nix::Error> for Error {
    fn from(e: nix::Error) -> Self {
        Self::new(ErrorKind::Io, e)
    }
}
