//! Error types for Ebbtide tasks.
//!
//! Producers store an [`Error`] in a task with
//! [`TaskProducer::return_error`](crate::TaskProducer::return_error); consumers
//! receive it from the `propagate_*` family. Errors are values, never panics:
//! the kind is a coarse, stable classification and the message is free-form
//! human-readable text.

use std::fmt;
use std::io;

use thiserror::Error as ThisError;

/// Coarse classification of a task failure.
///
/// `Failed` is the fallback for anything without a more specific kind. The
/// remaining kinds exist so producers can store a classified error and
/// consumers can match on it without parsing messages; the task core itself
/// only ever produces [`ErrorKind::Cancelled`] and [`ErrorKind::Failed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ThisError)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Generic failure; also the fallback for unclassified errors.
    #[error("operation failed")]
    Failed,
    /// The operation was cancelled through its [`Cancellable`](crate::Cancellable).
    #[error("operation was cancelled")]
    Cancelled,
    /// A referenced entity was not found.
    #[error("not found")]
    NotFound,
    /// An entity that was to be created already exists.
    #[error("already exists")]
    AlreadyExists,
    /// The caller lacks permission for the operation.
    #[error("permission denied")]
    PermissionDenied,
    /// The operation is not supported here.
    #[error("not supported")]
    NotSupported,
    /// The operation timed out.
    #[error("timed out")]
    TimedOut,
    /// A required resource is busy.
    #[error("resource busy")]
    Busy,
    /// The operation would block.
    #[error("would block")]
    WouldBlock,
    /// An argument was invalid for the operation.
    #[error("invalid argument")]
    InvalidArgument,
    /// The pipe or stream was closed by the peer.
    #[error("broken pipe")]
    BrokenPipe,
    /// The connection attempt was refused.
    #[error("connection refused")]
    ConnectionRefused,
    /// The connection was reset by the peer.
    #[error("connection reset")]
    ConnectionReset,
    /// The socket is not connected.
    #[error("not connected")]
    NotConnected,
    /// The address is already in use.
    #[error("address in use")]
    AddressInUse,
    /// The host is unreachable.
    #[error("host unreachable")]
    HostUnreachable,
}

impl ErrorKind {
    /// Map a [`std::io::ErrorKind`] into the task taxonomy.
    ///
    /// Unmapped kinds collapse to [`ErrorKind::Failed`]; future releases may
    /// return a more specific value for kinds currently unmapped.
    pub fn from_io(kind: io::ErrorKind) -> Self {
        use io::ErrorKind as Io;
        match kind {
            Io::NotFound => Self::NotFound,
            Io::AlreadyExists => Self::AlreadyExists,
            Io::PermissionDenied => Self::PermissionDenied,
            Io::Unsupported => Self::NotSupported,
            Io::TimedOut => Self::TimedOut,
            Io::WouldBlock => Self::WouldBlock,
            Io::InvalidInput | Io::InvalidData => Self::InvalidArgument,
            Io::BrokenPipe => Self::BrokenPipe,
            Io::ConnectionRefused => Self::ConnectionRefused,
            Io::ConnectionReset | Io::ConnectionAborted => Self::ConnectionReset,
            Io::NotConnected => Self::NotConnected,
            Io::AddrInUse => Self::AddressInUse,
            Io::AddrNotAvailable | Io::HostUnreachable | Io::NetworkUnreachable => {
                Self::HostUnreachable
            }
            Io::ResourceBusy => Self::Busy,
            Io::Interrupted => Self::Failed,
            _ => Self::Failed,
        }
    }
}

/// A classified error with a human-readable message.
///
/// The message is the whole `Display` output; the kind is carried alongside
/// for programmatic matching via [`Error::matches`].
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
#[error("{message}")]
pub struct Error {
    kind: ErrorKind,
    message: String,
}

impl Error {
    /// Create an error with an explicit kind and message.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// The standard cancellation error stored when a task is cancelled.
    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "Operation was cancelled")
    }

    /// The classification of this error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The human-readable message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether this error has the given kind.
    pub fn matches(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }

    /// Return this error with `prefix` prepended to the message.
    ///
    /// The kind is preserved. Used by
    /// [`TaskProducer::return_prefixed_error`](crate::TaskProducer::return_prefixed_error)
    /// to add call-site context to an inner error.
    pub fn prefixed(self, prefix: impl fmt::Display) -> Self {
        Self {
            kind: self.kind,
            message: format!("{}{}", prefix, self.message),
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::new(ErrorKind::from_io(err.kind()), err.to_string())
    }
}
