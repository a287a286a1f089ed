//! Error types for the store core.

use crate::path::Path;

/// Errors surfaced by store operations.
///
/// Errors from local API calls are returned synchronously to the caller;
/// errors discovered while demultiplexing an incoming message are returned
/// from [`Store::receive`](crate::Store::receive) to the host that drove it.
#[derive(Debug)]
pub enum Error {
    /// A malformed argument: empty namespace, zero throttle, a message
    /// missing its correlation id.
    InvalidArgument { message: String },

    /// Attach at a namespace that is already registered, or of a remote
    /// that already occupies another namespace.
    AlreadyAttached { namespace: Path },

    /// Unsubscribe or detach found nothing to act on.
    NotFound { message: String },

    /// `unsubscribe_tree` left links behind that are owned by a remote.
    PartialFailure { remaining: usize },

    /// A write at or above an attached mount path.
    ConflictingMount { namespace: Path },

    /// A value of the wrong shape: push against a non-sequence leaf, a
    /// non-mapping at the root, traversal through a non-container.
    TypeMismatch { message: String },

    /// An incoming message of an unrecognized kind.
    Protocol { message: String },

    /// An `event` received from a remote this store has not attached.
    MissingContext { message: String },

    /// Generic error with message.
    Other { message: String },
}

impl Error {
    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        Error::InvalidArgument {
            message: message.into(),
        }
    }

    pub(crate) fn not_found(message: impl Into<String>) -> Self {
        Error::NotFound {
            message: message.into(),
        }
    }

    pub(crate) fn type_mismatch(message: impl Into<String>) -> Self {
        Error::TypeMismatch {
            message: message.into(),
        }
    }

    pub(crate) fn other(message: impl Into<String>) -> Self {
        Error::Other {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidArgument { message } => write!(f, "invalid argument: {}", message),
            Error::AlreadyAttached { namespace } => {
                write!(f, "already attached at namespace '{}'", namespace)
            }
            Error::NotFound { message } => write!(f, "not found: {}", message),
            Error::PartialFailure { remaining } => {
                write!(f, "{} remotely-owned link(s) left behind", remaining)
            }
            Error::ConflictingMount { namespace } => {
                write!(f, "write conflicts with mount at '{}'", namespace)
            }
            Error::TypeMismatch { message } => write!(f, "type mismatch: {}", message),
            Error::Protocol { message } => write!(f, "protocol error: {}", message),
            Error::MissingContext { message } => write!(f, "missing context: {}", message),
            Error::Other { message } => write!(f, "{}", message),
        }
    }
}

impl std::error::Error for Error {}
