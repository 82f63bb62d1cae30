use std::error;
use std::fmt;
use std::io;

use crate::session::SessionId;

/// A specialized `Result` type for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// An error produced by the runtime or stored by a failed task.
///
/// Programming misuse (calling `get()` on an unfinished task, resolving a
/// cell twice, touching a loop-affine object from the wrong thread) is not
/// represented here; those are logic errors and panic instead.
#[derive(Debug)]
pub enum Error {
    /// An I/O error from the reactor or a session transport.
    Io(io::Error),

    /// A `race` timed out before any task satisfied the predicate.
    Timeout,

    /// The loop was shut down before the task being driven completed.
    Shutdown,

    /// The task body panicked; the payload message is preserved.
    Panicked(String),

    /// The session was closed while an operation was waiting on it.
    Closed,

    /// No session with this id is registered on the loop.
    SessionNotFound(SessionId),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "I/O error: {}", err),
            Error::Timeout => write!(f, "race timed out"),
            Error::Shutdown => write!(f, "loop shutdown before task completed"),
            Error::Panicked(msg) => write!(f, "task panicked: {}", msg),
            Error::Closed => write!(f, "session closed"),
            Error::SessionNotFound(id) => write!(f, "session {} not found", id),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::Io(err)
    }
}
