//! Error taxonomy shared across the starter.
//!
//! The HTTP layer maps these variants onto status codes; everything else
//! propagates them with `?`.

use thiserror::Error;

/// Result alias used throughout the starter.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors produced by the starter core and its collaborators.
#[derive(Debug, Error)]
pub enum Error {
    /// The caller sent a malformed or incomplete request.
    #[error("{0}")]
    BadRequest(String),

    /// The requested entity does not exist.
    #[error("{0}")]
    NotFound(String),

    /// A precondition for the operation does not hold.
    #[error("{0}")]
    PreconditionFailed(String),

    /// The operation cannot be served right now.
    #[error("{0}")]
    ServiceUnavailable(String),

    /// The caller must retry the request at the given location.
    #[error("redirect to {0}")]
    Redirect(String),

    /// A server port is already bound by another process.
    #[error("port {0} is already in use")]
    PortInUse(u16),

    /// An expectation on subprocess output was not met in time.
    #[error("timeout while waiting for '{pattern}' in {label}")]
    ExpectTimeout {
        /// The regular expression that did not match.
        pattern: String,
        /// Label identifying the subprocess.
        label: String,
    },

    /// `--version` output did not contain a server version line.
    #[error("no server-version found in '{0}'")]
    VersionNotFound(String),

    /// A transient failure while starting or talking to a server.
    #[error("{0}")]
    Transient(String),

    /// An explicit status code carried through to the HTTP layer.
    #[error("status {0}: {1}")]
    Status(u16, String),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Returns the redirect location if this is a redirect error.
    #[must_use]
    pub fn redirect_location(&self) -> Option<&str> {
        match self {
            Self::Redirect(loc) => Some(loc),
            _ => None,
        }
    }

    /// Returns `true` if this error indicates a port conflict.
    #[must_use]
    pub const fn is_port_in_use(&self) -> bool {
        matches!(self, Self::PortInUse(_))
    }
}
