//! Error handling for the cncd daemon
//!
//! Provides error types for all layers of the daemon:
//! - Validation errors (bad idents, unknown commands, missing resources)
//! - Auth errors (rejected sessions)
//! - Transport errors (serial/TCP open, read and write failures)
//! - Protocol errors (`error:<code>` / `ALARM:<code>` firmware replies)
//!
//! All error types use `thiserror` for ergonomic error handling. Only a
//! transport error is allowed to collapse a connection; every other family
//! is reported to the caller and the connection stays up.

use thiserror::Error;

/// Validation error type
///
/// Raised for malformed requests: bad controller type, bad ident, unknown
/// command, not-found macro/port/file. Reported via the operation's error
/// path; never tears the connection.
#[derive(Error, Debug, Clone)]
pub enum ValidationError {
    /// Requested controller type is not supported
    #[error("Unsupported controller type: {kind}")]
    UnknownControllerType {
        /// The requested type name.
        kind: String,
    },

    /// Connection ident does not resolve to an open controller
    #[error("No controller bound to ident: {ident}")]
    UnknownIdent {
        /// The offending ident.
        ident: String,
    },

    /// Connection options could not be turned into an ident
    #[error("Invalid connection options: {reason}")]
    InvalidOptions {
        /// Why the options were rejected.
        reason: String,
    },

    /// Command name is not in the dispatch table
    #[error("Unknown command: {name}")]
    UnknownCommand {
        /// The unknown command name.
        name: String,
    },

    /// Macro lookup failed
    #[error("Macro not found: {id}")]
    MacroNotFound {
        /// The macro id that was requested.
        id: String,
    },

    /// Watch-directory file lookup failed
    #[error("File not found in watch directory: {name}")]
    FileNotFound {
        /// The requested file name.
        name: String,
    },

    /// No program is loaded where one is required
    #[error("No program loaded")]
    NoProgramLoaded,
}

/// Auth error type
///
/// Raised at session admission. The socket is rejected; nothing else is
/// affected.
#[derive(Error, Debug, Clone)]
pub enum AuthError {
    /// Bearer token missing or failed verification upstream
    #[error("Invalid bearer token: {reason}")]
    InvalidToken {
        /// Why the token was rejected.
        reason: String,
    },

    /// Client address matched a deny rule (or no allow rule)
    #[error("Client address not allowed: {addr}")]
    IpBlocked {
        /// The rejected address.
        addr: String,
    },

    /// Token user is absent from or disabled in the user list
    #[error("User not enabled: {name}")]
    UserDisabled {
        /// The rejected user name.
        name: String,
    },
}

/// Transport error type
///
/// OS-level open/read/write failure on the serial or TCP link. This is the
/// only error family that collapses a connection: it triggers the close
/// path, which removes the controller from the registry and destroys it.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Opening the port/socket failed
    #[error("Failed to open {ident}: {reason}")]
    OpenFailed {
        /// The connection ident.
        ident: String,
        /// The underlying failure.
        reason: String,
    },

    /// Writing to an open link failed
    #[error("Write failed: {reason}")]
    WriteFailed {
        /// The underlying failure.
        reason: String,
    },

    /// The link is not open
    #[error("Transport not open")]
    NotOpen,

    /// The peer closed the link
    #[error("Connection closed by peer")]
    Closed,

    /// Underlying I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Protocol error type
///
/// `error:<code>` or `ALARM:<code>` reported by the firmware. During a
/// running program this pauses the workflow (unless errors are ignored by
/// configuration); otherwise it is logged and echoed.
#[derive(Error, Debug, Clone)]
pub enum ProtocolError {
    /// Firmware rejected a line
    #[error("{message}")]
    Firmware {
        /// Numeric code when the dialect provides one.
        code: Option<u8>,
        /// Decoded human-readable message.
        message: String,
        /// The raw reply line.
        raw: String,
    },

    /// Firmware raised an alarm
    #[error("{raw}")]
    Alarm {
        /// Numeric code when the dialect provides one.
        code: Option<u8>,
        /// The raw reply line.
        raw: String,
    },
}

/// Main error type for the cncd daemon
///
/// A unified error that can represent any failure from all layers. This is
/// the primary error type used in public APIs.
#[derive(Error, Debug)]
pub enum Error {
    /// Validation error
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Auth error
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Transport error
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Protocol error
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Internal bookkeeping went inconsistent (e.g. `received > sent`)
    #[error("Invariant violation: {message}")]
    Invariant {
        /// Description of the violated invariant.
        message: String,
    },

    /// Standard I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an error from a string message
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// Create an invariant-violation error
    pub fn invariant(msg: impl Into<String>) -> Self {
        Error::Invariant {
            message: msg.into(),
        }
    }

    /// Check if this error should collapse the connection
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Io(_))
    }
}

/// Result type using Error
pub type Result<T> = std::result::Result<T, Error>;
