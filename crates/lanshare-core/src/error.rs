//! Error types for the LANSHARE transfer engine.
//!
//! Errors fall in two groups:
//!
//! - **Listener-level** (`Bind`, `InvalidConfig`, `InvalidState`): returned to the
//!   caller of [`ConnectionAcceptor::start`](crate::ConnectionAcceptor::start).
//! - **Session-level** (`MalformedFrame`, `Connect`, `Transfer`, `Timeout`): they
//!   end exactly one session and are recorded in its history entry. They never
//!   reach the acceptor or sibling sessions.

use crate::session::SessionId;
use std::borrow::Cow;
use thiserror::Error;

/// Engine errors
#[derive(Debug, Error)]
pub enum Error {
    /// The listener could not bind its address
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address that was requested
        addr: String,
        /// Underlying OS error
        #[source]
        source: std::io::Error,
    },

    /// Protocol violation in a metadata frame
    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] FrameError),

    /// Transport failure while sending the metadata frame
    #[error("connect error: {0}")]
    Connect(Cow<'static, str>),

    /// Transport failure while streaming payload
    #[error("transfer error: {0}")]
    Transfer(Cow<'static, str>),

    /// No session with this id is known to the registry
    #[error("session not found: {0}")]
    NotFound(SessionId),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),

    /// Operation not valid in the current state
    #[error("invalid state: {0}")]
    InvalidState(Cow<'static, str>),

    /// A bounded operation did not finish in time
    #[error("operation timed out: {0}")]
    Timeout(Cow<'static, str>),

    /// File or socket I/O error outside of a session
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a connect error with static context (zero allocation)
    #[must_use]
    pub const fn connect(context: &'static str) -> Self {
        Error::Connect(Cow::Borrowed(context))
    }

    /// Create an invalid state error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_state(context: &'static str) -> Self {
        Error::InvalidState(Cow::Borrowed(context))
    }

    /// Create an invalid configuration error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_config(context: &'static str) -> Self {
        Error::InvalidConfig(Cow::Borrowed(context))
    }

    /// Create a timeout error with static context (zero allocation)
    #[must_use]
    pub const fn timeout(context: &'static str) -> Self {
        Error::Timeout(Cow::Borrowed(context))
    }
}

/// Metadata frame errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Buffer too short for the fixed header fields
    #[error("frame too short: expected at least {expected}, got {actual}")]
    TooShort {
        /// Expected minimum size
        expected: usize,
        /// Actual size received
        actual: usize,
    },

    /// Version byte not understood by this implementation
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// Declared name length runs past the end of the buffer
    #[error("name length {declared} exceeds remaining {available} bytes")]
    NameOverflow {
        /// Length declared in the frame
        declared: usize,
        /// Bytes actually left after the length field
        available: usize,
    },

    /// Declared name length above the accepted maximum
    #[error("name length {len} exceeds maximum {max}")]
    NameTooLong {
        /// Length declared in the frame
        len: usize,
        /// Accepted maximum
        max: usize,
    },

    /// Name bytes are not valid UTF-8
    #[error("file name is not valid UTF-8")]
    InvalidName,
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, Error>;
