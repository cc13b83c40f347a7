//! The error taxonomy shared by every component in this crate.
//!
//! The control-plane surface here needs to distinguish several kinds of
//! failure (programmer error vs. missing resource vs. admission rejection
//! vs. state misuse), so variants are typed with `thiserror` rather than
//! threaded through as a single opaque error.

use thiserror::Error;

/// The kinds of failure a caller of this crate's operations can observe.
///
/// Every fallible operation in `switch`, `aggregator`, `trunk` and `graph`
/// returns `Result<T>` with this error type. Variants group by failure
/// kind, not by the individual operation that raised them.
#[derive(Debug, Error)]
pub enum Error {
    /// A caller-supplied argument was malformed: negative bandwidth,
    /// negative capacity, a non-contiguous label range, a circuit that
    /// does not belong to the network it was presented to, or similar.
    /// Synchronous, never mutates state.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An unknown terminal, service id, or service handle was referenced.
    #[error("unknown terminal: {0}")]
    UnknownTerminal(String),

    /// An unknown service id or handle was referenced.
    #[error("unknown service: {0}")]
    UnknownService(String),

    /// A terminal name, service handle, or label range collided with one
    /// already registered.
    #[error("name already in use: {0}")]
    NameInUse(String),

    /// A service definition was rejected: it references a foreign or
    /// unknown circuit, it would exceed a terminal's capacity, or no
    /// spanning tree exists to realize it.
    #[error("invalid service: {0}")]
    InvalidService(String),

    /// An operation was attempted in a state that does not permit it:
    /// `define` after release, `activate` after failure, any operation
    /// on an already-released service.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// An error surfaced by the (out-of-scope) remote transport. Carries
    /// the remote error code/message verbatim; callers that care about
    /// the distinction should match on the other variants first.
    #[error("remote error: {0}")]
    Remote(String),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn invalid_argument<S: Into<String>>(msg: S) -> Error {
        Error::InvalidArgument(msg.into())
    }

    pub fn unknown_terminal<S: Into<String>>(name: S) -> Error {
        Error::UnknownTerminal(name.into())
    }

    pub fn unknown_service<S: Into<String>>(id: S) -> Error {
        Error::UnknownService(id.into())
    }

    pub fn name_in_use<S: Into<String>>(name: S) -> Error {
        Error::NameInUse(name.into())
    }

    pub fn invalid_service<S: Into<String>>(msg: S) -> Error {
        Error::InvalidService(msg.into())
    }

    pub fn illegal_state<S: Into<String>>(msg: S) -> Error {
        Error::IllegalState(msg.into())
    }
}
