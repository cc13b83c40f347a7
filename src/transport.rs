//! The remote JSON transport's wire contract — specified, not implemented.
//! A remote network presented locally over an ordered duplex channel
//! exchanges messages against this envelope; this module exists so a
//! future transport crate has a concrete contract to implement against and
//! so [`Error::Remote`](crate::error::Error::Remote) has a documented
//! source vocabulary.
//!
//! Out of scope here: opening connections, the channel pool's idle-flush
//! tick, authentication. Those are a collaborator's job; this crate only
//! promises that messages arrive in order and that transport errors map
//! onto [`Error`](crate::error::Error).

use serde::{Deserialize, Serialize};

use crate::status::Status;

/// A message on the wire, tagged by `type`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Envelope {
    /// A service's status changed.
    Status { id: u64, status: Status },
    /// An error response to a prior request.
    Error { code: ErrorCode, message: String },
}

/// The known remote error codes. A code outside this set still round-trips
/// through [`ErrorCode::Other`] rather than failing to parse.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    Unauthorized,
    NoNetwork,
    UnknownTerminal,
    UnknownService,
    #[serde(other)]
    Other,
}

impl From<ErrorCode> for crate::error::Error {
    fn from(code: ErrorCode) -> crate::error::Error {
        match code {
            ErrorCode::UnknownTerminal => crate::error::Error::unknown_terminal("remote"),
            ErrorCode::UnknownService => crate::error::Error::unknown_service("remote"),
            ErrorCode::Unauthorized | ErrorCode::NoNetwork | ErrorCode::Other => {
                crate::error::Error::Remote(format!("{:?}", code))
            }
        }
    }
}
