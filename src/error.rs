//! Error definitions shared by the session, tracker, store and supervisor

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::engine::{EngineError, RequestId};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Error taxonomy for the session layer
///
/// Connection failures (`Connection`, `Timeout`) are retried by the supervisor and
/// never stop the process. `OutOfOrder` and `BadParameter` are returned synchronously
/// to the caller. `UnexpectedAcknowledgement` is logged and otherwise ignored.
#[derive(Debug, Error)]
pub enum Error {
    /// Connect or reconnect failed
    #[error("Connection error: {0}")]
    Connection(EngineError),

    /// A bounded wait expired before the engine reported an outcome
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Malformed data from the engine or the broker
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Operation attempted in a state that does not allow it
    #[error("Out of order: {0}")]
    OutOfOrder(String),

    /// Acknowledgement for a request id that was never issued or is already consumed
    #[error("Unexpected acknowledgement: {kind} (request {request_id})")]
    UnexpectedAcknowledgement { kind: AckKind, request_id: RequestId },

    /// Persistence failure
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Invalid configuration or argument
    #[error("Bad parameter: {0}")]
    BadParameter(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Failure reported by the protocol engine for a single call
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    /// Configuration could not be read or parsed
    #[error("Configuration error: {0}")]
    Config(String),

    /// Several independent failures, e.g. from teardown
    #[error("{}", join_errors(.0))]
    Multiple(Vec<Error>),
}

impl Error {
    /// True for failures the supervisor retries on its next tick
    pub fn is_connection(&self) -> bool {
        matches!(self, Error::Connection(_) | Error::Timeout(_))
    }

    /// Collapses a list of failures into nothing, the single error, or `Multiple`
    pub fn aggregate(mut errors: Vec<Error>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Error::Multiple(errors)),
        }
    }
}

fn join_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Config(e.to_string())
    }
}

/// Kind of acknowledgement correlated by request id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckKind {
    Subscribe,
    Unsubscribe,
    Publish,
}

impl fmt::Display for AckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AckKind::Subscribe => write!(f, "subscribe"),
            AckKind::Unsubscribe => write!(f, "unsubscribe"),
            AckKind::Publish => write!(f, "publish"),
        }
    }
}
