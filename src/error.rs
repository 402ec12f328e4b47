use std::collections::HashMap;
use std::net::SocketAddr;

use thiserror::Error;

pub use color_eyre::eyre::eyre;

use crate::host::Host;
use crate::protocol::response::ServerError;

pub type Result<T> = core::result::Result<T, Error>;

/// The crate's single error currency.
///
/// Codec-level recoverable underflow (`NeedMoreData`) is a distinct variant
/// rather than an out-of-band panic or a parallel `Option`-returning API:
/// callers check for it explicitly and resume parsing, they never `?` past it
/// by accident because it still participates in `Result`.
#[derive(Debug, Error)]
pub enum Error {
    /// A typed reader needs more bytes than are currently available. Recovered
    /// locally by the streaming parser; never surfaced to a driver user.
    #[error("need {needed} more bytes, have {available}")]
    NeedMoreData { needed: usize, available: usize },

    /// Fatal for the Connection: the peer sent bytes that don't parse as a
    /// valid frame under the negotiated protocol version.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A single cell failed to decode into its declared CQL type.
    #[error("failed to decode column {column} (row {row}): {message}")]
    Decode {
        row: usize,
        column: usize,
        message: String,
    },

    #[error("utf-8 error: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("operation timed out after {elapsed_ms}ms on stream {stream_id} to {endpoint}")]
    OperationTimedOut {
        stream_id: i16,
        endpoint: SocketAddr,
        elapsed_ms: u64,
    },

    #[error("connection has no free stream ids")]
    BusyConnection,

    #[error("no host was available: {inner_errors:?}")]
    NoHostAvailable {
        inner_errors: HashMap<Host, Box<Error>>,
    },

    #[error("authentication error: {0}")]
    AuthenticationError(String),

    #[error("invalid policy argument: {0}")]
    ArgumentError(String),

    #[error("bad configuration: {0}")]
    BadConfig(String),

    #[error("internal driver bug: {0}")]
    Internal(color_eyre::Report),
}

impl Error {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn internal(err: impl std::fmt::Debug) -> Self {
        Self::Internal(color_eyre::eyre::eyre!(format!("{err:#?}")))
    }

    /// True if this attempt's failure should advance the query plan to the
    /// next host rather than rethrowing immediately.
    pub fn is_retryable_on_next_host(&self) -> bool {
        matches!(
            self,
            Error::ConnectionClosed | Error::OperationTimedOut { .. } | Error::BusyConnection
        )
    }
}

impl From<core::convert::Infallible> for Error {
    fn from(err: core::convert::Infallible) -> Self {
        match err {}
    }
}
