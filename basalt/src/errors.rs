//! Errors returned by the driver.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

pub use basalt_cql::errors::{DbError, WriteType};
use basalt_cql::frame::frame_errors::{FrameError, ParseError};

/// An error that occurred during query execution.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum QueryError {
    /// Database sent a response containing some error with a message
    #[error("Database returned an error: {0}, Error message: {1}")]
    DbError(DbError, String),

    /// Caller passed an invalid query
    #[error(transparent)]
    BadQuery(#[from] BadQuery),

    /// Input/Output error has occurred, connection broken etc.
    #[error("IO Error: {0}")]
    IoError(Arc<std::io::Error>),

    /// Unexpected or invalid message received from the server
    #[error("Protocol Error: {0}")]
    ProtocolError(&'static str),

    /// Connection the request was sent on broke before the response arrived
    #[error(transparent)]
    BrokenConnection(#[from] BrokenConnectionError),

    /// No stream id could be allocated on the connection; it is overloaded
    #[error("Unable to allocate stream id")]
    UnableToAllocStreamId,

    /// The client-side deadline of the request elapsed
    #[error("Request timeout: {0:?}")]
    RequestTimeout(Duration),

    /// Every host of the query plan failed; per-host causes attached
    #[error(transparent)]
    NoHostAvailable(#[from] NoHostAvailableError),

    /// Failed to serialize or deserialize a frame
    #[error("Frame error: {0}")]
    FrameError(Arc<FrameError>),
}

impl From<ParseError> for QueryError {
    fn from(err: ParseError) -> QueryError {
        QueryError::FrameError(Arc::new(err.into()))
    }
}

impl From<FrameError> for QueryError {
    fn from(err: FrameError) -> QueryError {
        QueryError::FrameError(Arc::new(err))
    }
}

impl From<std::io::Error> for QueryError {
    fn from(err: std::io::Error) -> QueryError {
        QueryError::IoError(Arc::new(err))
    }
}

impl From<basalt_cql::frame::response::error::Error> for QueryError {
    fn from(err: basalt_cql::frame::response::error::Error) -> QueryError {
        QueryError::DbError(err.error, err.reason)
    }
}

/// The query plan was exhausted without a single successful attempt.
/// Carries the last error observed on each tried host.
#[derive(Error, Debug, Clone, Default)]
#[error("No host could serve the request, per-host errors: {errors:?}")]
pub struct NoHostAvailableError {
    pub errors: HashMap<SocketAddr, String>,
}

/// Caller passed a query that cannot be executed as given.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum BadQuery {
    /// Serializing bound values failed
    #[error("Serializing values failed: {0}")]
    SerializeValuesError(#[from] basalt_cql::frame::value::SerializeValuesError),

    /// Serial consistency can only be set via the serial_consistency field
    #[error("Serial consistency {0} used as the regular consistency of a request")]
    SerialConsistencyForbidden(basalt_cql::Consistency),

    /// Number of values does not match the statement's bind markers
    #[error("Too many or too few values: expected {0}, got {1}")]
    ValueLenMismatch(usize, usize),

    /// Passed keyspace name is not valid
    #[error("Bad keyspace name: {0}")]
    BadKeyspaceName(#[from] BadKeyspaceName),

    /// Other reason, described in the message
    #[error("{0}")]
    Other(String),
}

/// Invalid keyspace name given to `Session::use_keyspace`.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum BadKeyspaceName {
    #[error("Keyspace name is empty")]
    Empty,
    #[error("Keyspace name {0} has len {1}, but the maximum is 48 characters")]
    TooLong(String, usize),
    #[error("Illegal character in keyspace name {0}: {1}")]
    IllegalCharacter(String, char),
}

/// An error that prevented a new session from being created.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum NewSessionError {
    /// None of the given hostnames could be resolved
    #[error("Couldn't resolve any hostname: {0:?}")]
    FailedToResolveAnyHostname(Vec<String>),

    /// The list of known nodes is empty
    #[error("Empty known nodes list")]
    EmptyKnownNodesList,

    /// Connecting to any of the contact points failed
    #[error(transparent)]
    NoHostAvailable(#[from] NoHostAvailableError),

    /// Metadata could not be fetched from any node
    #[error("Metadata fetch failed: {0}")]
    MetadataFetchError(#[from] QueryError),
}

/// An error that made the connection unusable.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ConnectionError {
    #[error("Connect timeout elapsed")]
    ConnectTimeout,
    #[error("IO Error: {0}")]
    IoError(Arc<std::io::Error>),
    #[error(transparent)]
    BrokenConnection(#[from] BrokenConnectionError),
    /// The connection setup exchange (OPTIONS/STARTUP/AUTH/REGISTER) failed.
    #[error("Connection setup failed: {0}")]
    SetupError(#[from] ConnectionSetupError),
    /// The server refused every protocol version the driver offered.
    #[error("Server refused all protocol versions supported by the driver")]
    NoSupportedProtocolVersion,
}

impl From<std::io::Error> for ConnectionError {
    fn from(err: std::io::Error) -> ConnectionError {
        ConnectionError::IoError(Arc::new(err))
    }
}

/// A failure of one of the requests of the connection setup exchange.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ConnectionSetupError {
    #[error("Database returned an error: {0}, Error message: {1}")]
    DbError(DbError, String),
    #[error("Received unexpected response: {0}")]
    UnexpectedResponse(&'static str),
    #[error("Server requires authentication but no authenticator was configured")]
    MissingAuthentication,
    #[error("Starting authentication session failed: {0}")]
    StartAuthSessionError(String),
    #[error("Evaluating authentication challenge failed: {0}")]
    AuthChallengeEvaluationError(String),
    #[error("Finishing authentication failed: {0}")]
    AuthFinishError(String),
    #[error(transparent)]
    QueryError(#[from] Box<QueryError>),
}

/// The reason a connection broke.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum BrokenConnectionError {
    #[error("Failed to read a frame: {0}")]
    FrameError(Arc<FrameError>),
    #[error("Failed to write a frame: {0}")]
    WriteError(Arc<std::io::Error>),
    #[error("Received a frame with unexpected stream id {0}")]
    UnexpectedStreamId(i16),
    #[error("Keepalive request failed: {0}")]
    KeepaliveError(Arc<BrokenConnectionError>),
    #[error("No response to keepalive request within the timeout")]
    KeepaliveTimeout,
    #[error("Too many orphaned stream ids: {0}")]
    TooManyOrphanedStreamIds(usize),
    #[error("Handling a server event failed: {0}")]
    EventHandlingError(&'static str),
    #[error("Internal channel closed; the router task died")]
    ChannelError,
}

/// The reason a per-host pool could not hand out a connection.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ConnectionPoolError {
    #[error("The pool is broken; last connection failed with: {last_connection_error}")]
    Broken { last_connection_error: ConnectionError },
    #[error("The pool is still being filled")]
    Initializing,
    #[error("The pool was closed")]
    Closed,
    #[error("All connections are busy and the pool is at its maximum size")]
    Busy,
}

/// An error of a single attempt of a request, before retry policy is applied.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum RequestAttemptError {
    #[error("Database returned an error: {0}, Error message: {1}")]
    DbError(DbError, String),
    #[error(transparent)]
    BrokenConnection(#[from] BrokenConnectionError),
    #[error("Unable to allocate stream id")]
    UnableToAllocStreamId,
    #[error("Frame error: {0}")]
    FrameError(Arc<FrameError>),
    #[error("Received unexpected response: {0}")]
    UnexpectedResponse(&'static str),
    #[error("Statement id changed upon repreparation; driver bug or server misbehaviour")]
    RepreparedIdChanged,
}

impl From<FrameError> for RequestAttemptError {
    fn from(err: FrameError) -> RequestAttemptError {
        RequestAttemptError::FrameError(Arc::new(err))
    }
}

impl From<ParseError> for RequestAttemptError {
    fn from(err: ParseError) -> RequestAttemptError {
        RequestAttemptError::FrameError(Arc::new(err.into()))
    }
}

impl From<basalt_cql::frame::response::error::Error> for RequestAttemptError {
    fn from(err: basalt_cql::frame::response::error::Error) -> RequestAttemptError {
        RequestAttemptError::DbError(err.error, err.reason)
    }
}

impl RequestAttemptError {
    /// Converts to the error surfaced to the caller.
    pub fn into_query_error(self) -> QueryError {
        match self {
            RequestAttemptError::DbError(err, reason) => QueryError::DbError(err, reason),
            RequestAttemptError::BrokenConnection(err) => QueryError::BrokenConnection(err),
            RequestAttemptError::UnableToAllocStreamId => QueryError::UnableToAllocStreamId,
            RequestAttemptError::FrameError(err) => QueryError::FrameError(err),
            RequestAttemptError::UnexpectedResponse(kind) => QueryError::ProtocolError(kind),
            RequestAttemptError::RepreparedIdChanged => {
                QueryError::ProtocolError("Reprepared statement id changed")
            }
        }
    }
}
