use std::io;

use thiserror::Error;

use crate::rdma::cm::CmEventType;
use crate::rdma::cq::{CqCreationError, WcStatus};
use crate::rdma::qp::QpCreationError;

/// Connection establishment error type.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The destination could not be resolved.
    #[error("cannot resolve destination: {0}")]
    Resolve(String),

    /// The expected CM event did not arrive in time.
    #[error("timed out waiting for {expected:?} after {waited_ms} ms")]
    Timeout {
        expected: CmEventType,
        waited_ms: u64,
    },

    /// A CM event other than the expected one arrived.
    #[error("expected CM event {expected:?}, got {got:?}")]
    UnexpectedEvent {
        expected: CmEventType,
        got: CmEventType,
    },

    /// The server refused the connection or nobody listens at the destination.
    #[error("connection rejected ({0:?})")]
    Rejected(CmEventType),

    /// Local resources for the connection could not be set up.
    #[error("cannot set up connection resources")]
    Resource(#[from] io::Error),

    /// The connection parameters could not be encoded.
    #[error("cannot encode connection parameters: {0}")]
    Params(#[from] serde_json::Error),
}

impl From<CqCreationError> for ConnectError {
    fn from(e: CqCreationError) -> Self {
        ConnectError::Resource(io::Error::new(io::ErrorKind::Other, e))
    }
}

impl From<QpCreationError> for ConnectError {
    fn from(e: QpCreationError) -> Self {
        ConnectError::Resource(io::Error::new(io::ErrorKind::Other, e))
    }
}

/// Remote procedure call error type.
#[derive(Debug, Error)]
pub enum RpcError {
    /// The connection does not exist or has been torn down.
    #[error("invalid connection")]
    InvalidConnection,

    /// The request does not fit in a context buffer.
    #[error("request too large: {0}")]
    RequestTooLarge(String),

    /// The response did not fit in the client's buffer.
    #[error("response too large: {0}")]
    ResponseTooLarge(String),

    /// No handler is registered for the procedure.
    #[error("unknown procedure {0}")]
    UnknownProcedure(u32),

    /// The handler returned an error or panicked.
    #[error("handler fault: {0}")]
    HandlerFault(String),

    /// A work request completed with an error.
    #[error("work completion error")]
    Completion(#[from] WcStatus),

    /// A work request could not be posted.
    #[error("cannot post work request")]
    Post(#[from] io::Error),

    /// The peer sent a malformed message.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The call did not complete within the call timeout.
    #[error("call timed out after {0} ms")]
    Timeout(u64),
}

/// Server error type.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The listening address could not be resolved.
    #[error("cannot resolve listening address: {0}")]
    Resolve(String),

    /// Binding or listening failed.
    #[error("cannot listen")]
    Listen(#[source] io::Error),

    /// The server's event loop lost one of its sources.
    #[error("server resources failed: {0}")]
    Resource(String),
}

/// Configuration loading error type.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file")]
    Io(#[from] io::Error),

    #[error("cannot parse config")]
    Toml(#[from] toml::de::Error),
}
