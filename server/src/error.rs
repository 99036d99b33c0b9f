//! Error taxonomy for the server.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    /// Bad or missing credential. The connection is turned away.
    #[error("unauthorized")]
    Unauthorized,
    /// Malformed payload. The request is dropped, the connection stays open.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// The referenced session or trade no longer exists.
    #[error("not found: {0}")]
    NotFound(String),
    /// The request arrived in a state that does not allow it. Never surfaced to clients.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),
    /// The entity store refused to execute a trade.
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
    #[error("connection already has a session")]
    DuplicateSession,
    #[error("configuration error: {0}")]
    Config(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("fixture error: {0}")]
    Fixture(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ServerError>;
