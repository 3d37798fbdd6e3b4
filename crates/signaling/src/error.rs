//! Error types for the signaling coordinator

/// Result type alias using the signaling Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while coordinating signaling sessions
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Request body is not a well-formed signaling message
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// No live session exists for the given id
    #[error("Unknown session: {0}")]
    UnknownSession(String),

    /// The engine rejected a negotiation step (SDP rejection, answer failure)
    #[error("Negotiation failed: {0}")]
    NegotiationFailure(String),

    /// Waiting for the answer exceeded the configured deadline
    #[error("Timed out waiting for answer: {0}")]
    BridgeTimeout(String),

    /// Session was closed while the operation was outstanding
    #[error("Session closed: {0}")]
    SessionClosed(String),

    /// Registry is at its configured capacity
    #[error("Session limit exceeded: {0}")]
    SessionLimitExceeded(String),

    /// ICE candidate could not be accepted
    #[error("ICE candidate error: {0}")]
    IceCandidateError(String),

    /// Transport engine error outside of negotiation (connection setup, teardown)
    #[error("Engine error: {0}")]
    EngineError(String),

    /// Video source error
    #[error("Video source error: {0}")]
    VideoSourceError(String),

    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Internal error (should not occur in normal operation)
    #[error("Internal error: {0}")]
    InternalError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error was caused by the client's request
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::MalformedMessage(_)
                | Error::UnknownSession(_)
                | Error::SessionLimitExceeded(_)
                | Error::IceCandidateError(_)
        )
    }

    /// Check if retrying the same request later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::BridgeTimeout(_) | Error::SessionLimitExceeded(_) | Error::IoError(_)
        )
    }

    /// Check if this error came out of SDP negotiation
    pub fn is_negotiation_error(&self) -> bool {
        matches!(self, Error::NegotiationFailure(_) | Error::BridgeTimeout(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::SerializationError(err.to_string())
    }
}
