use thiserror::Error;

/// Unified error type for all datasource operations
///
/// Errors are `Clone` because a single metadata fetch or login attempt can be
/// awaited by several callers at once, each of which receives its own copy.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DataError {
    /// Requested object does not exist on the backend
    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    /// Insert collided with an existing key
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// Missing or rejected credentials
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Backend rejected the request parameters
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Request did not complete within the configured timeout
    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    /// Network failure or backend unreachable
    #[error("Network error: {0}")]
    Network(String),

    /// Response could not be parsed or had an unexpected shape
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// One or more feature types have no descriptor available
    #[error("Missing metadata for feature types: {}", .0.join(", "))]
    MissingMetadata(Vec<String>),

    /// Adapter does not implement this operation
    #[error("Not implemented: {0}")]
    NotImplemented(String),

    /// Operation or combination of parameters not supported by the protocol
    #[error("Operation not supported: {0}")]
    NotSupported(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Invalid query or query parameters
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse classification used by the datasource state tracking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Object-not-found, duplicate-key, unauthorized, bad-request
    Expected,
    /// Timeout or network failure
    Transport,
    /// Malformed or unparseable response
    Protocol,
    /// Feature type descriptor unavailable
    MissingMetadata,
    /// Everything else
    Other,
}

impl DataError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DataError::ObjectNotFound(_)
            | DataError::DuplicateKey(_)
            | DataError::Unauthorized(_)
            | DataError::BadRequest(_) => ErrorKind::Expected,
            DataError::Timeout(_) | DataError::Network(_) => ErrorKind::Transport,
            DataError::Protocol(_) => ErrorKind::Protocol,
            DataError::MissingMetadata(_) => ErrorKind::MissingMetadata,
            _ => ErrorKind::Other,
        }
    }

    /// True for the fixed allow-list of errors that are part of normal operation
    pub fn is_expected(&self) -> bool {
        self.kind() == ErrorKind::Expected
    }

    /// True when the error means the backend is unreachable. Protocol
    /// errors and caller mistakes leave the datasource state alone.
    pub fn flips_state(&self) -> bool {
        self.kind() == ErrorKind::Transport
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        DataError::ObjectNotFound(msg.into())
    }

    pub fn not_implemented(msg: impl Into<String>) -> Self {
        DataError::NotImplemented(msg.into())
    }

    pub fn not_supported(msg: impl Into<String>) -> Self {
        DataError::NotSupported(msg.into())
    }

    pub fn invalid_configuration(msg: impl Into<String>) -> Self {
        DataError::InvalidConfiguration(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        DataError::Protocol(msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        DataError::BadRequest(msg.into())
    }
}

impl From<serde_json::Error> for DataError {
    fn from(err: serde_json::Error) -> Self {
        DataError::Protocol(format!("JSON error: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, DataError>;
