use thiserror::Error;

#[derive(Error, Debug)]
pub enum PdpError {
    #[error("client isn't connected")]
    NotConnected,

    #[error("client is already connected")]
    AlreadyConnected,

    #[error("no available endpoint")]
    NoAvailableEndpoint,

    #[error("request of {size} bytes exceeds limit of {limit} bytes")]
    RequestTooLarge { size: usize, limit: usize },

    #[error("mapping error: {0}")]
    Mapping(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PdpError {
    /// Whether the error reflects a connectivity problem rather than bad
    /// input, so callers can decide to retry against another client.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            PdpError::NotConnected
                | PdpError::NoAvailableEndpoint
                | PdpError::Connection(_)
                | PdpError::Timeout(_)
                | PdpError::Io(_)
        )
    }
}

impl From<std::net::AddrParseError> for PdpError {
    fn from(err: std::net::AddrParseError) -> Self {
        PdpError::Mapping(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PdpError>;
