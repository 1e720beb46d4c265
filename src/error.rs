use thiserror::Error;

/// Result type for device link operations
pub type Result<T> = std::result::Result<T, LinkError>;

/// Errors that can occur while talking to a device
#[derive(Error, Debug)]
pub enum LinkError {
    /// Socket-level error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The device is not connected
    #[error("Connection closed")]
    ConnectionClosed,

    /// The connection dropped while the request was pending or queued
    #[error("Connection dropped before a response arrived")]
    Dropped,

    /// Request timed out waiting for response
    #[error("Request timeout")]
    Timeout,

    /// Response did not match the outstanding request
    #[error("Protocol desync: {0}")]
    ProtocolDesync(String),

    /// Device answered with a well-formed negative response
    #[error("Device reported error: {detail}")]
    DeviceReported {
        /// Error detail as reported by the device
        detail: String,
    },

    /// Too many requests waiting to be sent
    #[error("Request queue full")]
    QueueFull,

    /// The protocol has no command for this attribute
    #[error("Unsupported attribute: {0}")]
    UnsupportedAttribute(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration file could not be parsed
    #[error("Config error: {0}")]
    Config(#[from] toml::de::Error),

    /// Configuration parsed but is not usable
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// The session task has stopped
    #[error("Session stopped")]
    SessionStopped,

    /// Channel receive error
    #[error("Channel error: {0}")]
    ChannelError(String),
}

/// A frame that could not be understood by the protocol parser
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ParseError(pub String);

impl ParseError {
    pub fn new(detail: impl Into<String>) -> Self {
        Self(detail.into())
    }
}

impl From<ParseError> for LinkError {
    fn from(e: ParseError) -> Self {
        LinkError::ProtocolDesync(e.0)
    }
}
