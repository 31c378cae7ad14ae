use std::fmt;

/// Error code reported when a consumer exceeded its max poll interval.
pub const MAX_POLL_EXCEEDED: &str = "_MAX_POLL_EXCEEDED";

/// Error reported by a broker collaborator.
///
/// `code` follows librdkafka naming (`_MAX_POLL_EXCEEDED`, `_MSG_SIZE_TOO_LARGE`,
/// `TOPIC_ALREADY_EXISTS`, ...). The consumer classifies errors as transient or
/// fatal by code only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerError {
    pub code: String,
    pub message: String,
}

impl BrokerError {
    pub fn new(code: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: msg.into(),
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    /// Add context to the error, preserving the original code.
    ///
    /// Produces: `"context: original message"`.
    pub fn with_context(self, ctx: impl fmt::Display) -> Self {
        Self {
            code: self.code,
            message: format!("{ctx}: {}", self.message),
        }
    }
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for BrokerError {}

/// Errors surfaced to pipeline code by datasets.
#[derive(Debug, thiserror::Error)]
pub enum DatasetError {
    #[error("invalid read mode: '{0}', expected `next` or `last`")]
    InvalidReadMode(String),

    #[error("timeout must be > 0 when consuming the last message")]
    NonPositiveTimeout,

    #[error("unable to create dataset `{0}`: reserved for internal use")]
    ReservedDataset(String),

    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("dataset '{0}' has no more values")]
    Exhausted(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl DatasetError {
    /// Broker error code, if this error came from the broker.
    pub fn broker_code(&self) -> Option<&str> {
        match self {
            DatasetError::Broker(e) => Some(e.code()),
            _ => None,
        }
    }
}
