use thiserror::Error;

pub type Result<T> = std::result::Result<T, AggregatorError>;

#[derive(Debug, Error)]
pub enum AggregatorError {
    #[error("rate limited after {attempts} attempt(s): {message}")]
    RateLimited { attempts: usize, message: String },
    #[error("network failure after {attempts} attempt(s): {message}")]
    NetworkTransient { attempts: usize, message: String },
    #[error("protocol decode error: {0}")]
    ProtocolDecode(String),
    #[error("cache entry `{key}` is corrupt: {reason}")]
    CacheCorrupt { key: String, reason: String },
    #[error("snapshot unavailable (primary: {primary}; backup: {backup})")]
    SnapshotUnavailable { primary: String, backup: String },
    #[error("scan superseded by a newer run")]
    Cancelled,
    #[error("fatal: {0}")]
    Fatal(String),
}

impl AggregatorError {
    /// Whether the transport should try the same request again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::NetworkTransient { .. })
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::ProtocolDecode(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }
}

impl From<rusqlite::Error> for AggregatorError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Fatal(format!("sqlite: {err}"))
    }
}

impl From<serde_json::Error> for AggregatorError {
    fn from(err: serde_json::Error) -> Self {
        Self::ProtocolDecode(format!("json: {err}"))
    }
}
