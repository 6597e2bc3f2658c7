// src/error.rs

//! Unified error handling for the ingestion pipeline.

use std::fmt;

use thiserror::Error;

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, AppError>;

/// Unified application error type.
#[derive(Error, Debug)]
pub enum AppError {
    /// AWS S3 error
    #[error("S3 error: {0}")]
    S3(String),

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// AMQP broker error
    #[error("Broker error: {0}")]
    Broker(#[from] lapin::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing failed
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// URL parsing failed
    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    /// Feed could not be fetched or parsed
    #[error("Feed error for {source_url}: {message}")]
    Feed { source_url: String, message: String },

    /// Broker accepted the connection but refused the message
    #[error("Publish rejected: {0}")]
    Publish(String),

    /// Broker connection is gone (stream ended, channel closed)
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Object upload failed
    #[error("Upload of {key} failed: {message}")]
    Upload { key: String, message: String },

    /// Message payload did not match the queue message schema
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Data validation error
    #[error("Validation error: {0}")]
    Validation(String),
}

impl AppError {
    /// Create a feed error with the source URL as context.
    pub fn feed(source_url: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Feed {
            source_url: source_url.into(),
            message: message.to_string(),
        }
    }

    /// Create an upload error for an object key.
    pub fn upload(key: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Upload {
            key: key.into(),
            message: message.to_string(),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a malformed-message error.
    pub fn malformed(message: impl fmt::Display) -> Self {
        Self::Malformed(message.to_string())
    }

    /// Whether the error comes from the transport and warrants a reconnect.
    ///
    /// Broker protocol errors and dropped connections are transient; data,
    /// configuration and storage errors are not.
    pub fn is_transient(&self) -> bool {
        match self {
            AppError::Broker(_) | AppError::ConnectionLost(_) => true,
            AppError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_are_transient() {
        assert!(AppError::ConnectionLost("channel closed".into()).is_transient());
        let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(AppError::Io(reset).is_transient());
    }

    #[test]
    fn data_errors_are_permanent() {
        assert!(!AppError::malformed("missing msg_id").is_transient());
        assert!(!AppError::config("no feeds").is_transient());
        assert!(!AppError::Publish("nack".into()).is_transient());
        let missing = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(!AppError::Io(missing).is_transient());
    }

    #[test]
    fn feed_error_carries_source() {
        let err = AppError::feed("https://example.com/rss", "HTTP 503");
        assert_eq!(
            err.to_string(),
            "Feed error for https://example.com/rss: HTTP 503"
        );
    }
}
