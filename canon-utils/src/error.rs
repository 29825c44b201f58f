//! The workspace error type
//!
//! Transport failures are classified by [`CanonError::is_retryable`] so the
//! reconnect cycle can absorb them; everything else reaches the caller.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum CanonError {
    // === IO Errors ===

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to read file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write file {path}: {source}")]
    FileWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    // === Connection Errors ===

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Server not running at {path}")]
    ServerNotRunning { path: PathBuf },

    #[error("Connection timeout after {millis}ms")]
    ConnectionTimeout { millis: u64 },

    #[error("Connection closed unexpectedly")]
    ConnectionClosed,

    // === Configuration Errors ===

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration at {path}: {message}")]
    ConfigInvalid { path: PathBuf, message: String },

    // === Session Cache ===

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    // === Orphan Endpoints ===

    #[error("Backend request failed: {0}")]
    Http(String),

    // === Internal Errors ===

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CanonError {
    /// Create a connection error
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a persistence error
    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }

    /// Create a backend request error
    pub fn http(msg: impl Into<String>) -> Self {
        Self::Http(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Transient transport failure
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionTimeout { .. }
                | Self::Connection(_)
                | Self::ConnectionClosed
                | Self::ServerNotRunning { .. }
        )
    }
}

/// Result type alias using CanonError
pub type Result<T> = std::result::Result<T, CanonError>;

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== Display Tests ====================

    #[test]
    fn test_error_display_session_not_found() {
        let err = CanonError::SessionNotFound("canon-a".into());
        assert_eq!(err.to_string(), "Session not found: canon-a");
    }

    #[test]
    fn test_error_display_file_write() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = CanonError::FileWrite {
            path: PathBuf::from("/state/sessions.json"),
            source: io_err,
        };
        let msg = err.to_string();
        assert!(msg.contains("Failed to write file"));
        assert!(msg.contains("sessions.json"));
    }

    #[test]
    fn test_error_display_connection_timeout() {
        let err = CanonError::ConnectionTimeout { millis: 5000 };
        assert_eq!(err.to_string(), "Connection timeout after 5000ms");
    }

    #[test]
    fn test_error_display_config_invalid() {
        let err = CanonError::ConfigInvalid {
            path: PathBuf::from("/home/user/.config/canon/config.toml"),
            message: "expected table".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("Invalid configuration"));
        assert!(msg.contains("config.toml"));
        assert!(msg.contains("expected table"));
    }

    #[test]
    fn test_error_display_http() {
        let err = CanonError::http("503 Service Unavailable");
        assert_eq!(
            err.to_string(),
            "Backend request failed: 503 Service Unavailable"
        );
    }

    // ==================== Retryable Tests ====================

    #[test]
    fn test_transport_errors_are_retryable() {
        assert!(CanonError::ConnectionTimeout { millis: 10 }.is_retryable());
        assert!(CanonError::connection("refused").is_retryable());
        assert!(CanonError::ConnectionClosed.is_retryable());
        assert!(CanonError::ServerNotRunning {
            path: PathBuf::from("/tmp/canon.sock")
        }
        .is_retryable());
    }

    #[test]
    fn test_not_retryable_errors() {
        let non_retryable = [
            CanonError::SessionNotFound("x".into()),
            CanonError::Config("bad".into()),
            CanonError::Persistence("disk full".into()),
            CanonError::Http("500".into()),
            CanonError::Internal("oops".into()),
        ];

        for err in non_retryable {
            assert!(!err.is_retryable(), "Expected {:?} to NOT be retryable", err);
        }
    }

    // ==================== From Trait Tests ====================

    #[test]
    fn test_from_io_error_preserves_kind() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: CanonError = io_err.into();
        if let CanonError::Io(inner) = err {
            assert_eq!(inner.kind(), std::io::ErrorKind::PermissionDenied);
        } else {
            panic!("Expected Io variant");
        }
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: CanonError = json_err.into();
        assert!(matches!(err, CanonError::Serialization(_)));
    }
}
