//! Error types for unicast RPC.
//!
//! Server-side variants describe the outcome of one dispatched call and map to
//! a transport status. Client-side variants keep "nothing answered" apart from
//! "something answered with an error".

use std::time::Duration;
use thiserror::Error;

/// Main error type for the unicast RPC library.
#[derive(Debug, Error)]
pub enum RpcError {
    // Dispatcher outcomes
    #[error("Method {method} does not exist")]
    MethodNotFound { method: String },

    #[error("Method {method} was already called")]
    DuplicateCall { method: String },

    #[error("{message}")]
    Internal { message: String },

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Invalid params: {message}")]
    InvalidParams { message: String },

    // Client outcomes
    #[error("Request timed out after {0:?}")]
    RequestTimeout(Duration),

    #[error("{0}")]
    RemoteMethod(String),

    #[error("Request error: {message}")]
    Request { message: String },

    #[error("Client is closing")]
    Closing,

    // Server lifecycle
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid server state: {message}")]
    InvalidState { message: String },

    // Transport plumbing
    #[error("Network error: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<reqwest::Error>,
    },

    #[error("TLS error: {message}")]
    Tls { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },
}

/// Result type alias for unicast RPC operations.
pub type Result<T> = std::result::Result<T, RpcError>;

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        RpcError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<reqwest::Error> for RpcError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_request() || err.is_timeout() {
            RpcError::Request {
                message: err.to_string(),
            }
        } else {
            RpcError::Network {
                message: err.to_string(),
                source: Some(err),
            }
        }
    }
}

impl RpcError {
    /// Transport status reported for a dispatcher outcome.
    ///
    /// - 202: duplicate call, the original is in flight or done
    /// - 405: method not found
    /// - 500: everything else that a handler or decoder produced
    pub fn status_code(&self) -> u16 {
        match self {
            RpcError::DuplicateCall { .. } => 202,
            RpcError::MethodNotFound { .. } => 405,
            _ => 500,
        }
    }

    /// Check if a failed bind should be attempted again.
    ///
    /// Only OS-level bind failures are retried; an address that cannot be
    /// parsed or resolved will not start working later.
    pub fn is_retryable(&self) -> bool {
        match self {
            RpcError::Bind { source, .. } => !matches!(
                source.kind(),
                std::io::ErrorKind::InvalidInput | std::io::ErrorKind::Unsupported
            ),
            _ => false,
        }
    }

    /// Check if this error means no endpoint produced a usable answer.
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            RpcError::Request { .. } | RpcError::RequestTimeout(_) | RpcError::Network { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RpcError::DuplicateCall {
            method: "echo".into(),
        };
        assert_eq!(err.to_string(), "Method echo was already called");

        let err = RpcError::MethodNotFound {
            method: "nope".into(),
        };
        assert_eq!(err.to_string(), "Method nope does not exist");
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            RpcError::DuplicateCall {
                method: "a".into()
            }
            .status_code(),
            202
        );
        assert_eq!(
            RpcError::MethodNotFound {
                method: "a".into()
            }
            .status_code(),
            405
        );
        assert_eq!(
            RpcError::Internal {
                message: "boom".into()
            }
            .status_code(),
            500
        );
    }

    #[test]
    fn test_retryable_bind_errors() {
        let busy = RpcError::Bind {
            addr: "127.0.0.1:9000".into(),
            source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
        };
        assert!(busy.is_retryable());

        let malformed = RpcError::Bind {
            addr: "nonsense".into(),
            source: std::io::Error::from(std::io::ErrorKind::InvalidInput),
        };
        assert!(!malformed.is_retryable());

        assert!(!RpcError::Closing.is_retryable());
    }

    #[test]
    fn test_transport_failures() {
        assert!(RpcError::RequestTimeout(Duration::from_secs(1)).is_transport_failure());
        assert!(!RpcError::RemoteMethod("boom".into()).is_transport_failure());
    }
}
