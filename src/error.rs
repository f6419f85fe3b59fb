//! Error types for the debugging control plane.
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`].
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | [`Error::Config`], [`Error::BrowserNotFound`] |
//! | Connection | [`Error::Connection`], [`Error::AttachFailed`], [`Error::LaunchFailed`], [`Error::ConnectionTimeout`], [`Error::ConnectionClosed`] |
//! | Targets | [`Error::TargetNotFound`], [`Error::TabClosed`] |
//! | Execution | [`Error::Timeout`], [`Error::RequestTimeout`] |
//! | Health | [`Error::HealthDegraded`] |
//! | Safety | [`Error::InvariantViolation`] |
//! | Protocol | [`Error::Protocol`] |
//! | External | [`Error::Io`], [`Error::Json`], [`Error::WebSocket`], [`Error::Http`] |

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::path::PathBuf;
use std::result::Result as StdResult;

use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::identifiers::{RequestId, TabId, TargetId};

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// ErrorClass
// ============================================================================

/// Coarse caller-facing classification of a failure.
///
/// Lets a driver decide between "try again", "fix configuration", and
/// "restart the session manually" without pattern-matching every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient failure; retrying the same operation may succeed.
    Transient,
    /// Configuration problem; fix the options and retry.
    Configuration,
    /// Browser is in an unrecoverable state; manual reattach required.
    Unrecoverable,
    /// Caller error (stale ID, bad argument); retrying unchanged will not help.
    Caller,
}

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// Each variant includes relevant context for debugging without source
/// access: attempted endpoints, last underlying transport error, IDs.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    /// Browser executable not found at path.
    #[error("Browser executable not found at: {path}")]
    BrowserNotFound {
        /// Path where the executable was expected.
        path: PathBuf,
    },

    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// Connection failed.
    #[error("Connection failed: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
    },

    /// Attach exhausted all candidate endpoints.
    ///
    /// Carries every endpoint tried plus the last underlying error so the
    /// failure can be diagnosed from the message alone.
    #[error("Attach failed after trying [{}]: {last_error}", attempted.join(", "))]
    AttachFailed {
        /// Candidate endpoints tried, in order.
        attempted: Vec<String>,
        /// Last underlying transport error.
        last_error: String,
    },

    /// Failed to launch the browser process.
    #[error("Failed to launch browser: {message}")]
    LaunchFailed {
        /// Description of the launch failure.
        message: String,
    },

    /// Connection not established within the timeout.
    #[error("Connection timeout after {timeout_ms}ms")]
    ConnectionTimeout {
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// Connection closed unexpectedly.
    #[error("Connection closed")]
    ConnectionClosed,

    // ========================================================================
    // Target Errors
    // ========================================================================
    /// Target or tab ID is stale or unknown.
    #[error("Target not found: {target}")]
    TargetNotFound {
        /// The missing target ID.
        target: TargetId,
    },

    /// A retired tab ID was addressed after its page closed.
    #[error("Tab closed: {tab_id}")]
    TabClosed {
        /// The retired tab ID.
        tab_id: TabId,
    },

    // ========================================================================
    // Execution Errors
    // ========================================================================
    /// Operation timeout.
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout {
        /// Description of the operation that timed out.
        operation: String,
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// An in-flight protocol call exceeded its deadline.
    #[error("Request {request_id} timed out after {timeout_ms}ms")]
    RequestTimeout {
        /// The request ID that timed out.
        request_id: RequestId,
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    // ========================================================================
    // Health Errors
    // ========================================================================
    /// Auto-reconnect exhausted its bounded attempts.
    ///
    /// Signals "stop auto-retrying, manual reattach required".
    #[error("Connection unhealthy after {attempts} reconnect attempts, manual reattach required")]
    HealthDegraded {
        /// Reconnect attempts performed before giving up.
        attempts: u32,
    },

    // ========================================================================
    // Safety Errors
    // ========================================================================
    /// A core safety invariant was about to be violated.
    ///
    /// Fatal to the request; never silently downgraded to a no-op.
    #[error("Invariant violation: {message}")]
    InvariantViolation {
        /// Description of the violated invariant.
        message: String,
    },

    // ========================================================================
    // Protocol Errors
    // ========================================================================
    /// Protocol violation or unexpected response shape.
    #[error("Protocol error: {message}")]
    Protocol {
        /// Description of the protocol violation.
        message: String,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    /// HTTP error from the discovery endpoint.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a browser-not-found error.
    #[inline]
    pub fn browser_not_found(path: impl Into<PathBuf>) -> Self {
        Self::BrowserNotFound { path: path.into() }
    }

    /// Creates a connection error.
    #[inline]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates an attach-exhausted error.
    #[inline]
    pub fn attach_failed(attempted: Vec<String>, last_error: impl Into<String>) -> Self {
        Self::AttachFailed {
            attempted,
            last_error: last_error.into(),
        }
    }

    /// Creates a launch-failed error.
    #[inline]
    pub fn launch_failed(message: impl Into<String>) -> Self {
        Self::LaunchFailed {
            message: message.into(),
        }
    }

    /// Creates a connection timeout error.
    #[inline]
    pub fn connection_timeout(timeout_ms: u64) -> Self {
        Self::ConnectionTimeout { timeout_ms }
    }

    /// Creates a target-not-found error.
    #[inline]
    pub fn target_not_found(target: TargetId) -> Self {
        Self::TargetNotFound { target }
    }

    /// Creates a tab-closed error.
    #[inline]
    pub fn tab_closed(tab_id: TabId) -> Self {
        Self::TabClosed { tab_id }
    }

    /// Creates a timeout error.
    #[inline]
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Creates a request timeout error.
    #[inline]
    pub fn request_timeout(request_id: RequestId, timeout_ms: u64) -> Self {
        Self::RequestTimeout {
            request_id,
            timeout_ms,
        }
    }

    /// Creates a health-degraded error.
    #[inline]
    pub fn health_degraded(attempts: u32) -> Self {
        Self::HealthDegraded { attempts }
    }

    /// Creates an invariant-violation error.
    #[inline]
    pub fn invariant(message: impl Into<String>) -> Self {
        Self::InvariantViolation {
            message: message.into(),
        }
    }

    /// Creates a protocol error.
    #[inline]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a timeout error.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::ConnectionTimeout { .. } | Self::Timeout { .. } | Self::RequestTimeout { .. }
        )
    }

    /// Returns `true` if this is a connection error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::AttachFailed { .. }
                | Self::LaunchFailed { .. }
                | Self::ConnectionTimeout { .. }
                | Self::ConnectionClosed
                | Self::WebSocket(_)
        )
    }

    /// Returns `true` if this error may succeed on retry.
    #[inline]
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::ConnectionTimeout { .. }
                | Self::ConnectionClosed
                | Self::Timeout { .. }
                | Self::RequestTimeout { .. }
        )
    }

    /// Returns the coarse caller-facing classification.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Config { .. } | Self::BrowserNotFound { .. } => ErrorClass::Configuration,
            Self::HealthDegraded { .. } | Self::InvariantViolation { .. } => {
                ErrorClass::Unrecoverable
            }
            Self::TargetNotFound { .. } | Self::TabClosed { .. } => ErrorClass::Caller,
            _ => ErrorClass::Transient,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::ErrorKind;

    #[test]
    fn test_error_display() {
        let err = Error::connection("refused");
        assert_eq!(err.to_string(), "Connection failed: refused");
    }

    #[test]
    fn test_attach_failed_lists_endpoints() {
        let err = Error::attach_failed(
            vec!["127.0.0.1:9222".into(), "localhost:9222".into()],
            "connection refused",
        );
        let text = err.to_string();
        assert!(text.contains("127.0.0.1:9222"));
        assert!(text.contains("localhost:9222"));
        assert!(text.contains("connection refused"));
    }

    #[test]
    fn test_is_timeout() {
        let timeout_err = Error::ConnectionTimeout { timeout_ms: 5000 };
        let other_err = Error::connection("test");

        assert!(timeout_err.is_timeout());
        assert!(!other_err.is_timeout());
    }

    #[test]
    fn test_is_connection_error() {
        assert!(Error::connection("test").is_connection_error());
        assert!(Error::ConnectionClosed.is_connection_error());
        assert!(Error::launch_failed("port in use").is_connection_error());
        assert!(!Error::config("test").is_connection_error());
    }

    #[test]
    fn test_class_buckets() {
        assert_eq!(Error::config("x").class(), ErrorClass::Configuration);
        assert_eq!(Error::health_degraded(3).class(), ErrorClass::Unrecoverable);
        assert_eq!(
            Error::invariant("terminate on non-owned browser").class(),
            ErrorClass::Unrecoverable
        );
        assert_eq!(
            Error::tab_closed(TabId::new("tab_1")).class(),
            ErrorClass::Caller
        );
        assert_eq!(Error::ConnectionClosed.class(), ErrorClass::Transient);
    }

    #[test]
    fn test_is_recoverable() {
        assert!(Error::timeout("evaluate", 10_000).is_recoverable());
        assert!(!Error::config("test").is_recoverable());
        assert!(!Error::health_degraded(3).is_recoverable());
    }

    #[test]
    fn test_from_io_error() {
        let io_err = IoError::new(ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<String>("invalid").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
    }
}
