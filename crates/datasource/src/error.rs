//! Pool and driver error types.

use std::time::Duration;

use thiserror::Error;

/// Errors reported by a database driver.
///
/// This is the error type of the external driver boundary. The pool wraps it in
/// [`PoolError::ConnectionCreation`] when opening a connection fails; close
/// failures are logged and never escalated.
#[derive(Debug, Error)]
pub enum DriverError {
    /// Opening a physical connection failed.
    #[error("connection failed: {0}")]
    Connect(String),

    /// The connection was closed.
    #[error("connection closed")]
    Closed,

    /// A statement failed on the server.
    #[error("query error: {0}")]
    Query(String),

    /// The connection does not provide the requested capability.
    #[error("operation not supported by this connection: {0}")]
    Unsupported(&'static str),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DriverError {
    /// Check if this error is transient and may succeed on retry.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connect(_) | Self::Closed | Self::Io(_))
    }
}

/// The lifecycle rule that an operation violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IllegalState {
    /// The data source was used before it was configured.
    NotConfigured,
    /// The data source was configured a second time.
    AlreadyConfigured,
    /// The pool or data source was used after it was disposed.
    Disposed,
}

impl std::fmt::Display for IllegalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotConfigured => f.write_str("not configured"),
            Self::AlreadyConfigured => f.write_str("already configured"),
            Self::Disposed => f.write_str("already disposed"),
        }
    }
}

/// Errors that can occur during pool operations.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The factory could not open a new connection.
    #[error("failed to create connection: {0}")]
    ConnectionCreation(#[source] DriverError),

    /// The pool is at its strict maximum and blocking is disabled.
    #[error("maximum connections ({max}) reached")]
    MaxConnectionsReached {
        /// Maximum allowed connections.
        max: usize,
    },

    /// No connection was released before the block timeout expired.
    #[error("connection acquisition timeout after {0:?}")]
    AcquisitionTimeout(Duration),

    /// The operation is not valid in the current lifecycle state.
    #[error("illegal state: {0}")]
    IllegalState(IllegalState),

    /// Pool configuration error.
    #[error("pool configuration error: {0}")]
    Configuration(String),

    /// No data source could serve the request.
    #[error("no valid connection: {0}")]
    NoValidConnection(String),
}

impl PoolError {
    /// Check if this error means the pool had no connection to hand out.
    ///
    /// Covers both the non-blocking saturation case and an expired block timeout.
    #[must_use]
    pub fn is_no_available_connection(&self) -> bool {
        matches!(
            self,
            Self::MaxConnectionsReached { .. } | Self::AcquisitionTimeout(_)
        )
    }

    /// Check if this error is a lifecycle violation.
    #[must_use]
    pub fn is_illegal_state(&self) -> bool {
        matches!(self, Self::IllegalState(_))
    }
}

impl From<IllegalState> for PoolError {
    fn from(state: IllegalState) -> Self {
        Self::IllegalState(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_available_connection_grouping() {
        assert!(PoolError::MaxConnectionsReached { max: 2 }.is_no_available_connection());
        assert!(
            PoolError::AcquisitionTimeout(Duration::from_millis(100)).is_no_available_connection()
        );
        assert!(!PoolError::IllegalState(IllegalState::Disposed).is_no_available_connection());
        assert!(
            !PoolError::ConnectionCreation(DriverError::Closed).is_no_available_connection()
        );
    }

    #[test]
    fn test_illegal_state_display() {
        let err = PoolError::from(IllegalState::AlreadyConfigured);
        assert!(err.is_illegal_state());
        assert_eq!(err.to_string(), "illegal state: already configured");
    }

    #[test]
    fn test_connection_creation_keeps_source() {
        use std::error::Error as _;

        let err = PoolError::ConnectionCreation(DriverError::Connect("refused".into()));
        assert_eq!(
            err.source().map(ToString::to_string).as_deref(),
            Some("connection failed: refused")
        );
    }

    #[test]
    fn test_driver_error_transient() {
        assert!(DriverError::Closed.is_transient());
        assert!(!DriverError::Unsupported("savepoints").is_transient());
        assert!(!DriverError::Query("syntax".into()).is_transient());
    }
}
