//! Error types shared by the core capabilities.

use thiserror::Error;

// =============================================================================
// Identifier errors
// =============================================================================

/// Errors raised while parsing a protocol identifier.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentifierError {
    /// The input is not a recognisable identifier.
    #[error("invalid identifier '{input}': {reason}")]
    InvalidIdentifier {
        /// Offending input.
        input: String,
        /// Why it was rejected.
        reason: &'static str,
    },
}

impl IdentifierError {
    /// Creates an invalid identifier error.
    pub fn invalid(input: impl Into<String>, reason: &'static str) -> Self {
        Self::InvalidIdentifier {
            input: input.into(),
            reason,
        }
    }
}

/// Result type for identifier parsing.
pub type IdentifierResult<T> = Result<T, IdentifierError>;

// =============================================================================
// Chat client errors
// =============================================================================

/// Errors surfaced by a [`ChatClient`](crate::client::ChatClient).
#[derive(Error, Debug, Clone)]
pub enum ClientError {
    /// The session is not in the `Connected` state.
    #[error("chat client is not ready (state: {state})")]
    NotReady {
        /// Connection state observed when the call was made.
        state: crate::client::ConnectionState,
    },

    /// The outbound buffer is full.
    #[error("outbound buffer is full")]
    Busy,

    /// The upstream service rejected the request.
    #[error("chat API error: {0}")]
    Api(String),

    /// Media could not be downloaded.
    #[error("media unavailable: {0}")]
    MediaUnavailable(String),

    /// The event stream was already taken by another consumer.
    #[error("event stream already taken")]
    StreamTaken,

    /// The client has been closed.
    #[error("chat client closed")]
    Closed,
}

impl ClientError {
    /// Creates an API error with the given message.
    pub fn api(msg: impl Into<String>) -> Self {
        Self::Api(msg.into())
    }
}

/// Result type for chat client calls.
pub type ClientResult<T> = Result<T, ClientError>;

// =============================================================================
// Store errors
// =============================================================================

/// Errors surfaced by a document store or by the collections gateway.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// The store could not be reached after retrying.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The circuit breaker for this endpoint is open.
    #[error("circuit open for store endpoint '{endpoint}'")]
    CircuitOpen {
        /// The endpoint whose breaker is open.
        endpoint: String,
    },

    /// A single attempt exceeded its deadline.
    #[error("store operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// A transient fault that is worth retrying.
    #[error("transient store error: {0}")]
    Transient(String),

    /// A unique index rejected the write.
    #[error("duplicate key on index '{index}' in '{collection}'")]
    DuplicateKey {
        /// Collection name.
        collection: String,
        /// Violated index name.
        index: String,
    },

    /// A conditional write matched no document.
    #[error("write conflict in '{0}'")]
    Conflict(String),

    /// The filter, update or pipeline is malformed.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// A document could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Underlying I/O failure (file backend).
    #[error("store I/O error: {0}")]
    Io(String),

    /// The backend does not support the requested operation.
    #[error("unsupported store operation: {0}")]
    Unsupported(&'static str),
}

impl StoreError {
    /// Creates an invalid query error.
    pub fn invalid_query(msg: impl Into<String>) -> Self {
        Self::InvalidQuery(msg.into())
    }

    /// Returns `true` for failures worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transient(_) | Self::Timeout(_) | Self::Io(_) | Self::Unavailable(_)
        )
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(StoreError::Transient("reset".into()).is_transient());
        assert!(StoreError::Timeout(std::time::Duration::from_secs(1)).is_transient());
        assert!(!StoreError::invalid_query("bad").is_transient());
        assert!(
            !StoreError::DuplicateKey {
                collection: "accounts".into(),
                index: "userId_1".into(),
            }
            .is_transient()
        );
    }
}
