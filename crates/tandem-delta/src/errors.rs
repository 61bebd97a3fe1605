//! Error taxonomy for delta pipeline operations.
//!
//! One error type covers the whole pipeline. Recoverable wire-level
//! anomalies (lost connections, storage hiccups) are ordinary variants that
//! retry paths classify with [`DeltaError::is_retryable`]; violations of the
//! pipeline's own invariants are assertions at the site that detects them,
//! not errors.

use serde::{Deserialize, Serialize};

/// Result alias used throughout the delta pipeline.
pub type DeltaResult<T> = Result<T, DeltaError>;

/// Unified error type for delta pipeline operations.
///
/// Clone + Serialize so errors can ride event channels the same way
/// messages do.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
pub enum DeltaError {
    /// Connection-level failure.
    #[error("Transport error: {message}")]
    Transport {
        /// What went wrong.
        message: String,
        /// Whether dialing again can reasonably be expected to help.
        retryable: bool,
    },

    /// The server repudiated the client's in-flight outbound stream.
    #[error("Nacked at sequence {sequence_number}: {message}")]
    Nack {
        /// Server-provided detail.
        message: String,
        /// Document sequence number at repudiation time.
        sequence_number: u64,
    },

    /// Delta storage request failed.
    #[error("Storage error: {message}")]
    Storage {
        /// What went wrong.
        message: String,
    },

    /// Payload could not be decoded.
    #[error("Serialization error: {message}")]
    Serialization {
        /// What went wrong.
        message: String,
    },

    /// The application handler rejected a message.
    #[error("Handler error: {message}")]
    Handler {
        /// What went wrong.
        message: String,
    },

    /// The delta manager has been closed; no further work is accepted.
    #[error("delta manager is closed")]
    Closed,

    /// A bug in the pipeline itself.
    #[error("Internal error: {message}")]
    Internal {
        /// What went wrong.
        message: String,
    },
}

impl DeltaError {
    /// Create a retryable transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Create a transport error that retrying will not fix.
    pub fn transport_permanent(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Create a nack error.
    pub fn nack(sequence_number: u64, message: impl Into<String>) -> Self {
        Self::Nack {
            message: message.into(),
            sequence_number,
        }
    }

    /// Create a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Create a serialization error.
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create a handler error.
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether a retry loop should keep going after this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { retryable, .. } => *retryable,
            Self::Storage { .. } => true,
            Self::Nack { .. } => false,
            Self::Serialization { .. } => false,
            Self::Handler { .. } => false,
            Self::Closed => false,
            Self::Internal { .. } => false,
        }
    }

    /// Error category for logging.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Transport { .. } => "transport",
            Self::Nack { .. } => "nack",
            Self::Storage { .. } => "storage",
            Self::Serialization { .. } => "serialization",
            Self::Handler { .. } => "handler",
            Self::Closed => "closed",
            Self::Internal { .. } => "internal",
        }
    }
}

impl From<serde_json::Error> for DeltaError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_are_retryable_by_default() {
        assert!(DeltaError::transport("connection reset").is_retryable());
        assert!(!DeltaError::transport_permanent("bad credentials").is_retryable());
        assert!(DeltaError::storage("503").is_retryable());
        assert!(!DeltaError::nack(10, "rate limited").is_retryable());
        assert!(!DeltaError::Closed.is_retryable());
    }

    #[test]
    fn categories_match_variants() {
        assert_eq!(DeltaError::transport("x").category(), "transport");
        assert_eq!(DeltaError::Closed.category(), "closed");
        let err: DeltaError = serde_json::from_str::<serde_json::Value>("not json")
            .map_err(DeltaError::from)
            .unwrap_err();
        assert_eq!(err.category(), "serialization");
    }
}
