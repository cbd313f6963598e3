//! Error types for idlewatch.
//!
//! Almost nothing in this crate can fail: invalid timeouts are clamped and
//! missing trackers are treated as no-ops. The errors below cover the few
//! caller-facing failures that remain.

use thiserror::Error;

use crate::tracker::TrackerId;

/// Errors raised by the tracker registry.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TrackingError {
    /// The subject already has a live tracker.
    #[error("Subject is already tracked by tracker {tracker}")]
    AlreadyTracked {
        /// The existing tracker.
        tracker: TrackerId,
    },
}

/// Errors raised while loading configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The document could not be deserialized.
    #[error("Failed to parse tracker configuration: {message}")]
    Parse {
        /// Parser message.
        message: String,
    },
}

/// Errors raised by transition streams.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// Nothing arrived before the timeout.
    #[error("No transition received within {duration_ms}ms")]
    Timeout {
        /// The timeout that elapsed.
        duration_ms: u64,
    },

    /// The tracker side of the stream is gone.
    #[error("Transition stream is disconnected")]
    Disconnected,

    /// No event is buffered.
    #[error("Transition stream is empty")]
    Empty,
}

/// Top-level error type for idlewatch.
#[derive(Debug, Error)]
pub enum IdleError {
    /// Registry failure.
    #[error("Tracking error: {0}")]
    Tracking(#[from] TrackingError),

    /// Configuration failure.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Stream failure.
    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    /// Unexpected internal failure.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the failure.
        message: String,
    },
}

impl IdleError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if the subject was already tracked.
    #[must_use]
    pub const fn is_already_tracked(&self) -> bool {
        matches!(self, Self::Tracking(TrackingError::AlreadyTracked { .. }))
    }

    /// Returns true if this is a configuration error.
    #[must_use]
    pub const fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// Returns true if this is a stream error.
    #[must_use]
    pub const fn is_stream(&self) -> bool {
        matches!(self, Self::Stream(_))
    }

    /// Returns true if this is an internal error.
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }

    /// Returns true if this error is retryable.
    ///
    /// Only waiting on a stream can succeed on a second attempt; tracking a
    /// subject twice stays a precondition violation until it is untracked.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Stream(StreamError::Timeout { .. } | StreamError::Empty))
    }
}

/// Result type alias for idlewatch operations.
pub type IdleResult<T> = Result<T, IdleError>;
