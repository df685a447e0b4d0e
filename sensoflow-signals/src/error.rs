//! Error types for signal sources.

use thiserror::Error;

/// Errors that can occur when sampling a load signal.
///
/// None of these are fatal: the load sampler substitutes a neutral
/// pressure for any source that fails.
#[derive(Debug, Error)]
pub enum SignalError {
    /// Reading the underlying source failed.
    #[error("Failed to read {source_name}: {error}")]
    Io {
        source_name: &'static str,
        #[source]
        error: std::io::Error,
    },

    /// The source was readable but its contents were not understood.
    #[error("Failed to parse {source_name}: {reason}")]
    Parse {
        source_name: &'static str,
        reason: String,
    },

    /// The source has nothing to report yet (or on this platform).
    #[error("Signal unavailable: {0}")]
    Unavailable(String),
}

impl SignalError {
    pub(crate) fn parse(source_name: &'static str, reason: impl Into<String>) -> Self {
        SignalError::Parse {
            source_name,
            reason: reason.into(),
        }
    }
}
