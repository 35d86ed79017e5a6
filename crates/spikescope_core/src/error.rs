//! Error types for the signal-delivery and spike-extraction pipeline.
//!
//! Filtering failures never appear here: they are absorbed inside the
//! signal module, which degrades to returning unfiltered data. Everything
//! else propagates as a distinguishable category so the transport layer
//! can map it to the right external signal.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by recording access, spike queries, and sorting runs.
#[derive(Error, Debug)]
pub enum DataError {
    /// A dataset, recording file, or persisted result file does not exist
    /// at any resolvable path.
    #[error("{what} not found: {name}")]
    NotFound { what: &'static str, name: String },

    /// An operation requiring an active recording ran while none is loaded.
    #[error("No recording is loaded")]
    NoDataLoaded,

    /// Channel id outside the valid 1-indexed range for the recording.
    #[error("Channel {channel} is outside the valid range 1..={channels}")]
    InvalidChannel { channel: usize, channels: usize },

    /// A tensor container held data that is neither 1-D nor 2-D.
    #[error("Unsupported tensor shape in {path}: {dims} dimensions")]
    UnsupportedShape { path: PathBuf, dims: usize },

    /// The requested sorting algorithm has no local backend registered and
    /// no remote worker is configured.
    #[error("Sorting algorithm '{algorithm}' is not available")]
    AlgorithmUnavailable { algorithm: String },

    /// The remote worker reported failure or the round trip failed.
    #[error("Remote execution failed: {0}")]
    RemoteExecutionFailure(String),

    /// File I/O failure while loading or persisting data.
    #[error("I/O error in {operation}: {source}")]
    Io {
        operation: String,
        #[source]
        source: io::Error,
    },

    /// A file's contents could not be decoded.
    #[error("Failed to parse {what}: {message}")]
    Parse { what: String, message: String },
}

impl DataError {
    /// Create a not-found error for a dataset or recording file.
    pub fn not_found(what: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            what,
            name: name.into(),
        }
    }

    /// Create an invalid-channel error.
    pub fn invalid_channel(channel: usize, channels: usize) -> Self {
        Self::InvalidChannel { channel, channels }
    }

    /// Create an algorithm-unavailable error.
    pub fn algorithm_unavailable(algorithm: impl Into<String>) -> Self {
        Self::AlgorithmUnavailable {
            algorithm: algorithm.into(),
        }
    }

    /// Create a remote-execution error.
    pub fn remote(message: impl Into<String>) -> Self {
        Self::RemoteExecutionFailure(message.into())
    }

    /// Create an I/O error with operation context.
    pub fn io(operation: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    /// Create a parse error.
    pub fn parse(what: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Parse {
            what: what.into(),
            message: message.into(),
        }
    }
}

/// Result type for data operations.
pub type DataResult<T> = Result<T, DataError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_displays_name() {
        let err = DataError::not_found("Dataset", "session_04.bin");
        let msg = err.to_string();
        assert!(msg.contains("Dataset"));
        assert!(msg.contains("session_04.bin"));
    }

    #[test]
    fn invalid_channel_displays_range() {
        let err = DataError::invalid_channel(999, 385);
        let msg = err.to_string();
        assert!(msg.contains("999"));
        assert!(msg.contains("1..=385"));
    }

    #[test]
    fn io_error_chains_source() {
        let source = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        let err = DataError::io("mapping recording", source);
        assert!(err.to_string().contains("mapping recording"));
    }
}
