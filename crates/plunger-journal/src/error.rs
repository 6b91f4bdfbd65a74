//! Error types for plunger-journal

use thiserror::Error;

/// Journal error type
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed recording line
    #[error("Parse error on line {line}: {reason}")]
    Parse { line: usize, reason: String },

    /// The machine rejected a replayed transition or could not advance
    #[error("Replay error: {0}")]
    Replay(#[from] plunger_core::Error),

    /// Export error
    #[error("Export error: {0}")]
    Export(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type for journal operations
pub type Result<T> = std::result::Result<T, Error>;
