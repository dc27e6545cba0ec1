//! Error types for StrataMap layout planning.

use thiserror::Error;

/// Result type alias using StrataError.
pub type Result<T> = std::result::Result<T, StrataError>;

/// Errors that can occur while configuring a map builder or emitting a layout.
///
/// All planning errors are synchronous and structured; none is retried.
/// Range and state violations surface at the offending setter, everything
/// else at `emit()` time.
#[derive(Debug, Error)]
pub enum StrataError {
    // Configuration errors
    #[error("invalid {option}: {message}")]
    InvalidConfig {
        option: &'static str,
        message: String,
    },

    #[error("conflicting configuration: {0}")]
    ConflictingConfig(String),

    #[error(
        "{role} size in serialized form must be configured, at least approximately; \
         use average size, an average sample, or a constant-size sample"
    )]
    MissingSize { role: &'static str },

    // Sizing errors
    #[error("too many entries: {message}")]
    TooManyEntries { message: String },

    #[error(
        "max chunks per segment is {max_chunks}; configuration demands \
         {entries_per_segment} entries per segment with {average_chunks_per_entry} \
         average chunks per entry"
    )]
    TooManyChunks {
        max_chunks: u64,
        entries_per_segment: u64,
        average_chunks_per_entry: f64,
    },

    #[error("cannot measure {role} sample: {message}")]
    BadSample {
        role: &'static str,
        message: String,
    },

    // Lifecycle errors
    #[error("builder is frozen: no mutation is permitted after emit()")]
    AlreadyFrozen,
}
