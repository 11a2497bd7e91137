//! loadr error types

/// loadr result type
pub type Result<T> = std::result::Result<T, Error>;

/// loadr errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Buffer or pool allocation failed at startup
    #[error("allocation error: {reason}")]
    Allocation {
        /// Description of what went wrong
        reason: String,
    },

    /// Corpus file is missing, truncated, or malformed
    #[error("corpus error: {reason}")]
    Corpus {
        /// Description of what went wrong
        reason: String,
    },

    /// Reader could not produce the next raw batch
    #[error("read error: {reason}")]
    Read {
        /// Description of what went wrong
        reason: String,
    },

    /// A decode worker could not transform an item
    #[error("decode error: {reason}")]
    Decode {
        /// Description of what went wrong
        reason: String,
    },

    /// Device initialization or copy failed
    #[error("device error: {reason}")]
    Device {
        /// Description of what went wrong
        reason: String,
    },

    /// Pipeline is stopped, stalled, or in an invalid lifecycle state
    #[error("pipeline error: {reason}")]
    Pipeline {
        /// Description of what went wrong
        reason: String,
    },

    /// Invalid argument to an operation
    #[error("invalid argument '{arg}': {reason}")]
    InvalidArgument {
        /// Argument name
        arg: &'static str,
        /// Why it's invalid
        reason: String,
    },

    /// I/O error from the filesystem
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
