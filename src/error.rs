use std::fmt::{Display, Formatter};
use std::io;

/// Why an on-disk chunk was rejected at open time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorruptReason {
    /// The chunk file named by the caller is missing.
    ChunkFileNotExist,
    /// The file exists but its header, footer, or length is inconsistent.
    BadChunkInDatabase,
}

impl Display for CorruptReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            CorruptReason::ChunkFileNotExist => write!(f, "chunk file not exist"),
            CorruptReason::BadChunkInDatabase => write!(f, "bad chunk in database"),
        }
    }
}

/// A specialized error type for chunk operations.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum ChunkError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// A chunk file could not be opened as a valid chunk.
    #[error("corrupt database ({reason}): {detail}")]
    CorruptDatabase {
        reason: CorruptReason,
        detail: String,
    },
    /// An invariant was violated while appending.
    #[error("chunk {chunk}: write failed: {message}")]
    ChunkWrite { chunk: u32, message: String },
    /// Completion preconditions were not met.
    #[error("chunk {chunk}: completion failed: {message}")]
    ChunkComplete { chunk: u32, message: String },
    /// A read observed inconsistent data or raced a delete.
    #[error("invalid read: {0}")]
    InvalidRead(String),
    /// Configuration value was invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Invalid state transition or operation.
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl ChunkError {
    /// Create a corrupt-database error for a missing chunk file.
    pub fn file_not_exist<T>(path: T) -> Self
    where
        T: Display,
    {
        Self::CorruptDatabase {
            reason: CorruptReason::ChunkFileNotExist,
            detail: path.to_string(),
        }
    }

    /// Create a corrupt-database error for an inconsistent chunk file.
    pub fn bad_chunk<T>(detail: T) -> Self
    where
        T: Display,
    {
        Self::CorruptDatabase {
            reason: CorruptReason::BadChunkInDatabase,
            detail: detail.to_string(),
        }
    }

    /// Create a write error scoped to the given chunk number.
    pub fn chunk_write<T>(chunk: u32, message: T) -> Self
    where
        T: Display,
    {
        Self::ChunkWrite {
            chunk,
            message: message.to_string(),
        }
    }

    /// Create a completion error scoped to the given chunk number.
    pub fn chunk_complete<T>(chunk: u32, message: T) -> Self
    where
        T: Display,
    {
        Self::ChunkComplete {
            chunk,
            message: message.to_string(),
        }
    }

    /// Create an invalid-read error from a displayable value.
    pub fn invalid_read<T>(detail: T) -> Self
    where
        T: Display,
    {
        Self::InvalidRead(detail.to_string())
    }

    /// Create an invalid configuration error from a displayable value.
    pub fn invalid_config<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::InvalidConfig(msg.to_string())
    }

    /// Create an invalid state error from a displayable value.
    pub fn invalid_state<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::InvalidState(msg.to_string())
    }
}

/// A Result type alias for chunk operations.
pub type ChunkResult<T> = Result<T, ChunkError>;
