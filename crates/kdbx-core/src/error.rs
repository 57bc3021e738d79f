//! Error types for kdbx-core

use thiserror::Error;

/// Result type alias for kdbx-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while decrypting or parsing a KeePass container
#[derive(Error, Debug)]
pub enum Error {
    /// Missing or invalid cipher method, key or IV, detected before any crypto call
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The underlying cipher rejected its input (bad padding, wrong block length)
    #[error("Crypto failure: {0}")]
    Crypto(String),

    /// A hashed block failed its integrity check
    #[error("Integrity violation: {0}")]
    Integrity(BlockFault),

    /// Header fields missing or malformed, key file unparsable, header hash mismatch
    #[error("Format error: {0}")]
    Format(String),

    /// The byte source ended before a length-prefixed structure was complete
    #[error("Short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },

    /// The decrypted body does not start with the header's stream-start marker
    #[error("Invalid credentials: incorrect password or key file, or corrupted file")]
    InvalidCredentials,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse category of an [`Error`], for callers that branch on failure kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Crypto,
    Integrity,
    Format,
    ShortRead,
    InvalidCredentials,
    Io,
}

impl Error {
    /// The category of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Configuration(_) => ErrorKind::Configuration,
            Error::Crypto(_) => ErrorKind::Crypto,
            Error::Integrity(_) => ErrorKind::Integrity,
            Error::Format(_) => ErrorKind::Format,
            Error::ShortRead { .. } => ErrorKind::ShortRead,
            Error::InvalidCredentials => ErrorKind::InvalidCredentials,
            Error::Io(_) => ErrorKind::Io,
        }
    }
}

/// The specific integrity violation observed in a hashed-block stream
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockFault {
    #[error("block index {found} where {expected} was expected")]
    IndexMismatch { expected: u32, found: u32 },

    #[error("content hash mismatch in block {index}")]
    HashMismatch { index: u32 },

    #[error("block {index} truncated")]
    Truncated { index: u32 },

    #[error("block {index} declares invalid length {length}")]
    InvalidLength { index: u32, length: i64 },

    #[error("terminator block {index} carries a non-empty hash")]
    BadTerminator { index: u32 },
}

impl From<BlockFault> for Error {
    fn from(fault: BlockFault) -> Self {
        Error::Integrity(fault)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind() {
        assert_eq!(Error::Crypto("x".into()).kind(), ErrorKind::Crypto);
        assert_eq!(
            Error::from(BlockFault::HashMismatch { index: 3 }).kind(),
            ErrorKind::Integrity
        );
        assert_eq!(
            Error::ShortRead {
                expected: 4,
                actual: 1
            }
            .kind(),
            ErrorKind::ShortRead
        );
    }

    #[test]
    fn test_display() {
        let err = Error::from(BlockFault::IndexMismatch {
            expected: 1,
            found: 7,
        });
        assert_eq!(
            err.to_string(),
            "Integrity violation: block index 7 where 1 was expected"
        );
    }
}
