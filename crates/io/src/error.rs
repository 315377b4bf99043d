//! Error types for rite binary I/O.

use thiserror::Error;

/// Errors produced while reading or writing rite binary data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IoError {
    /// The reader ran past the end of the input.
    #[error("unexpected end of stream: needed {needed} more bytes in {context}")]
    EndOfStream { needed: usize, context: String },

    /// The input bytes do not form a valid structure.
    #[error("invalid data in {context}: {reason}")]
    InvalidData { context: String, reason: String },

    /// A checksum did not match.
    #[error("checksum mismatch: expected {expected:#06x}, computed {computed:#06x}")]
    ChecksumMismatch { expected: u16, computed: u16 },

    /// A declared size is inconsistent with the surrounding structure.
    #[error("size mismatch in {context}: declared {declared}, actual {actual}")]
    SizeMismatch {
        context: String,
        declared: usize,
        actual: usize,
    },
}

impl IoError {
    /// Create a new end-of-stream error.
    pub fn end_of_stream<S: Into<String>>(needed: usize, context: S) -> Self {
        Self::EndOfStream {
            needed,
            context: context.into(),
        }
    }

    /// Create a new invalid-data error.
    pub fn invalid_data<S: Into<String>>(context: S, reason: S) -> Self {
        Self::InvalidData {
            context: context.into(),
            reason: reason.into(),
        }
    }

    /// Create a new size-mismatch error.
    pub fn size_mismatch<S: Into<String>>(context: S, declared: usize, actual: usize) -> Self {
        Self::SizeMismatch {
            context: context.into(),
            declared,
            actual,
        }
    }
}

/// Result type for rite binary I/O operations.
pub type IoResult<T> = std::result::Result<T, IoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = IoError::end_of_stream(4, "irep record");
        assert_eq!(
            err.to_string(),
            "unexpected end of stream: needed 4 more bytes in irep record"
        );

        let err = IoError::ChecksumMismatch {
            expected: 0x1234,
            computed: 0x5678,
        };
        assert_eq!(
            err.to_string(),
            "checksum mismatch: expected 0x1234, computed 0x5678"
        );
    }
}
