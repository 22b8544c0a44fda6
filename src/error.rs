use thiserror::Error;

/// Main error type for sediment operations
#[derive(Error, Debug)]
pub enum SedimentError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Corrupt segment data: {0}")]
    Corrupt(String),

    #[error("Checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("Unsupported segment version {actual}, expected {expected}")]
    UnsupportedVersion { expected: u32, actual: u32 },

    #[error("FST error: {0}")]
    Fst(#[from] fst::Error),

    #[error("Snappy error: {0}")]
    Snappy(#[from] snap::Error),

    #[error("Merge invariant violated: {0}")]
    MergeInvariant(String),

    #[error("Metadata store error: {0}")]
    MetaStore(String),

    #[error("Rollback point not found for epoch {0}")]
    RollbackPointNotFound(u64),

    #[error("Unknown segment type {name} version {version}")]
    UnknownSegmentType { name: String, version: u32 },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Index is closed")]
    Closed,

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for sediment operations
pub type Result<T> = std::result::Result<T, SedimentError>;

impl SedimentError {
    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        SedimentError::Corrupt(msg.into())
    }

    /// Check if this error indicates a transient failure that could be retried
    pub fn is_retriable(&self) -> bool {
        matches!(self, SedimentError::Io(_) | SedimentError::MetaStore(_))
    }

    /// Check if this error means on-disk bytes could not be trusted
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            SedimentError::Corrupt(_)
                | SedimentError::ChecksumMismatch { .. }
                | SedimentError::UnsupportedVersion { .. }
                | SedimentError::Fst(_)
                | SedimentError::Snappy(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SedimentError::RollbackPointNotFound(42);
        assert_eq!(err.to_string(), "Rollback point not found for epoch 42");

        let err = SedimentError::ChecksumMismatch {
            expected: 0xdeadbeef,
            actual: 1,
        };
        assert_eq!(
            err.to_string(),
            "Checksum mismatch: expected 0xdeadbeef, got 0x00000001"
        );
    }

    #[test]
    fn test_retriable_errors() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk");
        assert!(SedimentError::Io(io).is_retriable());
        assert!(SedimentError::MetaStore("busy".to_string()).is_retriable());
        assert!(!SedimentError::Closed.is_retriable());
        assert!(!SedimentError::RollbackPointNotFound(1).is_retriable());
    }

    #[test]
    fn test_corruption_errors() {
        assert!(SedimentError::corrupt("short read").is_corruption());
        assert!(SedimentError::UnsupportedVersion {
            expected: 1,
            actual: 7
        }
        .is_corruption());
        assert!(!SedimentError::Closed.is_corruption());
    }
}
