use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Session storage failures.
///
/// Callers in this crate never propagate these past their own boundary: a
/// failing backend degrades to "no prior state".
#[derive(Debug, Error)]
pub enum StorageError {
    /// Writing would exceed the backend's byte quota
    #[error("Storage quota exceeded: {needed} bytes needed, {quota} allowed")]
    QuotaExceeded { needed: usize, quota: usize },

    /// Backing file could not be read or written
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Backing document is not valid JSON
    #[error("Storage document is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),

    /// Backend lock was poisoned by a panicking writer
    #[error("Storage backend unavailable")]
    Unavailable,
}
