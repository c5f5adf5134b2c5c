//! ============================================================================
//! Memory Errors - Typed failures callers need to tell apart
//! ============================================================================
//! Most of the engine propagates `anyhow::Error`. The variants here are the
//! ones that change control flow: validation errors surface to the direct
//! caller and are never retried, and a rejected filter walks the store's
//! filter ladder instead of failing the query.
//! ============================================================================

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("Unknown memory type: {0}")]
    UnknownMemoryType(String),

    #[error("Missing required identifier: {0}")]
    MissingIdentifier(&'static str),

    #[error("Invalid namespace: {0}")]
    InvalidNamespace(String),

    #[error("Vector index rejected filter: {0}")]
    FilterRejected(String),
}

impl MemoryError {
    /// Validation errors are raised to the caller and never retried
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            MemoryError::UnknownMemoryType(_)
                | MemoryError::MissingIdentifier(_)
                | MemoryError::InvalidNamespace(_)
        )
    }
}

/// Reject empty or whitespace-only identifiers
pub fn require_id(value: &str, name: &'static str) -> Result<(), MemoryError> {
    if value.trim().is_empty() {
        return Err(MemoryError::MissingIdentifier(name));
    }
    Ok(())
}
