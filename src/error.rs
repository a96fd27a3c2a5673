//! Error types for coding operations

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CodingError>;

/// Machine-readable reason for a rejected request: a message key plus the
/// parameters a client needs to render it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    pub key: String,
    pub params: BTreeMap<String, Value>,
}

impl Rejection {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.params.insert(name.to_string(), value.into());
        self
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key)?;
        if !self.params.is_empty() {
            let params = self
                .params
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join(", ");
            write!(f, " ({})", params)?;
        }
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum CodingError {
    /// Store or cache failed during a completeness check; nothing was cached
    #[error("Validation failed: {0:#}")]
    Validation(anyhow::Error),

    /// The request is valid but the current state does not allow it
    #[error("Precondition failed: {0}")]
    Precondition(Rejection),

    #[error("Not found: {0}")]
    NotFound(Rejection),

    #[error("Invalid input: {0}")]
    InvalidInput(Rejection),

    /// Concurrent allocation runs kept claiming the same cases
    #[error("Allocation conflict: {0}")]
    AllocationConflict(Rejection),

    #[error("Store error: {0:#}")]
    Store(#[from] anyhow::Error),
}

impl CodingError {
    /// The user-facing rejection; internal failures get a generic key
    pub fn rejection(&self) -> Rejection {
        match self {
            Self::Precondition(r)
            | Self::NotFound(r)
            | Self::InvalidInput(r)
            | Self::AllocationConflict(r) => r.clone(),
            Self::Validation(_) => Rejection::new("validation.failed"),
            Self::Store(_) => Rejection::new("internal.store-error"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_display() {
        let r = Rejection::new("coding-job.apply.not-completed").with("status", "pending");
        assert_eq!(
            r.to_string(),
            "coding-job.apply.not-completed (status=\"pending\")"
        );
    }

    #[test]
    fn test_internal_errors_hide_details() {
        let err = CodingError::Store(anyhow::anyhow!("connection refused at 10.0.0.3"));
        assert_eq!(err.rejection().key, "internal.store-error");
        assert!(err.rejection().params.is_empty());
    }
}
