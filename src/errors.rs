//! Structured error types and codes for the experiment engine
//!
//! Store failures propagate unchanged inside [`ExperimentError::Store`]; the
//! engine never retries them. Duplicate assignment inserts never reach callers:
//! the assignment engine converts them into a read-back.

use serde::{Deserialize, Serialize};

/// Structured error payload for whatever transport sits in front of the engine
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Machine-readable error code
    pub code: String,

    /// Human-readable error message
    pub message: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Errors raised by an [`crate::storage::ExperimentStore`] implementation
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A uniqueness constraint rejected the write
    #[error("Duplicate key: {0}")]
    Duplicate(String),

    /// A compare-and-swap lost against a concurrent writer
    #[error("Version conflict on {0}")]
    Conflict(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(err: rocksdb::Error) -> Self {
        Self::Backend(err.into_string())
    }
}

/// Engine-level errors
#[derive(Debug, thiserror::Error)]
pub enum ExperimentError {
    #[error("Experiment not found: {0}")]
    ExperimentNotFound(String),

    #[error("Variant {variant_id} not found in experiment {experiment_id}")]
    VariantNotFound {
        experiment_id: String,
        variant_id: String,
    },

    #[error("Metric {metric_id} not found in experiment {experiment_id}")]
    MetricNotFound {
        experiment_id: String,
        metric_id: String,
    },

    #[error("Invalid input for field '{field}': {reason}")]
    InvalidInput { field: String, reason: String },

    #[error("Cannot {action} experiment {experiment_id} in {status} state")]
    InvalidTransition {
        experiment_id: String,
        action: &'static str,
        status: String,
    },

    /// The CAS loop on a result row ran out of attempts
    #[error("Concurrent update conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ExperimentError {
    pub fn invalid_input(field: &str, reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            field: field.to_string(),
            reason: reason.into(),
        }
    }

    /// Get error code for client identification
    pub fn code(&self) -> &'static str {
        match self {
            Self::ExperimentNotFound(_) => "EXPERIMENT_NOT_FOUND",
            Self::VariantNotFound { .. } => "VARIANT_NOT_FOUND",
            Self::MetricNotFound { .. } => "METRIC_NOT_FOUND",
            Self::InvalidInput { .. } => "INVALID_INPUT",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::Conflict(_) => "CONCURRENCY_CONFLICT",
            Self::Store(StoreError::Duplicate(_)) => "DUPLICATE_KEY",
            Self::Store(StoreError::Conflict(_)) => "CONCURRENCY_CONFLICT",
            Self::Store(StoreError::Serialization(_)) => "SERIALIZATION_ERROR",
            Self::Store(StoreError::Backend(_)) => "STORAGE_ERROR",
        }
    }

    /// True for errors the caller could not have avoided by changing input
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::Store(_) | Self::Conflict(_))
    }

    /// Convert to structured error response
    pub fn to_response(&self) -> ErrorResponse {
        ErrorResponse {
            code: self.code().to_string(),
            message: self.to_string(),
            details: None,
        }
    }
}

/// Helper trait to convert validation errors
pub trait ValidationErrorExt<T> {
    fn map_validation_err(self, field: &str) -> Result<T>;
}

impl<T> ValidationErrorExt<T> for anyhow::Result<T> {
    fn map_validation_err(self, field: &str) -> Result<T> {
        self.map_err(|e| ExperimentError::InvalidInput {
            field: field.to_string(),
            reason: e.to_string(),
        })
    }
}

/// Type alias for Results using ExperimentError
pub type Result<T> = std::result::Result<T, ExperimentError>;
