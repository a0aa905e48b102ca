//! Per-record error taxonomy.
//!
//! Every variant excludes a single record from the run; none of them is fatal on its
//! own. Whether the run carries on is decided by the caller (strict mode, reject ratio).
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationReason {
    #[error("missing required value")]
    Missing,
    #[error("length {actual} exceeds {max}")]
    TooLong { max: usize, actual: usize },
    #[error("expected {expected}")]
    TypeMismatch { expected: &'static str },
    #[error("does not match date format '{format}'")]
    MalformedDate { format: String },
    #[error("{actual} values for {expected} header columns")]
    FieldCount { expected: usize, actual: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("field '{field}': {reason}")]
    Validation {
        field: &'static str,
        reason: ValidationReason,
    },

    #[error("field '{field}': {detail}")]
    InvalidDate { field: &'static str, detail: String },

    #[error("country '{country}' is not a configured partition")]
    UnroutablePartition { country: String },

    #[error("duplicate key ({customer_id}, {country}) in staging")]
    DuplicateKey { customer_id: String, country: String },
}

impl RecordError {
    pub fn missing(field: &'static str) -> Self {
        RecordError::Validation {
            field,
            reason: ValidationReason::Missing,
        }
    }

    /// Stable code written to rejects files and run summaries.
    pub fn code(&self) -> &'static str {
        match self {
            RecordError::Validation { reason, .. } => match reason {
                ValidationReason::Missing => "CUST_FIELD_MISSING",
                ValidationReason::TooLong { .. } => "CUST_FIELD_TOO_LONG",
                ValidationReason::TypeMismatch { .. } => "CUST_TYPE_MISMATCH",
                ValidationReason::MalformedDate { .. } => "CUST_DATE_MALFORMED",
                ValidationReason::FieldCount { .. } => "CUST_FIELD_COUNT",
            },
            RecordError::InvalidDate { .. } => "CUST_DATE_INVALID",
            RecordError::UnroutablePartition { .. } => "CUST_PARTITION_UNROUTABLE",
            RecordError::DuplicateKey { .. } => "CUST_KEY_DUPLICATE",
        }
    }

    pub fn category(&self) -> RejectCategory {
        match self {
            RecordError::Validation { .. } => RejectCategory::Validation,
            RecordError::InvalidDate { .. } => RejectCategory::InvalidDate,
            RecordError::UnroutablePartition { .. } => RejectCategory::UnroutablePartition,
            RecordError::DuplicateKey { .. } => RejectCategory::DuplicateKey,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectCategory {
    Validation,
    InvalidDate,
    UnroutablePartition,
    DuplicateKey,
}

impl fmt::Display for RejectCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RejectCategory::Validation => "validation",
            RejectCategory::InvalidDate => "invalid_date",
            RejectCategory::UnroutablePartition => "unroutable_partition",
            RejectCategory::DuplicateKey => "duplicate_key",
        })
    }
}
