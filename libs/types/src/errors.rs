//! Error types shared across the pipeline
//!
//! Decode failures are recoverable (the record is dropped and counted);
//! state errors signal a broken aggregate invariant and must stop the
//! pipeline that observed them.

use thiserror::Error;

use crate::ids::AssetId;

/// Reasons a raw payload could not become a `RawRecord`
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("Schema violation: {reason}")]
    SchemaViolation { reason: String },

    #[error("Coercion error: field {field} has non-decimal value {value:?}")]
    CoercionError { field: &'static str, value: String },
}

impl DecodeError {
    /// Short label for counters and structured logs.
    pub fn kind_label(&self) -> &'static str {
        match self {
            DecodeError::SchemaViolation { .. } => "schema_violation",
            DecodeError::CoercionError { .. } => "coercion_error",
        }
    }
}

/// Aggregation state errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StateError {
    #[error("Aggregate invariant violated for asset {asset_id}, field {field}: {reason}")]
    InvariantViolation {
        asset_id: AssetId,
        field: &'static str,
        reason: String,
    },
}
