//! Error types for dispatch and payout orchestration.
//!
//! Variants follow the failure taxonomy of the core: discovery, reference
//! resolution, assignment, integrity and ledger writes. Each is fail closed at
//! the call site; nothing here is downgraded to a warning.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::store::StoreError;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Which logical table a discovery failure concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaConcept {
    Jobs,
    Assignments,
}

impl fmt::Display for SchemaConcept {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Jobs => write!(f, "jobs"),
            Self::Assignments => write!(f, "assignments"),
        }
    }
}

/// Main error type for the dispatch core
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no {concept} table satisfies the required column set")]
    SchemaNotFound { concept: SchemaConcept },

    #[error("required reference '{name}' could not be resolved")]
    MissingReference { name: &'static str },

    #[error("job {job_id} not found")]
    JobNotFound { job_id: String },

    #[error("no beneficiary pro could be determined for job {job_id}")]
    NoBeneficiary { job_id: String },

    #[error("no pro available for job {job_id}")]
    NoProAvailable { job_id: String },

    #[error("could not insert offer assignment after {attempts} attempts: {last_error}")]
    AssignmentInsertFailed { attempts: usize, last_error: String },

    #[error("computed payout for job {job_id} is not a finite amount")]
    NonFinitePayout { job_id: String },

    #[error("payout {payout:.2} exceeds order total {order_total:.2} for job {job_id}")]
    PayoutExceedsTotal {
        job_id: String,
        payout: f64,
        order_total: f64,
    },

    #[error("job {job_id} cannot move from '{from}' to '{to}'")]
    InvalidTransition {
        job_id: String,
        from: String,
        to: String,
    },

    #[error("payout ledger write failed: {0}")]
    LedgerWrite(#[source] StoreError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl DispatchError {
    /// Stable machine-readable code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::SchemaNotFound { .. } => "schema_not_found",
            Self::MissingReference { .. } => "missing_reference",
            Self::JobNotFound { .. } => "job_not_found",
            Self::NoBeneficiary { .. } => "no_beneficiary",
            Self::NoProAvailable { .. } => "no_pro_available",
            Self::AssignmentInsertFailed { .. } => "assignment_insert_failed",
            Self::NonFinitePayout { .. } => "non_finite_payout",
            Self::PayoutExceedsTotal { .. } => "payout_exceeds_total",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::LedgerWrite(_) => "ledger_write_failed",
            Self::Store(_) => "store_error",
        }
    }
}
