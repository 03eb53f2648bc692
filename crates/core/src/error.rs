//! Domain error model.

use thiserror::Error;

use crate::id::PackageId;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic, business/domain failures (validation,
/// invariants, conflicts, ledger rejections). Storage and ERP failures belong
/// to the infrastructure layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A domain invariant was violated.
    ///
    /// For the commitment ledger this always means an earlier bug (e.g. an
    /// orphaned commitment), never a transient condition.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A requested resource was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A conflict occurred (e.g. operation already in a terminal state).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Requested quantity exceeds `quantity - committed_quantity`.
    #[error(
        "insufficient available quantity for {item_code} in package {package_id} \
         (requested: {requested}, available: {available})"
    )]
    InsufficientAvailableQuantity {
        package_id: PackageId,
        item_code: String,
        requested: i64,
        available: i64,
    },

    /// The package cannot be taken as a whole (conflicting commitments, no content, ...).
    #[error("package {package_id} not eligible: {reason}")]
    PackageNotEligible { package_id: PackageId, reason: String },

    /// The operation is not allowed in the package's current status.
    #[error("package {package_id} has invalid status for this operation: {status}")]
    InvalidPackageStatus { package_id: PackageId, status: String },
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn not_eligible(package_id: PackageId, reason: impl Into<String>) -> Self {
        Self::PackageNotEligible {
            package_id,
            reason: reason.into(),
        }
    }

    /// Stable machine-readable code, used in caller-facing responses.
    pub fn code(&self) -> &'static str {
        match self {
            DomainError::Validation(_) => "validation_error",
            DomainError::InvariantViolation(_) => "invariant_violation",
            DomainError::InvalidId(_) => "invalid_id",
            DomainError::NotFound(_) => "not_found",
            DomainError::Conflict(_) => "conflict",
            DomainError::InsufficientAvailableQuantity { .. } => "insufficient_available_quantity",
            DomainError::PackageNotEligible { .. } => "package_not_eligible",
            DomainError::InvalidPackageStatus { .. } => "invalid_package_status",
        }
    }
}
