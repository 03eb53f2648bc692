use thiserror::Error;

use packledger_core::DomainError;

use crate::external::{ErpError, PickValidationCode};
use crate::store::StoreError;

pub type WorkflowResult<T> = Result<T, WorkflowError>;

/// Error returned by the ledger services.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("external system error: {0}")]
    ExternalSystem(#[from] ErpError),

    /// The pick list was already cancelled (or never had anything to cancel).
    #[error("cancellation of pick list {abs_entry} was already processed")]
    CancellationAlreadyProcessed { abs_entry: i32 },

    /// The ERP refused the pick.
    #[error("pick rejected by ERP ({}): {message}", code.as_str())]
    PickRejected {
        code: PickValidationCode,
        message: String,
    },

    /// Not enough loose stock in the bin once packaged stock and open picks are set aside.
    #[error(
        "insufficient loose stock of {item_code} in bin {bin_entry} \
         (requested: {requested}, available: {available})"
    )]
    InsufficientBinStock {
        item_code: String,
        bin_entry: i32,
        requested: i64,
        available: i64,
    },

    /// Ledger consistency check failed; the write was rolled back.
    #[error("ledger inconsistent: {0}")]
    LedgerInconsistent(String),
}

impl WorkflowError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            WorkflowError::Domain(err) => err.code(),
            WorkflowError::Store(StoreError::Conflict(_)) => "write_conflict",
            WorkflowError::Store(_) => "storage_error",
            WorkflowError::ExternalSystem(ErpError::Timeout { .. }) => "external_timeout",
            WorkflowError::ExternalSystem(_) => "external_system_error",
            WorkflowError::CancellationAlreadyProcessed { .. } => "cancellation_already_processed",
            WorkflowError::PickRejected { .. } => "pick_rejected",
            WorkflowError::InsufficientBinStock { .. } => "insufficient_bin_stock",
            WorkflowError::LedgerInconsistent(_) => "ledger_inconsistent",
        }
    }

    /// Whether the error points at a broken ledger rather than a bad request.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            WorkflowError::LedgerInconsistent(_)
                | WorkflowError::Domain(DomainError::InvariantViolation(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use packledger_core::PackageId;

    use super::*;

    #[test]
    fn codes_follow_the_wrapped_error() {
        let err: WorkflowError = DomainError::InsufficientAvailableQuantity {
            package_id: PackageId::new(),
            item_code: "A".into(),
            requested: 5,
            available: 4,
        }
        .into();
        assert_eq!(err.code(), "insufficient_available_quantity");
        assert!(!err.is_fatal());

        let err: WorkflowError = ErpError::Timeout { timeout_ms: 10 }.into();
        assert_eq!(err.code(), "external_timeout");
    }

    #[test]
    fn invariant_violations_are_fatal() {
        assert!(WorkflowError::from(DomainError::invariant("x")).is_fatal());
        assert!(WorkflowError::LedgerInconsistent("x".into()).is_fatal());
        assert!(!WorkflowError::CancellationAlreadyProcessed { abs_entry: 1 }.is_fatal());
    }
}
