//! Package domain module.
//!
//! Packages, their content rows, the commitments reserved against them and the
//! append-only audit trail, implemented purely as deterministic domain logic
//! (no IO, no storage).

pub mod audit;
pub mod barcode;
pub mod commitment;
pub mod content;
pub mod history;
pub mod operation;
pub mod package;

pub use audit::{LedgerViolation, audit_ledger, verify_target_assembly};
pub use barcode::BarcodeFormat;
pub use commitment::{Allocation, PackageCommitment};
pub use content::PackageContent;
pub use history::{
    MovementType, PackageLocationHistory, PackageTransaction, TransactionKind, UnitType,
};
pub use operation::{OperationKind, OperationRef};
pub use package::{Location, Package, PackageStatus};
