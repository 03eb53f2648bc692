//! Transactional storage boundary for the package ledger.
//!
//! Every service call opens one [`UnitOfWork`], performs all of its reads and
//! writes through it, and finishes with exactly one `commit()` or `rollback()`.
//!
//! ## Serialization
//!
//! Implementations must serialize concurrent mutations of the same
//! `PackageContent` row: `lock_content()` and `contents()` return rows that no
//! other unit of work can change until this one finishes. The Postgres store
//! uses `SELECT … FOR UPDATE`; the in-memory store serializes whole units of
//! work.
//!
//! ## Atomicity
//!
//! Nothing written through a unit of work is visible to others before
//! `commit()`, and `rollback()` (or dropping the unit of work) discards it all.

pub mod in_memory;
pub mod postgres;

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

use packledger_core::{CommitmentId, DomainError, PackageId, TransferId};
use packledger_packages::{
    OperationRef, Package, PackageCommitment, PackageContent, PackageLocationHistory,
    PackageTransaction,
};
use packledger_picking::{PickListLine, PickListPackage};
use packledger_transfers::{Transfer, TransferPackage};

pub use in_memory::InMemoryPackageStore;
pub use postgres::PostgresPackageStore;

pub type StoreResult<T> = Result<T, StoreError>;

/// Storage failure.
///
/// These are infrastructure errors as opposed to domain errors: the request
/// itself may have been fine.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("stored row could not be decoded: {0}")]
    Decode(String),

    /// A concurrent writer won (unique violation, serialization failure).
    #[error("write conflict: {0}")]
    Conflict(String),

    #[error("missing row: {0}")]
    Missing(String),
}

impl From<DomainError> for StoreError {
    fn from(value: DomainError) -> Self {
        StoreError::Decode(value.to_string())
    }
}

/// One transactional unit of work over all ledger tables.
#[async_trait]
pub trait UnitOfWork: Send {
    // --- packages ---------------------------------------------------------

    async fn insert_package(&mut self, package: &Package) -> StoreResult<()>;

    async fn update_package(&mut self, package: &Package) -> StoreResult<()>;

    /// Load (and lock) one package.
    async fn package(&mut self, id: PackageId) -> StoreResult<Option<Package>>;

    async fn package_by_barcode(&mut self, barcode: &str) -> StoreResult<Option<Package>>;

    /// Next value of the barcode sequence (never reused, even on rollback).
    async fn next_barcode_sequence(&mut self) -> StoreResult<u64>;

    // --- contents ---------------------------------------------------------

    /// Load and lock one content row.
    async fn lock_content(
        &mut self,
        package_id: PackageId,
        item_code: &str,
    ) -> StoreResult<Option<PackageContent>>;

    /// Load and lock every content row of a package, ordered by item code.
    async fn contents(&mut self, package_id: PackageId) -> StoreResult<Vec<PackageContent>>;

    /// Insert or update a content row.
    async fn save_content(&mut self, content: &PackageContent) -> StoreResult<()>;

    async fn delete_content(&mut self, package_id: PackageId, item_code: &str) -> StoreResult<()>;

    /// Serialize loose-stock checks for one item in one bin until the unit of
    /// work ends. Take it before reading the bin totals.
    async fn lock_bin_stock(&mut self, item_code: &str, bin_entry: i32) -> StoreResult<()>;

    /// Quantity of `item_code` held in open packages located in the bin.
    async fn packaged_quantity_in_bin(
        &mut self,
        item_code: &str,
        warehouse: &str,
        bin_entry: i32,
    ) -> StoreResult<i64>;

    async fn all_contents(&mut self) -> StoreResult<Vec<PackageContent>>;

    // --- commitments ------------------------------------------------------

    async fn insert_commitment(&mut self, commitment: &PackageCommitment) -> StoreResult<()>;

    async fn update_commitment(&mut self, commitment: &PackageCommitment) -> StoreResult<()>;

    async fn commitment(&mut self, id: CommitmentId) -> StoreResult<Option<PackageCommitment>>;

    /// Returns `false` when the row did not exist.
    async fn delete_commitment(&mut self, id: CommitmentId) -> StoreResult<bool>;

    /// Open commitments of one operation, oldest first.
    async fn commitments_for_operation(
        &mut self,
        operation: &OperationRef,
    ) -> StoreResult<Vec<PackageCommitment>>;

    async fn commitments_for_package(
        &mut self,
        package_id: PackageId,
    ) -> StoreResult<Vec<PackageCommitment>>;

    async fn all_commitments(&mut self) -> StoreResult<Vec<PackageCommitment>>;

    // --- audit trail ------------------------------------------------------

    async fn append_transaction(&mut self, transaction: &PackageTransaction) -> StoreResult<()>;

    async fn transactions(&mut self, package_id: PackageId) -> StoreResult<Vec<PackageTransaction>>;

    async fn append_location_history(&mut self, entry: &PackageLocationHistory) -> StoreResult<()>;

    async fn location_history(
        &mut self,
        package_id: PackageId,
    ) -> StoreResult<Vec<PackageLocationHistory>>;

    // --- picking ----------------------------------------------------------

    async fn insert_pick_line(&mut self, line: &PickListLine) -> StoreResult<()>;

    async fn update_pick_line(&mut self, line: &PickListLine) -> StoreResult<()>;

    async fn pick_lines(&mut self, abs_entry: i32) -> StoreResult<Vec<PickListLine>>;

    /// Quantity of open loose-stock pick lines for the item in the bin, across
    /// all pick lists.
    async fn open_stock_pick_quantity(&mut self, item_code: &str, bin_entry: i32) -> StoreResult<i64>;

    async fn insert_pick_package(&mut self, link: &PickListPackage) -> StoreResult<()>;

    async fn pick_packages(&mut self, abs_entry: i32) -> StoreResult<Vec<PickListPackage>>;

    /// Returns the number of deleted links.
    async fn delete_pick_packages(&mut self, abs_entry: i32) -> StoreResult<u64>;

    // --- transfers --------------------------------------------------------

    async fn insert_transfer(&mut self, transfer: &Transfer) -> StoreResult<()>;

    async fn update_transfer(&mut self, transfer: &Transfer) -> StoreResult<()>;

    async fn transfer(&mut self, id: TransferId) -> StoreResult<Option<Transfer>>;

    async fn insert_transfer_package(&mut self, link: &TransferPackage) -> StoreResult<()>;

    async fn transfer_packages(&mut self, transfer_id: TransferId) -> StoreResult<Vec<TransferPackage>>;

    // --- finish -----------------------------------------------------------

    async fn commit(self: Box<Self>) -> StoreResult<()>;

    async fn rollback(self: Box<Self>) -> StoreResult<()>;
}

/// Source of units of work.
#[async_trait]
pub trait PackageStore: Send + Sync {
    async fn begin(&self) -> StoreResult<Box<dyn UnitOfWork>>;
}

#[async_trait]
impl<S> PackageStore for std::sync::Arc<S>
where
    S: PackageStore + ?Sized,
{
    async fn begin(&self) -> StoreResult<Box<dyn UnitOfWork>> {
        (**self).begin().await
    }
}

/// Commit on success, roll back on failure.
///
/// A failed rollback is logged, not returned: the original error is what the
/// caller needs, and an unfinished transaction is discarded by the backend.
pub(crate) async fn finish<T, E>(uow: Box<dyn UnitOfWork>, result: Result<T, E>) -> Result<T, E>
where
    E: From<StoreError>,
{
    match result {
        Ok(value) => {
            uow.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = uow.rollback().await {
                warn!(error = %rollback_err, "rollback failed");
            }
            Err(err)
        }
    }
}
