use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};

use packledger_core::{CommitmentId, Entity, PackageId, TransferId};
use packledger_packages::{
    OperationRef, Package, PackageCommitment, PackageContent, PackageLocationHistory,
    PackageStatus, PackageTransaction,
};
use packledger_picking::{PickListLine, PickListPackage, PickSource};
use packledger_transfers::{Transfer, TransferPackage};

use super::{PackageStore, StoreError, StoreResult, UnitOfWork};

/// Rows keyed by their entity id.
#[derive(Debug, Clone)]
struct Table<E: Entity> {
    rows: HashMap<E::Id, E>,
}

impl<E: Entity> Default for Table<E> {
    fn default() -> Self {
        Self {
            rows: HashMap::new(),
        }
    }
}

impl<E: Entity + Clone> Table<E> {
    fn get(&self, id: &E::Id) -> Option<E> {
        self.rows.get(id).cloned()
    }

    fn contains(&self, id: &E::Id) -> bool {
        self.rows.contains_key(id)
    }

    fn put(&mut self, row: &E) {
        self.rows.insert(row.id().clone(), row.clone());
    }

    fn remove(&mut self, id: &E::Id) -> bool {
        self.rows.remove(id).is_some()
    }

    fn filtered(&self, pred: impl Fn(&E) -> bool) -> Vec<E> {
        self.rows.values().filter(|r| pred(r)).cloned().collect()
    }
}

#[derive(Debug, Clone, Default)]
struct State {
    packages: Table<Package>,
    contents: BTreeMap<(PackageId, String), PackageContent>,
    commitments: Table<PackageCommitment>,
    transactions: Vec<PackageTransaction>,
    location_history: Vec<PackageLocationHistory>,
    pick_lines: Table<PickListLine>,
    pick_packages: Table<PickListPackage>,
    transfers: Table<Transfer>,
    transfer_packages: Table<TransferPackage>,
}

/// In-memory package store.
///
/// Intended for tests/dev. A unit of work holds the store-wide lock for its
/// whole lifetime and writes into a working copy that replaces the shared
/// state on commit, so units of work are fully serialized and all-or-nothing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPackageStore {
    state: Arc<Mutex<State>>,
    barcode_sequence: Arc<AtomicU64>,
}

impl InMemoryPackageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl PackageStore for InMemoryPackageStore {
    async fn begin(&self) -> StoreResult<Box<dyn UnitOfWork>> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(InMemoryUnitOfWork {
            guard,
            working,
            barcode_sequence: self.barcode_sequence.clone(),
        }))
    }
}

struct InMemoryUnitOfWork {
    guard: OwnedMutexGuard<State>,
    working: State,
    barcode_sequence: Arc<AtomicU64>,
}

fn sorted_by_key<T, K: Ord>(mut rows: Vec<T>, key: impl Fn(&T) -> K) -> Vec<T> {
    rows.sort_by_key(|r| key(r));
    rows
}

#[async_trait]
impl UnitOfWork for InMemoryUnitOfWork {
    async fn insert_package(&mut self, package: &Package) -> StoreResult<()> {
        let state = &mut self.working;
        if state.packages.contains(&package.id) {
            return Err(StoreError::Conflict(format!("package {} exists", package.id)));
        }
        if state.packages.rows.values().any(|p| p.barcode == package.barcode) {
            return Err(StoreError::Conflict(format!(
                "barcode {} already in use",
                package.barcode
            )));
        }
        state.packages.put(package);
        Ok(())
    }

    async fn update_package(&mut self, package: &Package) -> StoreResult<()> {
        if !self.working.packages.contains(&package.id) {
            return Err(StoreError::Missing(format!("package {}", package.id)));
        }
        self.working.packages.put(package);
        Ok(())
    }

    async fn package(&mut self, id: PackageId) -> StoreResult<Option<Package>> {
        Ok(self.working.packages.get(&id))
    }

    async fn package_by_barcode(&mut self, barcode: &str) -> StoreResult<Option<Package>> {
        Ok(self
            .working
            .packages
            .rows
            .values()
            .find(|p| p.barcode == barcode)
            .cloned())
    }

    async fn next_barcode_sequence(&mut self) -> StoreResult<u64> {
        Ok(self.barcode_sequence.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn lock_content(
        &mut self,
        package_id: PackageId,
        item_code: &str,
    ) -> StoreResult<Option<PackageContent>> {
        Ok(self
            .working
            .contents
            .get(&(package_id, item_code.to_string()))
            .cloned())
    }

    async fn contents(&mut self, package_id: PackageId) -> StoreResult<Vec<PackageContent>> {
        // BTreeMap order: (package, item code).
        Ok(self
            .working
            .contents
            .values()
            .filter(|c| c.package_id == package_id)
            .cloned()
            .collect())
    }

    async fn save_content(&mut self, content: &PackageContent) -> StoreResult<()> {
        if !self.working.packages.contains(&content.package_id) {
            return Err(StoreError::Missing(format!("package {}", content.package_id)));
        }
        self.working.contents.insert(
            (content.package_id, content.item_code.clone()),
            content.clone(),
        );
        Ok(())
    }

    async fn delete_content(&mut self, package_id: PackageId, item_code: &str) -> StoreResult<()> {
        self.working
            .contents
            .remove(&(package_id, item_code.to_string()));
        Ok(())
    }

    async fn lock_bin_stock(&mut self, _item_code: &str, _bin_entry: i32) -> StoreResult<()> {
        // The unit of work already holds the whole store.
        Ok(())
    }

    async fn packaged_quantity_in_bin(
        &mut self,
        item_code: &str,
        warehouse: &str,
        bin_entry: i32,
    ) -> StoreResult<i64> {
        let state = &self.working;
        Ok(state
            .contents
            .values()
            .filter(|c| {
                c.item_code == item_code
                    && c.location.warehouse == warehouse
                    && c.location.bin_entry == Some(bin_entry)
                    && state
                        .packages
                        .rows
                        .get(&c.package_id)
                        .is_some_and(|p| p.status != PackageStatus::Closed)
            })
            .map(|c| c.quantity)
            .sum())
    }

    async fn all_contents(&mut self) -> StoreResult<Vec<PackageContent>> {
        Ok(self.working.contents.values().cloned().collect())
    }

    async fn insert_commitment(&mut self, commitment: &PackageCommitment) -> StoreResult<()> {
        if self.working.commitments.contains(&commitment.id) {
            return Err(StoreError::Conflict(format!("commitment {} exists", commitment.id)));
        }
        self.working.commitments.put(commitment);
        Ok(())
    }

    async fn update_commitment(&mut self, commitment: &PackageCommitment) -> StoreResult<()> {
        if !self.working.commitments.contains(&commitment.id) {
            return Err(StoreError::Missing(format!("commitment {}", commitment.id)));
        }
        self.working.commitments.put(commitment);
        Ok(())
    }

    async fn commitment(&mut self, id: CommitmentId) -> StoreResult<Option<PackageCommitment>> {
        Ok(self.working.commitments.get(&id))
    }

    async fn delete_commitment(&mut self, id: CommitmentId) -> StoreResult<bool> {
        Ok(self.working.commitments.remove(&id))
    }

    async fn commitments_for_operation(
        &mut self,
        operation: &OperationRef,
    ) -> StoreResult<Vec<PackageCommitment>> {
        let rows = self
            .working
            .commitments
            .filtered(|c| &c.operation == operation);
        Ok(sorted_by_key(rows, |c| (c.created_at, c.id)))
    }

    async fn commitments_for_package(
        &mut self,
        package_id: PackageId,
    ) -> StoreResult<Vec<PackageCommitment>> {
        let rows = self
            .working
            .commitments
            .filtered(|c| c.package_id == package_id);
        Ok(sorted_by_key(rows, |c| (c.created_at, c.id)))
    }

    async fn all_commitments(&mut self) -> StoreResult<Vec<PackageCommitment>> {
        let rows = self.working.commitments.filtered(|_| true);
        Ok(sorted_by_key(rows, |c| (c.created_at, c.id)))
    }

    async fn append_transaction(&mut self, transaction: &PackageTransaction) -> StoreResult<()> {
        self.working.transactions.push(transaction.clone());
        Ok(())
    }

    async fn transactions(&mut self, package_id: PackageId) -> StoreResult<Vec<PackageTransaction>> {
        Ok(self
            .working
            .transactions
            .iter()
            .filter(|t| t.package_id == package_id)
            .cloned()
            .collect())
    }

    async fn append_location_history(&mut self, entry: &PackageLocationHistory) -> StoreResult<()> {
        self.working.location_history.push(entry.clone());
        Ok(())
    }

    async fn location_history(
        &mut self,
        package_id: PackageId,
    ) -> StoreResult<Vec<PackageLocationHistory>> {
        Ok(self
            .working
            .location_history
            .iter()
            .filter(|h| h.package_id == package_id)
            .cloned()
            .collect())
    }

    async fn insert_pick_line(&mut self, line: &PickListLine) -> StoreResult<()> {
        self.working.pick_lines.put(line);
        Ok(())
    }

    async fn update_pick_line(&mut self, line: &PickListLine) -> StoreResult<()> {
        if !self.working.pick_lines.contains(&line.id) {
            return Err(StoreError::Missing(format!("pick line {}", line.id)));
        }
        self.working.pick_lines.put(line);
        Ok(())
    }

    async fn pick_lines(&mut self, abs_entry: i32) -> StoreResult<Vec<PickListLine>> {
        let rows = self.working.pick_lines.filtered(|l| l.abs_entry == abs_entry);
        Ok(sorted_by_key(rows, |l| (l.created_at, l.id)))
    }

    async fn open_stock_pick_quantity(&mut self, item_code: &str, bin_entry: i32) -> StoreResult<i64> {
        Ok(self
            .working
            .pick_lines
            .rows
            .values()
            .filter(|l| {
                l.is_open()
                    && l.source == PickSource::Stock
                    && l.item_code == item_code
                    && l.bin_entry == Some(bin_entry)
            })
            .map(|l| l.quantity)
            .sum())
    }

    async fn insert_pick_package(&mut self, link: &PickListPackage) -> StoreResult<()> {
        self.working.pick_packages.put(link);
        Ok(())
    }

    async fn pick_packages(&mut self, abs_entry: i32) -> StoreResult<Vec<PickListPackage>> {
        let rows = self
            .working
            .pick_packages
            .filtered(|l| l.abs_entry == abs_entry);
        Ok(sorted_by_key(rows, |l| (l.added_at, l.id)))
    }

    async fn delete_pick_packages(&mut self, abs_entry: i32) -> StoreResult<u64> {
        let before = self.working.pick_packages.rows.len();
        self.working
            .pick_packages
            .rows
            .retain(|_, l| l.abs_entry != abs_entry);
        Ok((before - self.working.pick_packages.rows.len()) as u64)
    }

    async fn insert_transfer(&mut self, transfer: &Transfer) -> StoreResult<()> {
        if self.working.transfers.contains(&transfer.id) {
            return Err(StoreError::Conflict(format!("transfer {} exists", transfer.id)));
        }
        self.working.transfers.put(transfer);
        Ok(())
    }

    async fn update_transfer(&mut self, transfer: &Transfer) -> StoreResult<()> {
        if !self.working.transfers.contains(&transfer.id) {
            return Err(StoreError::Missing(format!("transfer {}", transfer.id)));
        }
        self.working.transfers.put(transfer);
        Ok(())
    }

    async fn transfer(&mut self, id: TransferId) -> StoreResult<Option<Transfer>> {
        Ok(self.working.transfers.get(&id))
    }

    async fn insert_transfer_package(&mut self, link: &TransferPackage) -> StoreResult<()> {
        self.working.transfer_packages.put(link);
        Ok(())
    }

    async fn transfer_packages(&mut self, transfer_id: TransferId) -> StoreResult<Vec<TransferPackage>> {
        let rows = self
            .working
            .transfer_packages
            .filtered(|l| l.transfer_id == transfer_id);
        Ok(sorted_by_key(rows, |l| (l.added_at, l.id)))
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let InMemoryUnitOfWork {
            mut guard, working, ..
        } = *self;
        *guard = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        // Dropping the working copy discards every write.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use packledger_core::UserId;
    use packledger_packages::Location;

    use super::*;

    fn package(barcode: &str) -> Package {
        Package::new(
            PackageId::new(),
            barcode,
            Location::bin("W01", 1),
            UserId::new(),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn rollback_discards_writes() {
        let store = InMemoryPackageStore::new();
        let p = package("P1");

        let mut uow = store.begin().await.unwrap();
        uow.insert_package(&p).await.unwrap();
        uow.rollback().await.unwrap();

        let mut uow = store.begin().await.unwrap();
        assert!(uow.package(p.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn commit_publishes_writes() {
        let store = InMemoryPackageStore::new();
        let p = package("P1");

        let mut uow = store.begin().await.unwrap();
        uow.insert_package(&p).await.unwrap();
        uow.commit().await.unwrap();

        let mut uow = store.begin().await.unwrap();
        assert_eq!(uow.package_by_barcode("P1").await.unwrap(), Some(p));
    }

    #[tokio::test]
    async fn duplicate_barcode_is_a_conflict() {
        let store = InMemoryPackageStore::new();
        let mut uow = store.begin().await.unwrap();
        uow.insert_package(&package("P1")).await.unwrap();
        let err = uow.insert_package(&package("P1")).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn barcode_sequence_survives_rollback() {
        let store = InMemoryPackageStore::new();
        let mut uow = store.begin().await.unwrap();
        assert_eq!(uow.next_barcode_sequence().await.unwrap(), 1);
        uow.rollback().await.unwrap();

        let mut uow = store.begin().await.unwrap();
        assert_eq!(uow.next_barcode_sequence().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn content_requires_existing_package() {
        let store = InMemoryPackageStore::new();
        let mut uow = store.begin().await.unwrap();
        let orphan = PackageContent::empty(PackageId::new(), "A", Location::bin("W01", 1), Utc::now());
        assert!(matches!(
            uow.save_content(&orphan).await,
            Err(StoreError::Missing(_))
        ));
    }
}
