//! Package allocation engine: full-package and partial reservations, and
//! moving reserved content into a target package being assembled.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, instrument};

use packledger_core::{CommitmentId, DomainError, PackageId, UserId};
use packledger_packages::{
    Allocation, Location, MovementType, OperationRef, PackageCommitment, PackageLocationHistory,
};

use crate::error::WorkflowResult;
use crate::ledger::{self, load_package};
use crate::store::{PackageStore, UnitOfWork, finish};

/// Result of moving a reservation into a target package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MovedReservation {
    /// The source reservation, now `Allocation::MovedTo`.
    pub source: PackageCommitment,
    /// The staged copy held by the target package.
    pub staged: PackageCommitment,
}

/// Reserve everything available in an `Active` package for `operation`.
///
/// Commitments already held by the same operation are fine (the rest is
/// topped up); any commitment by another operation makes the package
/// ineligible.
pub async fn allocate_full_package(
    uow: &mut dyn UnitOfWork,
    package_id: PackageId,
    operation: OperationRef,
    at: DateTime<Utc>,
) -> WorkflowResult<Vec<PackageCommitment>> {
    let package = load_package(uow, package_id).await?;
    package.ensure_active()?;

    let contents = uow.contents(package_id).await?;
    if contents.is_empty() {
        return Err(DomainError::not_eligible(package_id, "package has no content").into());
    }
    let held = uow.commitments_for_package(package_id).await?;
    if let Some(other) = held.iter().find(|c| c.operation != operation) {
        return Err(DomainError::not_eligible(
            package_id,
            format!("{} is committed to {}", other.item_code, other.operation),
        )
        .into());
    }

    let mut reserved = Vec::with_capacity(contents.len());
    for content in contents.iter().filter(|c| c.available() > 0) {
        let commitment = ledger::reserve(
            uow,
            package_id,
            &content.item_code,
            content.available(),
            operation,
            at,
        )
        .await?;
        reserved.push(commitment);
    }
    if reserved.is_empty() {
        return Err(DomainError::not_eligible(package_id, "package is already fully committed").into());
    }

    info!(
        %package_id,
        %operation,
        lines = reserved.len(),
        "full package allocated"
    );
    Ok(reserved)
}

/// Reserve `quantity` of one item of an `Active` package.
pub async fn allocate_partial(
    uow: &mut dyn UnitOfWork,
    package_id: PackageId,
    item_code: &str,
    quantity: i64,
    operation: OperationRef,
    at: DateTime<Utc>,
) -> WorkflowResult<PackageCommitment> {
    let package = load_package(uow, package_id).await?;
    package.ensure_active()?;
    ledger::reserve(uow, package_id, item_code, quantity, operation, at).await
}

/// Stage a reserved quantity into `target_id` without touching the source's
/// physical quantity; that only happens when the operation closes.
///
/// With `target_bin` set, the target package is first moved into that bin of
/// its warehouse (one location-history row).
pub async fn move_reservation_to_target(
    uow: &mut dyn UnitOfWork,
    commitment_id: CommitmentId,
    target_id: PackageId,
    target_bin: Option<i32>,
    actor: UserId,
    at: DateTime<Utc>,
) -> WorkflowResult<MovedReservation> {
    let commitment = uow
        .commitment(commitment_id)
        .await?
        .ok_or_else(|| DomainError::not_found(format!("commitment {commitment_id}")))?;
    if commitment.allocation != Allocation::InPlace {
        return Err(DomainError::conflict(format!(
            "commitment {commitment_id} is already {}",
            commitment.allocation.kind_str()
        ))
        .into());
    }
    if commitment.package_id == target_id {
        return Err(
            DomainError::validation("target package must differ from the source package").into(),
        );
    }

    if let Some(bin) = target_bin {
        let target = load_package(uow, target_id).await?;
        let to = Location::bin(target.location.warehouse.clone(), bin);
        relocate(uow, target_id, to, MovementType::Picking, Some(commitment.operation), actor, at)
            .await?;
    }

    let staged = ledger::stage(
        uow,
        target_id,
        &commitment.item_code,
        commitment.quantity,
        commitment.operation,
        Some(commitment.package_id),
        actor,
        at,
    )
    .await?;

    let mut source = commitment;
    source.allocation = Allocation::MovedTo {
        target: target_id,
        staged: staged.id,
    };
    uow.update_commitment(&source).await?;

    info!(
        commitment_id = %source.id,
        source_package = %source.package_id,
        target_package = %target_id,
        item_code = %source.item_code,
        quantity = source.quantity,
        "reservation moved to target package"
    );
    Ok(MovedReservation { source, staged })
}

/// Move a package and its content rows. Writes one history row when the
/// location actually changes; returns whether it did.
pub async fn relocate(
    uow: &mut dyn UnitOfWork,
    package_id: PackageId,
    to: Location,
    movement: MovementType,
    operation: Option<OperationRef>,
    actor: UserId,
    at: DateTime<Utc>,
) -> WorkflowResult<bool> {
    let mut package = load_package(uow, package_id).await?;
    let Some(from) = package.relocate(to.clone(), at)? else {
        return Ok(false);
    };
    uow.update_package(&package).await?;

    for mut content in uow.contents(package_id).await? {
        content.location = to.clone();
        content.updated_at = at;
        uow.save_content(&content).await?;
    }
    uow.append_location_history(&PackageLocationHistory::new(
        package_id, from, to, movement, operation, actor, at,
    ))
    .await?;
    Ok(true)
}

/// Standalone allocation entry points, one unit of work per call.
#[derive(Clone)]
pub struct AllocationEngine {
    store: Arc<dyn PackageStore>,
}

impl AllocationEngine {
    pub fn new(store: Arc<dyn PackageStore>) -> Self {
        Self { store }
    }

    #[instrument(skip(self), fields(%package_id, %operation), err)]
    pub async fn allocate_full_package(
        &self,
        package_id: PackageId,
        operation: OperationRef,
    ) -> WorkflowResult<Vec<PackageCommitment>> {
        let mut uow = self.store.begin().await?;
        let result = allocate_full_package(uow.as_mut(), package_id, operation, Utc::now()).await;
        finish(uow, result).await
    }

    #[instrument(skip(self), fields(%package_id, %operation), err)]
    pub async fn allocate_partial(
        &self,
        package_id: PackageId,
        item_code: &str,
        quantity: i64,
        operation: OperationRef,
    ) -> WorkflowResult<PackageCommitment> {
        let mut uow = self.store.begin().await?;
        let result =
            allocate_partial(uow.as_mut(), package_id, item_code, quantity, operation, Utc::now())
                .await;
        finish(uow, result).await
    }

    #[instrument(skip(self), fields(%commitment_id, %target_id), err)]
    pub async fn move_reservation_to_target(
        &self,
        commitment_id: CommitmentId,
        target_id: PackageId,
        target_bin: Option<i32>,
        actor: UserId,
    ) -> WorkflowResult<MovedReservation> {
        let mut uow = self.store.begin().await?;
        let result = move_reservation_to_target(
            uow.as_mut(),
            commitment_id,
            target_id,
            target_bin,
            actor,
            Utc::now(),
        )
        .await;
        finish(uow, result).await
    }
}

impl core::fmt::Debug for AllocationEngine {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AllocationEngine").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use packledger_packages::TransactionKind;

    use super::*;
    use crate::error::WorkflowError;
    use crate::store::InMemoryPackageStore;
    use crate::testing::{commitments_of, content_of, package_of, seed_package};

    #[tokio::test]
    async fn full_package_then_partial_fails() {
        let store = InMemoryPackageStore::arc();
        let engine = AllocationEngine::new(store.clone());
        let p = seed_package(&store, "W01", 5, &[("A", 24)]).await;

        let reserved = engine
            .allocate_full_package(p, OperationRef::picking(1))
            .await
            .unwrap();
        assert_eq!(reserved.len(), 1);
        assert_eq!(content_of(&store, p, "A").await.unwrap().committed_quantity, 24);

        let err = engine
            .allocate_partial(p, "A", 1, OperationRef::picking(2))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::Domain(DomainError::InsufficientAvailableQuantity { .. })
        ));
    }

    #[tokio::test]
    async fn package_held_by_another_operation_is_not_eligible() {
        let store = InMemoryPackageStore::arc();
        let engine = AllocationEngine::new(store.clone());
        let p = seed_package(&store, "W01", 5, &[("A", 24), ("B", 6)]).await;

        engine
            .allocate_partial(p, "A", 4, OperationRef::picking(1))
            .await
            .unwrap();
        let err = engine
            .allocate_full_package(p, OperationRef::picking(2))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::Domain(DomainError::PackageNotEligible { .. })
        ));
        // Nothing of the failed call survived.
        assert_eq!(content_of(&store, p, "B").await.unwrap().committed_quantity, 0);
    }

    #[tokio::test]
    async fn same_operation_tops_up_to_full() {
        let store = InMemoryPackageStore::arc();
        let engine = AllocationEngine::new(store.clone());
        let p = seed_package(&store, "W01", 5, &[("A", 24)]).await;
        let op = OperationRef::picking(1);

        engine.allocate_partial(p, "A", 4, op).await.unwrap();
        let reserved = engine.allocate_full_package(p, op).await.unwrap();
        assert_eq!(reserved[0].quantity, 20);
        assert!(content_of(&store, p, "A").await.unwrap().is_fully_committed());
    }

    #[tokio::test]
    async fn init_package_cannot_be_allocated() {
        let store = InMemoryPackageStore::arc();
        let engine = AllocationEngine::new(store.clone());
        let p = seed_package(&store, "W01", 5, &[]).await;

        let err = engine
            .allocate_partial(p, "A", 1, OperationRef::picking(1))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::Domain(DomainError::InvalidPackageStatus { .. })
        ));
    }

    #[tokio::test]
    async fn moving_a_reservation_stages_it_on_the_target() {
        let store = InMemoryPackageStore::arc();
        let engine = AllocationEngine::new(store.clone());
        let source = seed_package(&store, "W01", 5, &[("A", 24)]).await;
        let target = seed_package(&store, "W01", 1, &[]).await;

        let reserved = engine
            .allocate_partial(source, "A", 12, OperationRef::picking(1))
            .await
            .unwrap();
        let moved = engine
            .move_reservation_to_target(reserved.id, target, Some(9), UserId::new())
            .await
            .unwrap();

        assert_eq!(moved.source.target_package_id(), Some(target));
        assert_eq!(moved.staged.allocation, Allocation::StagedFrom { origin: Some(source) });

        let src = content_of(&store, source, "A").await.unwrap();
        assert_eq!((src.quantity, src.committed_quantity), (24, 12));
        let tgt = content_of(&store, target, "A").await.unwrap();
        assert_eq!((tgt.quantity, tgt.committed_quantity), (12, 12));
        assert_eq!(tgt.location, Location::bin("W01", 9));
        assert_eq!(package_of(&store, target).await.location.bin_entry, Some(9));
        assert_eq!(commitments_of(&store, target).await.len(), 1);

        let mut uow = store.begin().await.unwrap();
        let adds = uow.transactions(target).await.unwrap();
        assert_eq!(adds.len(), 1);
        assert_eq!(adds[0].kind, TransactionKind::Add);
        assert_eq!(uow.location_history(target).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn a_moved_reservation_cannot_move_again() {
        let store = InMemoryPackageStore::arc();
        let engine = AllocationEngine::new(store.clone());
        let source = seed_package(&store, "W01", 5, &[("A", 24)]).await;
        let target = seed_package(&store, "W01", 1, &[]).await;
        let reserved = engine
            .allocate_partial(source, "A", 12, OperationRef::picking(1))
            .await
            .unwrap();
        engine
            .move_reservation_to_target(reserved.id, target, None, UserId::new())
            .await
            .unwrap();

        let err = engine
            .move_reservation_to_target(reserved.id, target, None, UserId::new())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Domain(DomainError::Conflict(_))));
    }
}
