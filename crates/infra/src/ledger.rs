//! Commitment ledger.
//!
//! The free functions operate inside a caller's unit of work, so workflows can
//! compose several ledger steps into one atomic change. [`CommitmentLedger`]
//! wraps each of them in a unit of work of its own for standalone callers.
//!
//! Transactions are written when a package's physical quantity changes:
//! staging writes `Add` on the target, consumption and unstaging write
//! `Remove`. Reserving, releasing and landing only move `committed_quantity`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument};

use packledger_core::{CommitmentId, DomainError, PackageId, UserId};
use packledger_packages::{
    Allocation, OperationRef, Package, PackageCommitment, PackageContent, PackageTransaction,
    UnitType,
};

use crate::error::WorkflowResult;
use crate::store::{PackageStore, UnitOfWork, finish};

/// What [`consume`] did with a commitment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// Quantity left the package; `package_closed` when it was the last content.
    Removed { package_closed: bool },
    /// Staged content stayed in its package and became available.
    Landed,
}

pub(crate) async fn load_package(
    uow: &mut dyn UnitOfWork,
    package_id: PackageId,
) -> WorkflowResult<Package> {
    Ok(uow
        .package(package_id)
        .await?
        .ok_or_else(|| DomainError::not_found(format!("package {package_id}")))?)
}

async fn lock_existing_content(
    uow: &mut dyn UnitOfWork,
    commitment: &PackageCommitment,
) -> WorkflowResult<PackageContent> {
    Ok(uow
        .lock_content(commitment.package_id, &commitment.item_code)
        .await?
        .ok_or_else(|| {
            DomainError::invariant(format!(
                "commitment {} references missing content {}/{}",
                commitment.id, commitment.package_id, commitment.item_code
            ))
        })?)
}

/// Persist a content row, dropping it once it holds nothing.
async fn store_content(uow: &mut dyn UnitOfWork, content: &PackageContent) -> WorkflowResult<()> {
    if content.is_empty() {
        uow.delete_content(content.package_id, &content.item_code).await?;
    } else {
        uow.save_content(content).await?;
    }
    Ok(())
}

/// Reserve `quantity` of one content row in place.
pub async fn reserve(
    uow: &mut dyn UnitOfWork,
    package_id: PackageId,
    item_code: &str,
    quantity: i64,
    operation: OperationRef,
    at: DateTime<Utc>,
) -> WorkflowResult<PackageCommitment> {
    let package = load_package(uow, package_id).await?;
    package.ensure_open()?;

    let commitment =
        PackageCommitment::new(package_id, item_code, operation, Allocation::InPlace, quantity, at)?;
    let mut content = uow
        .lock_content(package_id, item_code)
        .await?
        .ok_or_else(|| DomainError::not_found(format!("item {item_code} in package {package_id}")))?;

    content.reserve(quantity, at)?;
    uow.save_content(&content).await?;
    uow.insert_commitment(&commitment).await?;

    debug!(
        commitment_id = %commitment.id,
        %package_id,
        item_code,
        quantity,
        committed = content.committed_quantity,
        "content reserved"
    );
    Ok(commitment)
}

/// Give a commitment back. Unknown commitments are a no-op (`false`).
///
/// A moved reservation also takes its staged copy out of the target package,
/// and releasing a staged copy frees its source reservation, so the pair always
/// goes away together.
pub async fn release(
    uow: &mut dyn UnitOfWork,
    commitment_id: CommitmentId,
    actor: UserId,
    at: DateTime<Utc>,
) -> WorkflowResult<bool> {
    let Some(commitment) = uow.commitment(commitment_id).await? else {
        debug!(%commitment_id, "release of unknown commitment ignored");
        return Ok(false);
    };

    match commitment.allocation {
        Allocation::InPlace => release_in_place(uow, &commitment, at).await?,
        Allocation::MovedTo { staged, .. } => {
            release_in_place(uow, &commitment, at).await?;
            if let Some(staged) = uow.commitment(staged).await? {
                unstage(uow, &staged, actor, at).await?;
            }
        }
        Allocation::StagedFrom { origin } => {
            unstage(uow, &commitment, actor, at).await?;
            if let Some(origin) = origin {
                if let Some(source) = paired_source(uow, origin, commitment.id).await? {
                    release_in_place(uow, &source, at).await?;
                }
            }
        }
    }
    Ok(true)
}

async fn release_in_place(
    uow: &mut dyn UnitOfWork,
    commitment: &PackageCommitment,
    at: DateTime<Utc>,
) -> WorkflowResult<()> {
    let mut content = lock_existing_content(uow, commitment).await?;
    content.release(commitment.quantity, at)?;
    uow.save_content(&content).await?;
    uow.delete_commitment(commitment.id).await?;
    debug!(
        commitment_id = %commitment.id,
        package_id = %commitment.package_id,
        item_code = %commitment.item_code,
        quantity = commitment.quantity,
        "commitment released"
    );
    Ok(())
}

/// Take staged content back out of its target package.
async fn unstage(
    uow: &mut dyn UnitOfWork,
    staged: &PackageCommitment,
    actor: UserId,
    at: DateTime<Utc>,
) -> WorkflowResult<()> {
    let mut content = lock_existing_content(uow, staged).await?;
    content.consume(staged.quantity, at)?;
    store_content(uow, &content).await?;
    uow.append_transaction(&PackageTransaction::remove(
        staged.package_id,
        &staged.item_code,
        staged.quantity,
        UnitType::Unit,
        staged.operation,
        actor,
        at,
    ))
    .await?;
    uow.delete_commitment(staged.id).await?;
    debug!(
        commitment_id = %staged.id,
        package_id = %staged.package_id,
        item_code = %staged.item_code,
        quantity = staged.quantity,
        "staged content removed"
    );
    Ok(())
}

async fn paired_source(
    uow: &mut dyn UnitOfWork,
    origin: PackageId,
    staged_id: CommitmentId,
) -> WorkflowResult<Option<PackageCommitment>> {
    Ok(uow
        .commitments_for_package(origin)
        .await?
        .into_iter()
        .find(|c| c.allocation.linked_commitment() == Some(staged_id)))
}

/// Complete a commitment.
///
/// In-place and moved reservations physically leave their package (one
/// `Remove` transaction, tagged with `tag` or the commitment's own operation);
/// a drained package is closed. Staged content lands where it is.
pub async fn consume(
    uow: &mut dyn UnitOfWork,
    commitment_id: CommitmentId,
    tag: Option<OperationRef>,
    actor: UserId,
    at: DateTime<Utc>,
) -> WorkflowResult<ConsumeOutcome> {
    let commitment = uow
        .commitment(commitment_id)
        .await?
        .ok_or_else(|| DomainError::not_found(format!("commitment {commitment_id}")))?;
    let mut content = lock_existing_content(uow, &commitment).await?;

    if commitment.is_staged() {
        content.release(commitment.quantity, at)?;
        uow.save_content(&content).await?;
        uow.delete_commitment(commitment.id).await?;
        debug!(%commitment_id, package_id = %commitment.package_id, "staged content landed");
        return Ok(ConsumeOutcome::Landed);
    }

    content.consume(commitment.quantity, at)?;
    store_content(uow, &content).await?;
    uow.append_transaction(&PackageTransaction::remove(
        commitment.package_id,
        &commitment.item_code,
        commitment.quantity,
        UnitType::Unit,
        tag.unwrap_or(commitment.operation),
        actor,
        at,
    ))
    .await?;
    uow.delete_commitment(commitment.id).await?;

    let package_closed = close_if_drained(uow, commitment.package_id, at).await?;
    debug!(
        %commitment_id,
        package_id = %commitment.package_id,
        item_code = %commitment.item_code,
        quantity = commitment.quantity,
        package_closed,
        "commitment consumed"
    );
    Ok(ConsumeOutcome::Removed { package_closed })
}

/// Close the package when it has no content rows left. Returns `true` if it
/// was closed by this call.
pub async fn close_if_drained(
    uow: &mut dyn UnitOfWork,
    package_id: PackageId,
    at: DateTime<Utc>,
) -> WorkflowResult<bool> {
    if !uow.contents(package_id).await?.is_empty() {
        return Ok(false);
    }
    let mut package = load_package(uow, package_id).await?;
    if !package.close(at) {
        return Ok(false);
    }
    uow.update_package(&package).await?;
    info!(%package_id, barcode = %package.barcode, "package drained and closed");
    Ok(true)
}

/// Add `quantity` to `target` already reserved by `operation`.
#[allow(clippy::too_many_arguments)]
pub async fn stage(
    uow: &mut dyn UnitOfWork,
    target_id: PackageId,
    item_code: &str,
    quantity: i64,
    operation: OperationRef,
    origin: Option<PackageId>,
    actor: UserId,
    at: DateTime<Utc>,
) -> WorkflowResult<PackageCommitment> {
    let target = load_package(uow, target_id).await?;
    target.ensure_open()?;

    let commitment = PackageCommitment::new(
        target_id,
        item_code,
        operation,
        Allocation::StagedFrom { origin },
        quantity,
        at,
    )?;
    let mut content = match uow.lock_content(target_id, item_code).await? {
        Some(content) => content,
        None => PackageContent::empty(target_id, item_code, target.location.clone(), at),
    };
    content.stage(quantity, at)?;
    uow.save_content(&content).await?;
    uow.insert_commitment(&commitment).await?;
    uow.append_transaction(&PackageTransaction::add(
        target_id,
        item_code,
        quantity,
        UnitType::Unit,
        operation,
        actor,
        at,
    ))
    .await?;

    debug!(
        commitment_id = %commitment.id,
        package_id = %target_id,
        item_code,
        quantity,
        origin = ?origin,
        "content staged"
    );
    Ok(commitment)
}

/// Hand a commitment over to another operation.
pub async fn rehome(
    uow: &mut dyn UnitOfWork,
    commitment: &PackageCommitment,
    operation: OperationRef,
) -> WorkflowResult<PackageCommitment> {
    if !operation.can_commit() {
        return Err(DomainError::validation(format!(
            "operation {operation} cannot hold commitments"
        ))
        .into());
    }
    let mut moved = commitment.clone();
    moved.operation = operation;
    uow.update_commitment(&moved).await?;
    Ok(moved)
}

/// Standalone ledger entry points, one unit of work per call.
#[derive(Clone)]
pub struct CommitmentLedger {
    store: Arc<dyn PackageStore>,
}

impl CommitmentLedger {
    pub fn new(store: Arc<dyn PackageStore>) -> Self {
        Self { store }
    }

    #[instrument(skip(self), fields(%package_id, %operation), err)]
    pub async fn reserve(
        &self,
        package_id: PackageId,
        item_code: &str,
        quantity: i64,
        operation: OperationRef,
    ) -> WorkflowResult<CommitmentId> {
        let mut uow = self.store.begin().await?;
        let result = reserve(uow.as_mut(), package_id, item_code, quantity, operation, Utc::now())
            .await
            .map(|c| c.id);
        finish(uow, result).await
    }

    #[instrument(skip(self), fields(%commitment_id), err)]
    pub async fn release(&self, commitment_id: CommitmentId, actor: UserId) -> WorkflowResult<bool> {
        let mut uow = self.store.begin().await?;
        let result = release(uow.as_mut(), commitment_id, actor, Utc::now()).await;
        finish(uow, result).await
    }

    #[instrument(skip(self), fields(%commitment_id), err)]
    pub async fn consume(
        &self,
        commitment_id: CommitmentId,
        actor: UserId,
    ) -> WorkflowResult<ConsumeOutcome> {
        let mut uow = self.store.begin().await?;
        let result = consume(uow.as_mut(), commitment_id, None, actor, Utc::now()).await;
        finish(uow, result).await
    }
}

impl core::fmt::Debug for CommitmentLedger {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CommitmentLedger").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use packledger_packages::{PackageStatus, TransactionKind};

    use super::*;
    use crate::error::WorkflowError;
    use crate::store::InMemoryPackageStore;
    use crate::testing::{content_of, seed_package};

    fn ledger() -> (Arc<InMemoryPackageStore>, CommitmentLedger) {
        let store = InMemoryPackageStore::arc();
        (store.clone(), CommitmentLedger::new(store))
    }

    #[tokio::test]
    async fn reserve_then_release_round_trips() {
        let (store, ledger) = ledger();
        let p = seed_package(&store, "W01", 5, &[("A", 24)]).await;

        let id = ledger.reserve(p, "A", 10, OperationRef::picking(1)).await.unwrap();
        assert_eq!(content_of(&store, p, "A").await.unwrap().committed_quantity, 10);

        assert!(ledger.release(id, UserId::new()).await.unwrap());
        let row = content_of(&store, p, "A").await.unwrap();
        assert_eq!((row.quantity, row.committed_quantity), (24, 0));

        // Retried release is a no-op.
        assert!(!ledger.release(id, UserId::new()).await.unwrap());
    }

    #[tokio::test]
    async fn over_reservation_is_rejected() {
        let (store, ledger) = ledger();
        let p = seed_package(&store, "W01", 5, &[("A", 24)]).await;

        let err = ledger
            .reserve(p, "A", 25, OperationRef::picking(1))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::Domain(DomainError::InsufficientAvailableQuantity { available: 24, .. })
        ));
        assert_eq!(content_of(&store, p, "A").await.unwrap().committed_quantity, 0);
    }

    #[tokio::test]
    async fn consuming_last_content_closes_package() {
        let (store, ledger) = ledger();
        let p = seed_package(&store, "W01", 5, &[("A", 24)]).await;

        let id = ledger.reserve(p, "A", 24, OperationRef::picking(1)).await.unwrap();
        let outcome = ledger.consume(id, UserId::new()).await.unwrap();
        assert_eq!(outcome, ConsumeOutcome::Removed { package_closed: true });

        let mut uow = store.begin().await.unwrap();
        assert!(uow.contents(p).await.unwrap().is_empty());
        assert_eq!(uow.package(p).await.unwrap().unwrap().status, PackageStatus::Closed);
        let removes: Vec<_> = uow
            .transactions(p)
            .await
            .unwrap()
            .into_iter()
            .filter(|t| t.kind == TransactionKind::Remove)
            .collect();
        assert_eq!(removes.len(), 1);
        assert_eq!(removes[0].quantity, 24);
    }

    #[tokio::test]
    async fn partial_consume_keeps_package_active() {
        let (store, ledger) = ledger();
        let p = seed_package(&store, "W01", 5, &[("A", 24)]).await;

        let id = ledger.reserve(p, "A", 12, OperationRef::picking(1)).await.unwrap();
        ledger.consume(id, UserId::new()).await.unwrap();

        let row = content_of(&store, p, "A").await.unwrap();
        assert_eq!((row.quantity, row.committed_quantity), (12, 0));
        let mut uow = store.begin().await.unwrap();
        assert_eq!(uow.package(p).await.unwrap().unwrap().status, PackageStatus::Active);
    }

    #[tokio::test]
    async fn closed_package_cannot_be_reserved() {
        let (store, ledger) = ledger();
        let p = seed_package(&store, "W01", 5, &[("A", 1)]).await;
        let id = ledger.reserve(p, "A", 1, OperationRef::picking(1)).await.unwrap();
        ledger.consume(id, UserId::new()).await.unwrap();

        let err = ledger
            .reserve(p, "A", 1, OperationRef::picking(2))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::Domain(DomainError::InvalidPackageStatus { .. })
        ));
    }

    #[tokio::test]
    async fn releasing_staged_copy_frees_its_source() {
        let store = InMemoryPackageStore::arc();
        let source = seed_package(&store, "W01", 5, &[("A", 24)]).await;
        let target = seed_package(&store, "W01", 1, &[]).await;
        let op = OperationRef::picking(3);
        let actor = UserId::new();

        let mut uow = store.begin().await.unwrap();
        let reserved = reserve(uow.as_mut(), source, "A", 12, op, Utc::now()).await.unwrap();
        let staged = stage(uow.as_mut(), target, "A", 12, op, Some(source), actor, Utc::now())
            .await
            .unwrap();
        let mut moved = reserved.clone();
        moved.allocation = Allocation::MovedTo {
            target,
            staged: staged.id,
        };
        uow.update_commitment(&moved).await.unwrap();

        assert!(release(uow.as_mut(), staged.id, actor, Utc::now()).await.unwrap());
        assert!(uow.commitment(moved.id).await.unwrap().is_none());
        assert!(uow.lock_content(target, "A").await.unwrap().is_none());
        let src = uow.lock_content(source, "A").await.unwrap().unwrap();
        assert_eq!((src.quantity, src.committed_quantity), (24, 0));
        uow.commit().await.unwrap();
    }
}
