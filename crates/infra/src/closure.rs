//! Pick-list closure and cancellation.
//!
//! Three ways a pick list ends:
//! - [`ClosureWorkflow::close_pick_list`]: the pick was executed; reserved
//!   quantity leaves its source packages and assembled targets are delivered.
//! - [`ClosureWorkflow::clear_pick_list_commitments`]: cancelled before
//!   anything physically moved; every commitment is unwound.
//! - [`ClosureWorkflow::process_pick_list_closure`]: cancelled after targets
//!   were physically assembled; sources give up what went into the targets and
//!   the targets go back to stock through one compensating transfer.
//!
//! Closure and clearing are one unit of work each. A cancellation after
//! assembly plans in one unit of work, creates the ERP transfer with none
//! open, and reconciles in a second one. The ERP transfer carries a
//! per-pick-list reference, so a retry after a lost reply or a failed
//! reconciliation gets the same ERP document back. An ERP failure leaves the
//! ledger untouched.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, instrument};

use packledger_core::{DomainError, PackageId, TransferId, UserId};
use packledger_packages::{
    Allocation, Location, MovementType, OperationRef, Package, PackageCommitment, PackageContent,
    verify_target_assembly,
};
use packledger_picking::{PickListLine, PickListState};
use packledger_transfers::{
    Transfer, TransferLine, TransferPackage, TransferPackageRole, TransferReason,
};

use crate::allocation::relocate;
use crate::config::LedgerConfig;
use crate::error::{WorkflowError, WorkflowResult};
use crate::external::{CreatedDocument, ErpGateway, ErpObjectType, TransferRequest};
use crate::ledger::{self, ConsumeOutcome, load_package};
use crate::picking::pick_list_state;
use crate::response::OperationResponse;
use crate::store::{PackageStore, UnitOfWork, finish};

/// Outcome of a normal closure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosureSummary {
    pub consumed: usize,
    pub landed: usize,
    pub closed_sources: Vec<PackageId>,
    pub delivered_targets: Vec<PackageId>,
    pub closed_targets: Vec<PackageId>,
    pub closed_lines: usize,
}

/// Outcome of a cancellation before execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearSummary {
    pub released: usize,
    pub closed_targets: Vec<PackageId>,
    pub unlinked: u64,
    pub cancelled_lines: usize,
}

/// Outcome of a cancellation after targets were assembled.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancellationSummary {
    pub transfer_id: Option<TransferId>,
    pub external: Option<CreatedDocument>,
    pub consumed: usize,
    pub released: usize,
    pub closed_sources: Vec<PackageId>,
    pub returned_targets: Vec<PackageId>,
    pub closed_targets: Vec<PackageId>,
    pub cancelled_lines: usize,
}

impl CancellationSummary {
    /// Caller-facing result, carrying the compensating transfer when one was created.
    pub fn response(&self) -> OperationResponse {
        OperationResponse::with_transfer(self.transfer_id)
    }
}

async fn target_ids(uow: &mut dyn UnitOfWork, abs_entry: i32) -> WorkflowResult<Vec<PackageId>> {
    Ok(uow
        .pick_packages(abs_entry)
        .await?
        .into_iter()
        .filter(|l| l.is_target())
        .map(|l| l.package_id)
        .collect())
}

/// Every target must hold exactly what was staged into it. A mismatch means
/// the ledger is already broken, so nothing is touched.
async fn verify_targets(
    uow: &mut dyn UnitOfWork,
    abs_entry: i32,
    targets: &[PackageId],
    commitments: &[PackageCommitment],
) -> WorkflowResult<()> {
    let mut violations = Vec::new();
    for &target in targets {
        let contents = uow.contents(target).await?;
        violations.extend(verify_target_assembly(target, &contents, commitments));
    }
    if violations.is_empty() {
        return Ok(());
    }
    for violation in &violations {
        error!(abs_entry, %violation, "target package does not match its staged content");
    }
    Err(WorkflowError::LedgerInconsistent(format!(
        "{} target assembly mismatch(es) on pick list {abs_entry}",
        violations.len()
    )))
}

async fn settle_lines(
    uow: &mut dyn UnitOfWork,
    abs_entry: i32,
    at: DateTime<Utc>,
    settle: fn(&mut PickListLine, DateTime<Utc>) -> Result<(), DomainError>,
) -> WorkflowResult<usize> {
    let mut settled = 0;
    for mut line in uow.pick_lines(abs_entry).await? {
        if line.is_open() {
            settle(&mut line, at)?;
            uow.update_pick_line(&line).await?;
            settled += 1;
        }
    }
    Ok(settled)
}

/// Cancellations are refused on finished lists and reported as already
/// processed when nothing is left to unwind.
async fn ensure_cancellable(uow: &mut dyn UnitOfWork, abs_entry: i32) -> WorkflowResult<()> {
    match pick_list_state(uow, abs_entry).await? {
        PickListState::Open => Ok(()),
        PickListState::Empty | PickListState::Cancelled => {
            Err(WorkflowError::CancellationAlreadyProcessed { abs_entry })
        }
        PickListState::Closed => {
            Err(DomainError::conflict(format!("pick list {abs_entry} is already closed")).into())
        }
    }
}

#[derive(Clone)]
pub struct ClosureWorkflow {
    store: Arc<dyn PackageStore>,
    erp: ErpGateway,
    config: Arc<LedgerConfig>,
}

impl ClosureWorkflow {
    pub fn new(store: Arc<dyn PackageStore>, erp: ErpGateway, config: Arc<LedgerConfig>) -> Self {
        Self { store, erp, config }
    }

    /// Normal closure of an executed pick list.
    ///
    /// Reserved quantity leaves its source packages (drained sources close),
    /// staged content lands in the targets, and targets holding content are
    /// activated and moved to `destination_bin` of their warehouse when one is
    /// given. Empty targets are closed.
    #[instrument(skip(self), err)]
    pub async fn close_pick_list(
        &self,
        abs_entry: i32,
        destination_bin: Option<i32>,
        actor: UserId,
    ) -> WorkflowResult<ClosureSummary> {
        let mut uow = self.store.begin().await?;
        let result = close_in(uow.as_mut(), abs_entry, destination_bin, actor, Utc::now()).await;
        finish(uow, result).await
    }

    /// Cancel a pick list before execution: release every commitment, close
    /// the empty targets, drop the package links and cancel the open lines.
    #[instrument(skip(self), err)]
    pub async fn clear_pick_list_commitments(
        &self,
        abs_entry: i32,
        actor: UserId,
    ) -> WorkflowResult<ClearSummary> {
        let mut uow = self.store.begin().await?;
        let result = clear_in(uow.as_mut(), abs_entry, actor, Utc::now()).await;
        finish(uow, result).await
    }

    /// Cancel a pick list whose targets were physically assembled.
    ///
    /// Moved reservations are consumed from their sources (tagged as the
    /// closure reconciliation), in-place reservations are released, and the
    /// targets holding content move to the cancellation bin under one
    /// compensating transfer that now owns their staged commitments.
    ///
    /// The ERP transfer is created between two units of work, so no store
    /// lock is held while the ERP answers. The reconciliation re-plans and
    /// refuses to proceed when the pick list changed in between.
    #[instrument(skip(self), err)]
    pub async fn process_pick_list_closure(
        &self,
        abs_entry: i32,
        actor: UserId,
    ) -> WorkflowResult<CancellationSummary> {
        let mut uow = self.store.begin().await?;
        let planned = plan_cancellation(uow.as_mut(), &self.config, abs_entry).await;
        let plan = finish(uow, planned).await?;

        let sent = match &plan.returned {
            Some(returned) => Some(self.send_transfer(abs_entry, returned).await?),
            None => None,
        };

        let mut uow = self.store.begin().await?;
        let result = reconcile_cancellation_in(
            uow.as_mut(),
            &self.config,
            abs_entry,
            sent,
            actor,
            Utc::now(),
        )
        .await;
        finish(uow, result).await
    }

    async fn send_transfer(
        &self,
        abs_entry: i32,
        returned: &ReturnPlan,
    ) -> WorkflowResult<(TransferRequest, CreatedDocument)> {
        let series = self.erp.get_series(ErpObjectType::InventoryTransfer).await?;
        let request = TransferRequest {
            reference: cancellation_reference(abs_entry),
            series,
            source_warehouse: returned.warehouse.clone(),
            target_warehouse: None,
            comments: format!("Return of packages from cancelled pick list {abs_entry}"),
            lines: returned.lines.clone(),
        };
        let created = self.erp.create_transfer(&request).await.map_err(|err| {
            error!(
                abs_entry,
                reference = %request.reference,
                error = %err,
                "compensating transfer rejected by the ERP"
            );
            err
        })?;
        info!(
            abs_entry,
            external_entry = created.entry,
            cancellation_bin = returned.cancellation_bin,
            "compensating transfer created"
        );
        Ok((request, created))
    }
}

/// ERP reference of the compensating transfer of a pick list. A pick list is
/// cancelled at most once, so the key is stable across retries.
fn cancellation_reference(abs_entry: i32) -> String {
    format!("picking-cancellation-{abs_entry}")
}

/// Targets going back to stock, and the transfer lines that carry them.
#[derive(Debug, Clone)]
struct ReturnPlan {
    warehouse: String,
    cancellation_bin: i32,
    packages: Vec<Package>,
    lines: Vec<TransferLine>,
}

#[derive(Debug, Clone)]
struct CancellationPlan {
    commitments: Vec<PackageCommitment>,
    empty_targets: Vec<PackageId>,
    returned: Option<ReturnPlan>,
}

async fn plan_cancellation(
    uow: &mut dyn UnitOfWork,
    config: &LedgerConfig,
    abs_entry: i32,
) -> WorkflowResult<CancellationPlan> {
    ensure_cancellable(uow, abs_entry).await?;

    let commitments = uow
        .commitments_for_operation(&OperationRef::picking(abs_entry))
        .await?;
    let targets = target_ids(uow, abs_entry).await?;
    verify_targets(uow, abs_entry, &targets, &commitments).await?;

    let mut empty_targets = Vec::new();
    let mut assembled: Vec<(Package, Vec<PackageContent>)> = Vec::new();
    for target in targets {
        let contents = uow.contents(target).await?;
        if contents.is_empty() {
            empty_targets.push(target);
        } else {
            assembled.push((load_package(uow, target).await?, contents));
        }
    }

    let returned = match assembled.first().map(|(p, _)| p.location.warehouse.clone()) {
        None => None,
        Some(warehouse) => {
            if assembled.iter().any(|(p, _)| p.location.warehouse != warehouse) {
                return Err(DomainError::validation(format!(
                    "targets of pick list {abs_entry} span several warehouses"
                ))
                .into());
            }
            let bins = config.bins_for(&warehouse);
            let lines = assembled
                .iter()
                .flat_map(|(package, contents)| {
                    let from_bin = package.location.bin_entry.unwrap_or(bins.staging_bin);
                    contents.iter().map(move |c| {
                        TransferLine::bin_to_bin(
                            c.item_code.as_str(),
                            c.quantity,
                            from_bin,
                            bins.cancellation_bin,
                        )
                    })
                })
                .collect();
            Some(ReturnPlan {
                warehouse,
                cancellation_bin: bins.cancellation_bin,
                packages: assembled.into_iter().map(|(package, _)| package).collect(),
                lines,
            })
        }
    };

    Ok(CancellationPlan {
        commitments,
        empty_targets,
        returned,
    })
}

async fn reconcile_cancellation_in(
    uow: &mut dyn UnitOfWork,
    config: &LedgerConfig,
    abs_entry: i32,
    sent: Option<(TransferRequest, CreatedDocument)>,
    actor: UserId,
    now: DateTime<Utc>,
) -> WorkflowResult<CancellationSummary> {
    let plan = plan_cancellation(uow, config, abs_entry).await?;
    let planned = plan
        .returned
        .as_ref()
        .map(|r| (r.warehouse.as_str(), r.lines.as_slice()));
    let submitted = sent
        .as_ref()
        .map(|(request, _)| (request.source_warehouse.as_str(), request.lines.as_slice()));
    if planned != submitted {
        error!(abs_entry, "pick list changed after its compensating transfer was sent to the ERP");
        return Err(WorkflowError::LedgerInconsistent(format!(
            "pick list {abs_entry} changed while its compensating transfer was being created"
        )));
    }

    let mut summary = CancellationSummary::default();
    let mut staged = Vec::new();
    for commitment in plan.commitments {
        match commitment.allocation {
            Allocation::MovedTo { .. } => {
                let outcome = ledger::consume(
                    uow,
                    commitment.id,
                    Some(OperationRef::picking_closure(abs_entry)),
                    actor,
                    now,
                )
                .await?;
                summary.consumed += 1;
                if outcome == (ConsumeOutcome::Removed { package_closed: true }) {
                    summary.closed_sources.push(commitment.package_id);
                }
            }
            Allocation::InPlace => {
                ledger::release(uow, commitment.id, actor, now).await?;
                summary.released += 1;
            }
            Allocation::StagedFrom { .. } => staged.push(commitment),
        }
    }

    for target in plan.empty_targets {
        if ledger::close_if_drained(uow, target, now).await? {
            summary.closed_targets.push(target);
        }
    }

    if let (Some(returned), Some((request, created))) = (plan.returned, sent) {
        let mut transfer = Transfer::open(
            request.source_warehouse,
            None,
            request.comments,
            TransferReason::PickingCancellation { abs_entry },
            request.series,
            request.lines,
            actor,
            now,
        )?;
        transfer.record_external(created.entry, created.number, now);
        uow.insert_transfer(&transfer).await?;

        let owner = OperationRef::transfer(transfer.id);
        for commitment in &staged {
            ledger::rehome(uow, commitment, owner).await?;
        }
        let cancellation = Location::bin(returned.warehouse.as_str(), returned.cancellation_bin);
        for mut package in returned.packages {
            if package.activate(now)? {
                uow.update_package(&package).await?;
            }
            relocate(
                uow,
                package.id,
                cancellation.clone(),
                MovementType::PickingCancellation,
                Some(OperationRef::picking_closure(abs_entry)),
                actor,
                now,
            )
            .await?;
            uow.insert_transfer_package(&TransferPackage::new(
                transfer.id,
                package.id,
                TransferPackageRole::Source,
                actor,
                now,
            ))
            .await?;
            summary.returned_targets.push(package.id);
        }
        info!(
            abs_entry,
            transfer_id = %transfer.id,
            external_entry = created.entry,
            "compensating transfer recorded"
        );
        summary.transfer_id = Some(transfer.id);
        summary.external = Some(created);
    }

    uow.delete_pick_packages(abs_entry).await?;
    summary.cancelled_lines = settle_lines(uow, abs_entry, now, PickListLine::cancel).await?;

    info!(
        abs_entry,
        consumed = summary.consumed,
        released = summary.released,
        returned_targets = summary.returned_targets.len(),
        "pick list closure processed"
    );
    Ok(summary)
}

async fn close_in(
    uow: &mut dyn UnitOfWork,
    abs_entry: i32,
    destination_bin: Option<i32>,
    actor: UserId,
    now: DateTime<Utc>,
) -> WorkflowResult<ClosureSummary> {
    match pick_list_state(uow, abs_entry).await? {
        PickListState::Open => {}
        state => {
            return Err(DomainError::conflict(format!(
                "pick list {abs_entry} is {} and cannot be closed",
                state.as_str()
            ))
            .into());
        }
    }

    let picking = OperationRef::picking(abs_entry);
    let commitments = uow.commitments_for_operation(&picking).await?;
    let targets = target_ids(uow, abs_entry).await?;
    verify_targets(uow, abs_entry, &targets, &commitments).await?;

    let mut summary = ClosureSummary::default();
    for commitment in &commitments {
        match ledger::consume(uow, commitment.id, None, actor, now).await? {
            ConsumeOutcome::Landed => summary.landed += 1,
            ConsumeOutcome::Removed { package_closed } => {
                summary.consumed += 1;
                if package_closed {
                    summary.closed_sources.push(commitment.package_id);
                }
            }
        }
    }

    for target in targets {
        if uow.contents(target).await?.is_empty() {
            if ledger::close_if_drained(uow, target, now).await? {
                summary.closed_targets.push(target);
            }
            continue;
        }
        let mut package = load_package(uow, target).await?;
        if package.activate(now)? {
            uow.update_package(&package).await?;
        }
        if let Some(bin) = destination_bin {
            let to = Location::bin(package.location.warehouse.as_str(), bin);
            relocate(uow, target, to, MovementType::Picking, Some(picking), actor, now).await?;
        }
        summary.delivered_targets.push(target);
    }

    summary.closed_lines = settle_lines(uow, abs_entry, now, PickListLine::close).await?;
    info!(
        abs_entry,
        consumed = summary.consumed,
        landed = summary.landed,
        closed_sources = summary.closed_sources.len(),
        "pick list closed"
    );
    Ok(summary)
}

async fn clear_in(
    uow: &mut dyn UnitOfWork,
    abs_entry: i32,
    actor: UserId,
    now: DateTime<Utc>,
) -> WorkflowResult<ClearSummary> {
    ensure_cancellable(uow, abs_entry).await?;

    let picking = OperationRef::picking(abs_entry);
    let mut summary = ClearSummary::default();
    for commitment in uow.commitments_for_operation(&picking).await? {
        // Releasing one side of a moved pair also removes the other.
        if ledger::release(uow, commitment.id, actor, now).await? {
            summary.released += 1;
        }
    }

    for target in target_ids(uow, abs_entry).await? {
        if ledger::close_if_drained(uow, target, now).await? {
            summary.closed_targets.push(target);
        }
    }
    summary.unlinked = uow.delete_pick_packages(abs_entry).await?;
    summary.cancelled_lines = settle_lines(uow, abs_entry, now, PickListLine::cancel).await?;

    info!(
        abs_entry,
        released = summary.released,
        closed_targets = summary.closed_targets.len(),
        "pick list commitments cleared"
    );
    Ok(summary)
}

impl core::fmt::Debug for ClosureWorkflow {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ClosureWorkflow")
            .field("erp", &self.erp)
            .finish_non_exhaustive()
    }
}
