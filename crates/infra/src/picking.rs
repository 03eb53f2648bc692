//! Pick-list package orchestrator.
//!
//! Records pick lines against an ERP pick list (`abs_entry`) and keeps the
//! package side consistent: commitments on source packages, staged content in
//! target packages, and the `PickListPackage` links between them.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use packledger_core::{DomainError, PackageId, UserId};
use packledger_packages::{BarcodeFormat, Location, OperationRef, Package, UnitType};
use packledger_picking::{PickListLine, PickListPackage, PickListState, PickSource};

use crate::allocation::{allocate_full_package, allocate_partial, move_reservation_to_target};
use crate::config::LedgerConfig;
use crate::error::{WorkflowError, WorkflowResult};
use crate::external::{ErpGateway, PickValidation, PickValidationRequest};
use crate::ledger::{self, load_package};
use crate::packages::new_package;
use crate::store::{PackageStore, UnitOfWork, finish};

/// Where a pick takes its quantity from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceSelector {
    /// Loose bin stock.
    Stock,
    /// Part of one package's content.
    Package(PackageId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddItemRequest {
    pub abs_entry: i32,
    pub pick_entry: i32,
    pub item_code: String,
    pub quantity: i64,
    pub unit: UnitType,
    pub warehouse: String,
    /// Required for loose stock; defaults to the package's bin otherwise.
    pub bin_entry: Option<i32>,
    pub source: SourceSelector,
    /// Open target package of this pick list to re-pack the quantity into.
    pub target_package_id: Option<PackageId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddFullPackageRequest {
    pub abs_entry: i32,
    pub package_id: PackageId,
    /// ERP pick entry for every item the package holds.
    pub pick_entries: BTreeMap<String, i32>,
    pub target_package_id: Option<PackageId>,
}

/// Derive the pick list's state from what is stored.
pub async fn pick_list_state(uow: &mut dyn UnitOfWork, abs_entry: i32) -> WorkflowResult<PickListState> {
    let lines = uow.pick_lines(abs_entry).await?;
    let links = uow.pick_packages(abs_entry).await?;
    let commitments = uow
        .commitments_for_operation(&OperationRef::picking(abs_entry))
        .await?;
    Ok(PickListState::derive(&lines, &links, commitments.len()))
}

async fn ensure_accepting(uow: &mut dyn UnitOfWork, abs_entry: i32) -> WorkflowResult<()> {
    match pick_list_state(uow, abs_entry).await? {
        PickListState::Empty | PickListState::Open => Ok(()),
        state => Err(DomainError::conflict(format!(
            "pick list {abs_entry} is {}",
            state.as_str()
        ))
        .into()),
    }
}

/// The target must be an open package linked to this pick list as a target.
async fn ensure_target(
    uow: &mut dyn UnitOfWork,
    abs_entry: i32,
    target_id: PackageId,
) -> WorkflowResult<()> {
    let linked = uow
        .pick_packages(abs_entry)
        .await?
        .iter()
        .any(|l| l.is_target() && l.package_id == target_id);
    if !linked {
        return Err(DomainError::validation(format!(
            "package {target_id} is not a target package of pick list {abs_entry}"
        ))
        .into());
    }
    load_package(uow, target_id).await?.ensure_open()?;
    Ok(())
}

async fn link_source(
    uow: &mut dyn UnitOfWork,
    abs_entry: i32,
    package_id: PackageId,
    pick_entry: i32,
    actor: UserId,
    at: DateTime<Utc>,
) -> WorkflowResult<()> {
    let exists = uow.pick_packages(abs_entry).await?.iter().any(|l| {
        l.package_id == package_id && l.role.pick_entry() == Some(pick_entry)
    });
    if !exists {
        uow.insert_pick_package(&PickListPackage::source(abs_entry, package_id, pick_entry, actor, at))
            .await?;
    }
    Ok(())
}

async fn already_picked(uow: &mut dyn UnitOfWork, abs_entry: i32, pick_entry: i32) -> WorkflowResult<i64> {
    Ok(uow
        .pick_lines(abs_entry)
        .await?
        .iter()
        .filter(|l| l.is_open() && l.pick_entry == pick_entry)
        .map(|l| l.quantity)
        .sum())
}

#[derive(Clone)]
pub struct PickListOrchestrator {
    store: Arc<dyn PackageStore>,
    erp: ErpGateway,
    config: Arc<LedgerConfig>,
    barcodes: BarcodeFormat,
}

impl PickListOrchestrator {
    pub fn new(
        store: Arc<dyn PackageStore>,
        erp: ErpGateway,
        config: Arc<LedgerConfig>,
        barcodes: BarcodeFormat,
    ) -> Self {
        Self {
            store,
            erp,
            config,
            barcodes,
        }
    }

    /// Create a target package for the pick list in the warehouse's staging bin.
    #[instrument(skip(self), err)]
    pub async fn create_package(
        &self,
        abs_entry: i32,
        warehouse: &str,
        actor: UserId,
    ) -> WorkflowResult<Package> {
        let mut uow = self.store.begin().await?;
        let result: WorkflowResult<Package> = async {
            ensure_accepting(uow.as_mut(), abs_entry).await?;
            let now = Utc::now();
            let staging = Location::bin(warehouse, self.config.bins_for(warehouse).staging_bin);
            let package = new_package(uow.as_mut(), &self.barcodes, staging, actor, now).await?;
            uow.insert_pick_package(&PickListPackage::target(abs_entry, package.id, actor, now))
                .await?;
            info!(abs_entry, package_id = %package.id, "target package created for pick list");
            Ok(package)
        }
        .await;
        finish(uow, result).await
    }

    /// Record one pick, from loose stock or part of a package.
    #[instrument(
        skip(self, request),
        fields(
            abs_entry = request.abs_entry,
            pick_entry = request.pick_entry,
            item_code = %request.item_code,
            quantity = request.quantity
        ),
        err
    )]
    pub async fn add_item(&self, request: AddItemRequest, actor: UserId) -> WorkflowResult<PickListLine> {
        if request.quantity <= 0 {
            return Err(DomainError::validation("pick quantity must be positive").into());
        }
        if request.item_code.trim().is_empty() {
            return Err(DomainError::validation("item code cannot be empty").into());
        }
        let mut uow = self.store.begin().await?;
        let result = self.add_item_in(uow.as_mut(), &request, actor).await;
        finish(uow, result).await
    }

    async fn add_item_in(
        &self,
        uow: &mut dyn UnitOfWork,
        request: &AddItemRequest,
        actor: UserId,
    ) -> WorkflowResult<PickListLine> {
        let now = Utc::now();
        let abs_entry = request.abs_entry;
        let operation = OperationRef::picking(abs_entry);
        ensure_accepting(uow, abs_entry).await?;
        if let Some(target) = request.target_package_id {
            ensure_target(uow, abs_entry, target).await?;
        }

        let bin_entry = match request.source {
            SourceSelector::Stock => request.bin_entry,
            SourceSelector::Package(package_id) => request
                .bin_entry
                .or(load_package(uow, package_id).await?.location.bin_entry),
        };
        let picked = already_picked(uow, abs_entry, request.pick_entry).await?;
        self.validate_with_erp(PickValidationRequest {
            abs_entry,
            pick_entry: request.pick_entry,
            item_code: request.item_code.clone(),
            quantity: request.quantity,
            bin_entry,
            already_picked: picked,
        })
        .await?;

        let source = match request.source {
            SourceSelector::Stock => {
                let bin = bin_entry
                    .ok_or_else(|| DomainError::validation("loose stock picks need a bin"))?;
                self.ensure_loose_stock(uow, &request.item_code, &request.warehouse, bin, request.quantity)
                    .await?;
                if let Some(target) = request.target_package_id {
                    ledger::stage(
                        uow,
                        target,
                        &request.item_code,
                        request.quantity,
                        operation,
                        None,
                        actor,
                        now,
                    )
                    .await?;
                }
                PickSource::Stock
            }
            SourceSelector::Package(package_id) => {
                let reserved = allocate_partial(
                    uow,
                    package_id,
                    &request.item_code,
                    request.quantity,
                    operation,
                    now,
                )
                .await?;
                if let Some(target) = request.target_package_id {
                    move_reservation_to_target(uow, reserved.id, target, None, actor, now).await?;
                }
                link_source(uow, abs_entry, package_id, request.pick_entry, actor, now).await?;
                PickSource::Package {
                    package_id,
                    full: false,
                }
            }
        };

        let line = PickListLine::open(
            abs_entry,
            request.pick_entry,
            request.item_code.as_str(),
            request.quantity,
            request.unit,
            bin_entry,
            source,
            request.target_package_id,
            actor,
            now,
        )?;
        uow.insert_pick_line(&line).await?;
        info!(abs_entry, line_id = %line.id, source = ?line.source, "pick line recorded");
        Ok(line)
    }

    /// Take a whole package for the pick list: one line per content item.
    #[instrument(
        skip(self, request),
        fields(abs_entry = request.abs_entry, package_id = %request.package_id),
        err
    )]
    pub async fn add_full_package(
        &self,
        request: AddFullPackageRequest,
        actor: UserId,
    ) -> WorkflowResult<Vec<PickListLine>> {
        let mut uow = self.store.begin().await?;
        let result = self.add_full_package_in(uow.as_mut(), &request, actor).await;
        finish(uow, result).await
    }

    async fn add_full_package_in(
        &self,
        uow: &mut dyn UnitOfWork,
        request: &AddFullPackageRequest,
        actor: UserId,
    ) -> WorkflowResult<Vec<PickListLine>> {
        let now = Utc::now();
        let abs_entry = request.abs_entry;
        let package_id = request.package_id;
        let operation = OperationRef::picking(abs_entry);
        ensure_accepting(uow, abs_entry).await?;
        if let Some(target) = request.target_package_id {
            ensure_target(uow, abs_entry, target).await?;
        }

        let package = load_package(uow, package_id).await?;
        package.ensure_active()?;
        let contents = uow.contents(package_id).await?;
        let mut first_entry = None;
        for content in contents.iter().filter(|c| c.available() > 0) {
            let pick_entry = *request.pick_entries.get(&content.item_code).ok_or_else(|| {
                DomainError::validation(format!(
                    "no pick entry given for item {} of package {package_id}",
                    content.item_code
                ))
            })?;
            first_entry.get_or_insert(pick_entry);
            let picked = already_picked(uow, abs_entry, pick_entry).await?;
            self.validate_with_erp(PickValidationRequest {
                abs_entry,
                pick_entry,
                item_code: content.item_code.clone(),
                quantity: content.available(),
                bin_entry: package.location.bin_entry,
                already_picked: picked,
            })
            .await?;
        }

        let reserved = allocate_full_package(uow, package_id, operation, now).await?;
        let mut lines = Vec::with_capacity(reserved.len());
        for commitment in reserved {
            if let Some(target) = request.target_package_id {
                move_reservation_to_target(uow, commitment.id, target, None, actor, now).await?;
            }
            let pick_entry = request
                .pick_entries
                .get(&commitment.item_code)
                .copied()
                .ok_or_else(|| DomainError::invariant("pick entry vanished during allocation"))?;
            let line = PickListLine::open(
                abs_entry,
                pick_entry,
                commitment.item_code.as_str(),
                commitment.quantity,
                UnitType::Unit,
                package.location.bin_entry,
                PickSource::Package {
                    package_id,
                    full: true,
                },
                request.target_package_id,
                actor,
                now,
            )?;
            uow.insert_pick_line(&line).await?;
            lines.push(line);
        }
        if let Some(pick_entry) = first_entry {
            link_source(uow, abs_entry, package_id, pick_entry, actor, now).await?;
        }

        info!(abs_entry, %package_id, lines = lines.len(), "full package picked");
        Ok(lines)
    }

    /// Package links of the pick list, oldest first.
    pub async fn packages(&self, abs_entry: i32) -> WorkflowResult<Vec<PickListPackage>> {
        let mut uow = self.store.begin().await?;
        let result = uow.pick_packages(abs_entry).await.map_err(WorkflowError::from);
        finish(uow, result).await
    }

    pub async fn lines(&self, abs_entry: i32) -> WorkflowResult<Vec<PickListLine>> {
        let mut uow = self.store.begin().await?;
        let result = uow.pick_lines(abs_entry).await.map_err(WorkflowError::from);
        finish(uow, result).await
    }

    pub async fn state(&self, abs_entry: i32) -> WorkflowResult<PickListState> {
        let mut uow = self.store.begin().await?;
        let result = pick_list_state(uow.as_mut(), abs_entry).await;
        finish(uow, result).await
    }

    async fn validate_with_erp(&self, request: PickValidationRequest) -> WorkflowResult<()> {
        match self.erp.validate_picking_add_item(&request).await? {
            PickValidation::Ok => Ok(()),
            PickValidation::Rejected { code, message } => {
                warn!(
                    abs_entry = request.abs_entry,
                    pick_entry = request.pick_entry,
                    code = code.as_str(),
                    %message,
                    "ERP rejected pick"
                );
                Err(WorkflowError::PickRejected { code, message })
            }
        }
    }

    /// Loose stock = ERP on-hand - stock held in open packages in the bin - open loose picks.
    async fn ensure_loose_stock(
        &self,
        uow: &mut dyn UnitOfWork,
        item_code: &str,
        warehouse: &str,
        bin_entry: i32,
        quantity: i64,
    ) -> WorkflowResult<()> {
        uow.lock_bin_stock(item_code, bin_entry).await?;
        let on_hand = self.erp.get_bin_on_hand(item_code, bin_entry).await?;
        let packaged = uow.packaged_quantity_in_bin(item_code, warehouse, bin_entry).await?;
        let open_picks = uow.open_stock_pick_quantity(item_code, bin_entry).await?;
        let available = on_hand - packaged - open_picks;
        if quantity > available {
            warn!(item_code, bin_entry, on_hand, packaged, open_picks, quantity, "not enough loose stock");
            return Err(WorkflowError::InsufficientBinStock {
                item_code: item_code.to_string(),
                bin_entry,
                requested: quantity,
                available: available.max(0),
            });
        }
        Ok(())
    }
}

impl core::fmt::Debug for PickListOrchestrator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PickListOrchestrator")
            .field("erp", &self.erp)
            .finish_non_exhaustive()
    }
}
