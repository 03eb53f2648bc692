//! Package lifecycle service: creation, receipts, moves, lookups and the
//! ledger audit.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, instrument};

use packledger_core::{DomainError, PackageId, UserId};
use packledger_packages::{
    BarcodeFormat, LedgerViolation, Location, MovementType, OperationRef, Package,
    PackageCommitment, PackageContent, PackageTransaction, UnitType, audit_ledger,
};

use crate::allocation::relocate;
use crate::error::WorkflowResult;
use crate::ledger::load_package;
use crate::store::{PackageStore, UnitOfWork, finish};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreatePackageRequest {
    pub warehouse: String,
    pub bin_entry: Option<i32>,
    pub notes: Option<String>,
    pub custom_attributes: BTreeMap<String, String>,
}

/// A package with its content rows and open commitments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageView {
    pub package: Package,
    pub contents: Vec<PackageContent>,
    pub commitments: Vec<PackageCommitment>,
}

/// Insert a new `Init` package with the next barcode.
pub(crate) async fn new_package(
    uow: &mut dyn UnitOfWork,
    barcodes: &BarcodeFormat,
    location: Location,
    actor: UserId,
    at: DateTime<Utc>,
) -> WorkflowResult<Package> {
    let sequence = uow.next_barcode_sequence().await?;
    let barcode = barcodes.format(sequence)?;
    let package = Package::new(PackageId::new(), barcode, location, actor, at);
    uow.insert_package(&package).await?;
    info!(package_id = %package.id, barcode = %package.barcode, location = %package.location, "package created");
    Ok(package)
}

/// Run the full ledger audit inside `uow`.
pub async fn audit(uow: &mut dyn UnitOfWork) -> WorkflowResult<Vec<LedgerViolation>> {
    let contents = uow.all_contents().await?;
    let commitments = uow.all_commitments().await?;
    let violations = audit_ledger(&contents, &commitments);
    for violation in &violations {
        error!(%violation, "ledger violation");
    }
    Ok(violations)
}

#[derive(Clone)]
pub struct PackageService {
    store: Arc<dyn PackageStore>,
    barcodes: BarcodeFormat,
}

impl PackageService {
    pub fn new(store: Arc<dyn PackageStore>, barcodes: BarcodeFormat) -> Self {
        Self { store, barcodes }
    }

    #[instrument(skip(self, request), fields(warehouse = %request.warehouse), err)]
    pub async fn create_package(
        &self,
        request: CreatePackageRequest,
        actor: UserId,
    ) -> WorkflowResult<Package> {
        if request.warehouse.trim().is_empty() {
            return Err(DomainError::validation("warehouse cannot be empty").into());
        }
        let mut uow = self.store.begin().await?;
        let result: WorkflowResult<Package> = async {
            let now = Utc::now();
            let location = Location::new(request.warehouse, request.bin_entry);
            let mut package = new_package(uow.as_mut(), &self.barcodes, location, actor, now).await?;
            if request.notes.is_some() || !request.custom_attributes.is_empty() {
                package.notes = request.notes;
                package.custom_attributes = request.custom_attributes;
                uow.update_package(&package).await?;
            }
            Ok(package)
        }
        .await;
        finish(uow, result).await
    }

    /// Receive `quantity` into a package (goods receipt, repack, counting surplus).
    ///
    /// An `Init` package that sits in a bin becomes `Active`.
    #[instrument(skip(self), fields(%package_id, %operation), err)]
    pub async fn add_content(
        &self,
        package_id: PackageId,
        item_code: &str,
        quantity: i64,
        unit: UnitType,
        operation: OperationRef,
        actor: UserId,
    ) -> WorkflowResult<PackageContent> {
        if item_code.trim().is_empty() {
            return Err(DomainError::validation("item code cannot be empty").into());
        }
        let mut uow = self.store.begin().await?;
        let result: WorkflowResult<PackageContent> = async {
            let now = Utc::now();
            let mut package = load_package(uow.as_mut(), package_id).await?;
            package.ensure_open()?;

            let mut content = match uow.lock_content(package_id, item_code).await? {
                Some(content) => content,
                None => PackageContent::empty(package_id, item_code, package.location.clone(), now),
            };
            content.receive(quantity, now)?;
            uow.save_content(&content).await?;
            uow.append_transaction(&PackageTransaction::add(
                package_id, item_code, quantity, unit, operation, actor, now,
            ))
            .await?;

            if package.location.bin_entry.is_some() && package.activate(now)? {
                uow.update_package(&package).await?;
                info!(%package_id, "package activated");
            }
            Ok(content)
        }
        .await;
        finish(uow, result).await
    }

    /// Move a package with all of its content. Moving to the current location
    /// is a no-op and returns `false`.
    #[instrument(skip(self), fields(%package_id, to = %to), err)]
    pub async fn move_package(
        &self,
        package_id: PackageId,
        to: Location,
        movement: MovementType,
        operation: Option<OperationRef>,
        actor: UserId,
    ) -> WorkflowResult<bool> {
        let mut uow = self.store.begin().await?;
        let result = relocate(uow.as_mut(), package_id, to, movement, operation, actor, Utc::now()).await;
        finish(uow, result).await
    }

    pub async fn get_package(&self, package_id: PackageId) -> WorkflowResult<Option<PackageView>> {
        let mut uow = self.store.begin().await?;
        let result: WorkflowResult<Option<PackageView>> = async {
            match uow.package(package_id).await? {
                Some(package) => view(uow.as_mut(), package).await.map(Some),
                None => Ok(None),
            }
        }
        .await;
        finish(uow, result).await
    }

    pub async fn get_package_by_barcode(&self, barcode: &str) -> WorkflowResult<Option<PackageView>> {
        let mut uow = self.store.begin().await?;
        let result: WorkflowResult<Option<PackageView>> = async {
            match uow.package_by_barcode(barcode).await? {
                Some(package) => view(uow.as_mut(), package).await.map(Some),
                None => Ok(None),
            }
        }
        .await;
        finish(uow, result).await
    }

    #[instrument(skip(self), err)]
    pub async fn audit(&self) -> WorkflowResult<Vec<LedgerViolation>> {
        let mut uow = self.store.begin().await?;
        let result = audit(uow.as_mut()).await;
        finish(uow, result).await
    }
}

async fn view(uow: &mut dyn UnitOfWork, package: Package) -> WorkflowResult<PackageView> {
    let contents = uow.contents(package.id).await?;
    let commitments = uow.commitments_for_package(package.id).await?;
    Ok(PackageView {
        package,
        contents,
        commitments,
    })
}

impl core::fmt::Debug for PackageService {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PackageService")
            .field("barcodes", &self.barcodes)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use packledger_packages::PackageStatus;

    use super::*;
    use crate::store::InMemoryPackageStore;
    use crate::testing::seed_package;

    fn service(store: Arc<InMemoryPackageStore>) -> PackageService {
        PackageService::new(store, BarcodeFormat::new("PKG", 6).unwrap())
    }

    fn receipt() -> OperationRef {
        OperationRef::GoodsReceipt {
            receipt_id: Uuid::now_v7(),
        }
    }

    #[tokio::test]
    async fn barcodes_follow_the_sequence() {
        let service = service(InMemoryPackageStore::arc());
        let request = CreatePackageRequest {
            warehouse: "W01".into(),
            bin_entry: Some(3),
            ..Default::default()
        };
        let first = service.create_package(request.clone(), UserId::new()).await.unwrap();
        let second = service.create_package(request, UserId::new()).await.unwrap();
        assert_eq!(first.barcode, "PKG000001");
        assert_eq!(second.barcode, "PKG000002");
        assert_eq!(first.status, PackageStatus::Init);
    }

    #[tokio::test]
    async fn receiving_into_a_binned_package_activates_it() {
        let store = InMemoryPackageStore::arc();
        let service = service(store.clone());
        let package = service
            .create_package(
                CreatePackageRequest {
                    warehouse: "W01".into(),
                    bin_entry: Some(3),
                    ..Default::default()
                },
                UserId::new(),
            )
            .await
            .unwrap();

        service
            .add_content(package.id, "A", 10, UnitType::Unit, receipt(), UserId::new())
            .await
            .unwrap();
        let view = service.get_package(package.id).await.unwrap().unwrap();
        assert_eq!(view.package.status, PackageStatus::Active);
        assert_eq!(view.contents.len(), 1);
        assert_eq!(view.contents[0].available(), 10);

        let by_barcode = service
            .get_package_by_barcode(&package.barcode)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_barcode.package.id, package.id);
    }

    #[tokio::test]
    async fn moving_writes_one_history_row_and_moves_contents() {
        let store = InMemoryPackageStore::arc();
        let service = service(store.clone());
        let p = seed_package(&store, "W01", 5, &[("A", 4), ("B", 2)]).await;
        let actor = UserId::new();

        assert!(service
            .move_package(p, Location::bin("W01", 8), MovementType::Manual, None, actor)
            .await
            .unwrap());
        assert!(!service
            .move_package(p, Location::bin("W01", 8), MovementType::Manual, None, actor)
            .await
            .unwrap());

        let view = service.get_package(p).await.unwrap().unwrap();
        assert!(view.contents.iter().all(|c| c.location == Location::bin("W01", 8)));
        let mut uow = store.begin().await.unwrap();
        assert_eq!(uow.location_history(p).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn audit_of_a_clean_ledger_is_empty() {
        let store = InMemoryPackageStore::arc();
        let service = service(store.clone());
        seed_package(&store, "W01", 5, &[("A", 4)]).await;
        assert!(service.audit().await.unwrap().is_empty());
    }
}
