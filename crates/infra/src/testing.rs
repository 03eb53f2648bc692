//! Fixtures shared by the unit and scenario tests.

use chrono::Utc;
use uuid::Uuid;

use packledger_core::{PackageId, UserId};
use packledger_packages::{
    Location, OperationRef, Package, PackageCommitment, PackageContent, PackageTransaction,
    UnitType,
};

use crate::store::PackageStore;

/// Insert a package in `warehouse/bin` holding `items`, received through a
/// goods receipt. Packages with content are `Active`, empty ones stay `Init`.
pub async fn seed_package(
    store: &dyn PackageStore,
    warehouse: &str,
    bin: i32,
    items: &[(&str, i64)],
) -> PackageId {
    let now = Utc::now();
    let actor = UserId::new();
    let receipt = OperationRef::GoodsReceipt {
        receipt_id: Uuid::now_v7(),
    };
    let id = PackageId::new();
    let mut package = Package::new(id, format!("SEED-{id}"), Location::bin(warehouse, bin), actor, now);
    if !items.is_empty() {
        package.activate(now).unwrap();
    }

    let mut uow = store.begin().await.unwrap();
    uow.insert_package(&package).await.unwrap();
    for (item, qty) in items {
        let mut content = PackageContent::empty(id, *item, package.location.clone(), now);
        content.receive(*qty, now).unwrap();
        uow.save_content(&content).await.unwrap();
        uow.append_transaction(&PackageTransaction::add(
            id,
            *item,
            *qty,
            UnitType::Unit,
            receipt,
            actor,
            now,
        ))
        .await
        .unwrap();
    }
    uow.commit().await.unwrap();
    id
}

pub async fn content_of(store: &dyn PackageStore, package_id: PackageId, item: &str) -> Option<PackageContent> {
    let mut uow = store.begin().await.unwrap();
    let row = uow.lock_content(package_id, item).await.unwrap();
    uow.rollback().await.unwrap();
    row
}

pub async fn package_of(store: &dyn PackageStore, package_id: PackageId) -> Package {
    let mut uow = store.begin().await.unwrap();
    let package = uow.package(package_id).await.unwrap().unwrap();
    uow.rollback().await.unwrap();
    package
}

pub async fn commitments_of(store: &dyn PackageStore, package_id: PackageId) -> Vec<PackageCommitment> {
    let mut uow = store.begin().await.unwrap();
    let rows = uow.commitments_for_package(package_id).await.unwrap();
    uow.rollback().await.unwrap();
    rows
}
