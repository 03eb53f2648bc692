//! End-to-end scenarios over the in-memory store and ERP.
//!
//! Verifies:
//! - Concurrent reservations never over-commit a content row
//! - Cancelling an assembled pick list returns the targets through one transfer
//! - Cancellation is idempotent and all-or-nothing with respect to the ERP
//! - A retry after a lost ERP reply reuses the ERP document
//! - Every physical change leaves exactly one audit row

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use packledger_core::{DomainError, PackageId, UserId};
    use packledger_packages::{
        Location, MovementType, OperationRef, PackageStatus, TransactionKind, UnitType,
    };
    use packledger_picking::PickListState;

    use crate::error::WorkflowError;
    use crate::external::{ErpError, ErpPickLine, InMemoryErp};
    use crate::picking::{AddFullPackageRequest, AddItemRequest, SourceSelector};
    use crate::response::{OperationResponse, ResponseStatus};
    use crate::store::{InMemoryPackageStore, PackageStore};
    use crate::testing::{commitments_of, content_of, package_of, seed_package};
    use crate::{Ledger, LedgerConfig};

    const ABS: i32 = 30;

    fn setup() -> (Arc<InMemoryPackageStore>, Arc<InMemoryErp>, Ledger) {
        let store = InMemoryPackageStore::arc();
        let erp = Arc::new(InMemoryErp::new());
        let ledger = Ledger::new(store.clone(), erp.clone(), LedgerConfig::default()).unwrap();
        (store, erp, ledger)
    }

    fn register(erp: &InMemoryErp, pick_entry: i32, item: &str, open: i64) {
        erp.register_pick_line(
            ABS,
            pick_entry,
            ErpPickLine {
                item_code: item.into(),
                open_quantity: open,
                bin_entry: None,
            },
        )
        .unwrap();
    }

    struct Assembled {
        partial_source: PackageId,
        full_source: PackageId,
        target: PackageId,
    }

    /// Target receives 12 A from a 24 A package, the whole of a 24 B package
    /// and 3 loose C from bin 5.
    async fn assemble(store: &Arc<InMemoryPackageStore>, erp: &InMemoryErp, ledger: &Ledger) -> Assembled {
        let actor = UserId::new();
        register(erp, 0, "A", 50);
        register(erp, 1, "B", 50);
        register(erp, 2, "C", 50);
        erp.set_on_hand("C", 5, 3).unwrap();

        let partial_source = seed_package(store, "W01", 4, &[("A", 24)]).await;
        let full_source = seed_package(store, "W01", 4, &[("B", 24)]).await;
        let target = ledger.picking.create_package(ABS, "W01", actor).await.unwrap().id;

        ledger
            .picking
            .add_item(
                AddItemRequest {
                    abs_entry: ABS,
                    pick_entry: 0,
                    item_code: "A".into(),
                    quantity: 12,
                    unit: UnitType::Unit,
                    warehouse: "W01".into(),
                    bin_entry: None,
                    source: SourceSelector::Package(partial_source),
                    target_package_id: Some(target),
                },
                actor,
            )
            .await
            .unwrap();
        ledger
            .picking
            .add_full_package(
                AddFullPackageRequest {
                    abs_entry: ABS,
                    package_id: full_source,
                    pick_entries: BTreeMap::from([("B".to_string(), 1)]),
                    target_package_id: Some(target),
                },
                actor,
            )
            .await
            .unwrap();
        ledger
            .picking
            .add_item(
                AddItemRequest {
                    abs_entry: ABS,
                    pick_entry: 2,
                    item_code: "C".into(),
                    quantity: 3,
                    unit: UnitType::Unit,
                    warehouse: "W01".into(),
                    bin_entry: Some(5),
                    source: SourceSelector::Stock,
                    target_package_id: Some(target),
                },
                actor,
            )
            .await
            .unwrap();

        Assembled {
            partial_source,
            full_source,
            target,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_reservations_never_over_commit() {
        let (store, _erp, ledger) = setup();
        let package = seed_package(&store, "W01", 4, &[("A", 10)]).await;

        let mut handles = Vec::new();
        for abs_entry in 0..8 {
            let commitments = ledger.commitments.clone();
            handles.push(tokio::spawn(async move {
                commitments
                    .reserve(package, "A", 8, OperationRef::picking(abs_entry))
                    .await
            }));
        }

        let mut granted = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => granted += 1,
                Err(WorkflowError::Domain(DomainError::InsufficientAvailableQuantity { .. })) => {}
                Err(other) => panic!("unexpected error: {other:?}"),
            }
        }
        assert_eq!(granted, 1);
        let content = content_of(&store, package, "A").await.unwrap();
        assert_eq!(content.committed_quantity, 8);
        assert!(ledger.packages.audit().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancelling_an_assembled_pick_list_returns_targets_through_one_transfer() {
        let (store, erp, ledger) = setup();
        let actor = UserId::new();
        let a = assemble(&store, &erp, &ledger).await;

        let summary = ledger.closure.process_pick_list_closure(ABS, actor).await.unwrap();
        assert_eq!(summary.consumed, 2);
        assert_eq!(summary.closed_sources, vec![a.full_source]);
        assert_eq!(summary.returned_targets, vec![a.target]);
        assert_eq!(summary.cancelled_lines, 3);
        let transfer_id = summary.transfer_id.unwrap();
        assert_eq!(summary.response().transfer_id, Some(transfer_id));

        // Partial source keeps the rest, fully available.
        let rest = content_of(&store, a.partial_source, "A").await.unwrap();
        assert_eq!((rest.quantity, rest.committed_quantity), (12, 0));
        assert_eq!(package_of(&store, a.partial_source).await.status, PackageStatus::Active);

        // Full source is drained and closed.
        assert!(content_of(&store, a.full_source, "B").await.is_none());
        assert_eq!(package_of(&store, a.full_source).await.status, PackageStatus::Closed);

        // Target holds three fully committed lines and sits in the cancellation bin.
        let target = package_of(&store, a.target).await;
        assert_eq!(target.status, PackageStatus::Active);
        assert_eq!(target.location, Location::bin("W01", 2));
        for (item, qty) in [("A", 12), ("B", 24), ("C", 3)] {
            let row = content_of(&store, a.target, item).await.unwrap();
            assert_eq!((row.quantity, row.committed_quantity), (qty, qty), "item {item}");
        }
        let owned = commitments_of(&store, a.target).await;
        assert_eq!(owned.len(), 3);
        assert!(owned.iter().all(|c| c.operation == OperationRef::transfer(transfer_id)));

        // One ERP transfer, staging bin to cancellation bin.
        let sent = erp.transfers().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0.lines.len(), 3);
        let view = ledger.transfers.get_transfer(transfer_id).await.unwrap().unwrap();
        assert_eq!(view.transfer.external_entry, Some(sent[0].1.entry));
        assert_eq!(view.transfer.total_quantity(), 39);
        assert_eq!(view.packages.len(), 1);

        assert_eq!(ledger.picking.state(ABS).await.unwrap(), PickListState::Cancelled);
        assert!(ledger.packages.audit().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn second_cancellation_reports_already_processed_and_writes_nothing() {
        let (store, erp, ledger) = setup();
        let actor = UserId::new();
        let a = assemble(&store, &erp, &ledger).await;
        ledger.closure.process_pick_list_closure(ABS, actor).await.unwrap();

        let before = commitments_of(&store, a.target).await;
        let err = ledger.closure.process_pick_list_closure(ABS, actor).await.unwrap_err();
        assert!(matches!(err, WorkflowError::CancellationAlreadyProcessed { abs_entry: ABS }));
        assert_eq!(erp.transfers().unwrap().len(), 1);
        assert_eq!(commitments_of(&store, a.target).await, before);

        let response = OperationResponse::from(Err::<(), _>(err));
        assert_eq!(response.status, ResponseStatus::Error);
        assert_eq!(response.error_code.as_deref(), Some("cancellation_already_processed"));

        let err = ledger.closure.clear_pick_list_commitments(ABS, actor).await.unwrap_err();
        assert!(matches!(err, WorkflowError::CancellationAlreadyProcessed { .. }));
    }

    #[tokio::test]
    async fn erp_failure_leaves_the_ledger_untouched() {
        let (store, erp, ledger) = setup();
        let actor = UserId::new();
        let a = assemble(&store, &erp, &ledger).await;
        erp.fail_next_transfer(ErpError::Unavailable("service layer down".into()))
            .unwrap();

        let err = ledger.closure.process_pick_list_closure(ABS, actor).await.unwrap_err();
        assert!(matches!(err, WorkflowError::ExternalSystem(ErpError::Unavailable(_))));
        assert_eq!(err.code(), "external_system_error");

        assert_eq!(ledger.picking.state(ABS).await.unwrap(), PickListState::Open);
        let source = content_of(&store, a.partial_source, "A").await.unwrap();
        assert_eq!((source.quantity, source.committed_quantity), (24, 12));
        assert_eq!(package_of(&store, a.full_source).await.status, PackageStatus::Active);
        assert_eq!(package_of(&store, a.target).await.location, Location::bin("W01", 1));

        // The retry goes through.
        let summary = ledger.closure.process_pick_list_closure(ABS, actor).await.unwrap();
        assert!(summary.external.is_some());
    }

    #[tokio::test]
    async fn lost_erp_reply_is_not_sent_twice() {
        let (store, erp, ledger) = setup();
        let actor = UserId::new();
        let a = assemble(&store, &erp, &ledger).await;
        erp.lose_next_transfer_reply(ErpError::Unavailable("reply lost".into()))
            .unwrap();

        let err = ledger.closure.process_pick_list_closure(ABS, actor).await.unwrap_err();
        assert!(matches!(err, WorkflowError::ExternalSystem(ErpError::Unavailable(_))));
        assert_eq!(ledger.picking.state(ABS).await.unwrap(), PickListState::Open);
        assert_eq!(package_of(&store, a.target).await.location, Location::bin("W01", 1));
        assert_eq!(erp.transfers().unwrap().len(), 1);

        let summary = ledger.closure.process_pick_list_closure(ABS, actor).await.unwrap();
        let sent = erp.transfers().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(summary.external, Some(sent[0].1));

        let view = ledger
            .transfers
            .get_transfer(summary.transfer_id.unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(view.transfer.external_entry, Some(sent[0].1.entry));
        assert_eq!(ledger.picking.state(ABS).await.unwrap(), PickListState::Cancelled);
        assert!(ledger.packages.audit().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn every_physical_change_leaves_one_audit_row() {
        let (store, erp, ledger) = setup();
        let actor = UserId::new();
        let a = assemble(&store, &erp, &ledger).await;
        ledger.closure.process_pick_list_closure(ABS, actor).await.unwrap();

        let mut uow = store.begin().await.unwrap();
        let source_rows = uow.transactions(a.partial_source).await.unwrap();
        assert_eq!(source_rows.len(), 2);
        assert_eq!(source_rows[1].kind, TransactionKind::Remove);
        assert_eq!(source_rows[1].quantity, 12);
        assert_eq!(source_rows[1].operation, OperationRef::picking_closure(ABS));

        let target_rows = uow.transactions(a.target).await.unwrap();
        assert_eq!(target_rows.len(), 3);
        assert!(target_rows.iter().all(|t| t.kind == TransactionKind::Add));

        let moves = uow.location_history(a.target).await.unwrap();
        assert_eq!(moves.len(), 1);
        assert_eq!(moves[0].movement, MovementType::PickingCancellation);
        assert_eq!(moves[0].from, Location::bin("W01", 1));
        assert_eq!(moves[0].to, Location::bin("W01", 2));
        assert!(uow.location_history(a.partial_source).await.unwrap().is_empty());
        uow.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn completing_the_compensating_transfer_frees_the_targets() {
        let (store, erp, ledger) = setup();
        let actor = UserId::new();
        let a = assemble(&store, &erp, &ledger).await;
        let transfer_id = ledger
            .closure
            .process_pick_list_closure(ABS, actor)
            .await
            .unwrap()
            .transfer_id
            .unwrap();

        ledger.transfers.complete_transfer(transfer_id, actor).await.unwrap();
        for (item, qty) in [("A", 12), ("B", 24), ("C", 3)] {
            let row = content_of(&store, a.target, item).await.unwrap();
            assert_eq!((row.quantity, row.committed_quantity), (qty, 0));
        }
        assert!(commitments_of(&store, a.target).await.is_empty());

        let err = ledger.transfers.complete_transfer(transfer_id, actor).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Domain(DomainError::Conflict(_))));
    }

    #[tokio::test]
    async fn normal_closure_after_assembly_delivers_the_target() {
        let (store, erp, ledger) = setup();
        let actor = UserId::new();
        let a = assemble(&store, &erp, &ledger).await;

        let summary = ledger.closure.close_pick_list(ABS, Some(7), actor).await.unwrap();
        assert_eq!(summary.consumed, 2);
        assert_eq!(summary.landed, 3);
        assert_eq!(summary.delivered_targets, vec![a.target]);

        let target = package_of(&store, a.target).await;
        assert_eq!(target.location, Location::bin("W01", 7));
        assert_eq!(content_of(&store, a.target, "B").await.unwrap().available(), 24);
        assert!(ledger.closure.clear_pick_list_commitments(ABS, actor).await.is_err());
        assert!(ledger.packages.audit().await.unwrap().is_empty());
    }
}
