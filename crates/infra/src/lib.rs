//! Infrastructure layer: storage, ERP boundary, configuration and the
//! workflows that run the package ledger on top of them.

pub mod allocation;
pub mod closure;
pub mod config;
pub mod error;
pub mod external;
pub mod ledger;
pub mod packages;
pub mod picking;
pub mod response;
pub mod store;
pub mod transfers;

#[cfg(test)]
mod integration_tests;
#[cfg(test)]
mod testing;

use std::sync::Arc;

pub use allocation::{AllocationEngine, MovedReservation};
pub use closure::{CancellationSummary, ClearSummary, ClosureSummary, ClosureWorkflow};
pub use config::{ConfigError, LedgerConfig};
pub use error::{WorkflowError, WorkflowResult};
pub use external::{ErpAdapter, ErpError, ErpGateway};
pub use ledger::{CommitmentLedger, ConsumeOutcome};
pub use packages::{CreatePackageRequest, PackageService, PackageView};
pub use picking::{AddFullPackageRequest, AddItemRequest, PickListOrchestrator, SourceSelector};
pub use response::{OperationResponse, ResponseStatus};
pub use store::{PackageStore, StoreError, UnitOfWork};
pub use transfers::{TransferService, TransferView};

/// Every service of the ledger, wired to one store and one ERP gateway.
#[derive(Debug, Clone)]
pub struct Ledger {
    pub packages: PackageService,
    pub commitments: CommitmentLedger,
    pub allocation: AllocationEngine,
    pub picking: PickListOrchestrator,
    pub closure: ClosureWorkflow,
    pub transfers: TransferService,
}

impl Ledger {
    pub fn new(
        store: Arc<dyn PackageStore>,
        erp: Arc<dyn ErpAdapter>,
        config: LedgerConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let barcodes = config.barcode_format()?;
        let gateway = ErpGateway::new(erp, config.erp_write_timeout());
        let config = Arc::new(config);
        Ok(Self {
            packages: PackageService::new(store.clone(), barcodes.clone()),
            commitments: CommitmentLedger::new(store.clone()),
            allocation: AllocationEngine::new(store.clone()),
            picking: PickListOrchestrator::new(store.clone(), gateway.clone(), config.clone(), barcodes),
            closure: ClosureWorkflow::new(store.clone(), gateway, config),
            transfers: TransferService::new(store),
        })
    }
}
