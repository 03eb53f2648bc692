//! Local transfer documents and their completion.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, instrument};

use packledger_core::{DomainError, TransferId, UserId};
use packledger_packages::OperationRef;
use packledger_transfers::{Transfer, TransferPackage};

use crate::error::WorkflowResult;
use crate::ledger::{self, ConsumeOutcome};
use crate::store::{PackageStore, finish};

/// A transfer with the packages it carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferView {
    pub transfer: Transfer,
    pub packages: Vec<TransferPackage>,
}

#[derive(Clone)]
pub struct TransferService {
    store: Arc<dyn PackageStore>,
}

impl TransferService {
    pub fn new(store: Arc<dyn PackageStore>) -> Self {
        Self { store }
    }

    pub async fn get_transfer(&self, transfer_id: TransferId) -> WorkflowResult<Option<TransferView>> {
        let mut uow = self.store.begin().await?;
        let result: WorkflowResult<Option<TransferView>> = async {
            let Some(transfer) = uow.transfer(transfer_id).await? else {
                return Ok(None);
            };
            let packages = uow.transfer_packages(transfer_id).await?;
            Ok(Some(TransferView { transfer, packages }))
        }
        .await;
        finish(uow, result).await
    }

    /// Finish a transfer once its goods are booked at the destination.
    ///
    /// The staged content the transfer owns lands in its packages and becomes
    /// available again. A finished transfer cannot be completed twice.
    #[instrument(skip(self), fields(%transfer_id), err)]
    pub async fn complete_transfer(
        &self,
        transfer_id: TransferId,
        actor: UserId,
    ) -> WorkflowResult<Transfer> {
        let mut uow = self.store.begin().await?;
        let result: WorkflowResult<Transfer> = async {
            let now = Utc::now();
            let mut transfer = uow
                .transfer(transfer_id)
                .await?
                .ok_or_else(|| DomainError::not_found(format!("transfer {transfer_id}")))?;
            transfer.finish(now)?;

            let mut landed = 0;
            for commitment in uow
                .commitments_for_operation(&OperationRef::transfer(transfer_id))
                .await?
            {
                if ledger::consume(uow.as_mut(), commitment.id, None, actor, now).await?
                    == ConsumeOutcome::Landed
                {
                    landed += 1;
                }
            }
            uow.update_transfer(&transfer).await?;
            info!(%transfer_id, landed, "transfer completed");
            Ok(transfer)
        }
        .await;
        finish(uow, result).await
    }
}

impl core::fmt::Debug for TransferService {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TransferService").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WorkflowError;
    use crate::store::InMemoryPackageStore;

    #[tokio::test]
    async fn unknown_transfer_is_not_found() {
        let service = TransferService::new(InMemoryPackageStore::arc());
        let id = TransferId::new();
        assert!(service.get_transfer(id).await.unwrap().is_none());
        let err = service.complete_transfer(id, UserId::new()).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Domain(DomainError::NotFound(_))));
    }
}
