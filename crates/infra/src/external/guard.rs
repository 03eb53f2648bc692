use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{debug, instrument, warn};

use super::{
    CreatedDocument, ErpAdapter, ErpError, ErpObjectType, PickValidation, PickValidationRequest,
    TransferRequest,
};

/// Serializes ERP writes.
///
/// The ERP tolerates one writer per company database, so document-creating
/// calls take the single permit first. Reads pass straight through.
#[derive(Clone)]
pub struct ErpGateway {
    adapter: Arc<dyn ErpAdapter>,
    write_slot: Arc<Semaphore>,
    write_timeout: Duration,
}

impl ErpGateway {
    pub fn new(adapter: Arc<dyn ErpAdapter>, write_timeout: Duration) -> Self {
        Self {
            adapter,
            write_slot: Arc::new(Semaphore::new(1)),
            write_timeout,
        }
    }

    #[instrument(skip(self, request), fields(reference = %request.reference, lines = request.lines.len()), err)]
    pub async fn create_transfer(&self, request: &TransferRequest) -> Result<CreatedDocument, ErpError> {
        let timeout_ms = u64::try_from(self.write_timeout.as_millis()).unwrap_or(u64::MAX);
        let _permit = match tokio::time::timeout(self.write_timeout, self.write_slot.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_closed)) => return Err(ErpError::Unavailable("write slot closed".into())),
            Err(_elapsed) => {
                warn!(timeout_ms, "ERP write slot busy");
                return Err(ErpError::Timeout { timeout_ms });
            }
        };
        let created = self.adapter.create_transfer(request).await?;
        debug!(entry = created.entry, number = created.number, "ERP transfer created");
        Ok(created)
    }

    pub async fn get_series(&self, object_type: ErpObjectType) -> Result<Option<i32>, ErpError> {
        self.adapter.get_series(object_type).await
    }

    pub async fn get_bin_on_hand(&self, item_code: &str, bin_entry: i32) -> Result<i64, ErpError> {
        self.adapter.get_bin_on_hand(item_code, bin_entry).await
    }

    pub async fn validate_picking_add_item(
        &self,
        request: &PickValidationRequest,
    ) -> Result<PickValidation, ErpError> {
        self.adapter.validate_picking_add_item(request).await
    }
}

impl core::fmt::Debug for ErpGateway {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ErpGateway")
            .field("write_timeout", &self.write_timeout)
            .field("write_slot_free", &self.write_slot.available_permits())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Adapter whose writes take a while and record peak concurrency.
    #[derive(Default)]
    struct SlowErp {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl ErpAdapter for SlowErp {
        async fn get_series(&self, _: ErpObjectType) -> Result<Option<i32>, ErpError> {
            Ok(None)
        }

        async fn create_transfer(&self, _: &TransferRequest) -> Result<CreatedDocument, ErpError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(CreatedDocument { entry: 1, number: 1 })
        }

        async fn get_bin_on_hand(&self, _: &str, _: i32) -> Result<i64, ErpError> {
            Ok(0)
        }

        async fn validate_picking_add_item(
            &self,
            _: &PickValidationRequest,
        ) -> Result<PickValidation, ErpError> {
            Ok(PickValidation::Ok)
        }
    }

    fn request() -> TransferRequest {
        TransferRequest {
            reference: "test".into(),
            series: None,
            source_warehouse: "W01".into(),
            target_warehouse: None,
            comments: String::new(),
            lines: vec![],
        }
    }

    #[tokio::test]
    async fn writes_never_overlap() {
        let erp = Arc::new(SlowErp::default());
        let gateway = ErpGateway::new(erp.clone(), Duration::from_secs(5));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let gateway = gateway.clone();
            handles.push(tokio::spawn(async move { gateway.create_transfer(&request()).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(erp.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn busy_write_slot_times_out() {
        let erp = Arc::new(SlowErp::default());
        let gateway = ErpGateway::new(erp, Duration::from_millis(1));

        let held = gateway.write_slot.clone().acquire_owned().await.unwrap();
        let err = gateway.create_transfer(&request()).await.unwrap_err();
        assert_eq!(err, ErpError::Timeout { timeout_ms: 1 });
        drop(held);
    }
}
