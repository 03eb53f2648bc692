use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::{
    CreatedDocument, ErpAdapter, ErpError, ErpObjectType, PickValidation, PickValidationCode,
    PickValidationRequest, TransferRequest,
};

/// One line of an ERP pick list, as far as validation cares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErpPickLine {
    pub item_code: String,
    pub open_quantity: i64,
    pub bin_entry: Option<i32>,
}

#[derive(Debug, Default)]
struct ErpState {
    series: HashMap<ErpObjectType, i32>,
    on_hand: HashMap<(String, i32), i64>,
    pick_lines: HashMap<(i32, i32), ErpPickLine>,
    closed_pick_lists: HashSet<i32>,
    transfers: Vec<(TransferRequest, CreatedDocument)>,
    next_entry: i32,
    fail_next_transfer: Option<ErpError>,
    lose_next_reply: Option<ErpError>,
}

/// In-memory ERP stand-in.
///
/// Intended for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryErp {
    state: Mutex<ErpState>,
}

impl InMemoryErp {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, ErpState>, ErpError> {
        self.state
            .lock()
            .map_err(|_| ErpError::Unavailable("in-memory ERP lock poisoned".into()))
    }

    pub fn set_series(&self, object_type: ErpObjectType, series: i32) -> Result<(), ErpError> {
        self.state()?.series.insert(object_type, series);
        Ok(())
    }

    pub fn set_on_hand(&self, item_code: &str, bin_entry: i32, quantity: i64) -> Result<(), ErpError> {
        self.state()?
            .on_hand
            .insert((item_code.to_string(), bin_entry), quantity);
        Ok(())
    }

    pub fn register_pick_line(
        &self,
        abs_entry: i32,
        pick_entry: i32,
        line: ErpPickLine,
    ) -> Result<(), ErpError> {
        self.state()?.pick_lines.insert((abs_entry, pick_entry), line);
        Ok(())
    }

    pub fn close_pick_list(&self, abs_entry: i32) -> Result<(), ErpError> {
        self.state()?.closed_pick_lists.insert(abs_entry);
        Ok(())
    }

    /// Make the next `create_transfer` call fail with `error`.
    pub fn fail_next_transfer(&self, error: ErpError) -> Result<(), ErpError> {
        self.state()?.fail_next_transfer = Some(error);
        Ok(())
    }

    /// Let the next `create_transfer` call create its document but answer
    /// with `error`, as when the reply is lost on the way back.
    pub fn lose_next_transfer_reply(&self, error: ErpError) -> Result<(), ErpError> {
        self.state()?.lose_next_reply = Some(error);
        Ok(())
    }

    /// Transfers accepted so far, oldest first.
    pub fn transfers(&self) -> Result<Vec<(TransferRequest, CreatedDocument)>, ErpError> {
        Ok(self.state()?.transfers.clone())
    }
}

#[async_trait]
impl ErpAdapter for InMemoryErp {
    async fn get_series(&self, object_type: ErpObjectType) -> Result<Option<i32>, ErpError> {
        Ok(self.state()?.series.get(&object_type).copied())
    }

    async fn create_transfer(&self, request: &TransferRequest) -> Result<CreatedDocument, ErpError> {
        let mut state = self.state()?;
        if let Some(error) = state.fail_next_transfer.take() {
            return Err(error);
        }
        if let Some((_, created)) = state
            .transfers
            .iter()
            .find(|(sent, _)| sent.reference == request.reference)
        {
            return Ok(*created);
        }
        if request.lines.is_empty() {
            return Err(ErpError::Rejected("transfer has no lines".into()));
        }
        state.next_entry += 1;
        let created = CreatedDocument {
            entry: state.next_entry,
            number: 1000 + state.next_entry,
        };
        state.transfers.push((request.clone(), created));
        match state.lose_next_reply.take() {
            Some(error) => Err(error),
            None => Ok(created),
        }
    }

    async fn get_bin_on_hand(&self, item_code: &str, bin_entry: i32) -> Result<i64, ErpError> {
        Ok(self
            .state()?
            .on_hand
            .get(&(item_code.to_string(), bin_entry))
            .copied()
            .unwrap_or(0))
    }

    async fn validate_picking_add_item(
        &self,
        request: &PickValidationRequest,
    ) -> Result<PickValidation, ErpError> {
        let state = self.state()?;
        let reject = |code: PickValidationCode, message: String| {
            Ok(PickValidation::Rejected { code, message })
        };

        if state.closed_pick_lists.contains(&request.abs_entry) {
            return reject(
                PickValidationCode::PickListClosed,
                format!("pick list {} is closed", request.abs_entry),
            );
        }
        if !state.pick_lines.keys().any(|(abs, _)| *abs == request.abs_entry) {
            return reject(
                PickValidationCode::PickListNotFound,
                format!("pick list {} not found", request.abs_entry),
            );
        }
        let Some(line) = state.pick_lines.get(&(request.abs_entry, request.pick_entry)) else {
            return reject(
                PickValidationCode::PickLineNotFound,
                format!(
                    "pick list {} has no line {}",
                    request.abs_entry, request.pick_entry
                ),
            );
        };
        if line.item_code != request.item_code {
            return reject(
                PickValidationCode::ItemMismatch,
                format!("line {} is for item {}", request.pick_entry, line.item_code),
            );
        }
        if let (Some(expected), Some(actual)) = (line.bin_entry, request.bin_entry) {
            if expected != actual {
                return reject(
                    PickValidationCode::BinMismatch,
                    format!("line {} picks from bin {expected}", request.pick_entry),
                );
            }
        }
        let open = line.open_quantity - request.already_picked;
        if request.quantity > open {
            return reject(
                PickValidationCode::QuantityExceedsOpen,
                format!(
                    "requested {} but only {open} open on line {}",
                    request.quantity, request.pick_entry
                ),
            );
        }
        Ok(PickValidation::Ok)
    }
}
