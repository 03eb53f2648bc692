//! ERP integration boundary.
//!
//! The ledger never talks to the ERP directly: every call goes through
//! [`ErpAdapter`], and every write call additionally goes through the
//! single-writer [`ErpGateway`].

pub mod guard;
pub mod in_memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use packledger_transfers::TransferLine;

pub use guard::ErpGateway;
pub use in_memory::{ErpPickLine, InMemoryErp};

/// ERP document families the ledger reads series/numbers for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErpObjectType {
    InventoryTransfer,
    PickList,
}

impl ErpObjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErpObjectType::InventoryTransfer => "inventory_transfer",
            ErpObjectType::PickList => "pick_list",
        }
    }
}

/// Transfer document as submitted to the ERP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    /// Stable key of the document. The ERP returns the existing document
    /// instead of creating a second one for a reference it has seen.
    pub reference: String,
    pub series: Option<i32>,
    pub source_warehouse: String,
    pub target_warehouse: Option<String>,
    pub comments: String,
    pub lines: Vec<TransferLine>,
}

/// Keys the ERP assigned to a created document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedDocument {
    pub entry: i32,
    pub number: i32,
}

/// A pick about to be recorded, as checked against the ERP pick list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PickValidationRequest {
    pub abs_entry: i32,
    pub pick_entry: i32,
    pub item_code: String,
    pub quantity: i64,
    pub bin_entry: Option<i32>,
    /// Quantity already recorded on open lines for the same pick entry.
    pub already_picked: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PickValidationCode {
    PickListNotFound,
    PickLineNotFound,
    ItemMismatch,
    QuantityExceedsOpen,
    BinMismatch,
    PickListClosed,
}

impl PickValidationCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PickValidationCode::PickListNotFound => "pick_list_not_found",
            PickValidationCode::PickLineNotFound => "pick_line_not_found",
            PickValidationCode::ItemMismatch => "item_mismatch",
            PickValidationCode::QuantityExceedsOpen => "quantity_exceeds_open",
            PickValidationCode::BinMismatch => "bin_mismatch",
            PickValidationCode::PickListClosed => "pick_list_closed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum PickValidation {
    Ok,
    Rejected {
        code: PickValidationCode,
        message: String,
    },
}

/// ERP failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ErpError {
    /// The ERP refused the document.
    #[error("ERP rejected the request: {0}")]
    Rejected(String),

    /// The ERP could not be reached or answered with a transport error.
    #[error("ERP unavailable: {0}")]
    Unavailable(String),

    /// No write slot became free in time.
    #[error("timed out after {timeout_ms} ms waiting for the ERP write slot")]
    Timeout { timeout_ms: u64 },
}

/// Operations the ledger needs from the ERP.
#[async_trait]
pub trait ErpAdapter: Send + Sync {
    /// Default document series for the object type, if the ERP defines one.
    async fn get_series(&self, object_type: ErpObjectType) -> Result<Option<i32>, ErpError>;

    /// Create the transfer, or return the document already created under
    /// `request.reference`.
    async fn create_transfer(&self, request: &TransferRequest) -> Result<CreatedDocument, ErpError>;

    /// Stock on hand for the item in the bin, loose and packaged together.
    async fn get_bin_on_hand(&self, item_code: &str, bin_entry: i32) -> Result<i64, ErpError>;

    async fn validate_picking_add_item(
        &self,
        request: &PickValidationRequest,
    ) -> Result<PickValidation, ErpError>;
}
