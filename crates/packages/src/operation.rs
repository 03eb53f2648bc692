//! References to the warehouse operation that reserves or changes package content.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use packledger_core::{DomainError, DomainResult, TransferId};

/// Kind of source operation, as persisted alongside commitments and audit rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    GoodsReceipt,
    Picking,
    /// Reconciliation of a cancelled pick list after physical execution.
    PickingClosure,
    Transfer,
    Counting,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::GoodsReceipt => "goods_receipt",
            OperationKind::Picking => "picking",
            OperationKind::PickingClosure => "picking_closure",
            OperationKind::Transfer => "transfer",
            OperationKind::Counting => "counting",
        }
    }
}

impl core::str::FromStr for OperationKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "goods_receipt" => Ok(OperationKind::GoodsReceipt),
            "picking" => Ok(OperationKind::Picking),
            "picking_closure" => Ok(OperationKind::PickingClosure),
            "transfer" => Ok(OperationKind::Transfer),
            "counting" => Ok(OperationKind::Counting),
            other => Err(DomainError::validation(format!(
                "unknown operation kind '{other}'"
            ))),
        }
    }
}

/// A specific source operation.
///
/// Pick lists are keyed by the ERP's `abs_entry`; the other documents carry a
/// local identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperationRef {
    GoodsReceipt { receipt_id: Uuid },
    Picking { abs_entry: i32 },
    PickingClosure { abs_entry: i32 },
    Transfer { transfer_id: TransferId },
    Counting { counting_id: Uuid },
}

impl OperationRef {
    pub fn picking(abs_entry: i32) -> Self {
        Self::Picking { abs_entry }
    }

    pub fn picking_closure(abs_entry: i32) -> Self {
        Self::PickingClosure { abs_entry }
    }

    pub fn transfer(transfer_id: TransferId) -> Self {
        Self::Transfer { transfer_id }
    }

    pub fn kind(&self) -> OperationKind {
        match self {
            OperationRef::GoodsReceipt { .. } => OperationKind::GoodsReceipt,
            OperationRef::Picking { .. } => OperationKind::Picking,
            OperationRef::PickingClosure { .. } => OperationKind::PickingClosure,
            OperationRef::Transfer { .. } => OperationKind::Transfer,
            OperationRef::Counting { .. } => OperationKind::Counting,
        }
    }

    /// Document reference in text form (the second half of the persisted pair).
    pub fn reference(&self) -> String {
        match self {
            OperationRef::GoodsReceipt { receipt_id } => receipt_id.to_string(),
            OperationRef::Picking { abs_entry } | OperationRef::PickingClosure { abs_entry } => {
                abs_entry.to_string()
            }
            OperationRef::Transfer { transfer_id } => transfer_id.to_string(),
            OperationRef::Counting { counting_id } => counting_id.to_string(),
        }
    }

    /// Rebuild from the persisted `(kind, reference)` pair.
    pub fn from_parts(kind: OperationKind, reference: &str) -> DomainResult<Self> {
        let parse_uuid = |s: &str| {
            Uuid::parse_str(s).map_err(|e| DomainError::invalid_id(format!("{}: {e}", kind.as_str())))
        };
        let parse_entry = |s: &str| {
            s.parse::<i32>()
                .map_err(|e| DomainError::invalid_id(format!("abs_entry: {e}")))
        };
        Ok(match kind {
            OperationKind::GoodsReceipt => Self::GoodsReceipt {
                receipt_id: parse_uuid(reference)?,
            },
            OperationKind::Picking => Self::Picking {
                abs_entry: parse_entry(reference)?,
            },
            OperationKind::PickingClosure => Self::PickingClosure {
                abs_entry: parse_entry(reference)?,
            },
            OperationKind::Transfer => Self::Transfer {
                transfer_id: reference.parse()?,
            },
            OperationKind::Counting => Self::Counting {
                counting_id: parse_uuid(reference)?,
            },
        })
    }

    /// Whether this operation may hold commitments.
    ///
    /// Closure reconciliation only tags audit rows; it never reserves.
    pub fn can_commit(&self) -> bool {
        !matches!(self, OperationRef::PickingClosure { .. })
    }
}

impl core::fmt::Display for OperationRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}:{}", self.kind().as_str(), self.reference())
    }
}
