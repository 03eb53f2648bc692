//! Append-only audit rows: content transactions and location moves.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use packledger_core::{DomainError, PackageId, RecordId, UserId};

use crate::operation::OperationRef;
use crate::package::Location;

/// Direction of a physical content change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Add,
    Remove,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Add => "add",
            TransactionKind::Remove => "remove",
        }
    }
}

impl core::str::FromStr for TransactionKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "add" => Ok(TransactionKind::Add),
            "remove" => Ok(TransactionKind::Remove),
            other => Err(DomainError::validation(format!(
                "unknown transaction kind '{other}'"
            ))),
        }
    }
}

/// Unit the quantity was handled in. Quantities themselves are always base units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitType {
    #[default]
    Unit,
    Dozen,
    Pack,
}

impl UnitType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitType::Unit => "unit",
            UnitType::Dozen => "dozen",
            UnitType::Pack => "pack",
        }
    }
}

impl core::str::FromStr for UnitType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unit" => Ok(UnitType::Unit),
            "dozen" => Ok(UnitType::Dozen),
            "pack" => Ok(UnitType::Pack),
            other => Err(DomainError::validation(format!("unknown unit type '{other}'"))),
        }
    }
}

/// One physical content change on a package. Never mutated once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageTransaction {
    pub id: RecordId,
    pub package_id: PackageId,
    pub kind: TransactionKind,
    pub item_code: String,
    pub quantity: i64,
    pub unit: UnitType,
    pub operation: OperationRef,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

impl PackageTransaction {
    pub fn add(
        package_id: PackageId,
        item_code: impl Into<String>,
        quantity: i64,
        unit: UnitType,
        operation: OperationRef,
        actor: UserId,
        at: DateTime<Utc>,
    ) -> Self {
        Self::record(TransactionKind::Add, package_id, item_code, quantity, unit, operation, actor, at)
    }

    pub fn remove(
        package_id: PackageId,
        item_code: impl Into<String>,
        quantity: i64,
        unit: UnitType,
        operation: OperationRef,
        actor: UserId,
        at: DateTime<Utc>,
    ) -> Self {
        Self::record(TransactionKind::Remove, package_id, item_code, quantity, unit, operation, actor, at)
    }

    #[allow(clippy::too_many_arguments)]
    fn record(
        kind: TransactionKind,
        package_id: PackageId,
        item_code: impl Into<String>,
        quantity: i64,
        unit: UnitType,
        operation: OperationRef,
        actor: UserId,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: RecordId::new(),
            package_id,
            kind,
            item_code: item_code.into(),
            quantity,
            unit,
            operation,
            actor,
            occurred_at: at,
        }
    }

    /// Signed quantity: positive for Add, negative for Remove.
    pub fn delta(&self) -> i64 {
        match self.kind {
            TransactionKind::Add => self.quantity,
            TransactionKind::Remove => -self.quantity,
        }
    }
}

/// Why a package changed bin/warehouse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementType {
    GoodsReceipt,
    Manual,
    Picking,
    PickingCancellation,
    Transfer,
}

impl MovementType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MovementType::GoodsReceipt => "goods_receipt",
            MovementType::Manual => "manual",
            MovementType::Picking => "picking",
            MovementType::PickingCancellation => "picking_cancellation",
            MovementType::Transfer => "transfer",
        }
    }
}

impl core::str::FromStr for MovementType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "goods_receipt" => Ok(MovementType::GoodsReceipt),
            "manual" => Ok(MovementType::Manual),
            "picking" => Ok(MovementType::Picking),
            "picking_cancellation" => Ok(MovementType::PickingCancellation),
            "transfer" => Ok(MovementType::Transfer),
            other => Err(DomainError::validation(format!(
                "unknown movement type '{other}'"
            ))),
        }
    }
}

/// One bin/warehouse move of a package. Never mutated once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageLocationHistory {
    pub id: RecordId,
    pub package_id: PackageId,
    pub from: Location,
    pub to: Location,
    pub movement: MovementType,
    pub operation: Option<OperationRef>,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

impl PackageLocationHistory {
    pub fn new(
        package_id: PackageId,
        from: Location,
        to: Location,
        movement: MovementType,
        operation: Option<OperationRef>,
        actor: UserId,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: RecordId::new(),
            package_id,
            from,
            to,
            movement,
            operation,
            actor,
            occurred_at: at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_is_signed_by_kind() {
        let package_id = PackageId::new();
        let actor = UserId::new();
        let add = PackageTransaction::add(
            package_id,
            "A",
            5,
            UnitType::Unit,
            OperationRef::picking(1),
            actor,
            Utc::now(),
        );
        let remove = PackageTransaction::remove(
            package_id,
            "A",
            5,
            UnitType::Unit,
            OperationRef::picking(1),
            actor,
            Utc::now(),
        );
        assert_eq!(add.delta() + remove.delta(), 0);
        assert_ne!(add.id, remove.id);
    }

    #[test]
    fn text_forms_parse_back() {
        for m in [
            MovementType::GoodsReceipt,
            MovementType::Manual,
            MovementType::Picking,
            MovementType::PickingCancellation,
            MovementType::Transfer,
        ] {
            assert_eq!(m.as_str().parse::<MovementType>().unwrap(), m);
        }
        assert_eq!("dozen".parse::<UnitType>().unwrap(), UnitType::Dozen);
        assert_eq!("remove".parse::<TransactionKind>().unwrap(), TransactionKind::Remove);
    }
}
