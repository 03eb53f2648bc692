use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use packledger_core::{DomainError, DomainResult, Entity, PackageId, RecordId, TransferId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    /// Document exists; stock is in transit.
    Open,
    Finished,
    Cancelled,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Open => "open",
            TransferStatus::Finished => "finished",
            TransferStatus::Cancelled => "cancelled",
        }
    }
}

impl core::str::FromStr for TransferStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(TransferStatus::Open),
            "finished" => Ok(TransferStatus::Finished),
            "cancelled" => Ok(TransferStatus::Cancelled),
            other => Err(DomainError::validation(format!(
                "unknown transfer status '{other}'"
            ))),
        }
    }
}

/// Why the transfer exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum TransferReason {
    Manual,
    /// Compensates stock re-packed by a pick list that was then cancelled.
    PickingCancellation { abs_entry: i32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinQuantity {
    pub bin_entry: i32,
    pub quantity: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferLine {
    pub item_code: String,
    pub quantity: i64,
    pub source_bins: Vec<BinQuantity>,
    pub target_bins: Vec<BinQuantity>,
}

impl TransferLine {
    /// One item moved in full from one bin to another.
    pub fn bin_to_bin(item_code: impl Into<String>, quantity: i64, from_bin: i32, to_bin: i32) -> Self {
        Self {
            item_code: item_code.into(),
            quantity,
            source_bins: vec![BinQuantity {
                bin_entry: from_bin,
                quantity,
            }],
            target_bins: vec![BinQuantity {
                bin_entry: to_bin,
                quantity,
            }],
        }
    }

    fn validate(&self) -> DomainResult<()> {
        if self.quantity <= 0 {
            return Err(DomainError::validation(format!(
                "transfer line for {} must have a positive quantity",
                self.item_code
            )));
        }
        let sourced: i64 = self.source_bins.iter().map(|b| b.quantity).sum();
        let targeted: i64 = self.target_bins.iter().map(|b| b.quantity).sum();
        if (!self.source_bins.is_empty() && sourced != self.quantity)
            || (!self.target_bins.is_empty() && targeted != self.quantity)
        {
            return Err(DomainError::validation(format!(
                "bin allocations for {} do not add up to {}",
                self.item_code, self.quantity
            )));
        }
        Ok(())
    }
}

/// Local record of a warehouse transfer document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub id: TransferId,
    pub series: Option<i32>,
    /// ERP document key, once the ERP has accepted the document.
    pub external_entry: Option<i32>,
    /// ERP document number, once the ERP has accepted the document.
    pub external_number: Option<i32>,
    pub source_warehouse: String,
    pub target_warehouse: Option<String>,
    pub comments: String,
    pub reason: TransferReason,
    pub status: TransferStatus,
    pub lines: Vec<TransferLine>,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transfer {
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        source_warehouse: impl Into<String>,
        target_warehouse: Option<String>,
        comments: impl Into<String>,
        reason: TransferReason,
        series: Option<i32>,
        lines: Vec<TransferLine>,
        created_by: UserId,
        at: DateTime<Utc>,
    ) -> DomainResult<Self> {
        if lines.is_empty() {
            return Err(DomainError::validation("transfer needs at least one line"));
        }
        for line in &lines {
            line.validate()?;
        }
        Ok(Self {
            id: TransferId::new(),
            series,
            external_entry: None,
            external_number: None,
            source_warehouse: source_warehouse.into(),
            target_warehouse,
            comments: comments.into(),
            reason,
            status: TransferStatus::Open,
            lines,
            created_by,
            created_at: at,
            updated_at: at,
        })
    }

    pub fn record_external(&mut self, entry: i32, number: i32, at: DateTime<Utc>) {
        self.external_entry = Some(entry);
        self.external_number = Some(number);
        self.updated_at = at;
    }

    pub fn finish(&mut self, at: DateTime<Utc>) -> DomainResult<()> {
        if self.status != TransferStatus::Open {
            return Err(DomainError::conflict(format!(
                "transfer {} is already {}",
                self.id,
                self.status.as_str()
            )));
        }
        self.status = TransferStatus::Finished;
        self.updated_at = at;
        Ok(())
    }

    pub fn total_quantity(&self) -> i64 {
        self.lines.iter().map(|l| l.quantity).sum()
    }
}

impl Entity for Transfer {
    type Id = TransferId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferPackageRole {
    /// Package carried out of the source location.
    Source,
    /// Package assembled at the destination.
    Target,
}

impl TransferPackageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferPackageRole::Source => "source",
            TransferPackageRole::Target => "target",
        }
    }
}

impl core::str::FromStr for TransferPackageRole {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "source" => Ok(TransferPackageRole::Source),
            "target" => Ok(TransferPackageRole::Target),
            other => Err(DomainError::validation(format!(
                "unknown transfer package role '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferPackage {
    pub id: RecordId,
    pub transfer_id: TransferId,
    pub package_id: PackageId,
    pub role: TransferPackageRole,
    pub added_by: UserId,
    pub added_at: DateTime<Utc>,
}

impl TransferPackage {
    pub fn new(
        transfer_id: TransferId,
        package_id: PackageId,
        role: TransferPackageRole,
        added_by: UserId,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: RecordId::new(),
            transfer_id,
            package_id,
            role,
            added_by,
            added_at: at,
        }
    }
}

impl Entity for TransferPackage {
    type Id = RecordId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transfer() -> Transfer {
        Transfer::open(
            "W01",
            None,
            "compensation",
            TransferReason::PickingCancellation { abs_entry: 9 },
            Some(12),
            vec![
                TransferLine::bin_to_bin("A", 36, 5, 99),
                TransferLine::bin_to_bin("C", 3, 5, 99),
            ],
            UserId::new(),
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn open_transfer_sums_lines() {
        let t = transfer();
        assert_eq!(t.status, TransferStatus::Open);
        assert_eq!(t.total_quantity(), 39);
        assert!(t.external_entry.is_none());
    }

    #[test]
    fn finish_only_once() {
        let mut t = transfer();
        t.finish(Utc::now()).unwrap();
        assert!(matches!(t.finish(Utc::now()), Err(DomainError::Conflict(_))));
    }

    #[test]
    fn rejects_lines_whose_bins_do_not_add_up() {
        let mut line = TransferLine::bin_to_bin("A", 10, 1, 2);
        line.source_bins[0].quantity = 4;
        let err = Transfer::open(
            "W01",
            None,
            "",
            TransferReason::Manual,
            None,
            vec![line],
            UserId::new(),
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn package_link_is_keyed_by_its_record_id() {
        let t = transfer();
        let link = TransferPackage::new(
            t.id,
            PackageId::new(),
            TransferPackageRole::Source,
            UserId::new(),
            Utc::now(),
        );
        assert_eq!(Entity::id(&link), &link.id);
        assert_eq!(Entity::id(&t), &t.id);
    }

    #[test]
    fn rejects_empty_transfer() {
        assert!(
            Transfer::open("W01", None, "", TransferReason::Manual, None, vec![], UserId::new(), Utc::now())
                .is_err()
        );
    }
}
