use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use packledger_core::{DomainError, DomainResult, Entity, PackageId, RecordId, UserId};
use packledger_packages::UnitType;

/// Where a pick line's quantity comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PickSource {
    /// Loose bin stock, no container.
    Stock,
    /// Content of a source package; `full` when the whole package was taken.
    Package { package_id: PackageId, full: bool },
}

impl PickSource {
    pub fn package_id(&self) -> Option<PackageId> {
        match self {
            PickSource::Stock => None,
            PickSource::Package { package_id, .. } => Some(*package_id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PickLineStatus {
    Open,
    Closed,
    Cancelled,
}

impl PickLineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PickLineStatus::Open => "open",
            PickLineStatus::Closed => "closed",
            PickLineStatus::Cancelled => "cancelled",
        }
    }
}

impl core::str::FromStr for PickLineStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(PickLineStatus::Open),
            "closed" => Ok(PickLineStatus::Closed),
            "cancelled" => Ok(PickLineStatus::Cancelled),
            other => Err(DomainError::validation(format!(
                "unknown pick line status '{other}'"
            ))),
        }
    }
}

/// Whether the line has been reported to the ERP pick list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Pending,
    Synced,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Synced => "synced",
            SyncStatus::Failed => "failed",
        }
    }
}

impl core::str::FromStr for SyncStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SyncStatus::Pending),
            "synced" => Ok(SyncStatus::Synced),
            "failed" => Ok(SyncStatus::Failed),
            other => Err(DomainError::validation(format!(
                "unknown sync status '{other}'"
            ))),
        }
    }
}

/// One picked quantity recorded against an ERP pick list line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PickListLine {
    pub id: RecordId,
    pub abs_entry: i32,
    pub pick_entry: i32,
    pub item_code: String,
    pub quantity: i64,
    pub unit: UnitType,
    pub bin_entry: Option<i32>,
    pub source: PickSource,
    pub target_package_id: Option<PackageId>,
    pub status: PickLineStatus,
    pub sync_status: SyncStatus,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PickListLine {
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        abs_entry: i32,
        pick_entry: i32,
        item_code: impl Into<String>,
        quantity: i64,
        unit: UnitType,
        bin_entry: Option<i32>,
        source: PickSource,
        target_package_id: Option<PackageId>,
        created_by: UserId,
        at: DateTime<Utc>,
    ) -> DomainResult<Self> {
        let item_code = item_code.into();
        if item_code.trim().is_empty() {
            return Err(DomainError::validation("item code cannot be empty"));
        }
        if quantity <= 0 {
            return Err(DomainError::validation("pick quantity must be positive"));
        }
        Ok(Self {
            id: RecordId::new(),
            abs_entry,
            pick_entry,
            item_code,
            quantity,
            unit,
            bin_entry,
            source,
            target_package_id,
            status: PickLineStatus::Open,
            sync_status: SyncStatus::Pending,
            created_by,
            created_at: at,
            updated_at: at,
        })
    }

    pub fn is_open(&self) -> bool {
        self.status == PickLineStatus::Open
    }

    pub fn close(&mut self, at: DateTime<Utc>) -> DomainResult<()> {
        self.finish(PickLineStatus::Closed, at)
    }

    pub fn cancel(&mut self, at: DateTime<Utc>) -> DomainResult<()> {
        self.finish(PickLineStatus::Cancelled, at)
    }

    fn finish(&mut self, status: PickLineStatus, at: DateTime<Utc>) -> DomainResult<()> {
        if !self.is_open() {
            return Err(DomainError::conflict(format!(
                "pick line {} of pick list {} is already {}",
                self.pick_entry,
                self.abs_entry,
                self.status.as_str()
            )));
        }
        self.status = status;
        self.updated_at = at;
        Ok(())
    }
}

impl Entity for PickListLine {
    type Id = RecordId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line() -> PickListLine {
        PickListLine::open(
            100,
            0,
            "A",
            12,
            UnitType::Unit,
            Some(5),
            PickSource::Stock,
            None,
            UserId::new(),
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn new_line_is_open_and_pending_sync() {
        let l = line();
        assert!(l.is_open());
        assert_eq!(l.sync_status, SyncStatus::Pending);
        assert_eq!(l.source.package_id(), None);
    }

    #[test]
    fn terminal_status_cannot_change_again() {
        let mut l = line();
        l.cancel(Utc::now()).unwrap();
        assert!(matches!(l.close(Utc::now()), Err(DomainError::Conflict(_))));
        assert_eq!(l.status, PickLineStatus::Cancelled);
    }

    #[test]
    fn rejects_empty_item_and_zero_quantity() {
        let user = UserId::new();
        assert!(
            PickListLine::open(1, 0, " ", 1, UnitType::Unit, None, PickSource::Stock, None, user, Utc::now())
                .is_err()
        );
        assert!(
            PickListLine::open(1, 0, "A", 0, UnitType::Unit, None, PickSource::Stock, None, user, Utc::now())
                .is_err()
        );
    }
}
