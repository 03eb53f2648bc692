use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use packledger_core::{DomainError, DomainResult, Entity, PackageId, UserId};

/// Package lifecycle status.
///
/// `Init` while content is being staged, `Active` once the package sits in a
/// real bin with content, `Closed` when everything has left it (terminal).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageStatus {
    Init,
    Active,
    Closed,
}

impl PackageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PackageStatus::Init => "init",
            PackageStatus::Active => "active",
            PackageStatus::Closed => "closed",
        }
    }
}

impl core::fmt::Display for PackageStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for PackageStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "init" => Ok(PackageStatus::Init),
            "active" => Ok(PackageStatus::Active),
            "closed" => Ok(PackageStatus::Closed),
            other => Err(DomainError::validation(format!(
                "unknown package status '{other}'"
            ))),
        }
    }
}

/// Warehouse + bin position. `bin_entry` is the ERP bin key; `None` means the
/// warehouse is not bin-managed or the package has not been put away yet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub warehouse: String,
    pub bin_entry: Option<i32>,
}

impl Location {
    pub fn new(warehouse: impl Into<String>, bin_entry: Option<i32>) -> Self {
        Self {
            warehouse: warehouse.into(),
            bin_entry,
        }
    }

    pub fn bin(warehouse: impl Into<String>, bin_entry: i32) -> Self {
        Self::new(warehouse, Some(bin_entry))
    }
}

impl core::fmt::Display for Location {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.bin_entry {
            Some(bin) => write!(f, "{}/{}", self.warehouse, bin),
            None => f.write_str(&self.warehouse),
        }
    }
}

/// A physical container holding one or more item lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    pub id: PackageId,
    pub barcode: String,
    pub status: PackageStatus,
    pub location: Location,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub custom_attributes: BTreeMap<String, String>,
}

impl Package {
    /// A freshly created package: `Init`, no content.
    pub fn new(
        id: PackageId,
        barcode: impl Into<String>,
        location: Location,
        created_by: UserId,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            barcode: barcode.into(),
            status: PackageStatus::Init,
            location,
            created_by,
            created_at: at,
            updated_at: at,
            closed_at: None,
            notes: None,
            custom_attributes: BTreeMap::new(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.status == PackageStatus::Closed
    }

    /// Reject any mutation of a closed package.
    pub fn ensure_open(&self) -> DomainResult<()> {
        if self.is_closed() {
            return Err(self.status_error());
        }
        Ok(())
    }

    /// Require the package to be `Active` (allocatable as a whole).
    pub fn ensure_active(&self) -> DomainResult<()> {
        if self.status != PackageStatus::Active {
            return Err(self.status_error());
        }
        Ok(())
    }

    /// `Init -> Active`. Returns `true` if the status changed.
    ///
    /// Activation needs a bin when the package's warehouse is bin-managed; the
    /// caller decides that, so only the closed state is rejected here.
    pub fn activate(&mut self, at: DateTime<Utc>) -> DomainResult<bool> {
        match self.status {
            PackageStatus::Init => {
                self.status = PackageStatus::Active;
                self.updated_at = at;
                Ok(true)
            }
            PackageStatus::Active => Ok(false),
            PackageStatus::Closed => Err(self.status_error()),
        }
    }

    /// Any status -> `Closed`. Returns `true` if the status changed.
    pub fn close(&mut self, at: DateTime<Utc>) -> bool {
        if self.is_closed() {
            return false;
        }
        self.status = PackageStatus::Closed;
        self.closed_at = Some(at);
        self.updated_at = at;
        true
    }

    /// Move the package. Returns the previous location when it actually changed.
    pub fn relocate(&mut self, to: Location, at: DateTime<Utc>) -> DomainResult<Option<Location>> {
        self.ensure_open()?;
        if self.location == to {
            return Ok(None);
        }
        let previous = core::mem::replace(&mut self.location, to);
        self.updated_at = at;
        Ok(Some(previous))
    }

    fn status_error(&self) -> DomainError {
        DomainError::InvalidPackageStatus {
            package_id: self.id,
            status: self.status.to_string(),
        }
    }
}

impl Entity for Package {
    type Id = PackageId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}
