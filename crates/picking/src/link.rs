use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use packledger_core::{DomainError, DomainResult, Entity, PackageId, RecordId, UserId};

/// Role a package plays for a pick list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum PickPackageRole {
    /// Content of this package is consumed by pick line `pick_entry`.
    Source { pick_entry: i32 },
    /// New package being assembled for the pick list.
    Target,
}

impl PickPackageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            PickPackageRole::Source { .. } => "source",
            PickPackageRole::Target => "target",
        }
    }

    pub fn pick_entry(&self) -> Option<i32> {
        match self {
            PickPackageRole::Source { pick_entry } => Some(*pick_entry),
            PickPackageRole::Target => None,
        }
    }

    pub fn from_parts(role: &str, pick_entry: Option<i32>) -> DomainResult<Self> {
        match (role, pick_entry) {
            ("source", Some(pick_entry)) => Ok(PickPackageRole::Source { pick_entry }),
            ("target", None) => Ok(PickPackageRole::Target),
            (role, entry) => Err(DomainError::validation(format!(
                "inconsistent pick package role '{role}' with pick entry {entry:?}"
            ))),
        }
    }
}

/// Link between a pick list and a package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PickListPackage {
    pub id: RecordId,
    pub abs_entry: i32,
    pub package_id: PackageId,
    pub role: PickPackageRole,
    pub added_by: UserId,
    pub added_at: DateTime<Utc>,
}

impl PickListPackage {
    pub fn source(
        abs_entry: i32,
        package_id: PackageId,
        pick_entry: i32,
        added_by: UserId,
        at: DateTime<Utc>,
    ) -> Self {
        Self::link(abs_entry, package_id, PickPackageRole::Source { pick_entry }, added_by, at)
    }

    pub fn target(abs_entry: i32, package_id: PackageId, added_by: UserId, at: DateTime<Utc>) -> Self {
        Self::link(abs_entry, package_id, PickPackageRole::Target, added_by, at)
    }

    fn link(
        abs_entry: i32,
        package_id: PackageId,
        role: PickPackageRole,
        added_by: UserId,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: RecordId::new(),
            abs_entry,
            package_id,
            role,
            added_by,
            added_at: at,
        }
    }

    pub fn is_target(&self) -> bool {
        self.role == PickPackageRole::Target
    }
}

impl Entity for PickListPackage {
    type Id = RecordId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_parts_must_agree() {
        assert_eq!(
            PickPackageRole::from_parts("source", Some(3)).unwrap(),
            PickPackageRole::Source { pick_entry: 3 }
        );
        assert_eq!(PickPackageRole::from_parts("target", None).unwrap(), PickPackageRole::Target);
        assert!(PickPackageRole::from_parts("target", Some(3)).is_err());
        assert!(PickPackageRole::from_parts("source", None).is_err());
    }

    #[test]
    fn target_link_has_no_pick_entry() {
        let link = PickListPackage::target(10, PackageId::new(), UserId::new(), Utc::now());
        assert!(link.is_target());
        assert_eq!(link.role.pick_entry(), None);
    }
}
