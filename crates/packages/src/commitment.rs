use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use packledger_core::{CommitmentId, DomainError, DomainResult, Entity, PackageId};

use crate::operation::OperationRef;

/// What a commitment does with the reserved content.
///
/// The source-vs-target role of a reservation is carried here explicitly
/// instead of being inferred from an optional target id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Allocation {
    /// Reserved where it is; it leaves the package when the operation closes.
    InPlace,
    /// Reserved on a source package and already staged into `target`, where
    /// commitment `staged` holds the staged copy.
    MovedTo {
        target: PackageId,
        staged: CommitmentId,
    },
    /// Content staged into this package by the operation; `origin` is the
    /// source package, `None` for loose bin stock.
    StagedFrom { origin: Option<PackageId> },
}

impl Allocation {
    pub fn kind_str(&self) -> &'static str {
        match self {
            Allocation::InPlace => "in_place",
            Allocation::MovedTo { .. } => "moved_to",
            Allocation::StagedFrom { .. } => "staged_from",
        }
    }

    /// The package on the other side of the move, if any.
    pub fn linked_package(&self) -> Option<PackageId> {
        match self {
            Allocation::InPlace => None,
            Allocation::MovedTo { target, .. } => Some(*target),
            Allocation::StagedFrom { origin } => *origin,
        }
    }

    /// The paired staged commitment of a moved reservation.
    pub fn linked_commitment(&self) -> Option<CommitmentId> {
        match self {
            Allocation::MovedTo { staged, .. } => Some(*staged),
            _ => None,
        }
    }

    /// Rebuild from the persisted `(kind, linked package, linked commitment)` columns.
    pub fn from_parts(
        kind: &str,
        linked: Option<PackageId>,
        linked_commitment: Option<CommitmentId>,
    ) -> DomainResult<Self> {
        match (kind, linked, linked_commitment) {
            ("in_place", None, None) => Ok(Allocation::InPlace),
            ("moved_to", Some(target), Some(staged)) => Ok(Allocation::MovedTo { target, staged }),
            ("staged_from", origin, None) => Ok(Allocation::StagedFrom { origin }),
            (kind, linked, commitment) => Err(DomainError::validation(format!(
                "inconsistent allocation '{kind}' with linked package {linked:?} and commitment {commitment:?}"
            ))),
        }
    }
}

/// A reservation of package content against an in-flight operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageCommitment {
    pub id: CommitmentId,
    pub package_id: PackageId,
    pub item_code: String,
    pub operation: OperationRef,
    pub allocation: Allocation,
    pub quantity: i64,
    pub created_at: DateTime<Utc>,
}

impl PackageCommitment {
    pub fn new(
        package_id: PackageId,
        item_code: impl Into<String>,
        operation: OperationRef,
        allocation: Allocation,
        quantity: i64,
        at: DateTime<Utc>,
    ) -> DomainResult<Self> {
        if quantity <= 0 {
            return Err(DomainError::validation("commitment quantity must be positive"));
        }
        if !operation.can_commit() {
            return Err(DomainError::validation(format!(
                "operation {operation} cannot hold commitments"
            )));
        }
        if let Allocation::MovedTo { target, .. } = allocation {
            if target == package_id {
                return Err(DomainError::validation(
                    "target package must differ from the source package",
                ));
            }
        }
        Ok(Self {
            id: CommitmentId::new(),
            package_id,
            item_code: item_code.into(),
            operation,
            allocation,
            quantity,
            created_at: at,
        })
    }

    /// Target package the reserved content was moved into, if any.
    pub fn target_package_id(&self) -> Option<PackageId> {
        match self.allocation {
            Allocation::MovedTo { target, .. } => Some(target),
            _ => None,
        }
    }

    pub fn is_staged(&self) -> bool {
        matches!(self.allocation, Allocation::StagedFrom { .. })
    }
}

impl Entity for PackageCommitment {
    type Id = CommitmentId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_positive_quantity() {
        let err = PackageCommitment::new(
            PackageId::new(),
            "A",
            OperationRef::picking(1),
            Allocation::InPlace,
            0,
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn closure_reconciliation_cannot_reserve() {
        assert!(
            PackageCommitment::new(
                PackageId::new(),
                "A",
                OperationRef::picking_closure(1),
                Allocation::InPlace,
                1,
                Utc::now(),
            )
            .is_err()
        );
    }

    #[test]
    fn moving_into_itself_is_rejected() {
        let id = PackageId::new();
        assert!(
            PackageCommitment::new(
                id,
                "A",
                OperationRef::picking(1),
                Allocation::MovedTo {
                    target: id,
                    staged: CommitmentId::new(),
                },
                1,
                Utc::now(),
            )
            .is_err()
        );
    }

    #[test]
    fn allocation_parts_must_agree() {
        let p = PackageId::new();
        let c = CommitmentId::new();
        assert_eq!(
            Allocation::from_parts("moved_to", Some(p), Some(c)).unwrap(),
            Allocation::MovedTo { target: p, staged: c }
        );
        assert_eq!(
            Allocation::from_parts("staged_from", None, None).unwrap(),
            Allocation::StagedFrom { origin: None }
        );
        assert!(Allocation::from_parts("moved_to", Some(p), None).is_err());
        assert!(Allocation::from_parts("in_place", Some(p), None).is_err());
    }

    #[test]
    fn target_id_only_for_moved_reservations() {
        let target = PackageId::new();
        let c = PackageCommitment::new(
            PackageId::new(),
            "A",
            OperationRef::picking(1),
            Allocation::MovedTo {
                target,
                staged: CommitmentId::new(),
            },
            5,
            Utc::now(),
        )
        .unwrap();
        assert_eq!(c.target_package_id(), Some(target));
        assert!(!c.is_staged());
    }
}
