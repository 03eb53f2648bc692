//! Ledger consistency checks.
//!
//! A violation found here is never a transient condition: it means an earlier
//! write broke the ledger. Callers log these as errors and refuse to proceed.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use packledger_core::{CommitmentId, PackageId};

use crate::commitment::PackageCommitment;
use crate::content::PackageContent;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "violation", rename_all = "snake_case")]
pub enum LedgerViolation {
    /// `committed_quantity` outside `0..=quantity`.
    CommittedOutOfRange {
        package_id: PackageId,
        item_code: String,
        quantity: i64,
        committed: i64,
    },
    /// `committed_quantity` differs from the sum of open commitments on the row.
    CommitmentSumMismatch {
        package_id: PackageId,
        item_code: String,
        committed: i64,
        commitments_total: i64,
    },
    /// A commitment whose content row no longer exists.
    OrphanedCommitment {
        commitment_id: CommitmentId,
        package_id: PackageId,
        item_code: String,
    },
    /// A target package whose content differs from what was staged into it.
    TargetAssemblyMismatch {
        package_id: PackageId,
        item_code: String,
        content_quantity: i64,
        staged_quantity: i64,
    },
}

impl core::fmt::Display for LedgerViolation {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            LedgerViolation::CommittedOutOfRange {
                package_id,
                item_code,
                quantity,
                committed,
            } => write!(
                f,
                "package {package_id} item {item_code}: committed {committed} outside 0..={quantity}"
            ),
            LedgerViolation::CommitmentSumMismatch {
                package_id,
                item_code,
                committed,
                commitments_total,
            } => write!(
                f,
                "package {package_id} item {item_code}: committed {committed} but commitments total {commitments_total}"
            ),
            LedgerViolation::OrphanedCommitment {
                commitment_id,
                package_id,
                item_code,
            } => write!(
                f,
                "commitment {commitment_id} references missing content {package_id}/{item_code}"
            ),
            LedgerViolation::TargetAssemblyMismatch {
                package_id,
                item_code,
                content_quantity,
                staged_quantity,
            } => write!(
                f,
                "target package {package_id} item {item_code}: content {content_quantity} but staged {staged_quantity}"
            ),
        }
    }
}

/// Check every content row against the full set of open commitments.
pub fn audit_ledger(
    contents: &[PackageContent],
    commitments: &[PackageCommitment],
) -> Vec<LedgerViolation> {
    let mut violations = Vec::new();

    let mut totals: HashMap<(PackageId, &str), i64> = HashMap::new();
    for c in commitments {
        *totals.entry((c.package_id, c.item_code.as_str())).or_default() += c.quantity;
    }

    for row in contents {
        if row.check_invariant().is_err() {
            violations.push(LedgerViolation::CommittedOutOfRange {
                package_id: row.package_id,
                item_code: row.item_code.clone(),
                quantity: row.quantity,
                committed: row.committed_quantity,
            });
        }
        let total = totals
            .remove(&(row.package_id, row.item_code.as_str()))
            .unwrap_or(0);
        if total != row.committed_quantity {
            violations.push(LedgerViolation::CommitmentSumMismatch {
                package_id: row.package_id,
                item_code: row.item_code.clone(),
                committed: row.committed_quantity,
                commitments_total: total,
            });
        }
    }

    // Whatever is left in `totals` has no content row.
    for c in commitments {
        if totals.contains_key(&(c.package_id, c.item_code.as_str())) {
            violations.push(LedgerViolation::OrphanedCommitment {
                commitment_id: c.id,
                package_id: c.package_id,
                item_code: c.item_code.clone(),
            });
        }
    }

    violations
}

/// A target package assembled by one operation must hold exactly what was
/// staged into it, item by item.
pub fn verify_target_assembly(
    package_id: PackageId,
    contents: &[PackageContent],
    staged: &[PackageCommitment],
) -> Vec<LedgerViolation> {
    let mut expected: BTreeMap<&str, i64> = BTreeMap::new();
    for c in staged.iter().filter(|c| c.package_id == package_id && c.is_staged()) {
        *expected.entry(c.item_code.as_str()).or_default() += c.quantity;
    }

    let mut actual: BTreeMap<&str, i64> = BTreeMap::new();
    for row in contents.iter().filter(|r| r.package_id == package_id) {
        *actual.entry(row.item_code.as_str()).or_default() += row.quantity;
    }

    let mut items: Vec<&str> = expected.keys().chain(actual.keys()).copied().collect();
    items.sort_unstable();
    items.dedup();

    items
        .into_iter()
        .filter_map(|item| {
            let content_quantity = actual.get(item).copied().unwrap_or(0);
            let staged_quantity = expected.get(item).copied().unwrap_or(0);
            (content_quantity != staged_quantity).then(|| LedgerViolation::TargetAssemblyMismatch {
                package_id,
                item_code: item.to_string(),
                content_quantity,
                staged_quantity,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::commitment::Allocation;
    use crate::operation::OperationRef;
    use crate::package::Location;

    fn row(package_id: PackageId, item: &str, quantity: i64, committed: i64) -> PackageContent {
        PackageContent {
            package_id,
            item_code: item.to_string(),
            quantity,
            committed_quantity: committed,
            location: Location::bin("W01", 1),
            updated_at: Utc::now(),
        }
    }

    fn commitment(package_id: PackageId, item: &str, qty: i64, allocation: Allocation) -> PackageCommitment {
        PackageCommitment::new(
            package_id,
            item,
            OperationRef::picking(1),
            allocation,
            qty,
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn consistent_ledger_has_no_violations() {
        let p = PackageId::new();
        let contents = vec![row(p, "A", 24, 12), row(p, "B", 5, 0)];
        let commitments = vec![
            commitment(p, "A", 8, Allocation::InPlace),
            commitment(p, "A", 4, Allocation::InPlace),
        ];
        assert!(audit_ledger(&contents, &commitments).is_empty());
    }

    #[test]
    fn detects_sum_mismatch_and_range() {
        let p = PackageId::new();
        let contents = vec![row(p, "A", 10, 12)];
        let commitments = vec![commitment(p, "A", 3, Allocation::InPlace)];
        let violations = audit_ledger(&contents, &commitments);
        assert_eq!(violations.len(), 2);
        assert!(matches!(violations[0], LedgerViolation::CommittedOutOfRange { .. }));
        assert!(matches!(
            violations[1],
            LedgerViolation::CommitmentSumMismatch {
                commitments_total: 3,
                ..
            }
        ));
    }

    #[test]
    fn detects_orphaned_commitment() {
        let p = PackageId::new();
        let orphan = commitment(p, "GONE", 2, Allocation::InPlace);
        let violations = audit_ledger(&[], std::slice::from_ref(&orphan));
        assert_eq!(
            violations,
            vec![LedgerViolation::OrphanedCommitment {
                commitment_id: orphan.id,
                package_id: p,
                item_code: "GONE".to_string(),
            }]
        );
    }

    #[test]
    fn target_assembly_matches_staged_commitments() {
        let target = PackageId::new();
        let source = PackageId::new();
        let contents = vec![row(target, "A", 36, 36), row(target, "C", 3, 3)];
        let staged = vec![
            commitment(target, "A", 12, Allocation::StagedFrom { origin: Some(source) }),
            commitment(target, "A", 24, Allocation::StagedFrom { origin: Some(source) }),
            commitment(target, "C", 3, Allocation::StagedFrom { origin: None }),
        ];
        assert!(verify_target_assembly(target, &contents, &staged).is_empty());

        let short = vec![row(target, "A", 30, 30), row(target, "C", 3, 3)];
        let violations = verify_target_assembly(target, &short, &staged);
        assert_eq!(violations.len(), 1);
        match &violations[0] {
            LedgerViolation::TargetAssemblyMismatch {
                item_code,
                content_quantity,
                staged_quantity,
                ..
            } => {
                assert_eq!(item_code, "A");
                assert_eq!(*content_quantity, 30);
                assert_eq!(*staged_quantity, 36);
            }
            other => panic!("unexpected violation {other:?}"),
        }
    }
}
