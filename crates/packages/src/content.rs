//! Package content rows and the quantity arithmetic of the commitment ledger.
//!
//! Every mutation keeps `0 <= committed_quantity <= quantity`; a request that
//! would break it is rejected before anything changes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use packledger_core::{DomainError, DomainResult, PackageId};

use crate::package::Location;

/// One (package, item) line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageContent {
    pub package_id: PackageId,
    pub item_code: String,
    /// Total quantity physically present, in base units.
    pub quantity: i64,
    /// Portion of `quantity` reserved by in-flight operations.
    pub committed_quantity: i64,
    pub location: Location,
    pub updated_at: DateTime<Utc>,
}

impl PackageContent {
    /// Empty content row (used before the first receipt or staging).
    pub fn empty(
        package_id: PackageId,
        item_code: impl Into<String>,
        location: Location,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            package_id,
            item_code: item_code.into(),
            quantity: 0,
            committed_quantity: 0,
            location,
            updated_at: at,
        }
    }

    /// Quantity still free to allocate.
    pub fn available(&self) -> i64 {
        self.quantity - self.committed_quantity
    }

    pub fn is_empty(&self) -> bool {
        self.quantity == 0
    }

    pub fn is_fully_committed(&self) -> bool {
        self.quantity > 0 && self.committed_quantity == self.quantity
    }

    /// Reserve `qty` of the available quantity.
    pub fn reserve(&mut self, qty: i64, at: DateTime<Utc>) -> DomainResult<()> {
        ensure_positive(qty)?;
        let available = self.available();
        if qty > available {
            return Err(DomainError::InsufficientAvailableQuantity {
                package_id: self.package_id,
                item_code: self.item_code.clone(),
                requested: qty,
                available,
            });
        }
        self.committed_quantity += qty;
        self.touch(at)
    }

    /// Give back a reservation without touching the physical quantity.
    ///
    /// Also used to settle staged content: once an operation lands content in a
    /// package, the content stays and only the reservation goes away.
    pub fn release(&mut self, qty: i64, at: DateTime<Utc>) -> DomainResult<()> {
        ensure_positive(qty)?;
        if qty > self.committed_quantity {
            return Err(DomainError::invariant(format!(
                "release of {qty} exceeds committed {} for {} in package {}",
                self.committed_quantity, self.item_code, self.package_id
            )));
        }
        self.committed_quantity -= qty;
        self.touch(at)
    }

    /// Physically remove `qty` that was reserved.
    pub fn consume(&mut self, qty: i64, at: DateTime<Utc>) -> DomainResult<()> {
        ensure_positive(qty)?;
        if qty > self.committed_quantity {
            return Err(DomainError::invariant(format!(
                "consume of {qty} exceeds committed {} for {} in package {}",
                self.committed_quantity, self.item_code, self.package_id
            )));
        }
        self.quantity -= qty;
        self.committed_quantity -= qty;
        self.touch(at)
    }

    /// Physically add `qty` that is free to allocate (goods receipt, counting surplus).
    pub fn receive(&mut self, qty: i64, at: DateTime<Utc>) -> DomainResult<()> {
        ensure_positive(qty)?;
        self.quantity += qty;
        self.touch(at)
    }

    /// Physically add `qty` that arrives already reserved by the operation
    /// assembling this package.
    pub fn stage(&mut self, qty: i64, at: DateTime<Utc>) -> DomainResult<()> {
        ensure_positive(qty)?;
        self.quantity += qty;
        self.committed_quantity += qty;
        self.touch(at)
    }

    /// Ledger invariant for a single row.
    pub fn check_invariant(&self) -> DomainResult<()> {
        if self.committed_quantity < 0 || self.committed_quantity > self.quantity {
            return Err(DomainError::invariant(format!(
                "committed {} outside 0..={} for {} in package {}",
                self.committed_quantity, self.quantity, self.item_code, self.package_id
            )));
        }
        Ok(())
    }

    fn touch(&mut self, at: DateTime<Utc>) -> DomainResult<()> {
        self.updated_at = at;
        self.check_invariant()
    }
}

fn ensure_positive(qty: i64) -> DomainResult<()> {
    if qty <= 0 {
        return Err(DomainError::validation("quantity must be positive"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn content(quantity: i64) -> PackageContent {
        let mut c = PackageContent::empty(PackageId::new(), "A", Location::bin("W01", 1), Utc::now());
        if quantity > 0 {
            c.receive(quantity, Utc::now()).unwrap();
        }
        c
    }

    #[test]
    fn reserve_beyond_available_is_rejected_without_change() {
        let mut c = content(24);
        c.reserve(20, Utc::now()).unwrap();

        let err = c.reserve(5, Utc::now()).unwrap_err();
        match err {
            DomainError::InsufficientAvailableQuantity {
                requested, available, ..
            } => {
                assert_eq!(requested, 5);
                assert_eq!(available, 4);
            }
            other => panic!("expected InsufficientAvailableQuantity, got {other:?}"),
        }
        assert_eq!(c.committed_quantity, 20);
    }

    #[test]
    fn reserve_then_release_restores_committed() {
        let mut c = content(24);
        c.reserve(12, Utc::now()).unwrap();
        c.release(12, Utc::now()).unwrap();
        assert_eq!(c.committed_quantity, 0);
        assert_eq!(c.quantity, 24);
    }

    #[test]
    fn consume_reduces_both_sides() {
        let mut c = content(24);
        c.reserve(12, Utc::now()).unwrap();
        c.consume(12, Utc::now()).unwrap();
        assert_eq!(c.quantity, 12);
        assert_eq!(c.committed_quantity, 0);
        assert_eq!(c.available(), 12);
    }

    #[test]
    fn staged_content_is_fully_committed() {
        let mut c = content(0);
        c.stage(7, Utc::now()).unwrap();
        assert!(c.is_fully_committed());
        assert_eq!(c.available(), 0);
    }

    #[test]
    fn releasing_more_than_committed_is_an_invariant_violation() {
        let mut c = content(10);
        c.reserve(3, Utc::now()).unwrap();
        assert!(matches!(
            c.release(4, Utc::now()),
            Err(DomainError::InvariantViolation(_))
        ));
        assert!(matches!(
            c.consume(4, Utc::now()),
            Err(DomainError::InvariantViolation(_))
        ));
    }

    #[test]
    fn non_positive_quantities_are_validation_errors() {
        let mut c = content(10);
        assert!(matches!(c.reserve(0, Utc::now()), Err(DomainError::Validation(_))));
        assert!(matches!(c.receive(-1, Utc::now()), Err(DomainError::Validation(_))));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Reserve(i64),
        Release(i64),
        Consume(i64),
        Receive(i64),
        Stage(i64),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1i64..50).prop_map(Op::Reserve),
            (1i64..50).prop_map(Op::Release),
            (1i64..50).prop_map(Op::Consume),
            (1i64..50).prop_map(Op::Receive),
            (1i64..50).prop_map(Op::Stage),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: whatever sequence of ledger operations is attempted,
        /// accepted or rejected, the row never leaves `0 <= committed <= quantity`.
        #[test]
        fn committed_stays_within_quantity(start in 0i64..100, ops in prop::collection::vec(op(), 1..40)) {
            let mut c = content(start);
            for op in ops {
                let before = c.clone();
                let result = match op {
                    Op::Reserve(q) => c.reserve(q, Utc::now()),
                    Op::Release(q) => c.release(q, Utc::now()),
                    Op::Consume(q) => c.consume(q, Utc::now()),
                    Op::Receive(q) => c.receive(q, Utc::now()),
                    Op::Stage(q) => c.stage(q, Utc::now()),
                };
                if result.is_err() {
                    prop_assert_eq!(c.quantity, before.quantity);
                    prop_assert_eq!(c.committed_quantity, before.committed_quantity);
                }
                prop_assert!(c.committed_quantity >= 0);
                prop_assert!(c.committed_quantity <= c.quantity);
            }
        }
    }
}
