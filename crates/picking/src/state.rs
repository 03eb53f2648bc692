use serde::{Deserialize, Serialize};

use crate::line::{PickListLine, PickLineStatus};
use crate::link::PickListPackage;

/// Aggregate state of a pick list as seen by this system.
///
/// Derived from what is stored rather than persisted:
/// - `Closed` once any line has been closed by normal closure
/// - `Open` while lines, package links or commitments are outstanding
/// - `Cancelled` when only cancelled lines remain
/// - `Empty` when nothing was ever recorded (or everything was unwound)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PickListState {
    Empty,
    Open,
    Closed,
    Cancelled,
}

impl PickListState {
    pub fn derive(
        lines: &[PickListLine],
        links: &[PickListPackage],
        open_commitments: usize,
    ) -> Self {
        if lines.iter().any(|l| l.status == PickLineStatus::Closed) {
            return PickListState::Closed;
        }
        if open_commitments > 0 || !links.is_empty() || lines.iter().any(|l| l.is_open()) {
            return PickListState::Open;
        }
        if lines.iter().any(|l| l.status == PickLineStatus::Cancelled) {
            return PickListState::Cancelled;
        }
        PickListState::Empty
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PickListState::Empty => "empty",
            PickListState::Open => "open",
            PickListState::Closed => "closed",
            PickListState::Cancelled => "cancelled",
        }
    }
}
