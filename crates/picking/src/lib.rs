//! Pick-list domain module.
//!
//! Pick lines recorded against an ERP pick list (`abs_entry`) and the links
//! between a pick list and the packages it draws from or assembles.

pub mod line;
pub mod link;
pub mod state;

pub use line::{PickLineStatus, PickListLine, PickSource, SyncStatus};
pub use link::{PickListPackage, PickPackageRole};
pub use state::PickListState;
