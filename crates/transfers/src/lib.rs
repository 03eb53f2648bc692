//! Warehouse transfer domain module.
//!
//! Transfer documents moving stock between bins/warehouses and the packages
//! they carry. Used chiefly as the compensating document when a pick list is
//! cancelled after stock was already re-packed.

pub mod transfer;

pub use transfer::{
    BinQuantity, Transfer, TransferLine, TransferPackage, TransferPackageRole, TransferReason,
    TransferStatus,
};
