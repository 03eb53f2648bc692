//! Caller-facing result envelope.

use serde::{Deserialize, Serialize};

use packledger_core::TransferId;

use crate::error::WorkflowError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseStatus {
    Ok,
    Error,
}

/// Outcome of one ledger operation: `Ok`, or `Error` with a code and message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResponse {
    pub status: ResponseStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Compensating transfer created by the operation, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer_id: Option<TransferId>,
}

impl OperationResponse {
    pub fn ok() -> Self {
        Self {
            status: ResponseStatus::Ok,
            error_code: None,
            error_message: None,
            transfer_id: None,
        }
    }

    pub fn with_transfer(transfer_id: Option<TransferId>) -> Self {
        Self {
            transfer_id,
            ..Self::ok()
        }
    }

    pub fn error(err: &WorkflowError) -> Self {
        Self {
            status: ResponseStatus::Error,
            error_code: Some(err.code().to_string()),
            error_message: Some(err.to_string()),
            transfer_id: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ResponseStatus::Ok
    }
}

impl<T> From<Result<T, WorkflowError>> for OperationResponse {
    fn from(result: Result<T, WorkflowError>) -> Self {
        match result {
            Ok(_) => Self::ok(),
            Err(err) => Self::error(&err),
        }
    }
}
