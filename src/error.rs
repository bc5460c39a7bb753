//! Error taxonomy shared by every tracker operation.

use std::fmt;
use thiserror::Error;

/// Why a billing run found nothing to invoice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NothingToBillReason {
    /// The project has no tasks in `done` status.
    NoCompletedTasks,
    /// Every `done` task already carries a billed stamp.
    AllCompletedTasksBilled,
}

impl fmt::Display for NothingToBillReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NothingToBillReason::NoCompletedTasks => {
                f.write_str("the project has no completed tasks")
            }
            NothingToBillReason::AllCompletedTasksBilled => {
                f.write_str("every completed task has already been billed")
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("nothing to bill: {0}")]
    NothingToBill(NothingToBillReason),

    #[error("persistence failure: {0}")]
    Persistence(String),

    #[error(
        "invoice {invoice_id} was created but {} task(s) could not be stamped: {reason}",
        task_ids.len()
    )]
    Reconciliation {
        invoice_id: String,
        task_ids: Vec<String>,
        reason: String,
    },

    #[error("task {task_id} is already billed in invoice {invoice_id}")]
    AlreadyBilled { task_id: String, invoice_id: String },

    #[error("invoice cannot move from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl TrackerError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        TrackerError::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Transient datastore failures are the only errors worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TrackerError::Persistence(_))
    }
}

impl From<rusqlite::Error> for TrackerError {
    fn from(err: rusqlite::Error) -> Self {
        TrackerError::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for TrackerError {
    fn from(err: serde_json::Error) -> Self {
        TrackerError::Persistence(format!("corrupt stored payload: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, TrackerError>;
