use crate::{ContainerId, ShipSymbol};
use thiserror::Error;

/// Ledger failures. `Conflict` and `NotAssignedTo` are the rollback triggers
/// of the ship-handoff protocol; everything else is surfaced as-is.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ship {ship} already has an active assignment")]
    Conflict { ship: ShipSymbol },
    #[error("ship {ship} is not assigned to container {expected}")]
    NotAssignedTo { ship: ShipSymbol, expected: ContainerId },
    #[error("no active assignment for ship {ship}")]
    NotFound { ship: ShipSymbol },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Task-level failure classes a worker reports back to its coordinator.
/// Everything except `Fatal` stays inside the task lifecycle.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("transient upstream failure: {0}")]
    TransientUpstream(String),
    #[error("precondition no longer holds: {0}")]
    PreconditionViolated(String),
    #[error("domain rejected the operation: {0}")]
    DomainViolation(String),
    #[error("expected row missing: {0}")]
    NotFound(String),
    #[error("cancelled")]
    Cancelled,
    #[error("fatal: {0}")]
    Fatal(anyhow::Error),
}

impl WorkerError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, WorkerError::TransientUpstream(_))
    }
}

/// Upstream API failures as seen by the engine. Code 4511 ("agent already has
/// an active contract") is not an error state; the client maps it to
/// `AlreadyHasContract` carrying the existing contract id.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("agent already has active contract {contract_id}")]
    AlreadyHasContract { contract_id: String },
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },
    #[error("upstream returned {code}: {message}")]
    Upstream { code: i64, message: String },
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

impl ApiError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ApiError::RateLimited { .. } | ApiError::Transport(_))
    }
}
