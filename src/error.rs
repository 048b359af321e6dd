use thiserror::Error;

use crate::model::{BranchAction, BranchId, BranchStatus, ChangeAction, ObjectKey};

/// Error taxonomy for branch operations. Replay-time errors always identify
/// the offending object and action; any single failure invalidates the whole
/// window and the transaction is rolled back.
#[derive(Debug, Error)]
pub enum BranchError {
    #[error("branch {0} not found")]
    NotFound(BranchId),

    #[error("branch named {0:?} not found")]
    NameNotFound(String),

    #[error("invalid branch status transition: {from} -> {to}")]
    InvalidTransition {
        from: BranchStatus,
        to: BranchStatus,
    },

    #[error("an operation is already in flight for branch {0}")]
    OperationInFlight(BranchId),

    #[error("{action} denied by policy: {reason}")]
    PolicyDenied {
        action: BranchAction,
        reason: String,
    },

    #[error(
        "branch {name:?} is stale: last synced beyond the {retention_days}-day \
         changelog retention window"
    )]
    StaleBranch { name: String, retention_days: u32 },

    #[error(
        "{} object(s) have unacknowledged conflicts; acknowledge each or run as a dry run",
        .objects.len()
    )]
    UnacknowledgedConflicts { objects: Vec<ObjectKey> },

    #[error("cannot {action} {object}: no such object in the target namespace")]
    MissingTarget {
        object: ObjectKey,
        action: ChangeAction,
    },

    #[error("cannot create {object}: identity collision on {constraint}")]
    IdentityCollision {
        object: ObjectKey,
        constraint: String,
    },

    #[error("changelog window is not in ascending sequence order at seq {seq}")]
    OutOfOrderWindow { seq: i64 },

    #[error("dependency cycle among {count} collapsed changes: {members}")]
    DependencyCycle { count: usize, members: String },

    #[error("provisioning branch {name:?} failed: {reason}")]
    Provisioning { name: String, reason: String },

    #[error("migration {migration} failed: {reason}")]
    Migration { migration: String, reason: String },

    #[error("branch limit reached: {0}")]
    BranchLimit(String),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl BranchError {
    /// Whether the failed operation left the branch in its prior stable
    /// status (true for replay and precondition failures) as opposed to a
    /// structural failure that changes the branch's status.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            BranchError::Provisioning { .. } | BranchError::Migration { .. }
        )
    }
}
