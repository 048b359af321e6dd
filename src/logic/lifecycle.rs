use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::Arc;

use crate::error::BranchError;
use crate::model::{Branch, BranchAction, BranchId, BranchStatus};
use crate::store::traits::BranchStore;

/// Outcome of a policy validator.
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyDecision {
    Allow,
    Deny(String),
}

type PolicyValidator = dyn Fn(&Branch, BranchAction) -> PolicyDecision + Send + Sync;

/// Owns branch status transitions and serializes operations per branch.
/// Entering a transitional status requires the branch's exclusive advisory
/// lock; a second request fails fast with a conflict instead of queuing.
pub struct Lifecycle {
    in_flight: Arc<Mutex<HashSet<BranchId>>>,
    validators: RwLock<Vec<Arc<PolicyValidator>>>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            validators: RwLock::new(Vec::new()),
        }
    }

    /// Register a predicate consulted before any transition for the given
    /// branch and action. A denial blocks the transition without mutating
    /// state.
    pub fn register_validator<F>(&self, validator: F)
    where
        F: Fn(&Branch, BranchAction) -> PolicyDecision + Send + Sync + 'static,
    {
        self.validators.write().push(Arc::new(validator));
    }

    pub fn check_policy(&self, branch: &Branch, action: BranchAction) -> Result<(), BranchError> {
        for validator in self.validators.read().iter() {
            if let PolicyDecision::Deny(reason) = validator(branch, action) {
                return Err(BranchError::PolicyDenied { action, reason });
            }
        }
        Ok(())
    }

    /// The legal transition table. Anything not listed here fails with an
    /// InvalidTransition error.
    pub fn is_legal(from: BranchStatus, to: BranchStatus) -> bool {
        use BranchStatus::*;
        matches!(
            (from, to),
            (New, Provisioning)
                | (Provisioning, Ready)
                | (Provisioning, Failed)
                | (Ready, Syncing)
                | (Ready, Merging)
                | (Ready, Migrating)
                | (Syncing, Ready)
                | (Merging, Merged)
                | (Merging, Ready)
                | (Migrating, Ready)
                | (Migrating, PendingMigrations)
                | (PendingMigrations, Migrating)
                | (PendingMigrations, Archived)
                | (Merged, Reverting)
                | (Merged, Archived)
                | (Reverting, Ready)
                | (Reverting, Merged)
                | (Ready, Archived)
        )
    }

    /// Validate and persist a status change, keeping the in-memory branch in
    /// step with the store.
    pub async fn transition<S: BranchStore + ?Sized>(
        &self,
        store: &S,
        branch: &mut Branch,
        to: BranchStatus,
    ) -> Result<(), BranchError> {
        if !Self::is_legal(branch.status, to) {
            return Err(BranchError::InvalidTransition {
                from: branch.status,
                to,
            });
        }
        store.set_branch_status(&branch.id, to).await?;
        branch.status = to;
        Ok(())
    }

    /// Acquire the branch's exclusive operation lock. The returned guard
    /// releases it on drop.
    pub fn lock(&self, id: BranchId) -> Result<OperationGuard, BranchError> {
        let mut in_flight = self.in_flight.lock();
        if !in_flight.insert(id) {
            return Err(BranchError::OperationInFlight(id));
        }
        Ok(OperationGuard {
            id,
            in_flight: self.in_flight.clone(),
        })
    }

    pub fn is_in_flight(&self, id: &BranchId) -> bool {
        self.in_flight.lock().contains(id)
    }
}

/// RAII guard for a branch's exclusive operation lock.
pub struct OperationGuard {
    id: BranchId,
    in_flight: Arc<Mutex<HashSet<BranchId>>>,
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::generate_branch_id;

    #[test]
    fn transition_table_matches_the_state_machine() {
        use BranchStatus::*;
        assert!(Lifecycle::is_legal(New, Provisioning));
        assert!(Lifecycle::is_legal(Provisioning, Failed));
        assert!(Lifecycle::is_legal(Ready, Merging));
        assert!(Lifecycle::is_legal(Merging, Ready), "dry run returns to ready");
        assert!(Lifecycle::is_legal(Merged, Reverting));
        assert!(Lifecycle::is_legal(Reverting, Ready), "reverted branch is reusable");
        assert!(Lifecycle::is_legal(PendingMigrations, Migrating));

        assert!(!Lifecycle::is_legal(New, Ready));
        assert!(!Lifecycle::is_legal(Merged, Merging), "no re-merge without revert");
        assert!(!Lifecycle::is_legal(Archived, Ready), "archive is terminal");
        assert!(!Lifecycle::is_legal(Failed, Ready));
        assert!(!Lifecycle::is_legal(Syncing, Merging));
    }

    #[test]
    fn second_lock_fails_fast() {
        let lifecycle = Lifecycle::new();
        let id = generate_branch_id();
        let guard = lifecycle.lock(id).unwrap();
        assert!(matches!(
            lifecycle.lock(id),
            Err(BranchError::OperationInFlight(_))
        ));
        drop(guard);
        assert!(lifecycle.lock(id).is_ok());
    }

    #[test]
    fn locks_are_per_branch() {
        let lifecycle = Lifecycle::new();
        let _a = lifecycle.lock(generate_branch_id()).unwrap();
        assert!(lifecycle.lock(generate_branch_id()).is_ok());
    }

    #[test]
    fn policy_denial_blocks_with_reason() {
        let lifecycle = Lifecycle::new();
        lifecycle.register_validator(|_branch, action| {
            if action == BranchAction::Merge {
                PolicyDecision::Deny("merge window closed".to_string())
            } else {
                PolicyDecision::Allow
            }
        });

        let branch = Branch::new("b".to_string(), None, None);
        assert!(lifecycle.check_policy(&branch, BranchAction::Sync).is_ok());
        let err = lifecycle
            .check_policy(&branch, BranchAction::Merge)
            .unwrap_err();
        assert!(err.to_string().contains("merge window closed"));
    }
}
