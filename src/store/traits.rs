use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::model::{
    Branch, BranchEvent, BranchId, BranchStatus, ChangeDiff, ChangeRecord, NewChangeRecord,
    ObjectKey, SnapshotData,
};

#[async_trait::async_trait]
pub trait BranchStore: Send + Sync {
    async fn get_branch(&self, id: &BranchId) -> Result<Option<Branch>>;
    async fn get_branch_by_name(&self, name: &str) -> Result<Option<Branch>>;
    async fn list_branches(&self) -> Result<Vec<Branch>>;
    async fn insert_branch(&self, branch: &Branch) -> Result<()>;
    async fn update_branch(&self, branch: &Branch) -> Result<()>;
    /// Persist only the status column. Callers go through the lifecycle
    /// state machine; nothing else mutates status.
    async fn set_branch_status(&self, id: &BranchId, status: BranchStatus) -> Result<()>;
    async fn delete_branch(&self, id: &BranchId) -> Result<bool>;
}

/// Consumed contract of the change record store: per namespace, a gap-free,
/// strictly increasing sequence with `[from, to)` window queries. Sequence
/// positions start at 1.
#[async_trait::async_trait]
pub trait ChangeLogStore: Send + Sync {
    /// Append one record; the store assigns the next sequence position.
    async fn append_change(&self, namespace: &str, change: NewChangeRecord)
        -> Result<ChangeRecord>;
    /// All records with `from <= seq < to`, in ascending sequence order.
    async fn changes_in(&self, namespace: &str, from: i64, to: i64) -> Result<Vec<ChangeRecord>>;
    /// The entire changelog of a namespace, ascending.
    async fn all_changes(&self, namespace: &str) -> Result<Vec<ChangeRecord>>;
    /// The next unassigned sequence position (1 for an empty changelog).
    async fn changelog_head(&self, namespace: &str) -> Result<i64>;
}

#[async_trait::async_trait]
pub trait DiffStore: Send + Sync {
    /// Insert or replace; at most one diff exists per (branch, object).
    async fn upsert_diff(&self, diff: &ChangeDiff) -> Result<()>;
    async fn get_diff(&self, branch_id: &BranchId, object: &ObjectKey)
        -> Result<Option<ChangeDiff>>;
    async fn list_diffs(&self, branch_id: &BranchId) -> Result<Vec<ChangeDiff>>;
    async fn remove_diff(&self, branch_id: &BranchId, object: &ObjectKey) -> Result<bool>;
    async fn clear_diffs(&self, branch_id: &BranchId) -> Result<()>;
    /// Mark a conflicted object as acknowledged by the operator. Returns
    /// false if no diff exists for the object.
    async fn acknowledge_diff(&self, branch_id: &BranchId, object: &ObjectKey) -> Result<bool>;
}

#[async_trait::async_trait]
pub trait EventStore: Send + Sync {
    async fn append_event(&self, event: &BranchEvent) -> Result<()>;
    /// Events for a branch, newest first.
    async fn events_for_branch(&self, branch_id: &BranchId) -> Result<Vec<BranchEvent>>;
}

/// Bookkeeping of the change records a merge applied into main, in applied
/// order. This is the replay source for revert.
#[async_trait::async_trait]
pub trait AppliedChangeStore: Send + Sync {
    async fn merged_changes(&self, branch_id: &BranchId) -> Result<Vec<ChangeRecord>>;
    async fn clear_merged_changes(&self, branch_id: &BranchId) -> Result<()>;
}

/// Outcome of inserting a row: either it landed, or an identity/uniqueness
/// constraint rejected it. Collisions are surfaced, never hidden.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Conflict { constraint: String },
}

#[async_trait::async_trait]
pub trait NamespaceStore: Send + Sync {
    /// Create `target` as a structural and content copy of `source`
    /// (tables, rows, current sequence values, empty changelog), as a single
    /// isolated transaction. No partial namespace survives an error.
    async fn provision_namespace(&self, source: &str, target: &str) -> Result<()>;
    /// Drop the namespace entirely. Irreversible.
    async fn deprovision_namespace(&self, namespace: &str) -> Result<()>;
    async fn namespace_exists(&self, namespace: &str) -> Result<bool>;
    /// Allocate the next object id from the namespace's own sequence.
    async fn next_object_id(&self, namespace: &str, object_type: &str) -> Result<i64>;
    /// Read one object's committed state.
    async fn get_object(&self, namespace: &str, object: &ObjectKey)
        -> Result<Option<SnapshotData>>;
    /// Open a transaction scoped to one namespace. Everything staged through
    /// the returned handle commits or rolls back as a unit.
    async fn begin(&self, namespace: &str) -> Result<Box<dyn ObjectTx>>;
}

/// An open transaction against one namespace. The replay engine applies a
/// whole changelog window through one of these; events and applied-change
/// bookkeeping staged here share the transaction's fate.
#[async_trait::async_trait]
pub trait ObjectTx: Send {
    async fn get(&mut self, object: &ObjectKey) -> Result<Option<SnapshotData>>;
    async fn insert(&mut self, object: &ObjectKey, data: &SnapshotData) -> Result<InsertOutcome>;
    /// Apply only the given attributes to an existing row, leaving others
    /// untouched. Returns false when the row is absent.
    async fn update(&mut self, object: &ObjectKey, attrs: &SnapshotData) -> Result<bool>;
    /// Returns false when the row was already absent.
    async fn delete(&mut self, object: &ObjectKey) -> Result<bool>;
    /// Recompute derived hierarchy data for one type. Called once per
    /// touched hierarchical type after a whole window has been applied.
    async fn rebuild_hierarchy(&mut self, object_type: &str) -> Result<()>;
    async fn record_event(&mut self, event: BranchEvent) -> Result<()>;
    async fn record_applied(&mut self, branch_id: &BranchId, change: &ChangeRecord) -> Result<()>;
    async fn commit(self: Box<Self>) -> Result<()>;
    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// A structural migration, identified by its app/module label and name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationId {
    pub app: String,
    pub name: String,
}

impl MigrationId {
    pub fn new(app: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            app: app.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for MigrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.app, self.name)
    }
}

/// Consumed contract of the migration tooling: list what is pending for a
/// branch and apply one migration to a namespace.
#[async_trait::async_trait]
pub trait MigrationSource: Send + Sync {
    async fn pending(&self, branch: &Branch) -> Result<Vec<MigrationId>>;
    async fn apply(&self, namespace: &str, migration: &MigrationId) -> Result<()>;
}

/// Migration source with nothing to apply; used by the operator binary when
/// no migration tooling is wired in.
pub struct NoPendingMigrations;

#[async_trait::async_trait]
impl MigrationSource for NoPendingMigrations {
    async fn pending(&self, _branch: &Branch) -> Result<Vec<MigrationId>> {
        Ok(Vec::new())
    }

    async fn apply(&self, _namespace: &str, migration: &MigrationId) -> Result<()> {
        anyhow::bail!("no migration tooling configured; cannot apply {}", migration)
    }
}

pub trait Store:
    BranchStore + ChangeLogStore + DiffStore + EventStore + AppliedChangeStore + NamespaceStore
{
}

impl<T> Store for T where
    T: BranchStore + ChangeLogStore + DiffStore + EventStore + AppliedChangeStore + NamespaceStore
{
}
