use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::model::{generate_branch_id, generate_schema_id, BranchId};

/// Lifecycle status of a branch. Only the lifecycle state machine may move a
/// branch between statuses; see `logic::lifecycle` for the legal transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchStatus {
    New,
    Provisioning,
    Ready,
    Syncing,
    Migrating,
    Merging,
    Reverting,
    PendingMigrations,
    Merged,
    Archived,
    Failed,
}

impl BranchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BranchStatus::New => "new",
            BranchStatus::Provisioning => "provisioning",
            BranchStatus::Ready => "ready",
            BranchStatus::Syncing => "syncing",
            BranchStatus::Migrating => "migrating",
            BranchStatus::Merging => "merging",
            BranchStatus::Reverting => "reverting",
            BranchStatus::PendingMigrations => "pending_migrations",
            BranchStatus::Merged => "merged",
            BranchStatus::Archived => "archived",
            BranchStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "new" => BranchStatus::New,
            "provisioning" => BranchStatus::Provisioning,
            "ready" => BranchStatus::Ready,
            "syncing" => BranchStatus::Syncing,
            "migrating" => BranchStatus::Migrating,
            "merging" => BranchStatus::Merging,
            "reverting" => BranchStatus::Reverting,
            "pending_migrations" => BranchStatus::PendingMigrations,
            "merged" => BranchStatus::Merged,
            "archived" => BranchStatus::Archived,
            "failed" => BranchStatus::Failed,
            _ => return None,
        })
    }

    /// An operation is currently in flight for this branch.
    pub fn is_transitional(&self) -> bool {
        matches!(
            self,
            BranchStatus::Provisioning
                | BranchStatus::Syncing
                | BranchStatus::Migrating
                | BranchStatus::Merging
                | BranchStatus::Reverting
        )
    }

    /// Counts against the configured maximum of working branches.
    pub fn is_working(&self) -> bool {
        !matches!(
            self,
            BranchStatus::Merged | BranchStatus::Archived | BranchStatus::Failed
        )
    }
}

impl fmt::Display for BranchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The operations the lifecycle state machine arbitrates. Policy validators
/// are consulted per action before any transition begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BranchAction {
    Provision,
    Sync,
    Migrate,
    Merge,
    Revert,
    Archive,
}

impl BranchAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            BranchAction::Provision => "provision",
            BranchAction::Sync => "sync",
            BranchAction::Migrate => "migrate",
            BranchAction::Merge => "merge",
            BranchAction::Revert => "revert",
            BranchAction::Archive => "archive",
        }
    }
}

impl fmt::Display for BranchAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named, independently addressable workspace holding a structural copy of
/// the main namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    pub id: BranchId,
    pub name: String,
    pub owner: Option<String>,
    pub description: Option<String>,
    /// Random identifier the isolated namespace name is derived from.
    /// Immutable once assigned.
    pub schema_id: String,
    pub status: BranchStatus,
    /// Main-changelog position up to which this branch has been synchronized
    /// (exclusive boundary of the next window). Monotonically non-decreasing.
    pub last_sync: Option<i64>,
    /// Wall-clock time of the last committed sync (or of provisioning).
    /// Compared against the changelog retention window for staleness.
    pub last_sync_time: Option<DateTime<Utc>>,
    pub merged_time: Option<DateTime<Utc>>,
    pub merged_by: Option<String>,
    /// Whether the merge that produced MERGED used the squash strategy.
    pub merged_with_squash: bool,
    /// Structural migrations applied to the branch namespace, as "app.name".
    pub applied_migrations: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Branch {
    pub fn new(name: String, owner: Option<String>, description: Option<String>) -> Self {
        Self {
            id: generate_branch_id(),
            name,
            owner,
            description,
            schema_id: generate_schema_id(),
            status: BranchStatus::New,
            last_sync: None,
            last_sync_time: None,
            merged_time: None,
            merged_by: None,
            merged_with_squash: false,
            applied_migrations: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Name of the branch's isolated namespace.
    pub fn schema_name(&self, prefix: &str) -> String {
        format!("{}{}", prefix, self.schema_id)
    }

    pub fn is_ready(&self) -> bool {
        self.status == BranchStatus::Ready
    }

    pub fn is_merged(&self) -> bool {
        self.status == BranchStatus::Merged
    }

    /// Whether the branch is too far out of date to be synced or merged.
    /// A branch that has never synced is not stale (it has nothing to lose);
    /// retention of zero disables the check.
    pub fn is_stale(&self, retention_days: u32) -> bool {
        if retention_days == 0 {
            return false;
        }
        match self.last_sync_time {
            Some(t) => t < Utc::now() - Duration::days(i64::from(retention_days)),
            None => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BranchEventKind {
    Provisioned,
    Synced,
    Migrated,
    Merged,
    Reverted,
    Archived,
}

impl BranchEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BranchEventKind::Provisioned => "provisioned",
            BranchEventKind::Synced => "synced",
            BranchEventKind::Migrated => "migrated",
            BranchEventKind::Merged => "merged",
            BranchEventKind::Reverted => "reverted",
            BranchEventKind::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "provisioned" => BranchEventKind::Provisioned,
            "synced" => BranchEventKind::Synced,
            "migrated" => BranchEventKind::Migrated,
            "merged" => BranchEventKind::Merged,
            "reverted" => BranchEventKind::Reverted,
            "archived" => BranchEventKind::Archived,
            _ => return None,
        })
    }
}

impl fmt::Display for BranchEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable audit entry for a branch lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchEvent {
    pub time: DateTime<Utc>,
    pub branch_id: BranchId,
    /// Set when another branch's operation affected this branch's
    /// bookkeeping (e.g. a merge elsewhere invalidated this branch's diffs).
    pub related_branch_id: Option<BranchId>,
    pub user: Option<String>,
    pub kind: BranchEventKind,
}

impl BranchEvent {
    pub fn new(branch_id: BranchId, user: Option<String>, kind: BranchEventKind) -> Self {
        Self {
            time: Utc::now(),
            branch_id,
            related_branch_id: None,
            user,
            kind,
        }
    }

    pub fn with_related(mut self, related: BranchId) -> Self {
        self.related_branch_id = Some(related);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_branch_starts_new_with_schema_id() {
        let branch = Branch::new("feature-1".to_string(), Some("alice".to_string()), None);
        assert_eq!(branch.status, BranchStatus::New);
        assert_eq!(branch.schema_id.len(), 8);
        assert_eq!(branch.last_sync, None);
        assert_eq!(
            branch.schema_name("branch_"),
            format!("branch_{}", branch.schema_id)
        );
    }

    #[test]
    fn staleness_respects_retention_window() {
        let mut branch = Branch::new("b".to_string(), None, None);
        assert!(!branch.is_stale(30), "unsynced branch is never stale");

        branch.last_sync_time = Some(Utc::now() - Duration::days(45));
        assert!(branch.is_stale(30));
        assert!(!branch.is_stale(60));
        assert!(!branch.is_stale(0), "retention of zero disables staleness");
    }

    #[test]
    fn status_roundtrips_through_strings() {
        for status in [
            BranchStatus::New,
            BranchStatus::Provisioning,
            BranchStatus::Ready,
            BranchStatus::Syncing,
            BranchStatus::Migrating,
            BranchStatus::Merging,
            BranchStatus::Reverting,
            BranchStatus::PendingMigrations,
            BranchStatus::Merged,
            BranchStatus::Archived,
            BranchStatus::Failed,
        ] {
            assert_eq!(BranchStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(BranchStatus::parse("bogus"), None);
    }
}
