use chrono::Utc;
use log::{debug, info, warn};
use std::sync::Arc;

use crate::config::BranchingConfig;
use crate::error::BranchError;
use crate::logic::diff_engine::DiffEngine;
use crate::logic::lifecycle::Lifecycle;
use crate::logic::replay::{ReplayDirection, ReplayEngine, ReplayOutcome, ReplayReport};
use crate::logic::squash::{collapse, order_by_dependencies};
use crate::model::{
    Branch, BranchAction, BranchEvent, BranchEventKind, BranchId, BranchStatus, ChangeRecord,
    ObjectKey, TypeRegistry,
};
use crate::store::traits::{MigrationSource, Store};

/// How a merge (and its later revert) replays the branch's changelog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeStrategy {
    /// Replay every record one at a time in sequence order.
    #[default]
    Iterative,
    /// Collapse each object's records into one equivalent change first,
    /// then replay in reference-dependency order.
    Squash,
}

/// Input for creating a branch.
#[derive(Debug, Clone)]
pub struct NewBranch {
    pub name: String,
    pub owner: Option<String>,
    pub description: Option<String>,
}

/// Structured result of one branch operation, including the per-object
/// outcomes of any replay it performed.
#[derive(Debug, Clone)]
pub struct OperationReport {
    pub operation: BranchAction,
    pub branch_id: BranchId,
    pub dry_run: bool,
    pub outcomes: Vec<ReplayOutcome>,
}

impl OperationReport {
    fn new(operation: BranchAction, branch_id: BranchId, dry_run: bool) -> Self {
        Self {
            operation,
            branch_id,
            dry_run,
            outcomes: Vec::new(),
        }
    }

    fn with_report(mut self, report: ReplayReport) -> Self {
        self.outcomes = report.outcomes;
        self
    }
}

/// An entry of a branch's event history: either a lifecycle event or a
/// summary of the changes recorded between two events.
#[derive(Debug, Clone)]
pub enum HistoryEntry {
    Event(BranchEvent),
    Changes(ChangeSummary),
}

#[derive(Debug, Clone)]
pub struct ChangeSummary {
    pub start: chrono::DateTime<Utc>,
    pub end: chrono::DateTime<Utc>,
    pub count: usize,
}

/// Orchestrates the branch operations: provisioning, sync, merge, revert,
/// migrate, archive. Holds the lifecycle state machine and threads the
/// active branch explicitly through every call; there is no ambient branch
/// context.
pub struct BranchService<S> {
    store: Arc<S>,
    registry: Arc<TypeRegistry>,
    config: BranchingConfig,
    lifecycle: Arc<Lifecycle>,
}

impl<S: Store> BranchService<S> {
    pub fn new(store: Arc<S>, registry: Arc<TypeRegistry>, config: BranchingConfig) -> Self {
        Self {
            store,
            registry,
            config,
            lifecycle: Arc::new(Lifecycle::new()),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub fn config(&self) -> &BranchingConfig {
        &self.config
    }

    fn main_namespace(&self) -> &str {
        &self.config.main_schema
    }

    /// The branch's isolated namespace name.
    pub fn namespace(&self, branch: &Branch) -> String {
        branch.schema_name(&self.config.schema_prefix)
    }

    async fn require(&self, id: &BranchId) -> Result<Branch, BranchError> {
        self.store
            .get_branch(id)
            .await?
            .ok_or(BranchError::NotFound(*id))
    }

    pub async fn get_by_name(&self, name: &str) -> Result<Branch, BranchError> {
        self.store
            .get_branch_by_name(name)
            .await?
            .ok_or_else(|| BranchError::NameNotFound(name.to_string()))
    }

    /// Create a branch in status NEW, subject to the configured limits.
    /// Provisioning runs as a separate unit of work.
    pub async fn create_branch(&self, new: NewBranch) -> Result<Branch, BranchError> {
        let branches = self.store.list_branches().await?;
        if let Some(max) = self.config.max_branches {
            let total = branches
                .iter()
                .filter(|b| b.status != BranchStatus::Archived)
                .count();
            if total >= max as usize {
                return Err(BranchError::BranchLimit(format!(
                    "the maximum number of non-archived branches ({max}) has been reached"
                )));
            }
        }
        if let Some(max) = self.config.max_working_branches {
            let working = branches.iter().filter(|b| b.status.is_working()).count();
            if working >= max as usize {
                return Err(BranchError::BranchLimit(format!(
                    "the maximum number of working branches ({max}) has been reached"
                )));
            }
        }

        let branch = Branch::new(new.name, new.owner, new.description);
        self.store.insert_branch(&branch).await?;
        info!("created branch {} ({})", branch.name, branch.schema_id);
        Ok(branch)
    }

    /// Create the branch's namespace and populate it from main.
    pub async fn provision(
        &self,
        branch_id: &BranchId,
        user: Option<&str>,
    ) -> Result<OperationReport, BranchError> {
        let mut branch = self.require(branch_id).await?;
        let namespace = self.namespace(&branch);
        info!("provisioning branch {} ({})", branch.name, namespace);

        self.lifecycle.check_policy(&branch, BranchAction::Provision)?;
        let _guard = self.lifecycle.lock(branch.id)?;
        self.lifecycle
            .transition(&*self.store, &mut branch, BranchStatus::Provisioning)
            .await?;

        // The divergence point: everything before this position exists in
        // the copy, so sync never needs to revisit it.
        let head = self.store.changelog_head(self.main_namespace()).await?;

        if let Err(e) = self
            .store
            .provision_namespace(self.main_namespace(), &namespace)
            .await
        {
            warn!("provisioning branch {} failed: {e:#}", branch.name);
            self.lifecycle
                .transition(&*self.store, &mut branch, BranchStatus::Failed)
                .await?;
            return Err(BranchError::Provisioning {
                name: branch.name,
                reason: format!("{e:#}"),
            });
        }

        branch.last_sync = Some(head);
        branch.last_sync_time = Some(Utc::now());
        self.store.update_branch(&branch).await?;
        self.lifecycle
            .transition(&*self.store, &mut branch, BranchStatus::Ready)
            .await?;
        self.store
            .append_event(&BranchEvent::new(
                branch.id,
                user.map(String::from),
                BranchEventKind::Provisioned,
            ))
            .await?;
        info!("provisioning completed");
        Ok(OperationReport::new(BranchAction::Provision, branch.id, false))
    }

    /// Apply changes from main onto the branch's namespace.
    pub async fn sync(
        &self,
        branch_id: &BranchId,
        user: Option<&str>,
        commit: bool,
    ) -> Result<OperationReport, BranchError> {
        let mut branch = self.require(branch_id).await?;
        let namespace = self.namespace(&branch);
        info!("syncing branch {} ({})", branch.name, namespace);

        if !branch.is_ready() {
            return Err(BranchError::InvalidTransition {
                from: branch.status,
                to: BranchStatus::Syncing,
            });
        }
        self.check_stale(&branch)?;
        if commit {
            self.lifecycle.check_policy(&branch, BranchAction::Sync)?;
        }

        DiffEngine::refresh(&*self.store, &branch, &namespace, self.main_namespace()).await?;

        let from = branch.last_sync.unwrap_or(1);
        let head = self.store.changelog_head(self.main_namespace()).await?;
        if from >= head {
            info!("no changes found; aborting");
            return Ok(OperationReport::new(BranchAction::Sync, branch.id, !commit));
        }
        if commit {
            self.check_acknowledged(&branch).await?;
        }
        let window = self
            .store
            .changes_in(self.main_namespace(), from, head)
            .await?;
        info!("found {} changes to sync", window.len());

        let _guard = self.lifecycle.lock(branch.id)?;
        self.lifecycle
            .transition(&*self.store, &mut branch, BranchStatus::Syncing)
            .await?;

        let event = BranchEvent::new(branch.id, user.map(String::from), BranchEventKind::Synced);
        let result = self
            .run_replay(&namespace, &window, ReplayDirection::Forward, commit, None, event)
            .await;

        // A branch that failed to sync is not corrupt; it always returns to
        // ready.
        self.lifecycle
            .transition(&*self.store, &mut branch, BranchStatus::Ready)
            .await?;

        let report = match result {
            Ok(report) => report,
            Err(e) => {
                warn!("sync of branch {} failed: {e}", branch.name);
                return Err(e);
            }
        };

        if commit {
            branch.last_sync = Some(head.max(branch.last_sync.unwrap_or(0)));
            branch.last_sync_time = Some(Utc::now());
            self.store.update_branch(&branch).await?;
            // Main advanced past the branch's objects; recompute.
            DiffEngine::refresh(&*self.store, &branch, &namespace, self.main_namespace()).await?;
        }
        info!("syncing completed");
        Ok(OperationReport::new(BranchAction::Sync, branch.id, !commit).with_report(report))
    }

    /// Apply all of the branch's changes to main by replaying them in order.
    pub async fn merge(
        &self,
        branch_id: &BranchId,
        user: Option<&str>,
        commit: bool,
        strategy: MergeStrategy,
    ) -> Result<OperationReport, BranchError> {
        let mut branch = self.require(branch_id).await?;
        let namespace = self.namespace(&branch);
        info!("merging branch {} ({})", branch.name, namespace);

        if !branch.is_ready() {
            return Err(BranchError::InvalidTransition {
                from: branch.status,
                to: BranchStatus::Merging,
            });
        }
        self.check_stale(&branch)?;
        if commit {
            self.lifecycle.check_policy(&branch, BranchAction::Merge)?;
        }

        DiffEngine::refresh(&*self.store, &branch, &namespace, self.main_namespace()).await?;
        if commit {
            self.check_acknowledged(&branch).await?;
        }

        let head = self.store.changelog_head(&namespace).await?;
        let records = self.store.changes_in(&namespace, 1, head).await?;
        if records.is_empty() {
            info!("no changes found; aborting");
            return Ok(OperationReport::new(BranchAction::Merge, branch.id, !commit));
        }
        info!("found {} changes to merge", records.len());

        let window = match strategy {
            MergeStrategy::Iterative => records,
            MergeStrategy::Squash => {
                debug!("collapsing changes per object");
                let ordered = order_by_dependencies(collapse(&records), &self.registry)?;
                // The dependency order is the replay authority; renumber so
                // the recorded window replays (and reverts) in that order.
                ordered
                    .iter()
                    .filter_map(|c| c.to_record())
                    .enumerate()
                    .map(|(i, mut r)| {
                        r.seq = (i + 1) as i64;
                        r
                    })
                    .collect()
            }
        };

        let _guard = self.lifecycle.lock(branch.id)?;
        self.lifecycle
            .transition(&*self.store, &mut branch, BranchStatus::Merging)
            .await?;

        let event = BranchEvent::new(branch.id, user.map(String::from), BranchEventKind::Merged);
        let result = self
            .run_replay(
                self.main_namespace(),
                &window,
                ReplayDirection::Forward,
                commit,
                Some(branch.id),
                event,
            )
            .await;

        let report = match result {
            Ok(report) => report,
            Err(e) => {
                warn!("merge of branch {} failed: {e}", branch.name);
                self.lifecycle
                    .transition(&*self.store, &mut branch, BranchStatus::Ready)
                    .await?;
                return Err(e);
            }
        };

        if commit {
            branch.merged_time = Some(Utc::now());
            branch.merged_by = user.map(String::from);
            branch.merged_with_squash = strategy == MergeStrategy::Squash;
            self.store.update_branch(&branch).await?;
            self.lifecycle
                .transition(&*self.store, &mut branch, BranchStatus::Merged)
                .await?;
            self.refresh_sibling_diffs(&branch).await?;
        } else {
            self.lifecycle
                .transition(&*self.store, &mut branch, BranchStatus::Ready)
                .await?;
        }
        info!("merging completed");
        Ok(OperationReport::new(BranchAction::Merge, branch.id, !commit).with_report(report))
    }

    /// Undo a previously merged branch by replaying its recorded merge
    /// window in reverse.
    pub async fn revert(
        &self,
        branch_id: &BranchId,
        user: Option<&str>,
        commit: bool,
    ) -> Result<OperationReport, BranchError> {
        let mut branch = self.require(branch_id).await?;
        info!("reverting branch {}", branch.name);

        if !branch.is_merged() {
            return Err(BranchError::InvalidTransition {
                from: branch.status,
                to: BranchStatus::Reverting,
            });
        }
        if commit {
            self.lifecycle.check_policy(&branch, BranchAction::Revert)?;
        }

        let window = self.store.merged_changes(&branch.id).await?;
        if window.is_empty() {
            info!("no changes found; aborting");
            return Ok(OperationReport::new(BranchAction::Revert, branch.id, !commit));
        }
        info!("found {} changes to revert", window.len());

        let _guard = self.lifecycle.lock(branch.id)?;
        self.lifecycle
            .transition(&*self.store, &mut branch, BranchStatus::Reverting)
            .await?;

        let event = BranchEvent::new(branch.id, user.map(String::from), BranchEventKind::Reverted);
        let result = self
            .run_replay(
                self.main_namespace(),
                &window,
                ReplayDirection::Reverse,
                commit,
                None,
                event,
            )
            .await;

        let report = match result {
            Ok(report) => report,
            Err(e) => {
                warn!("revert of branch {} failed: {e}", branch.name);
                self.lifecycle
                    .transition(&*self.store, &mut branch, BranchStatus::Merged)
                    .await?;
                return Err(e);
            }
        };

        if commit {
            branch.merged_time = None;
            branch.merged_by = None;
            branch.merged_with_squash = false;
            self.store.update_branch(&branch).await?;
            self.store.clear_merged_changes(&branch.id).await?;
            self.lifecycle
                .transition(&*self.store, &mut branch, BranchStatus::Ready)
                .await?;
        } else {
            self.lifecycle
                .transition(&*self.store, &mut branch, BranchStatus::Merged)
                .await?;
        }
        info!("reversion completed");
        Ok(OperationReport::new(BranchAction::Revert, branch.id, !commit).with_report(report))
    }

    /// Apply pending structural migrations to the branch's namespace.
    pub async fn migrate(
        &self,
        branch_id: &BranchId,
        user: Option<&str>,
        source: &dyn MigrationSource,
    ) -> Result<OperationReport, BranchError> {
        let mut branch = self.require(branch_id).await?;
        let namespace = self.namespace(&branch);
        info!("migrating branch {} ({})", branch.name, namespace);

        self.lifecycle.check_policy(&branch, BranchAction::Migrate)?;
        let _guard = self.lifecycle.lock(branch.id)?;
        self.lifecycle
            .transition(&*self.store, &mut branch, BranchStatus::Migrating)
            .await?;

        let pending = source.pending(&branch).await?;
        if pending.is_empty() {
            info!("found no migrations to apply");
        }
        for migration in &pending {
            info!("applying migration {migration}");
            if let Err(e) = source.apply(&namespace, migration).await {
                warn!("migration {migration} failed: {e:#}");
                // Keep what was applied so far, then park the branch until
                // the operator retries.
                self.store.update_branch(&branch).await?;
                self.lifecycle
                    .transition(&*self.store, &mut branch, BranchStatus::PendingMigrations)
                    .await?;
                return Err(BranchError::Migration {
                    migration: migration.to_string(),
                    reason: format!("{e:#}"),
                });
            }
            branch.applied_migrations.push(migration.to_string());
        }
        self.store.update_branch(&branch).await?;

        // Migrations that appeared while we were applying leave the branch
        // parked rather than silently behind.
        let remaining = source.pending(&branch).await?;
        let target = if remaining.is_empty() {
            BranchStatus::Ready
        } else {
            info!("{} migrations remain pending", remaining.len());
            BranchStatus::PendingMigrations
        };
        self.lifecycle
            .transition(&*self.store, &mut branch, target)
            .await?;
        self.store
            .append_event(&BranchEvent::new(
                branch.id,
                user.map(String::from),
                BranchEventKind::Migrated,
            ))
            .await?;
        info!("migration completed");
        Ok(OperationReport::new(BranchAction::Migrate, branch.id, false))
    }

    /// Deprovision the branch's namespace and mark the branch archived.
    /// Terminal and irreversible; the branch record is retained.
    pub async fn archive(
        &self,
        branch_id: &BranchId,
        user: Option<&str>,
    ) -> Result<OperationReport, BranchError> {
        let mut branch = self.require(branch_id).await?;
        let namespace = self.namespace(&branch);
        info!("archiving branch {} ({})", branch.name, namespace);

        self.lifecycle.check_policy(&branch, BranchAction::Archive)?;
        if !Lifecycle::is_legal(branch.status, BranchStatus::Archived) {
            return Err(BranchError::InvalidTransition {
                from: branch.status,
                to: BranchStatus::Archived,
            });
        }
        let _guard = self.lifecycle.lock(branch.id)?;

        // Even a failed deprovision must not leave the branch pointing at a
        // half-dropped namespace without being marked archived.
        let deprovision_result = self.store.deprovision_namespace(&namespace).await;
        self.lifecycle
            .transition(&*self.store, &mut branch, BranchStatus::Archived)
            .await?;
        self.store
            .append_event(&BranchEvent::new(
                branch.id,
                user.map(String::from),
                BranchEventKind::Archived,
            ))
            .await?;
        if let Err(e) = deprovision_result {
            warn!("deprovisioning schema {namespace} failed: {e:#}");
            return Err(BranchError::Store(e));
        }
        info!("archiving completed");
        Ok(OperationReport::new(BranchAction::Archive, branch.id, false))
    }

    /// Remove a branch record entirely, deprovisioning its namespace if one
    /// exists. Refused mid-operation.
    pub async fn delete_branch(&self, branch_id: &BranchId) -> Result<(), BranchError> {
        let branch = self.require(branch_id).await?;
        if branch.status.is_transitional() || self.lifecycle.is_in_flight(branch_id) {
            return Err(BranchError::OperationInFlight(*branch_id));
        }
        let _guard = self.lifecycle.lock(branch.id)?;
        let namespace = self.namespace(&branch);
        if self.store.namespace_exists(&namespace).await? {
            self.store.deprovision_namespace(&namespace).await?;
        }
        self.store.clear_diffs(&branch.id).await?;
        self.store.clear_merged_changes(&branch.id).await?;
        self.store.delete_branch(&branch.id).await?;
        info!("deleted branch {}", branch.name);
        Ok(())
    }

    /// Recompute the branch's diffs on demand.
    pub async fn refresh_diffs(&self, branch_id: &BranchId) -> Result<Vec<crate::model::ChangeDiff>, BranchError> {
        let branch = self.require(branch_id).await?;
        let namespace = self.namespace(&branch);
        DiffEngine::refresh(&*self.store, &branch, &namespace, self.main_namespace()).await
    }

    /// Operator acknowledgment of one conflicted object.
    pub async fn acknowledge(
        &self,
        branch_id: &BranchId,
        object: &ObjectKey,
    ) -> Result<bool, BranchError> {
        Ok(self.store.acknowledge_diff(branch_id, object).await?)
    }

    /// The branch's event history, with a summary of the changes recorded
    /// between consecutive events.
    pub async fn event_history(&self, branch_id: &BranchId) -> Result<Vec<HistoryEntry>, BranchError> {
        let branch = self.require(branch_id).await?;
        let changes = if branch.status == BranchStatus::New {
            Vec::new()
        } else {
            let namespace = self.namespace(&branch);
            if self.store.namespace_exists(&namespace).await? {
                self.store.all_changes(&namespace).await?
            } else {
                Vec::new()
            }
        };

        let mut history = Vec::new();
        let mut last_time = Utc::now();
        for event in self.store.events_for_branch(&branch.id).await? {
            let count = changes
                .iter()
                .filter(|c| c.time >= event.time && c.time < last_time)
                .count();
            if count > 0 {
                history.push(HistoryEntry::Changes(ChangeSummary {
                    start: event.time,
                    end: last_time,
                    count,
                }));
            }
            last_time = event.time;
            history.push(HistoryEntry::Event(event));
        }
        Ok(history)
    }

    fn check_stale(&self, branch: &Branch) -> Result<(), BranchError> {
        if branch.is_stale(self.config.changelog_retention_days) {
            return Err(BranchError::StaleBranch {
                name: branch.name.clone(),
                retention_days: self.config.changelog_retention_days,
            });
        }
        Ok(())
    }

    async fn check_acknowledged(&self, branch: &Branch) -> Result<(), BranchError> {
        let unacked = DiffEngine::unacknowledged_conflicts(&*self.store, branch).await?;
        if !unacked.is_empty() {
            return Err(BranchError::UnacknowledgedConflicts { objects: unacked });
        }
        Ok(())
    }

    /// Replay a window inside one transaction on the target namespace. The
    /// lifecycle event and applied-change bookkeeping are staged in the same
    /// transaction; a dry run rolls everything back after full evaluation.
    async fn run_replay(
        &self,
        namespace: &str,
        window: &[ChangeRecord],
        direction: ReplayDirection,
        commit: bool,
        record_applied_for: Option<BranchId>,
        event: BranchEvent,
    ) -> Result<ReplayReport, BranchError> {
        let mut tx = self.store.begin(namespace).await?;
        let engine = ReplayEngine::new(&self.registry);
        let report = match engine.replay(tx.as_mut(), window, direction).await {
            Ok(report) => report,
            Err(e) => {
                tx.rollback().await?;
                return Err(e);
            }
        };

        if commit {
            if let Some(branch_id) = record_applied_for {
                for record in window {
                    tx.record_applied(&branch_id, record).await?;
                }
            }
            tx.record_event(event).await?;
            tx.commit().await?;
        } else {
            debug!("dry run; rolling back");
            tx.rollback().await?;
        }
        Ok(report)
    }

    /// A committed merge moved main forward under every other working
    /// branch. Recompute their diffs and note the cause on branches whose
    /// bookkeeping changed.
    async fn refresh_sibling_diffs(&self, merged: &Branch) -> Result<(), BranchError> {
        for sibling in self.store.list_branches().await? {
            if sibling.id == merged.id || sibling.status != BranchStatus::Ready {
                continue;
            }
            let namespace = self.namespace(&sibling);
            if !self.store.namespace_exists(&namespace).await? {
                continue;
            }
            let diffs =
                DiffEngine::refresh(&*self.store, &sibling, &namespace, self.main_namespace())
                    .await?;
            if !diffs.is_empty() {
                self.store
                    .append_event(
                        &BranchEvent::new(sibling.id, None, BranchEventKind::Merged)
                            .with_related(merged.id),
                    )
                    .await?;
            }
        }
        Ok(())
    }
}
