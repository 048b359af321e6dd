use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::error::BranchError;
use crate::logic::operations::{BranchService, MergeStrategy, OperationReport};
use crate::model::{BranchAction, BranchId, BranchStatus};
use crate::store::traits::{MigrationSource, Store};

/// Structured success/failure of one dispatched branch operation.
#[derive(Debug)]
pub struct JobOutcome {
    pub operation: BranchAction,
    pub branch_id: BranchId,
    pub result: Result<OperationReport, BranchError>,
}

/// Dispatches branch operations as units of asynchronous work on the tokio
/// runtime. Operations on different branches run fully in parallel; the
/// lifecycle lock serializes operations on the same branch. An operation
/// that exceeds its time budget is aborted wholesale; the open transaction
/// rolls back with it.
pub struct JobRunner<S> {
    service: Arc<BranchService<S>>,
    migrations: Arc<dyn MigrationSource>,
}

impl<S: Store + 'static> JobRunner<S> {
    pub fn new(service: Arc<BranchService<S>>, migrations: Arc<dyn MigrationSource>) -> Self {
        Self {
            service,
            migrations,
        }
    }

    pub fn service(&self) -> &BranchService<S> {
        &self.service
    }

    /// Size the time budget for an operation from the configured base
    /// timeout plus the per-change multiplier applied to the backlog the
    /// operation will replay.
    pub async fn budget(&self, operation: BranchAction, branch_id: &BranchId) -> Duration {
        let config = self.service.config();
        let base = Duration::from_secs(config.job_timeout_secs);
        let pending = match self.pending_changes(operation, branch_id).await {
            Ok(count) => count,
            Err(e) => {
                warn!("could not size job budget: {e}");
                0
            }
        };
        base + Duration::from_secs_f64(config.change_timeout_multiplier * pending as f64)
    }

    async fn pending_changes(
        &self,
        operation: BranchAction,
        branch_id: &BranchId,
    ) -> Result<i64, BranchError> {
        let store = self.service.store();
        let Some(branch) = store.get_branch(branch_id).await? else {
            return Ok(0);
        };
        let count = match operation {
            BranchAction::Sync => {
                let head = store
                    .changelog_head(self.service.config().main_schema.as_str())
                    .await?;
                head - branch.last_sync.unwrap_or(1)
            }
            BranchAction::Merge => {
                if branch.status != BranchStatus::Ready {
                    return Ok(0);
                }
                let namespace = self.service.namespace(&branch);
                store.changelog_head(&namespace).await? - 1
            }
            BranchAction::Revert => store.merged_changes(branch_id).await?.len() as i64,
            _ => 0,
        };
        Ok(count.max(0))
    }

    /// Run one operation to completion under its time budget.
    pub async fn run(
        &self,
        operation: BranchAction,
        branch_id: BranchId,
        user: Option<String>,
        commit: bool,
    ) -> JobOutcome {
        let budget = self.budget(operation, &branch_id).await;
        info!(
            "running {} for branch {} (commit={}, budget={}s)",
            operation,
            branch_id,
            commit,
            budget.as_secs()
        );
        let user = user.as_deref();
        let work = async {
            match operation {
                BranchAction::Provision => self.service.provision(&branch_id, user).await,
                BranchAction::Sync => self.service.sync(&branch_id, user, commit).await,
                BranchAction::Merge => {
                    self.service
                        .merge(&branch_id, user, commit, MergeStrategy::Iterative)
                        .await
                }
                BranchAction::Revert => self.service.revert(&branch_id, user, commit).await,
                BranchAction::Migrate => {
                    self.service
                        .migrate(&branch_id, user, self.migrations.as_ref())
                        .await
                }
                BranchAction::Archive => self.service.archive(&branch_id, user).await,
            }
        };

        let result = match tokio::time::timeout(budget, work).await {
            Ok(result) => result,
            Err(_) => Err(BranchError::Store(anyhow::anyhow!(
                "{operation} for branch {branch_id} exceeded its {}s execution budget",
                budget.as_secs()
            ))),
        };
        if let Err(e) = &result {
            warn!("{operation} for branch {branch_id} failed: {e}");
        }
        JobOutcome {
            operation,
            branch_id,
            result,
        }
    }

    /// Dispatch one operation as a background task.
    pub fn submit(
        &self,
        operation: BranchAction,
        branch_id: BranchId,
        user: Option<String>,
        commit: bool,
    ) -> JoinHandle<JobOutcome> {
        let runner = Self {
            service: self.service.clone(),
            migrations: self.migrations.clone(),
        };
        tokio::spawn(async move { runner.run(operation, branch_id, user, commit).await })
    }
}
