use chrono::Utc;
use log::debug;
use std::collections::HashSet;

use crate::error::BranchError;
use crate::logic::squash::{collapse, CollapsedAction};
use crate::model::{Branch, ChangeAction, ChangeDiff, ObjectKey};
use crate::store::traits::Store;

/// Computes the three-way comparison for every object touched by a branch
/// and keeps the stored ChangeDiffs in step: at most one per (branch,
/// object), recomputed rather than appended, stale entries removed.
pub struct DiffEngine;

impl DiffEngine {
    /// Recompute all of a branch's diffs from its changelog and the live
    /// state of main. An existing acknowledgment survives only while the
    /// recomputed conflict set is unchanged.
    pub async fn refresh<S: Store + ?Sized>(
        store: &S,
        branch: &Branch,
        branch_namespace: &str,
        main_namespace: &str,
    ) -> Result<Vec<ChangeDiff>, BranchError> {
        let records = store.all_changes(branch_namespace).await?;
        let collapsed = collapse(&records);

        let mut touched: HashSet<ObjectKey> = HashSet::new();
        let mut diffs = Vec::new();

        for change in collapsed {
            if change.action == CollapsedAction::Skip {
                continue;
            }
            touched.insert(change.key.clone());

            let current = store.get_object(main_namespace, &change.key).await?;
            let (action, original, modified) = match change.action {
                CollapsedAction::Create => {
                    (ChangeAction::Create, None, Some(change.postchange.clone()))
                }
                CollapsedAction::Update => (
                    ChangeAction::Update,
                    Some(change.prechange.clone()),
                    Some(change.postchange.clone()),
                ),
                CollapsedAction::Delete => (
                    ChangeAction::Delete,
                    Some(change.prechange.clone()),
                    None,
                ),
                CollapsedAction::Skip => unreachable!(),
            };

            let mut diff = ChangeDiff {
                branch_id: branch.id,
                object_type: change.key.object_type.clone(),
                object_id: change.key.object_id,
                action,
                original,
                modified,
                current,
                conflicts: Vec::new(),
                acknowledged: false,
                last_updated: Utc::now(),
            };
            diff.update_conflicts();

            if let Some(previous) = store.get_diff(&branch.id, &change.key).await? {
                if previous.acknowledged && previous.conflicts == diff.conflicts {
                    diff.acknowledged = true;
                }
            }

            debug!(
                "diff for {}: {} ({} conflicts)",
                change.key,
                diff.action,
                diff.conflicts.len()
            );
            store.upsert_diff(&diff).await?;
            diffs.push(diff);
        }

        // Objects the branch no longer touches (e.g. created and deleted in
        // the branch) must not keep a diff around.
        for existing in store.list_diffs(&branch.id).await? {
            if !touched.contains(&existing.key()) {
                store.remove_diff(&branch.id, &existing.key()).await?;
            }
        }

        Ok(diffs)
    }

    /// The objects whose conflict sets are non-empty and not yet
    /// acknowledged. Must be empty before a sync or merge may commit.
    pub async fn unacknowledged_conflicts<S: Store + ?Sized>(
        store: &S,
        branch: &Branch,
    ) -> Result<Vec<ObjectKey>, BranchError> {
        let diffs = store.list_diffs(&branch.id).await?;
        Ok(diffs
            .into_iter()
            .filter(|d| d.has_conflicts() && !d.acknowledged)
            .map(|d| d.key())
            .collect())
    }
}
