use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::model::{BranchId, ChangeAction, ObjectKey, SnapshotData};

/// Derived three-way comparison for one object within one branch: the state
/// in main at divergence (original), the cumulative effect of the branch's
/// own changes (modified), and the live state in main (current). Recomputed
/// whenever either side changes; at most one exists per (branch, object).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeDiff {
    pub branch_id: BranchId,
    pub object_type: String,
    pub object_id: i64,
    /// Net action of the branch's changes, after collapsing intermediate
    /// edits.
    pub action: ChangeAction,
    pub original: Option<SnapshotData>,
    pub modified: Option<SnapshotData>,
    pub current: Option<SnapshotData>,
    /// Attribute names independently changed to different values on both
    /// sides since the original snapshot.
    pub conflicts: Vec<String>,
    /// Set by the operator; required for every conflicted object before a
    /// sync or merge may commit. Reset whenever recomputation changes the
    /// conflict set.
    pub acknowledged: bool,
    pub last_updated: DateTime<Utc>,
}

impl ChangeDiff {
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.object_type.clone(), self.object_id)
    }

    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }

    /// Recompute the conflict set from the three snapshots.
    ///
    /// An attribute of an updated object conflicts iff both sides changed it
    /// away from the original, to different values; both sides changing it
    /// to the same value is not a conflict. For an object deleted in the
    /// branch, any attribute main has since changed conflicts. Creates never
    /// conflict (a same-identity create in main surfaces as a replay
    /// collision instead).
    pub fn update_conflicts(&mut self) {
        let empty = SnapshotData::new();
        let original = self.original.as_ref().unwrap_or(&empty);
        let modified = self.modified.as_ref().unwrap_or(&empty);

        self.conflicts = match (self.action, self.current.as_ref()) {
            (ChangeAction::Update, Some(current)) => original
                .iter()
                .filter(|(k, v)| {
                    modified.get(*k) != Some(*v)
                        && current.get(*k) != Some(*v)
                        && modified.get(*k) != current.get(*k)
                })
                .map(|(k, _)| k.clone())
                .collect(),
            (ChangeAction::Delete, Some(current)) => original
                .iter()
                .filter(|(k, v)| current.get(*k) != Some(*v))
                .map(|(k, _)| k.clone())
                .collect(),
            // Object absent from main: nothing to conflict with attribute-
            // wise. Replay surfaces the missing-target or collision error.
            _ => Vec::new(),
        };
        self.conflicts.sort();
        self.last_updated = Utc::now();
    }

    /// Attributes altered within the branch relative to the original.
    pub fn altered_in_modified(&self) -> BTreeSet<String> {
        let empty = SnapshotData::new();
        let original = self.original.as_ref().unwrap_or(&empty);
        self.modified
            .as_ref()
            .unwrap_or(&empty)
            .iter()
            .filter(|(k, v)| original.contains_key(*k) && original.get(*k) != Some(*v))
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Attributes altered in main relative to the original.
    pub fn altered_in_current(&self) -> BTreeSet<String> {
        let empty = SnapshotData::new();
        let original = self.original.as_ref().unwrap_or(&empty);
        self.current
            .as_ref()
            .unwrap_or(&empty)
            .iter()
            .filter(|(k, v)| original.contains_key(*k) && original.get(*k) != Some(*v))
            .map(|(k, _)| k.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn snapshot(pairs: &[(&str, serde_json::Value)]) -> SnapshotData {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn diff_for(
        action: ChangeAction,
        original: Option<SnapshotData>,
        modified: Option<SnapshotData>,
        current: Option<SnapshotData>,
    ) -> ChangeDiff {
        let mut diff = ChangeDiff {
            branch_id: Uuid::new_v4(),
            object_type: "device".to_string(),
            object_id: 1,
            action,
            original,
            modified,
            current,
            conflicts: Vec::new(),
            acknowledged: false,
            last_updated: Utc::now(),
        };
        diff.update_conflicts();
        diff
    }

    #[test]
    fn both_sides_changed_differently_is_a_conflict() {
        let diff = diff_for(
            ChangeAction::Update,
            Some(snapshot(&[("status", json!("active"))])),
            Some(snapshot(&[("status", json!("planned"))])),
            Some(snapshot(&[("status", json!("staged"))])),
        );
        assert_eq!(diff.conflicts, vec!["status"]);
    }

    #[test]
    fn untouched_in_main_is_not_a_conflict() {
        let diff = diff_for(
            ChangeAction::Update,
            Some(snapshot(&[("status", json!("active"))])),
            Some(snapshot(&[("status", json!("planned"))])),
            Some(snapshot(&[("status", json!("active"))])),
        );
        assert!(diff.conflicts.is_empty());
    }

    #[test]
    fn both_sides_same_value_is_not_a_conflict() {
        let diff = diff_for(
            ChangeAction::Update,
            Some(snapshot(&[("status", json!("active"))])),
            Some(snapshot(&[("status", json!("planned"))])),
            Some(snapshot(&[("status", json!("planned"))])),
        );
        assert!(diff.conflicts.is_empty());
    }

    #[test]
    fn delete_conflicts_when_main_changed_the_object() {
        let diff = diff_for(
            ChangeAction::Delete,
            Some(snapshot(&[
                ("name", json!("t1")),
                ("status", json!("active")),
            ])),
            None,
            Some(snapshot(&[
                ("name", json!("t1")),
                ("status", json!("staged")),
            ])),
        );
        assert_eq!(diff.conflicts, vec!["status"]);
    }

    #[test]
    fn altered_sets_track_each_side() {
        let diff = diff_for(
            ChangeAction::Update,
            Some(snapshot(&[
                ("name", json!("a")),
                ("status", json!("active")),
            ])),
            Some(snapshot(&[
                ("name", json!("b")),
                ("status", json!("active")),
            ])),
            Some(snapshot(&[
                ("name", json!("a")),
                ("status", json!("staged")),
            ])),
        );
        assert_eq!(
            diff.altered_in_modified().into_iter().collect::<Vec<_>>(),
            vec!["name".to_string()]
        );
        assert_eq!(
            diff.altered_in_current().into_iter().collect::<Vec<_>>(),
            vec!["status".to_string()]
        );
        assert!(diff.conflicts.is_empty(), "different attrs never conflict");
    }
}
