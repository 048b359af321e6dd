use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::model::{ObjectKey, SnapshotData};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    Create,
    Update,
    Delete,
}

impl ChangeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeAction::Create => "create",
            ChangeAction::Update => "update",
            ChangeAction::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "create" => ChangeAction::Create,
            "update" => ChangeAction::Update,
            "delete" => ChangeAction::Delete,
            _ => return None,
        })
    }
}

impl fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One immutable, ordered entry in a namespace's changelog describing a
/// create/update/delete of one logical object. The sequence position defines
/// total replay order within the namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub seq: i64,
    pub time: DateTime<Utc>,
    /// None for system-triggered changes.
    pub user: Option<String>,
    pub object_type: String,
    pub object_id: i64,
    pub action: ChangeAction,
    /// Complete pre-change snapshot; None for creates.
    pub prechange: Option<SnapshotData>,
    /// Complete post-change snapshot; None for deletes.
    pub postchange: Option<SnapshotData>,
}

/// Input for appending to a changelog; the store assigns the sequence
/// position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewChangeRecord {
    pub time: DateTime<Utc>,
    pub user: Option<String>,
    pub object_type: String,
    pub object_id: i64,
    pub action: ChangeAction,
    pub prechange: Option<SnapshotData>,
    pub postchange: Option<SnapshotData>,
}

/// The attributes a change actually touched, keyed both ways.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordDiff {
    pub pre: SnapshotData,
    pub post: SnapshotData,
}

impl ChangeRecord {
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.object_type.clone(), self.object_id)
    }

    /// The changed attributes between the pre- and post-change snapshots.
    /// For creates every post attribute counts as changed; for deletes every
    /// pre attribute; for updates only attributes whose values differ.
    pub fn diff(&self) -> RecordDiff {
        let empty = SnapshotData::new();
        let pre = self.prechange.as_ref().unwrap_or(&empty);
        let post = self.postchange.as_ref().unwrap_or(&empty);

        let changed: Vec<String> = match self.action {
            ChangeAction::Create => post.keys().cloned().collect(),
            ChangeAction::Delete => pre.keys().cloned().collect(),
            ChangeAction::Update => crate::model::changed_attr_names(pre, post),
        };

        let mut diff = RecordDiff::default();
        for attr in changed {
            if let Some(v) = pre.get(&attr) {
                diff.pre.insert(attr.clone(), v.clone());
            }
            if let Some(v) = post.get(&attr) {
                diff.post.insert(attr.clone(), v.clone());
            }
        }
        diff
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot(pairs: &[(&str, serde_json::Value)]) -> SnapshotData {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn update_diff_only_contains_changed_attrs() {
        let record = ChangeRecord {
            seq: 7,
            time: Utc::now(),
            user: Some("alice".to_string()),
            object_type: "device".to_string(),
            object_id: 3,
            action: ChangeAction::Update,
            prechange: Some(snapshot(&[
                ("name", json!("core-sw-1")),
                ("description", json!("foo")),
            ])),
            postchange: Some(snapshot(&[
                ("name", json!("core-sw-1")),
                ("description", json!("bar")),
            ])),
        };

        let diff = record.diff();
        assert_eq!(diff.pre, snapshot(&[("description", json!("foo"))]));
        assert_eq!(diff.post, snapshot(&[("description", json!("bar"))]));
    }

    #[test]
    fn create_diff_contains_all_post_attrs() {
        let record = ChangeRecord {
            seq: 1,
            time: Utc::now(),
            user: None,
            object_type: "site".to_string(),
            object_id: 1,
            action: ChangeAction::Create,
            prechange: None,
            postchange: Some(snapshot(&[("name", json!("dc1"))])),
        };

        let diff = record.diff();
        assert!(diff.pre.is_empty());
        assert_eq!(diff.post, snapshot(&[("name", json!("dc1"))]));
    }
}
