use chrono::{DateTime, Utc};
use itertools::Itertools;
use log::{debug, warn};
use std::collections::{HashMap, HashSet};

use crate::error::BranchError;
use crate::model::{ChangeAction, ChangeRecord, ObjectKey, SnapshotData, TypeRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollapsedAction {
    Create,
    Update,
    Delete,
    /// Created and deleted within the window; nothing to replay.
    Skip,
}

impl CollapsedAction {
    /// Ordering priority when no reference dependency dictates otherwise:
    /// deletes free unique values first, creates come last.
    fn priority(&self) -> u8 {
        match self {
            CollapsedAction::Delete => 0,
            CollapsedAction::Update => 1,
            CollapsedAction::Create => 2,
            CollapsedAction::Skip => 3,
        }
    }
}

/// The net effect of all of one object's change records within a window.
#[derive(Debug, Clone, PartialEq)]
pub struct CollapsedChange {
    pub key: ObjectKey,
    pub action: CollapsedAction,
    pub prechange: SnapshotData,
    pub postchange: SnapshotData,
    pub change_count: usize,
    pub last_seq: i64,
    pub last_time: DateTime<Utc>,
    pub last_user: Option<String>,
}

impl CollapsedChange {
    fn new(key: ObjectKey, first: &ChangeRecord) -> Self {
        Self {
            key,
            action: CollapsedAction::Skip,
            prechange: SnapshotData::new(),
            postchange: SnapshotData::new(),
            change_count: 0,
            last_seq: first.seq,
            last_time: first.time,
            last_user: first.user.clone(),
        }
    }

    fn set_initial(&mut self, record: &ChangeRecord) {
        self.prechange = record.prechange.clone().unwrap_or_default();
        if let Some(post) = &record.postchange {
            for (k, v) in post {
                self.postchange.insert(k.clone(), v.clone());
            }
        }
    }

    /// Fold one more record into the collapsed state. Records must arrive in
    /// sequence order.
    fn add(&mut self, record: &ChangeRecord, first: bool) {
        self.change_count += 1;
        self.last_seq = record.seq;
        self.last_time = record.time;
        self.last_user = record.user.clone();

        match record.action {
            ChangeAction::Create => {
                if first {
                    self.action = CollapsedAction::Create;
                    self.set_initial(record);
                } else {
                    warn!("unexpected create for {} after {:?}", self.key, self.action);
                }
            }
            ChangeAction::Update => match self.action {
                _ if first => {
                    self.action = CollapsedAction::Update;
                    self.set_initial(record);
                }
                CollapsedAction::Create | CollapsedAction::Update => {
                    if let Some(post) = &record.postchange {
                        for (k, v) in post {
                            self.postchange.insert(k.clone(), v.clone());
                        }
                    }
                }
                _ => warn!("unexpected update for {} after {:?}", self.key, self.action),
            },
            ChangeAction::Delete => match self.action {
                _ if first => {
                    self.action = CollapsedAction::Delete;
                    self.set_initial(record);
                }
                // Created and deleted inside the window: drop entirely.
                CollapsedAction::Create => {
                    debug!("{} created and deleted in window; skipping", self.key);
                    self.action = CollapsedAction::Skip;
                    self.postchange = SnapshotData::new();
                }
                CollapsedAction::Update => {
                    self.action = CollapsedAction::Delete;
                    self.postchange = SnapshotData::new();
                }
                _ => warn!("unexpected delete for {} after {:?}", self.key, self.action),
            },
        }
    }

    /// Materialize as a single equivalent change record for replay and
    /// applied-change bookkeeping. None for skips.
    pub fn to_record(&self) -> Option<ChangeRecord> {
        let (action, pre, post) = match self.action {
            CollapsedAction::Create => (ChangeAction::Create, None, Some(self.postchange.clone())),
            CollapsedAction::Update => (
                ChangeAction::Update,
                Some(self.prechange.clone()),
                Some(self.postchange.clone()),
            ),
            CollapsedAction::Delete => (ChangeAction::Delete, Some(self.prechange.clone()), None),
            CollapsedAction::Skip => return None,
        };
        Some(ChangeRecord {
            seq: self.last_seq,
            time: self.last_time,
            user: self.last_user.clone(),
            object_type: self.key.object_type.clone(),
            object_id: self.key.object_id,
            action,
            prechange: pre,
            postchange: post,
        })
    }
}

/// Collapse a window's records per object: create + edits + delete vanishes,
/// edits + delete becomes one delete, create + edits one create, edits one
/// update. The input must be in ascending sequence order.
pub fn collapse(window: &[ChangeRecord]) -> Vec<CollapsedChange> {
    let groups = window.iter().map(|r| (r.key(), r)).into_group_map();

    let mut collapsed: Vec<CollapsedChange> = groups
        .into_iter()
        .map(|(key, records)| {
            let mut change = CollapsedChange::new(key, records[0]);
            for (i, record) in records.iter().enumerate() {
                change.add(record, i == 0);
            }
            change
        })
        .collect();
    collapsed.sort_by_key(|c| c.last_seq);
    collapsed
}

/// Order collapsed changes so every reference dependency is satisfied:
/// updates that drop a reference run before the referenced delete, creates
/// run before anything that references them, child deletes run before parent
/// deletes. Kahn's algorithm; ties broken by action priority then time.
pub fn order_by_dependencies(
    collapsed: Vec<CollapsedChange>,
    registry: &TypeRegistry,
) -> Result<Vec<CollapsedChange>, BranchError> {
    let mut items: HashMap<ObjectKey, CollapsedChange> = collapsed
        .into_iter()
        .filter(|c| c.action != CollapsedAction::Skip)
        .map(|c| (c.key.clone(), c))
        .collect();

    let deletes: HashSet<ObjectKey> = items
        .values()
        .filter(|c| c.action == CollapsedAction::Delete)
        .map(|c| c.key.clone())
        .collect();
    let creates: HashSet<ObjectKey> = items
        .values()
        .filter(|c| c.action == CollapsedAction::Create)
        .map(|c| c.key.clone())
        .collect();

    // depends_on: the change may only run after all listed keys have run.
    let mut depends_on: HashMap<ObjectKey, HashSet<ObjectKey>> =
        items.keys().map(|k| (k.clone(), HashSet::new())).collect();

    for change in items.values() {
        let pre_refs = registry.snapshot_references(&change.key.object_type, &change.prechange);
        let post_refs = registry.snapshot_references(&change.key.object_type, &change.postchange);

        match change.action {
            CollapsedAction::Update => {
                // The update releases its reference; the delete of the
                // referenced object must wait for it.
                for referenced in &pre_refs {
                    if deletes.contains(referenced) {
                        if let Some(deps) = depends_on.get_mut(referenced) {
                            deps.insert(change.key.clone());
                        }
                    }
                }
                // The update points at a created object; the create must
                // exist first.
                for referenced in &post_refs {
                    if creates.contains(referenced) {
                        if let Some(deps) = depends_on.get_mut(&change.key) {
                            deps.insert(referenced.clone());
                        }
                    }
                }
            }
            CollapsedAction::Create => {
                for referenced in &post_refs {
                    if *referenced != change.key && creates.contains(referenced) {
                        if let Some(deps) = depends_on.get_mut(&change.key) {
                            deps.insert(referenced.clone());
                        }
                    }
                }
            }
            CollapsedAction::Delete => {
                // This delete still references another deleted object; the
                // referenced (parent) delete must wait for this (child) one.
                for referenced in &pre_refs {
                    if *referenced != change.key && deletes.contains(referenced) {
                        if let Some(deps) = depends_on.get_mut(referenced) {
                            deps.insert(change.key.clone());
                        }
                    }
                }
            }
            CollapsedAction::Skip => {}
        }
    }

    let mut ordered = Vec::with_capacity(items.len());
    while !depends_on.is_empty() {
        let mut ready: Vec<ObjectKey> = depends_on
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(k, _)| k.clone())
            .collect();

        if ready.is_empty() {
            let members = depends_on
                .keys()
                .sorted_by_key(|k| k.to_string())
                .take(5)
                .join(", ");
            return Err(BranchError::DependencyCycle {
                count: depends_on.len(),
                members,
            });
        }

        ready.sort_by_key(|k| {
            let c = &items[k];
            (c.action.priority(), c.last_time, c.last_seq)
        });

        for key in ready {
            depends_on.remove(&key);
            for deps in depends_on.values_mut() {
                deps.remove(&key);
            }
            ordered.push(items.remove(&key).expect("ordered key missing"));
        }
    }

    Ok(ordered)
}
