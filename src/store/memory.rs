use anyhow::{anyhow, bail, Result};
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::model::{
    Branch, BranchEvent, BranchId, BranchStatus, ChangeAction, ChangeDiff, ChangeRecord,
    NewChangeRecord, ObjectKey, SnapshotData, TypeRegistry,
};
use crate::store::traits::{
    AppliedChangeStore, BranchStore, ChangeLogStore, DiffStore, EventStore, InsertOutcome,
    NamespaceStore, ObjectTx,
};

/// One namespace's rows, id sequences, and derived hierarchy data.
#[derive(Debug, Clone, Default)]
struct NamespaceData {
    /// object type -> id -> attribute snapshot
    objects: HashMap<String, BTreeMap<i64, SnapshotData>>,
    /// object type -> next id
    sequences: HashMap<String, i64>,
    /// object type -> id -> ancestor chain, nearest first
    hierarchy: HashMap<String, BTreeMap<i64, Vec<i64>>>,
}

#[derive(Default)]
struct MemoryInner {
    branches: HashMap<BranchId, Branch>,
    namespaces: HashMap<String, NamespaceData>,
    changelogs: HashMap<String, Vec<ChangeRecord>>,
    diffs: HashMap<(BranchId, ObjectKey), ChangeDiff>,
    events: Vec<BranchEvent>,
    applied: HashMap<BranchId, Vec<ChangeRecord>>,
}

/// In-memory store implementing the full `Store` contract. Used by the test
/// suite and by embedded callers that do not need Postgres; namespace
/// transactions stage a copy and swap it in on commit, so a rollback leaves
/// no trace.
#[derive(Clone)]
pub struct MemoryStore {
    registry: Arc<TypeRegistry>,
    main_namespace: String,
    inner: Arc<RwLock<MemoryInner>>,
}

fn unique_violation(
    registry: &TypeRegistry,
    data_for_type: &BTreeMap<i64, SnapshotData>,
    object: &ObjectKey,
    data: &SnapshotData,
) -> Option<String> {
    let def = registry.get(&object.object_type)?;
    for attrs in &def.unique_attrs {
        if attrs.iter().all(|a| data.get(a).is_none()) {
            continue;
        }
        for (other_id, other) in data_for_type {
            if *other_id == object.object_id {
                continue;
            }
            if attrs.iter().all(|a| other.get(a) == data.get(a)) {
                return Some(format!(
                    "{}_{}_key",
                    object.object_type,
                    attrs.join("_")
                ));
            }
        }
    }
    None
}

fn rebuild_hierarchy(registry: &TypeRegistry, ns: &mut NamespaceData, object_type: &str) {
    let Some(parent_attr) = registry.get(object_type).and_then(|d| d.parent_attr()) else {
        return;
    };
    let objects = ns.objects.entry(object_type.to_string()).or_default();
    let parents: BTreeMap<i64, Option<i64>> = objects
        .iter()
        .map(|(id, data)| (*id, data.get(parent_attr).and_then(|v| v.as_i64())))
        .collect();

    let mut chains: BTreeMap<i64, Vec<i64>> = BTreeMap::new();
    for id in parents.keys() {
        let mut chain = Vec::new();
        let mut cursor = parents.get(id).copied().flatten();
        while let Some(ancestor) = cursor {
            if chain.contains(&ancestor) || ancestor == *id {
                break;
            }
            chain.push(ancestor);
            cursor = parents.get(&ancestor).copied().flatten();
        }
        chains.insert(*id, chain);
    }
    ns.hierarchy.insert(object_type.to_string(), chains);
}

impl MemoryStore {
    pub fn new(registry: Arc<TypeRegistry>, main_namespace: &str) -> Self {
        let mut ns = NamespaceData::default();
        for name in registry.type_names() {
            ns.objects.insert(name.to_string(), BTreeMap::new());
            ns.sequences.insert(name.to_string(), 1);
        }
        let mut inner = MemoryInner::default();
        inner.namespaces.insert(main_namespace.to_string(), ns);
        inner.changelogs.insert(main_namespace.to_string(), Vec::new());
        Self {
            registry,
            main_namespace: main_namespace.to_string(),
            inner: Arc::new(RwLock::new(inner)),
        }
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    pub fn main_namespace(&self) -> &str {
        &self.main_namespace
    }

    /// All rows of one type within a namespace, for inspection.
    pub fn list_objects(&self, namespace: &str, object_type: &str) -> Vec<(i64, SnapshotData)> {
        let inner = self.inner.read();
        inner
            .namespaces
            .get(namespace)
            .and_then(|ns| ns.objects.get(object_type))
            .map(|rows| rows.iter().map(|(id, d)| (*id, d.clone())).collect())
            .unwrap_or_default()
    }

    /// The derived ancestor chain of one object, nearest ancestor first.
    pub fn ancestors(&self, namespace: &str, object: &ObjectKey) -> Vec<i64> {
        let inner = self.inner.read();
        inner
            .namespaces
            .get(namespace)
            .and_then(|ns| ns.hierarchy.get(&object.object_type))
            .and_then(|chains| chains.get(&object.object_id))
            .cloned()
            .unwrap_or_default()
    }

    // Host-application edit helpers: mutate a namespace's rows and append
    // the matching change record in one step, the way the surrounding
    // system's change logging does.

    pub fn create_object(
        &self,
        namespace: &str,
        user: Option<&str>,
        object_type: &str,
        data: SnapshotData,
    ) -> Result<ChangeRecord> {
        let id = {
            let mut inner = self.inner.write();
            let ns = inner
                .namespaces
                .get_mut(namespace)
                .ok_or_else(|| anyhow!("namespace {:?} does not exist", namespace))?;
            let seq = ns.sequences.entry(object_type.to_string()).or_insert(1);
            let id = *seq;
            *seq += 1;
            id
        };
        self.create_object_with_id(namespace, user, object_type, id, data)
    }

    pub fn create_object_with_id(
        &self,
        namespace: &str,
        user: Option<&str>,
        object_type: &str,
        id: i64,
        data: SnapshotData,
    ) -> Result<ChangeRecord> {
        let object = ObjectKey::new(object_type, id);
        {
            let mut inner = self.inner.write();
            let ns = inner
                .namespaces
                .get_mut(namespace)
                .ok_or_else(|| anyhow!("namespace {:?} does not exist", namespace))?;
            let rows = ns.objects.entry(object_type.to_string()).or_default();
            if rows.contains_key(&id) {
                bail!("object {} already exists in {:?}", object, namespace);
            }
            if let Some(constraint) = unique_violation(&self.registry, rows, &object, &data) {
                bail!("unique constraint {} violated in {:?}", constraint, namespace);
            }
            rows.insert(id, data.clone());
            rebuild_hierarchy(&self.registry, ns, object_type);
        }
        self.append_record(
            namespace,
            user,
            &object,
            ChangeAction::Create,
            None,
            Some(data),
        )
    }

    pub fn update_object(
        &self,
        namespace: &str,
        user: Option<&str>,
        object: &ObjectKey,
        attrs: SnapshotData,
    ) -> Result<ChangeRecord> {
        let (pre, post) = {
            let mut inner = self.inner.write();
            let ns = inner
                .namespaces
                .get_mut(namespace)
                .ok_or_else(|| anyhow!("namespace {:?} does not exist", namespace))?;
            let rows = ns.objects.entry(object.object_type.clone()).or_default();
            let current = rows
                .get(&object.object_id)
                .cloned()
                .ok_or_else(|| anyhow!("object {} not found in {:?}", object, namespace))?;
            let mut updated = current.clone();
            for (k, v) in attrs {
                updated.insert(k, v);
            }
            if let Some(constraint) = unique_violation(&self.registry, rows, object, &updated) {
                bail!("unique constraint {} violated in {:?}", constraint, namespace);
            }
            rows.insert(object.object_id, updated.clone());
            rebuild_hierarchy(&self.registry, ns, &object.object_type);
            (current, updated)
        };
        self.append_record(
            namespace,
            user,
            object,
            ChangeAction::Update,
            Some(pre),
            Some(post),
        )
    }

    pub fn delete_object(
        &self,
        namespace: &str,
        user: Option<&str>,
        object: &ObjectKey,
    ) -> Result<ChangeRecord> {
        let pre = {
            let mut inner = self.inner.write();
            let ns = inner
                .namespaces
                .get_mut(namespace)
                .ok_or_else(|| anyhow!("namespace {:?} does not exist", namespace))?;
            let rows = ns.objects.entry(object.object_type.clone()).or_default();
            let removed = rows
                .remove(&object.object_id)
                .ok_or_else(|| anyhow!("object {} not found in {:?}", object, namespace))?;
            rebuild_hierarchy(&self.registry, ns, &object.object_type);
            removed
        };
        self.append_record(
            namespace,
            user,
            object,
            ChangeAction::Delete,
            Some(pre),
            None,
        )
    }

    fn append_record(
        &self,
        namespace: &str,
        user: Option<&str>,
        object: &ObjectKey,
        action: ChangeAction,
        prechange: Option<SnapshotData>,
        postchange: Option<SnapshotData>,
    ) -> Result<ChangeRecord> {
        let mut inner = self.inner.write();
        let log = inner
            .changelogs
            .get_mut(namespace)
            .ok_or_else(|| anyhow!("no changelog for namespace {:?}", namespace))?;
        let record = ChangeRecord {
            seq: log.last().map(|r| r.seq + 1).unwrap_or(1),
            time: Utc::now(),
            user: user.map(|u| u.to_string()),
            object_type: object.object_type.clone(),
            object_id: object.object_id,
            action,
            prechange,
            postchange,
        };
        log.push(record.clone());
        Ok(record)
    }
}

#[async_trait::async_trait]
impl BranchStore for MemoryStore {
    async fn get_branch(&self, id: &BranchId) -> Result<Option<Branch>> {
        Ok(self.inner.read().branches.get(id).cloned())
    }

    async fn get_branch_by_name(&self, name: &str) -> Result<Option<Branch>> {
        Ok(self
            .inner
            .read()
            .branches
            .values()
            .find(|b| b.name == name)
            .cloned())
    }

    async fn list_branches(&self) -> Result<Vec<Branch>> {
        let mut branches: Vec<Branch> = self.inner.read().branches.values().cloned().collect();
        branches.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(branches)
    }

    async fn insert_branch(&self, branch: &Branch) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.branches.values().any(|b| b.name == branch.name) {
            bail!("branch named {:?} already exists", branch.name);
        }
        inner.branches.insert(branch.id, branch.clone());
        Ok(())
    }

    async fn update_branch(&self, branch: &Branch) -> Result<()> {
        let mut inner = self.inner.write();
        if !inner.branches.contains_key(&branch.id) {
            bail!("branch {} does not exist", branch.id);
        }
        inner.branches.insert(branch.id, branch.clone());
        Ok(())
    }

    async fn set_branch_status(&self, id: &BranchId, status: BranchStatus) -> Result<()> {
        let mut inner = self.inner.write();
        let branch = inner
            .branches
            .get_mut(id)
            .ok_or_else(|| anyhow!("branch {} does not exist", id))?;
        branch.status = status;
        Ok(())
    }

    async fn delete_branch(&self, id: &BranchId) -> Result<bool> {
        Ok(self.inner.write().branches.remove(id).is_some())
    }
}

#[async_trait::async_trait]
impl ChangeLogStore for MemoryStore {
    async fn append_change(
        &self,
        namespace: &str,
        change: NewChangeRecord,
    ) -> Result<ChangeRecord> {
        let object = ObjectKey::new(change.object_type.clone(), change.object_id);
        let mut inner = self.inner.write();
        let log = inner
            .changelogs
            .get_mut(namespace)
            .ok_or_else(|| anyhow!("no changelog for namespace {:?}", namespace))?;
        let record = ChangeRecord {
            seq: log.last().map(|r| r.seq + 1).unwrap_or(1),
            time: change.time,
            user: change.user,
            object_type: object.object_type,
            object_id: object.object_id,
            action: change.action,
            prechange: change.prechange,
            postchange: change.postchange,
        };
        log.push(record.clone());
        Ok(record)
    }

    async fn changes_in(&self, namespace: &str, from: i64, to: i64) -> Result<Vec<ChangeRecord>> {
        let inner = self.inner.read();
        let log = inner
            .changelogs
            .get(namespace)
            .ok_or_else(|| anyhow!("no changelog for namespace {:?}", namespace))?;
        Ok(log
            .iter()
            .filter(|r| r.seq >= from && r.seq < to)
            .cloned()
            .collect())
    }

    async fn all_changes(&self, namespace: &str) -> Result<Vec<ChangeRecord>> {
        let inner = self.inner.read();
        let log = inner
            .changelogs
            .get(namespace)
            .ok_or_else(|| anyhow!("no changelog for namespace {:?}", namespace))?;
        Ok(log.clone())
    }

    async fn changelog_head(&self, namespace: &str) -> Result<i64> {
        let inner = self.inner.read();
        let log = inner
            .changelogs
            .get(namespace)
            .ok_or_else(|| anyhow!("no changelog for namespace {:?}", namespace))?;
        Ok(log.last().map(|r| r.seq + 1).unwrap_or(1))
    }
}

#[async_trait::async_trait]
impl DiffStore for MemoryStore {
    async fn upsert_diff(&self, diff: &ChangeDiff) -> Result<()> {
        self.inner
            .write()
            .diffs
            .insert((diff.branch_id, diff.key()), diff.clone());
        Ok(())
    }

    async fn get_diff(
        &self,
        branch_id: &BranchId,
        object: &ObjectKey,
    ) -> Result<Option<ChangeDiff>> {
        Ok(self
            .inner
            .read()
            .diffs
            .get(&(*branch_id, object.clone()))
            .cloned())
    }

    async fn list_diffs(&self, branch_id: &BranchId) -> Result<Vec<ChangeDiff>> {
        let inner = self.inner.read();
        let mut diffs: Vec<ChangeDiff> = inner
            .diffs
            .values()
            .filter(|d| d.branch_id == *branch_id)
            .cloned()
            .collect();
        diffs.sort_by(|a, b| a.key().to_string().cmp(&b.key().to_string()));
        Ok(diffs)
    }

    async fn remove_diff(&self, branch_id: &BranchId, object: &ObjectKey) -> Result<bool> {
        Ok(self
            .inner
            .write()
            .diffs
            .remove(&(*branch_id, object.clone()))
            .is_some())
    }

    async fn clear_diffs(&self, branch_id: &BranchId) -> Result<()> {
        self.inner
            .write()
            .diffs
            .retain(|(id, _), _| id != branch_id);
        Ok(())
    }

    async fn acknowledge_diff(&self, branch_id: &BranchId, object: &ObjectKey) -> Result<bool> {
        let mut inner = self.inner.write();
        match inner.diffs.get_mut(&(*branch_id, object.clone())) {
            Some(diff) => {
                diff.acknowledged = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait::async_trait]
impl EventStore for MemoryStore {
    async fn append_event(&self, event: &BranchEvent) -> Result<()> {
        self.inner.write().events.push(event.clone());
        Ok(())
    }

    async fn events_for_branch(&self, branch_id: &BranchId) -> Result<Vec<BranchEvent>> {
        let inner = self.inner.read();
        let mut events: Vec<BranchEvent> = inner
            .events
            .iter()
            .filter(|e| e.branch_id == *branch_id)
            .cloned()
            .collect();
        events.sort_by(|a, b| b.time.cmp(&a.time));
        Ok(events)
    }
}

#[async_trait::async_trait]
impl AppliedChangeStore for MemoryStore {
    async fn merged_changes(&self, branch_id: &BranchId) -> Result<Vec<ChangeRecord>> {
        Ok(self
            .inner
            .read()
            .applied
            .get(branch_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn clear_merged_changes(&self, branch_id: &BranchId) -> Result<()> {
        self.inner.write().applied.remove(branch_id);
        Ok(())
    }
}

#[async_trait::async_trait]
impl NamespaceStore for MemoryStore {
    async fn provision_namespace(&self, source: &str, target: &str) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.namespaces.contains_key(target) {
            bail!("namespace {:?} already exists", target);
        }
        let cloned = inner
            .namespaces
            .get(source)
            .cloned()
            .ok_or_else(|| anyhow!("source namespace {:?} does not exist", source))?;
        inner.namespaces.insert(target.to_string(), cloned);
        inner.changelogs.insert(target.to_string(), Vec::new());
        Ok(())
    }

    async fn deprovision_namespace(&self, namespace: &str) -> Result<()> {
        let mut inner = self.inner.write();
        inner.namespaces.remove(namespace);
        inner.changelogs.remove(namespace);
        Ok(())
    }

    async fn namespace_exists(&self, namespace: &str) -> Result<bool> {
        Ok(self.inner.read().namespaces.contains_key(namespace))
    }

    async fn next_object_id(&self, namespace: &str, object_type: &str) -> Result<i64> {
        let mut inner = self.inner.write();
        let ns = inner
            .namespaces
            .get_mut(namespace)
            .ok_or_else(|| anyhow!("namespace {:?} does not exist", namespace))?;
        let seq = ns.sequences.entry(object_type.to_string()).or_insert(1);
        let id = *seq;
        *seq += 1;
        Ok(id)
    }

    async fn get_object(
        &self,
        namespace: &str,
        object: &ObjectKey,
    ) -> Result<Option<SnapshotData>> {
        let inner = self.inner.read();
        Ok(inner
            .namespaces
            .get(namespace)
            .and_then(|ns| ns.objects.get(&object.object_type))
            .and_then(|rows| rows.get(&object.object_id))
            .cloned())
    }

    async fn begin(&self, namespace: &str) -> Result<Box<dyn ObjectTx>> {
        let staged = {
            let inner = self.inner.read();
            inner
                .namespaces
                .get(namespace)
                .cloned()
                .ok_or_else(|| anyhow!("namespace {:?} does not exist", namespace))?
        };
        Ok(Box::new(MemoryObjectTx {
            registry: self.registry.clone(),
            inner: self.inner.clone(),
            namespace: namespace.to_string(),
            staged,
            staged_events: Vec::new(),
            staged_applied: Vec::new(),
        }))
    }
}

/// Staged copy of one namespace; swapped in atomically on commit, discarded
/// on rollback.
struct MemoryObjectTx {
    registry: Arc<TypeRegistry>,
    inner: Arc<RwLock<MemoryInner>>,
    namespace: String,
    staged: NamespaceData,
    staged_events: Vec<BranchEvent>,
    staged_applied: Vec<(BranchId, ChangeRecord)>,
}

#[async_trait::async_trait]
impl ObjectTx for MemoryObjectTx {
    async fn get(&mut self, object: &ObjectKey) -> Result<Option<SnapshotData>> {
        Ok(self
            .staged
            .objects
            .get(&object.object_type)
            .and_then(|rows| rows.get(&object.object_id))
            .cloned())
    }

    async fn insert(&mut self, object: &ObjectKey, data: &SnapshotData) -> Result<InsertOutcome> {
        let rows = self
            .staged
            .objects
            .entry(object.object_type.clone())
            .or_default();
        if rows.contains_key(&object.object_id) {
            return Ok(InsertOutcome::Conflict {
                constraint: format!("{}_pkey", object.object_type),
            });
        }
        if let Some(constraint) = unique_violation(&self.registry, rows, object, data) {
            return Ok(InsertOutcome::Conflict { constraint });
        }
        rows.insert(object.object_id, data.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn update(&mut self, object: &ObjectKey, attrs: &SnapshotData) -> Result<bool> {
        let rows = self
            .staged
            .objects
            .entry(object.object_type.clone())
            .or_default();
        let Some(current) = rows.get(&object.object_id).cloned() else {
            return Ok(false);
        };
        let mut updated = current;
        for (k, v) in attrs {
            updated.insert(k.clone(), v.clone());
        }
        if let Some(constraint) = unique_violation(&self.registry, rows, object, &updated) {
            bail!("unique constraint {} violated by update of {}", constraint, object);
        }
        rows.insert(object.object_id, updated);
        Ok(true)
    }

    async fn delete(&mut self, object: &ObjectKey) -> Result<bool> {
        Ok(self
            .staged
            .objects
            .get_mut(&object.object_type)
            .and_then(|rows| rows.remove(&object.object_id))
            .is_some())
    }

    async fn rebuild_hierarchy(&mut self, object_type: &str) -> Result<()> {
        rebuild_hierarchy(&self.registry, &mut self.staged, object_type);
        Ok(())
    }

    async fn record_event(&mut self, event: BranchEvent) -> Result<()> {
        self.staged_events.push(event);
        Ok(())
    }

    async fn record_applied(&mut self, branch_id: &BranchId, change: &ChangeRecord) -> Result<()> {
        self.staged_applied.push((*branch_id, change.clone()));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let this = *self;
        let mut inner = this.inner.write();
        inner.namespaces.insert(this.namespace, this.staged);
        inner.events.extend(this.staged_events);
        for (branch_id, change) in this.staged_applied {
            inner.applied.entry(branch_id).or_default().push(change);
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
