use anyhow::anyhow;
use log::debug;
use std::collections::BTreeSet;

use crate::error::BranchError;
use crate::model::{ChangeAction, ChangeRecord, ObjectKey, TypeRegistry};
use crate::store::traits::{InsertOutcome, ObjectTx};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayDirection {
    /// Apply the window in ascending sequence order (sync, merge).
    Forward,
    /// Replay in reverse sequence order with each action inverted (revert).
    Reverse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Applied,
    Skipped,
}

/// Per-object outcome of one replayed change record.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayOutcome {
    pub object: ObjectKey,
    pub action: ChangeAction,
    pub disposition: Disposition,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplayReport {
    pub outcomes: Vec<ReplayOutcome>,
}

impl ReplayReport {
    pub fn applied(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.disposition == Disposition::Applied)
            .count()
    }

    pub fn skipped(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.disposition == Disposition::Skipped)
            .count()
    }
}

/// Applies an ordered changelog window against a target namespace, one
/// record at a time inside the caller's transaction. Any single failure
/// aborts the whole window; the caller rolls the transaction back.
pub struct ReplayEngine<'a> {
    registry: &'a TypeRegistry,
}

impl<'a> ReplayEngine<'a> {
    pub fn new(registry: &'a TypeRegistry) -> Self {
        Self { registry }
    }

    /// Replay a window. The window must be in ascending sequence order;
    /// Reverse iterates it back-to-front and inverts each action. Derived
    /// hierarchy data of touched types is rebuilt once, after the whole
    /// window, never per record.
    pub async fn replay(
        &self,
        tx: &mut dyn ObjectTx,
        window: &[ChangeRecord],
        direction: ReplayDirection,
    ) -> Result<ReplayReport, BranchError> {
        for pair in window.windows(2) {
            if pair[1].seq <= pair[0].seq {
                return Err(BranchError::OutOfOrderWindow { seq: pair[1].seq });
            }
        }

        let mut report = ReplayReport::default();
        let mut touched: BTreeSet<String> = BTreeSet::new();

        let records: Vec<&ChangeRecord> = match direction {
            ReplayDirection::Forward => window.iter().collect(),
            ReplayDirection::Reverse => window.iter().rev().collect(),
        };

        for record in records {
            touched.insert(record.object_type.clone());
            let disposition = match direction {
                ReplayDirection::Forward => self.apply(tx, record).await?,
                ReplayDirection::Reverse => self.undo(tx, record).await?,
            };
            report.outcomes.push(ReplayOutcome {
                object: record.key(),
                action: record.action,
                disposition,
            });
        }

        for object_type in &touched {
            if self
                .registry
                .get(object_type)
                .map(|d| d.hierarchical)
                .unwrap_or(false)
            {
                debug!("rebuilding hierarchy for {}", object_type);
                tx.rebuild_hierarchy(object_type).await?;
            }
        }

        Ok(report)
    }

    /// Apply one record as written.
    async fn apply(
        &self,
        tx: &mut dyn ObjectTx,
        record: &ChangeRecord,
    ) -> Result<Disposition, BranchError> {
        let object = record.key();
        match record.action {
            ChangeAction::Create => {
                debug!("creating {}", object);
                let data = record
                    .postchange
                    .as_ref()
                    .ok_or_else(|| anyhow!("create record {} has no post-change snapshot", object))?;
                match tx.insert(&object, data).await? {
                    InsertOutcome::Inserted => Ok(Disposition::Applied),
                    InsertOutcome::Conflict { constraint } => {
                        Err(BranchError::IdentityCollision { object, constraint })
                    }
                }
            }
            ChangeAction::Update => {
                debug!("updating {}", object);
                let diff = record.diff();
                if tx.update(&object, &diff.post).await? {
                    Ok(Disposition::Applied)
                } else {
                    Err(BranchError::MissingTarget {
                        object,
                        action: ChangeAction::Update,
                    })
                }
            }
            ChangeAction::Delete => {
                if tx.delete(&object).await? {
                    debug!("deleted {}", object);
                    Ok(Disposition::Applied)
                } else {
                    // Tolerated only as an idempotent re-run of the same
                    // window; out-of-order application fails elsewhere.
                    debug!("{} already deleted; skipping", object);
                    Ok(Disposition::Skipped)
                }
            }
        }
    }

    /// Apply the inverse of one record.
    async fn undo(
        &self,
        tx: &mut dyn ObjectTx,
        record: &ChangeRecord,
    ) -> Result<Disposition, BranchError> {
        let object = record.key();
        match record.action {
            // A prior create becomes a delete of that identity.
            ChangeAction::Create => {
                debug!("undoing creation of {}", object);
                if tx.delete(&object).await? {
                    Ok(Disposition::Applied)
                } else {
                    debug!("{} does not exist; skipping", object);
                    Ok(Disposition::Skipped)
                }
            }
            // A prior update restores the pre-change values of the fields it
            // touched.
            ChangeAction::Update => {
                debug!("undoing update of {}", object);
                let diff = record.diff();
                if tx.update(&object, &diff.pre).await? {
                    Ok(Disposition::Applied)
                } else {
                    debug!("{} does not exist; skipping", object);
                    Ok(Disposition::Skipped)
                }
            }
            // A prior delete becomes a re-creation from the pre-change
            // snapshot, identity and reference attributes included.
            ChangeAction::Delete => {
                debug!("undoing deletion of {}", object);
                let data = record
                    .prechange
                    .as_ref()
                    .ok_or_else(|| anyhow!("delete record {} has no pre-change snapshot", object))?;
                match tx.insert(&object, data).await? {
                    InsertOutcome::Inserted => Ok(Disposition::Applied),
                    InsertOutcome::Conflict { constraint } => {
                        Err(BranchError::IdentityCollision { object, constraint })
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ObjectTypeDef, SnapshotData};
    use crate::store::memory::MemoryStore;
    use crate::store::traits::NamespaceStore;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::Arc;

    fn registry() -> Arc<TypeRegistry> {
        Arc::new(
            TypeRegistry::new(vec![ObjectTypeDef::new("site").with_unique(&["name"])], vec![])
                .unwrap(),
        )
    }

    fn snapshot(pairs: &[(&str, serde_json::Value)]) -> SnapshotData {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn record(
        seq: i64,
        action: ChangeAction,
        id: i64,
        pre: Option<SnapshotData>,
        post: Option<SnapshotData>,
    ) -> ChangeRecord {
        ChangeRecord {
            seq,
            time: Utc::now(),
            user: None,
            object_type: "site".to_string(),
            object_id: id,
            action,
            prechange: pre,
            postchange: post,
        }
    }

    #[tokio::test]
    async fn create_then_update_applies_in_order() {
        let registry = registry();
        let store = MemoryStore::new(registry.clone(), "main");
        let window = vec![
            record(
                1,
                ChangeAction::Create,
                1,
                None,
                Some(snapshot(&[("name", json!("dc1")), ("a", json!(1))])),
            ),
            record(
                2,
                ChangeAction::Update,
                1,
                Some(snapshot(&[("name", json!("dc1")), ("a", json!(1))])),
                Some(snapshot(&[("name", json!("dc1")), ("a", json!(2))])),
            ),
        ];

        let engine = ReplayEngine::new(&registry);
        let mut tx = store.begin("main").await.unwrap();
        let report = engine
            .replay(tx.as_mut(), &window, ReplayDirection::Forward)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(report.applied(), 2);
        let data = store
            .get_object("main", &ObjectKey::new("site", 1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(data.get("a"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn update_before_create_fails() {
        let registry = registry();
        let store = MemoryStore::new(registry.clone(), "main");
        // Same records, swapped seq order: the window itself is rejected.
        let window = vec![
            record(
                2,
                ChangeAction::Update,
                1,
                Some(snapshot(&[("a", json!(1))])),
                Some(snapshot(&[("a", json!(2))])),
            ),
            record(
                1,
                ChangeAction::Create,
                1,
                None,
                Some(snapshot(&[("a", json!(1))])),
            ),
        ];

        let engine = ReplayEngine::new(&registry);
        let mut tx = store.begin("main").await.unwrap();
        let err = engine
            .replay(tx.as_mut(), &window, ReplayDirection::Forward)
            .await
            .unwrap_err();
        assert!(matches!(err, BranchError::OutOfOrderWindow { seq: 1 }));

        // An update whose target was never created is a missing-target
        // replay error.
        let window = vec![record(
            5,
            ChangeAction::Update,
            9,
            Some(snapshot(&[("a", json!(1))])),
            Some(snapshot(&[("a", json!(2))])),
        )];
        let err = engine
            .replay(tx.as_mut(), &window, ReplayDirection::Forward)
            .await
            .unwrap_err();
        assert!(matches!(err, BranchError::MissingTarget { .. }));
        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_create_is_surfaced_not_skipped() {
        let registry = registry();
        let store = MemoryStore::new(registry.clone(), "main");
        store
            .create_object_with_id("main", None, "site", 1, snapshot(&[("name", json!("dc1"))]))
            .unwrap();

        let engine = ReplayEngine::new(&registry);
        let mut tx = store.begin("main").await.unwrap();
        let window = vec![record(
            1,
            ChangeAction::Create,
            1,
            None,
            Some(snapshot(&[("name", json!("other"))])),
        )];
        let err = engine
            .replay(tx.as_mut(), &window, ReplayDirection::Forward)
            .await
            .unwrap_err();
        assert!(matches!(err, BranchError::IdentityCollision { .. }));
        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn reverse_replay_inverts_each_action() {
        let registry = registry();
        let store = MemoryStore::new(registry.clone(), "main");
        // Main currently holds the post-merge state: site 1 created, site 2
        // updated, site 3 deleted.
        store
            .create_object_with_id("main", None, "site", 1, snapshot(&[("name", json!("new"))]))
            .unwrap();
        store
            .create_object_with_id(
                "main",
                None,
                "site",
                2,
                snapshot(&[("name", json!("dc2")), ("desc", json!("bar"))]),
            )
            .unwrap();

        let window = vec![
            record(
                1,
                ChangeAction::Create,
                1,
                None,
                Some(snapshot(&[("name", json!("new"))])),
            ),
            record(
                2,
                ChangeAction::Update,
                2,
                Some(snapshot(&[("name", json!("dc2")), ("desc", json!("foo"))])),
                Some(snapshot(&[("name", json!("dc2")), ("desc", json!("bar"))])),
            ),
            record(
                3,
                ChangeAction::Delete,
                3,
                Some(snapshot(&[("name", json!("gone"))])),
                None,
            ),
        ];

        let engine = ReplayEngine::new(&registry);
        let mut tx = store.begin("main").await.unwrap();
        let report = engine
            .replay(tx.as_mut(), &window, ReplayDirection::Reverse)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(report.applied(), 3);
        // Undo order: re-create 3, restore 2, delete 1.
        assert_eq!(
            report.outcomes[0].object,
            ObjectKey::new("site", 3)
        );
        assert!(store
            .get_object("main", &ObjectKey::new("site", 1))
            .await
            .unwrap()
            .is_none());
        let restored = store
            .get_object("main", &ObjectKey::new("site", 2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(restored.get("desc"), Some(&json!("foo")));
        let recreated = store
            .get_object("main", &ObjectKey::new("site", 3))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(recreated.get("name"), Some(&json!("gone")));
    }

    #[tokio::test]
    async fn delete_of_absent_row_is_skipped() {
        let registry = registry();
        let store = MemoryStore::new(registry.clone(), "main");
        let engine = ReplayEngine::new(&registry);
        let mut tx = store.begin("main").await.unwrap();
        let window = vec![record(
            1,
            ChangeAction::Delete,
            7,
            Some(snapshot(&[("name", json!("x"))])),
            None,
        )];
        let report = engine
            .replay(tx.as_mut(), &window, ReplayDirection::Forward)
            .await
            .unwrap();
        assert_eq!(report.skipped(), 1);
        tx.rollback().await.unwrap();
    }
}
