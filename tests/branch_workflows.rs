//! End-to-end branch workflows over the in-memory store: provisioning,
//! isolation, sync, merge, revert, conflicts, and failure handling.

use branchdb::config::BranchingConfig;
use branchdb::logic::{BranchService, MergeStrategy, NewBranch, PolicyDecision};
use branchdb::model::{
    Branch, BranchAction, BranchEventKind, BranchStatus, ObjectKey, ObjectTypeDef, SnapshotData,
    TypeRegistry,
};
use branchdb::store::{
    AppliedChangeStore, BranchStore, DiffStore, EventStore, MemoryStore, NamespaceStore,
};
use branchdb::BranchError;
use serde_json::json;
use std::sync::Arc;

const MAIN: &str = "public";

fn snapshot(pairs: &[(&str, serde_json::Value)]) -> SnapshotData {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn registry() -> Arc<TypeRegistry> {
    Arc::new(
        TypeRegistry::new(
            vec![
                ObjectTypeDef::new("site").with_unique(&["name"]),
                ObjectTypeDef::new("device")
                    .with_unique(&["name"])
                    .with_reference("site", "site"),
                ObjectTypeDef::new("tenant").with_unique(&["name"]),
            ],
            vec![],
        )
        .unwrap(),
    )
}

fn service_with_config(config: BranchingConfig) -> (Arc<MemoryStore>, BranchService<MemoryStore>) {
    let registry = registry();
    let store = Arc::new(MemoryStore::new(registry.clone(), MAIN));
    let service = BranchService::new(store.clone(), registry, config);
    (store, service)
}

/// Store seeded with a site, a device on it, and a tenant.
fn seeded() -> (Arc<MemoryStore>, BranchService<MemoryStore>) {
    let (store, service) = service_with_config(BranchingConfig::default());
    store
        .create_object(MAIN, None, "site", snapshot(&[("name", json!("dc1"))]))
        .unwrap();
    store
        .create_object(
            MAIN,
            None,
            "device",
            snapshot(&[
                ("name", json!("core-sw")),
                ("description", json!("foo")),
                ("site", json!(1)),
            ]),
        )
        .unwrap();
    store
        .create_object(MAIN, None, "tenant", snapshot(&[("name", json!("acme"))]))
        .unwrap();
    (store, service)
}

async fn provisioned(service: &BranchService<MemoryStore>, name: &str) -> Branch {
    let branch = service
        .create_branch(NewBranch {
            name: name.to_string(),
            owner: Some("alice".to_string()),
            description: None,
        })
        .await
        .unwrap();
    service.provision(&branch.id, Some("alice")).await.unwrap();
    service.store().get_branch(&branch.id).await.unwrap().unwrap()
}

fn main_state(store: &MemoryStore) -> Vec<(String, Vec<(i64, SnapshotData)>)> {
    ["site", "device", "tenant"]
        .iter()
        .map(|t| (t.to_string(), store.list_objects(MAIN, t)))
        .collect()
}

#[tokio::test]
async fn provisioning_copies_contents_and_sequences() {
    let (store, service) = seeded();
    let branch = provisioned(&service, "feature").await;
    let ns = service.namespace(&branch);

    assert_eq!(branch.status, BranchStatus::Ready);
    assert_eq!(store.list_objects(&ns, "site").len(), 1);
    assert_eq!(store.list_objects(&ns, "device").len(), 1);

    // Sequences are copied at their current value, so the branch's next id
    // matches main's at the time of the copy.
    let main_next = store.next_object_id(MAIN, "site").await.unwrap();
    let branch_next = store.next_object_id(&ns, "site").await.unwrap();
    assert_eq!(main_next, branch_next);
}

#[tokio::test]
async fn branches_are_isolated_from_main_and_each_other() {
    let (store, service) = seeded();
    let b1 = provisioned(&service, "b1").await;
    let b2 = provisioned(&service, "b2").await;
    let ns1 = service.namespace(&b1);
    let ns2 = service.namespace(&b2);

    store
        .create_object(&ns1, Some("alice"), "site", snapshot(&[("name", json!("dc2"))]))
        .unwrap();

    assert_eq!(store.list_objects(&ns1, "site").len(), 2);
    assert_eq!(store.list_objects(&ns2, "site").len(), 1, "b2 must not see b1's edit");
    assert_eq!(store.list_objects(MAIN, "site").len(), 1, "main must not see b1's edit");
}

#[tokio::test]
async fn sync_applies_main_changes_and_is_idempotent() {
    let (store, service) = seeded();
    let branch = provisioned(&service, "feature").await;
    let ns = service.namespace(&branch);

    // Main advances after the branch diverged.
    store
        .update_object(
            MAIN,
            Some("bob"),
            &ObjectKey::new("site", 1),
            snapshot(&[("name", json!("dc1-renamed"))]),
        )
        .unwrap();

    let report = service.sync(&branch.id, Some("alice"), true).await.unwrap();
    assert_eq!(report.outcomes.len(), 1);
    let synced = store
        .get_object(&ns, &ObjectKey::new("site", 1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(synced.get("name"), Some(&json!("dc1-renamed")));

    let after_first = service.store().get_branch(&branch.id).await.unwrap().unwrap();

    // A second sync with no intervening changes is a no-op.
    let report = service.sync(&branch.id, Some("alice"), true).await.unwrap();
    assert!(report.outcomes.is_empty());
    let after_second = service.store().get_branch(&branch.id).await.unwrap().unwrap();
    assert_eq!(after_first.last_sync, after_second.last_sync);

    let sync_events = service
        .store()
        .events_for_branch(&branch.id)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.kind == BranchEventKind::Synced)
        .count();
    assert_eq!(sync_events, 1, "the no-op sync records no event");
}

#[tokio::test]
async fn merge_then_revert_restores_main_exactly() {
    let (store, service) = seeded();
    let branch = provisioned(&service, "feature").await;
    let ns = service.namespace(&branch);
    let before = main_state(&store);

    // Branch work: create a site, update the device, delete the tenant.
    store
        .create_object(&ns, Some("alice"), "site", snapshot(&[("name", json!("dc2"))]))
        .unwrap();
    store
        .update_object(
            &ns,
            Some("alice"),
            &ObjectKey::new("device", 1),
            snapshot(&[("description", json!("bar"))]),
        )
        .unwrap();
    store
        .delete_object(&ns, Some("alice"), &ObjectKey::new("tenant", 1))
        .unwrap();

    service
        .merge(&branch.id, Some("alice"), true, MergeStrategy::Iterative)
        .await
        .unwrap();

    let merged = service.store().get_branch(&branch.id).await.unwrap().unwrap();
    assert_eq!(merged.status, BranchStatus::Merged);
    assert!(merged.merged_time.is_some());
    assert_eq!(merged.merged_by.as_deref(), Some("alice"));
    assert_eq!(store.list_objects(MAIN, "site").len(), 2);
    assert!(store.list_objects(MAIN, "tenant").is_empty());
    let device = store
        .get_object(MAIN, &ObjectKey::new("device", 1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(device.get("description"), Some(&json!("bar")));

    // Revert replays the merge window in reverse: re-create the tenant,
    // restore the device, delete the site.
    let report = service.revert(&branch.id, Some("bob"), true).await.unwrap();
    assert_eq!(report.outcomes[0].object, ObjectKey::new("tenant", 1));

    assert_eq!(main_state(&store), before, "main restored exactly");
    let reverted = service.store().get_branch(&branch.id).await.unwrap().unwrap();
    assert_eq!(reverted.status, BranchStatus::Ready, "re-mergeable after revert");
    assert_eq!(reverted.merged_time, None);
    assert!(service
        .store()
        .merged_changes(&branch.id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn conflicts_require_acknowledgment_before_commit() {
    let (store, service) = seeded();
    let branch = provisioned(&service, "feature").await;
    let ns = service.namespace(&branch);
    let device = ObjectKey::new("device", 1);

    store
        .update_object(&ns, Some("alice"), &device, snapshot(&[("description", json!("planned"))]))
        .unwrap();
    store
        .update_object(MAIN, Some("bob"), &device, snapshot(&[("description", json!("staged"))]))
        .unwrap();

    let diffs = service.refresh_diffs(&branch.id).await.unwrap();
    assert_eq!(diffs.len(), 1);
    assert_eq!(diffs[0].conflicts, vec!["description"]);

    // commit=true is blocked; a dry run is always permitted.
    let err = service
        .merge(&branch.id, Some("alice"), true, MergeStrategy::Iterative)
        .await
        .unwrap_err();
    assert!(matches!(err, BranchError::UnacknowledgedConflicts { .. }));
    let report = service
        .merge(&branch.id, Some("alice"), false, MergeStrategy::Iterative)
        .await
        .unwrap();
    assert!(report.dry_run);

    service.acknowledge(&branch.id, &device).await.unwrap();
    service
        .merge(&branch.id, Some("alice"), true, MergeStrategy::Iterative)
        .await
        .unwrap();
    let data = store.get_object(MAIN, &device).await.unwrap().unwrap();
    assert_eq!(data.get("description"), Some(&json!("planned")));
}

#[tokio::test]
async fn attribute_untouched_in_main_never_conflicts() {
    let (store, service) = seeded();
    let branch = provisioned(&service, "feature").await;
    let ns = service.namespace(&branch);
    let device = ObjectKey::new("device", 1);

    store
        .update_object(&ns, Some("alice"), &device, snapshot(&[("description", json!("planned"))]))
        .unwrap();
    // Main touches a different attribute of the same object.
    store
        .update_object(MAIN, Some("bob"), &device, snapshot(&[("name", json!("core-sw-2"))]))
        .unwrap();

    let diffs = service.refresh_diffs(&branch.id).await.unwrap();
    assert!(diffs[0].conflicts.is_empty());
    service
        .merge(&branch.id, Some("alice"), true, MergeStrategy::Iterative)
        .await
        .unwrap();
}

#[tokio::test]
async fn dry_run_merge_leaves_no_trace() {
    let (store, service) = seeded();
    let branch = provisioned(&service, "feature").await;
    let ns = service.namespace(&branch);

    store
        .create_object(&ns, Some("alice"), "site", snapshot(&[("name", json!("dc2"))]))
        .unwrap();
    store
        .delete_object(&ns, Some("alice"), &ObjectKey::new("tenant", 1))
        .unwrap();

    let before_rows = main_state(&store);
    let before_branch = service.store().get_branch(&branch.id).await.unwrap().unwrap();

    let report = service
        .merge(&branch.id, Some("alice"), false, MergeStrategy::Iterative)
        .await
        .unwrap();
    assert!(report.dry_run);
    assert_eq!(report.outcomes.len(), 2, "the dry run evaluates the full window");

    let after_branch = service.store().get_branch(&branch.id).await.unwrap().unwrap();
    assert_eq!(main_state(&store), before_rows, "main rows bit-identical");
    assert_eq!(after_branch.status, BranchStatus::Ready);
    assert_eq!(after_branch.last_sync, before_branch.last_sync);
    assert_eq!(after_branch.merged_time, None);
    assert!(service
        .store()
        .merged_changes(&branch.id)
        .await
        .unwrap()
        .is_empty());
    let merged_events = service
        .store()
        .events_for_branch(&branch.id)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.kind == BranchEventKind::Merged)
        .count();
    assert_eq!(merged_events, 0);
}

#[tokio::test]
async fn duplicate_create_fails_and_squash_recovers() {
    let (store, service) = seeded();
    let branch = provisioned(&service, "feature").await;
    let ns = service.namespace(&branch);

    // The same unique name lands independently on both sides.
    store
        .create_object_with_id(MAIN, Some("bob"), "site", 10, snapshot(&[("name", json!("edge1"))]))
        .unwrap();
    store
        .create_object_with_id(&ns, Some("alice"), "site", 20, snapshot(&[("name", json!("edge1"))]))
        .unwrap();

    let err = service
        .merge(&branch.id, Some("alice"), true, MergeStrategy::Iterative)
        .await
        .unwrap_err();
    assert!(matches!(err, BranchError::IdentityCollision { .. }));
    let after = service.store().get_branch(&branch.id).await.unwrap().unwrap();
    assert_eq!(after.status, BranchStatus::Ready, "failed merge restores ready");

    // The corrective edit supersedes the offending value only under squash;
    // an iterative replay would re-apply the original create first.
    store
        .update_object(
            &ns,
            Some("alice"),
            &ObjectKey::new("site", 20),
            snapshot(&[("name", json!("edge1-feature"))]),
        )
        .unwrap();
    let err = service
        .merge(&branch.id, Some("alice"), true, MergeStrategy::Iterative)
        .await
        .unwrap_err();
    assert!(matches!(err, BranchError::IdentityCollision { .. }));

    service
        .merge(&branch.id, Some("alice"), true, MergeStrategy::Squash)
        .await
        .unwrap();
    let names: Vec<String> = store
        .list_objects(MAIN, "site")
        .into_iter()
        .filter_map(|(_, d)| d.get("name").and_then(|v| v.as_str()).map(String::from))
        .collect();
    assert!(names.contains(&"edge1".to_string()));
    assert!(names.contains(&"edge1-feature".to_string()));
    let merged = service.store().get_branch(&branch.id).await.unwrap().unwrap();
    assert!(merged.merged_with_squash);
}

#[tokio::test]
async fn update_after_delete_in_main_fails_the_merge() {
    let (store, service) = seeded();
    let branch = provisioned(&service, "feature").await;
    let ns = service.namespace(&branch);
    let device = ObjectKey::new("device", 1);

    store
        .update_object(&ns, Some("alice"), &device, snapshot(&[("description", json!("bar"))]))
        .unwrap();
    store.delete_object(MAIN, Some("bob"), &device).unwrap();

    let err = service
        .merge(&branch.id, Some("alice"), true, MergeStrategy::Iterative)
        .await
        .unwrap_err();
    assert!(matches!(err, BranchError::MissingTarget { .. }));
    let after = service.store().get_branch(&branch.id).await.unwrap().unwrap();
    assert_eq!(after.status, BranchStatus::Ready, "branch itself is not corrupt");
}

#[tokio::test]
async fn stale_branches_refuse_sync_and_merge() {
    let (store, service) = seeded();
    let branch = provisioned(&service, "feature").await;

    let mut stale = service.store().get_branch(&branch.id).await.unwrap().unwrap();
    stale.last_sync_time = Some(chrono::Utc::now() - chrono::Duration::days(120));
    service.store().update_branch(&stale).await.unwrap();
    // Give it something it would otherwise sync.
    store
        .update_object(
            MAIN,
            None,
            &ObjectKey::new("site", 1),
            snapshot(&[("name", json!("dc1-x"))]),
        )
        .unwrap();

    assert!(matches!(
        service.sync(&branch.id, None, true).await.unwrap_err(),
        BranchError::StaleBranch { .. }
    ));
    assert!(matches!(
        service
            .merge(&branch.id, None, true, MergeStrategy::Iterative)
            .await
            .unwrap_err(),
        BranchError::StaleBranch { .. }
    ));
}

#[tokio::test]
async fn branch_limits_are_enforced_at_creation() {
    let mut config = BranchingConfig::default();
    config.max_working_branches = Some(2);
    let (_store, service) = service_with_config(config);

    for name in ["a", "b"] {
        service
            .create_branch(NewBranch {
                name: name.to_string(),
                owner: None,
                description: None,
            })
            .await
            .unwrap();
    }
    let err = service
        .create_branch(NewBranch {
            name: "c".to_string(),
            owner: None,
            description: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, BranchError::BranchLimit(_)));
}

#[tokio::test]
async fn concurrent_operation_fails_fast() {
    let (store, service) = seeded();
    let branch = provisioned(&service, "feature").await;
    store
        .update_object(
            MAIN,
            None,
            &ObjectKey::new("site", 1),
            snapshot(&[("name", json!("dc1-x"))]),
        )
        .unwrap();

    let _guard = service.lifecycle().lock(branch.id).unwrap();
    let err = service.sync(&branch.id, None, true).await.unwrap_err();
    assert!(matches!(err, BranchError::OperationInFlight(_)));
}

#[tokio::test]
async fn policy_denial_blocks_commit_but_not_dry_run() {
    let (store, service) = seeded();
    let branch = provisioned(&service, "feature").await;
    let ns = service.namespace(&branch);
    store
        .create_object(&ns, None, "site", snapshot(&[("name", json!("dc2"))]))
        .unwrap();

    service.lifecycle().register_validator(|_, action| {
        if action == BranchAction::Merge {
            PolicyDecision::Deny("merges are frozen".to_string())
        } else {
            PolicyDecision::Allow
        }
    });

    let err = service
        .merge(&branch.id, None, true, MergeStrategy::Iterative)
        .await
        .unwrap_err();
    assert!(matches!(err, BranchError::PolicyDenied { .. }));

    let report = service
        .merge(&branch.id, None, false, MergeStrategy::Iterative)
        .await
        .unwrap();
    assert!(report.dry_run);
}

#[tokio::test]
async fn archive_deprovisions_and_is_terminal() {
    let (store, service) = seeded();
    let branch = provisioned(&service, "feature").await;
    let ns = service.namespace(&branch);

    service.archive(&branch.id, Some("alice")).await.unwrap();
    let archived = service.store().get_branch(&branch.id).await.unwrap().unwrap();
    assert_eq!(archived.status, BranchStatus::Archived);
    assert!(!store.namespace_exists(&ns).await.unwrap());

    // Terminal: no further operations are legal.
    assert!(matches!(
        service.sync(&branch.id, None, true).await.unwrap_err(),
        BranchError::InvalidTransition { .. }
    ));
}

#[tokio::test]
async fn sibling_branch_bookkeeping_notes_the_merge() {
    let (store, service) = seeded();
    let merging = provisioned(&service, "merging").await;
    let watching = provisioned(&service, "watching").await;
    let merging_ns = service.namespace(&merging);
    let watching_ns = service.namespace(&watching);
    let site = ObjectKey::new("site", 1);

    // Both branches touch the same object; one merges first.
    store
        .update_object(&merging_ns, Some("alice"), &site, snapshot(&[("name", json!("dc1-a"))]))
        .unwrap();
    store
        .update_object(&watching_ns, Some("bob"), &site, snapshot(&[("name", json!("dc1-b"))]))
        .unwrap();

    service
        .merge(&merging.id, Some("alice"), true, MergeStrategy::Iterative)
        .await
        .unwrap();

    // The watcher's diff now shows a conflict against the new main state,
    // and the cause is recorded against the watching branch.
    let diffs = service.store().list_diffs(&watching.id).await.unwrap();
    assert_eq!(diffs.len(), 1);
    assert_eq!(diffs[0].conflicts, vec!["name"]);
    let related: Vec<_> = service
        .store()
        .events_for_branch(&watching.id)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.related_branch_id == Some(merging.id))
        .collect();
    assert_eq!(related.len(), 1);
}

#[tokio::test]
async fn delete_branch_removes_namespace_and_bookkeeping() {
    let (store, service) = seeded();
    let branch = provisioned(&service, "feature").await;
    let ns = service.namespace(&branch);
    store
        .create_object(&ns, None, "site", snapshot(&[("name", json!("dc2"))]))
        .unwrap();
    service.refresh_diffs(&branch.id).await.unwrap();

    service.delete_branch(&branch.id).await.unwrap();
    assert!(service.store().get_branch(&branch.id).await.unwrap().is_none());
    assert!(!store.namespace_exists(&ns).await.unwrap());
    assert!(service.store().list_diffs(&branch.id).await.unwrap().is_empty());
}
