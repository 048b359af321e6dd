use anyhow::{anyhow, bail, Context, Result};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::sync::Arc;

use crate::model::{
    Branch, BranchEvent, BranchEventKind, BranchId, BranchStatus, ChangeAction, ChangeDiff,
    ChangeRecord, NewChangeRecord, ObjectKey, SnapshotData, TypeRegistry,
};
use crate::store::traits::{
    AppliedChangeStore, BranchStore, ChangeLogStore, DiffStore, EventStore, InsertOutcome,
    NamespaceStore, ObjectTx,
};

/// Engine bookkeeping tables living in the main schema; never replicated
/// into branch namespaces.
const META_TABLES: &[&str] = &[
    "branch",
    "branch_event",
    "change_diff",
    "applied_change",
    "change_log",
];

/// Postgres-backed store. Branch isolation uses one schema per branch;
/// object rows are (id, data) pairs with uniqueness enforced by expression
/// indexes derived from the type registry.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
    registry: Arc<TypeRegistry>,
    main_schema: String,
}

fn qualified(namespace: &str, table: &str) -> String {
    format!("\"{}\".\"{}\"", namespace, table)
}

fn json_to_snapshot(value: Option<serde_json::Value>) -> Option<SnapshotData> {
    match value {
        Some(serde_json::Value::Object(map)) => Some(map),
        _ => None,
    }
}

fn snapshot_to_json(snapshot: &Option<SnapshotData>) -> Option<serde_json::Value> {
    snapshot
        .as_ref()
        .map(|m| serde_json::Value::Object(m.clone()))
}

fn branch_from_row(row: &PgRow) -> Result<Branch> {
    let status: String = row.try_get("status")?;
    Ok(Branch {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        owner: row.try_get("owner")?,
        description: row.try_get("description")?,
        schema_id: row.try_get("schema_id")?,
        status: BranchStatus::parse(&status)
            .ok_or_else(|| anyhow!("unknown branch status {:?}", status))?,
        last_sync: row.try_get("last_sync")?,
        last_sync_time: row.try_get("last_sync_time")?,
        merged_time: row.try_get("merged_time")?,
        merged_by: row.try_get("merged_by")?,
        merged_with_squash: row.try_get("merged_with_squash")?,
        applied_migrations: row.try_get("applied_migrations")?,
        created_at: row.try_get("created_at")?,
    })
}

fn change_from_row(row: &PgRow) -> Result<ChangeRecord> {
    let action: String = row.try_get("action")?;
    Ok(ChangeRecord {
        seq: row.try_get("seq")?,
        time: row.try_get("time")?,
        user: row.try_get("actor")?,
        object_type: row.try_get("object_type")?,
        object_id: row.try_get("object_id")?,
        action: ChangeAction::parse(&action)
            .ok_or_else(|| anyhow!("unknown change action {:?}", action))?,
        prechange: json_to_snapshot(row.try_get("prechange")?),
        postchange: json_to_snapshot(row.try_get("postchange")?),
    })
}

impl PostgresStore {
    /// Create a new PostgreSQL store with the given database URL.
    pub async fn new(
        database_url: &str,
        registry: Arc<TypeRegistry>,
        main_schema: &str,
        max_connections: u32,
    ) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("Failed to create PostgreSQL connection pool")?;

        Ok(Self {
            pool,
            registry,
            main_schema: main_schema.to_string(),
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the engine's bookkeeping tables and the main-schema object
    /// tables for every registered type. Idempotent.
    pub async fn migrate(&self) -> Result<()> {
        for def in self.registry.types() {
            if META_TABLES.contains(&def.name.as_str()) {
                bail!("object type name {:?} is reserved", def.name);
            }
        }

        let main = &self.main_schema;
        let mut tx = self.pool.begin().await.context("Failed to begin migration")?;

        let branch_table = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id UUID PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                owner TEXT,
                description TEXT,
                schema_id TEXT NOT NULL UNIQUE,
                status TEXT NOT NULL,
                last_sync BIGINT,
                last_sync_time TIMESTAMPTZ,
                merged_time TIMESTAMPTZ,
                merged_by TEXT,
                merged_with_squash BOOLEAN NOT NULL DEFAULT FALSE,
                applied_migrations TEXT[] NOT NULL DEFAULT '{{}}',
                created_at TIMESTAMPTZ NOT NULL
            )",
            qualified(main, "branch")
        );
        sqlx::query(&branch_table).execute(&mut *tx).await?;

        let event_table = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id BIGSERIAL PRIMARY KEY,
                time TIMESTAMPTZ NOT NULL,
                branch_id UUID NOT NULL,
                related_branch_id UUID,
                actor TEXT,
                kind TEXT NOT NULL
            )",
            qualified(main, "branch_event")
        );
        sqlx::query(&event_table).execute(&mut *tx).await?;

        let diff_table = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                branch_id UUID NOT NULL,
                object_type TEXT NOT NULL,
                object_id BIGINT NOT NULL,
                action TEXT NOT NULL,
                original JSONB,
                modified JSONB,
                current JSONB,
                conflicts TEXT[] NOT NULL DEFAULT '{{}}',
                acknowledged BOOLEAN NOT NULL DEFAULT FALSE,
                last_updated TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (branch_id, object_type, object_id)
            )",
            qualified(main, "change_diff")
        );
        sqlx::query(&diff_table).execute(&mut *tx).await?;

        let applied_table = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                branch_id UUID NOT NULL,
                position BIGINT NOT NULL,
                seq BIGINT NOT NULL,
                time TIMESTAMPTZ NOT NULL,
                actor TEXT,
                object_type TEXT NOT NULL,
                object_id BIGINT NOT NULL,
                action TEXT NOT NULL,
                prechange JSONB,
                postchange JSONB,
                PRIMARY KEY (branch_id, position)
            )",
            qualified(main, "applied_change")
        );
        sqlx::query(&applied_table).execute(&mut *tx).await?;

        sqlx::query(&Self::changelog_ddl(main)).execute(&mut *tx).await?;

        for def in self.registry.types() {
            let object_table = format!(
                "CREATE TABLE IF NOT EXISTS {} (id BIGINT PRIMARY KEY, data JSONB NOT NULL)",
                qualified(main, &def.name)
            );
            sqlx::query(&object_table).execute(&mut *tx).await?;

            let sequence = format!(
                "CREATE SEQUENCE IF NOT EXISTS {}",
                qualified(main, &format!("{}_id_seq", def.name))
            );
            sqlx::query(&sequence).execute(&mut *tx).await?;

            for attrs in &def.unique_attrs {
                let columns = attrs
                    .iter()
                    .map(|a| format!("(data->>'{}')", a))
                    .collect::<Vec<_>>()
                    .join(", ");
                let index = format!(
                    "CREATE UNIQUE INDEX IF NOT EXISTS \"{}_{}_key\" ON {} ({})",
                    def.name,
                    attrs.join("_"),
                    qualified(main, &def.name),
                    columns
                );
                sqlx::query(&index).execute(&mut *tx).await?;
            }

            if def.hierarchical {
                let closure = format!(
                    "CREATE TABLE IF NOT EXISTS {} (
                        ancestor BIGINT NOT NULL,
                        descendant BIGINT NOT NULL,
                        depth INT NOT NULL,
                        PRIMARY KEY (ancestor, descendant)
                    )",
                    qualified(main, &format!("{}_closure", def.name))
                );
                sqlx::query(&closure).execute(&mut *tx).await?;
            }
        }

        tx.commit().await.context("Failed to commit migration")?;
        Ok(())
    }

    fn changelog_ddl(namespace: &str) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (
                seq BIGINT PRIMARY KEY,
                time TIMESTAMPTZ NOT NULL,
                actor TEXT,
                object_type TEXT NOT NULL,
                object_id BIGINT NOT NULL,
                action TEXT NOT NULL,
                prechange JSONB,
                postchange JSONB
            )",
            qualified(namespace, "change_log")
        )
    }

    fn object_table(&self, namespace: &str, object_type: &str) -> Result<String> {
        if !self.registry.is_branchable(object_type) {
            bail!("object type {:?} is not branchable", object_type);
        }
        Ok(qualified(namespace, object_type))
    }
}

#[async_trait::async_trait]
impl BranchStore for PostgresStore {
    async fn get_branch(&self, id: &BranchId) -> Result<Option<Branch>> {
        let sql = format!(
            "SELECT * FROM {} WHERE id = $1",
            qualified(&self.main_schema, "branch")
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch branch")?;
        row.map(|r| branch_from_row(&r)).transpose()
    }

    async fn get_branch_by_name(&self, name: &str) -> Result<Option<Branch>> {
        let sql = format!(
            "SELECT * FROM {} WHERE name = $1",
            qualified(&self.main_schema, "branch")
        );
        let row = sqlx::query(&sql)
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch branch")?;
        row.map(|r| branch_from_row(&r)).transpose()
    }

    async fn list_branches(&self) -> Result<Vec<Branch>> {
        let sql = format!(
            "SELECT * FROM {} ORDER BY name",
            qualified(&self.main_schema, "branch")
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list branches")?;
        rows.iter().map(branch_from_row).collect()
    }

    async fn insert_branch(&self, branch: &Branch) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (id, name, owner, description, schema_id, status, last_sync,
                last_sync_time, merged_time, merged_by, merged_with_squash,
                applied_migrations, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
            qualified(&self.main_schema, "branch")
        );
        sqlx::query(&sql)
            .bind(branch.id)
            .bind(&branch.name)
            .bind(&branch.owner)
            .bind(&branch.description)
            .bind(&branch.schema_id)
            .bind(branch.status.as_str())
            .bind(branch.last_sync)
            .bind(branch.last_sync_time)
            .bind(branch.merged_time)
            .bind(&branch.merged_by)
            .bind(branch.merged_with_squash)
            .bind(&branch.applied_migrations)
            .bind(branch.created_at)
            .execute(&self.pool)
            .await
            .context("Failed to insert branch")?;
        Ok(())
    }

    async fn update_branch(&self, branch: &Branch) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET name = $2, owner = $3, description = $4, status = $5,
                last_sync = $6, last_sync_time = $7, merged_time = $8, merged_by = $9,
                merged_with_squash = $10, applied_migrations = $11
             WHERE id = $1",
            qualified(&self.main_schema, "branch")
        );
        let result = sqlx::query(&sql)
            .bind(branch.id)
            .bind(&branch.name)
            .bind(&branch.owner)
            .bind(&branch.description)
            .bind(branch.status.as_str())
            .bind(branch.last_sync)
            .bind(branch.last_sync_time)
            .bind(branch.merged_time)
            .bind(&branch.merged_by)
            .bind(branch.merged_with_squash)
            .bind(&branch.applied_migrations)
            .execute(&self.pool)
            .await
            .context("Failed to update branch")?;
        if result.rows_affected() == 0 {
            bail!("branch {} does not exist", branch.id);
        }
        Ok(())
    }

    async fn set_branch_status(&self, id: &BranchId, status: BranchStatus) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET status = $2 WHERE id = $1",
            qualified(&self.main_schema, "branch")
        );
        let result = sqlx::query(&sql)
            .bind(id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await
            .context("Failed to update branch status")?;
        if result.rows_affected() == 0 {
            bail!("branch {} does not exist", id);
        }
        Ok(())
    }

    async fn delete_branch(&self, id: &BranchId) -> Result<bool> {
        let sql = format!(
            "DELETE FROM {} WHERE id = $1",
            qualified(&self.main_schema, "branch")
        );
        let result = sqlx::query(&sql)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to delete branch")?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait::async_trait]
impl ChangeLogStore for PostgresStore {
    async fn append_change(
        &self,
        namespace: &str,
        change: NewChangeRecord,
    ) -> Result<ChangeRecord> {
        let table = qualified(namespace, "change_log");
        let sql = format!(
            "INSERT INTO {table} (seq, time, actor, object_type, object_id, action, prechange, postchange)
             VALUES ((SELECT COALESCE(MAX(seq), 0) + 1 FROM {table}), $1, $2, $3, $4, $5, $6, $7)
             RETURNING *"
        );
        let row = sqlx::query(&sql)
            .bind(change.time)
            .bind(&change.user)
            .bind(&change.object_type)
            .bind(change.object_id)
            .bind(change.action.as_str())
            .bind(snapshot_to_json(&change.prechange))
            .bind(snapshot_to_json(&change.postchange))
            .fetch_one(&self.pool)
            .await
            .context("Failed to append change record")?;
        change_from_row(&row)
    }

    async fn changes_in(&self, namespace: &str, from: i64, to: i64) -> Result<Vec<ChangeRecord>> {
        let sql = format!(
            "SELECT * FROM {} WHERE seq >= $1 AND seq < $2 ORDER BY seq",
            qualified(namespace, "change_log")
        );
        let rows = sqlx::query(&sql)
            .bind(from)
            .bind(to)
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch change records")?;
        rows.iter().map(change_from_row).collect()
    }

    async fn all_changes(&self, namespace: &str) -> Result<Vec<ChangeRecord>> {
        let sql = format!(
            "SELECT * FROM {} ORDER BY seq",
            qualified(namespace, "change_log")
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch change records")?;
        rows.iter().map(change_from_row).collect()
    }

    async fn changelog_head(&self, namespace: &str) -> Result<i64> {
        let sql = format!(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM {}",
            qualified(namespace, "change_log")
        );
        let head: i64 = sqlx::query_scalar(&sql)
            .fetch_one(&self.pool)
            .await
            .context("Failed to read changelog head")?;
        Ok(head)
    }
}

#[async_trait::async_trait]
impl DiffStore for PostgresStore {
    async fn upsert_diff(&self, diff: &ChangeDiff) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (branch_id, object_type, object_id, action, original, modified,
                current, conflicts, acknowledged, last_updated)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
             ON CONFLICT (branch_id, object_type, object_id) DO UPDATE SET
                action = EXCLUDED.action,
                original = EXCLUDED.original,
                modified = EXCLUDED.modified,
                current = EXCLUDED.current,
                conflicts = EXCLUDED.conflicts,
                acknowledged = EXCLUDED.acknowledged,
                last_updated = EXCLUDED.last_updated",
            qualified(&self.main_schema, "change_diff")
        );
        sqlx::query(&sql)
            .bind(diff.branch_id)
            .bind(&diff.object_type)
            .bind(diff.object_id)
            .bind(diff.action.as_str())
            .bind(snapshot_to_json(&diff.original))
            .bind(snapshot_to_json(&diff.modified))
            .bind(snapshot_to_json(&diff.current))
            .bind(&diff.conflicts)
            .bind(diff.acknowledged)
            .bind(diff.last_updated)
            .execute(&self.pool)
            .await
            .context("Failed to upsert change diff")?;
        Ok(())
    }

    async fn get_diff(
        &self,
        branch_id: &BranchId,
        object: &ObjectKey,
    ) -> Result<Option<ChangeDiff>> {
        let sql = format!(
            "SELECT * FROM {} WHERE branch_id = $1 AND object_type = $2 AND object_id = $3",
            qualified(&self.main_schema, "change_diff")
        );
        let row = sqlx::query(&sql)
            .bind(branch_id)
            .bind(&object.object_type)
            .bind(object.object_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch change diff")?;
        row.map(|r| diff_from_row(&r)).transpose()
    }

    async fn list_diffs(&self, branch_id: &BranchId) -> Result<Vec<ChangeDiff>> {
        let sql = format!(
            "SELECT * FROM {} WHERE branch_id = $1 ORDER BY object_type, object_id",
            qualified(&self.main_schema, "change_diff")
        );
        let rows = sqlx::query(&sql)
            .bind(branch_id)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list change diffs")?;
        rows.iter().map(diff_from_row).collect()
    }

    async fn remove_diff(&self, branch_id: &BranchId, object: &ObjectKey) -> Result<bool> {
        let sql = format!(
            "DELETE FROM {} WHERE branch_id = $1 AND object_type = $2 AND object_id = $3",
            qualified(&self.main_schema, "change_diff")
        );
        let result = sqlx::query(&sql)
            .bind(branch_id)
            .bind(&object.object_type)
            .bind(object.object_id)
            .execute(&self.pool)
            .await
            .context("Failed to remove change diff")?;
        Ok(result.rows_affected() > 0)
    }

    async fn clear_diffs(&self, branch_id: &BranchId) -> Result<()> {
        let sql = format!(
            "DELETE FROM {} WHERE branch_id = $1",
            qualified(&self.main_schema, "change_diff")
        );
        sqlx::query(&sql)
            .bind(branch_id)
            .execute(&self.pool)
            .await
            .context("Failed to clear change diffs")?;
        Ok(())
    }

    async fn acknowledge_diff(&self, branch_id: &BranchId, object: &ObjectKey) -> Result<bool> {
        let sql = format!(
            "UPDATE {} SET acknowledged = TRUE
             WHERE branch_id = $1 AND object_type = $2 AND object_id = $3",
            qualified(&self.main_schema, "change_diff")
        );
        let result = sqlx::query(&sql)
            .bind(branch_id)
            .bind(&object.object_type)
            .bind(object.object_id)
            .execute(&self.pool)
            .await
            .context("Failed to acknowledge change diff")?;
        Ok(result.rows_affected() > 0)
    }
}

fn diff_from_row(row: &PgRow) -> Result<ChangeDiff> {
    let action: String = row.try_get("action")?;
    Ok(ChangeDiff {
        branch_id: row.try_get("branch_id")?,
        object_type: row.try_get("object_type")?,
        object_id: row.try_get("object_id")?,
        action: ChangeAction::parse(&action)
            .ok_or_else(|| anyhow!("unknown change action {:?}", action))?,
        original: json_to_snapshot(row.try_get("original")?),
        modified: json_to_snapshot(row.try_get("modified")?),
        current: json_to_snapshot(row.try_get("current")?),
        conflicts: row.try_get("conflicts")?,
        acknowledged: row.try_get("acknowledged")?,
        last_updated: row.try_get("last_updated")?,
    })
}

fn event_from_row(row: &PgRow) -> Result<BranchEvent> {
    let kind: String = row.try_get("kind")?;
    Ok(BranchEvent {
        time: row.try_get("time")?,
        branch_id: row.try_get("branch_id")?,
        related_branch_id: row.try_get("related_branch_id")?,
        user: row.try_get("actor")?,
        kind: BranchEventKind::parse(&kind)
            .ok_or_else(|| anyhow!("unknown branch event kind {:?}", kind))?,
    })
}

#[async_trait::async_trait]
impl EventStore for PostgresStore {
    async fn append_event(&self, event: &BranchEvent) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (time, branch_id, related_branch_id, actor, kind)
             VALUES ($1, $2, $3, $4, $5)",
            qualified(&self.main_schema, "branch_event")
        );
        sqlx::query(&sql)
            .bind(event.time)
            .bind(event.branch_id)
            .bind(event.related_branch_id)
            .bind(&event.user)
            .bind(event.kind.as_str())
            .execute(&self.pool)
            .await
            .context("Failed to append branch event")?;
        Ok(())
    }

    async fn events_for_branch(&self, branch_id: &BranchId) -> Result<Vec<BranchEvent>> {
        let sql = format!(
            "SELECT * FROM {} WHERE branch_id = $1 ORDER BY time DESC, id DESC",
            qualified(&self.main_schema, "branch_event")
        );
        let rows = sqlx::query(&sql)
            .bind(branch_id)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list branch events")?;
        rows.iter().map(event_from_row).collect()
    }
}

#[async_trait::async_trait]
impl AppliedChangeStore for PostgresStore {
    async fn merged_changes(&self, branch_id: &BranchId) -> Result<Vec<ChangeRecord>> {
        let sql = format!(
            "SELECT * FROM {} WHERE branch_id = $1 ORDER BY position",
            qualified(&self.main_schema, "applied_change")
        );
        let rows = sqlx::query(&sql)
            .bind(branch_id)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list applied changes")?;
        rows.iter().map(change_from_row).collect()
    }

    async fn clear_merged_changes(&self, branch_id: &BranchId) -> Result<()> {
        let sql = format!(
            "DELETE FROM {} WHERE branch_id = $1",
            qualified(&self.main_schema, "applied_change")
        );
        sqlx::query(&sql)
            .bind(branch_id)
            .execute(&self.pool)
            .await
            .context("Failed to clear applied changes")?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl NamespaceStore for PostgresStore {
    async fn provision_namespace(&self, source: &str, target: &str) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin provisioning transaction")?;

        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!("CREATE SCHEMA \"{}\"", target))
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to create schema {target}"))?;

        // An empty copy of the changelog; the branch starts recording at
        // sequence 1.
        sqlx::query(&Self::changelog_ddl(target)).execute(&mut *tx).await?;

        for def in self.registry.types() {
            let source_table = qualified(source, &def.name);
            let target_table = qualified(target, &def.name);

            // Structure, indexes and constraints first, then the rows.
            sqlx::query(&format!(
                "CREATE TABLE {target_table} (LIKE {source_table} INCLUDING ALL)"
            ))
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to replicate table {source_table}"))?;
            sqlx::query(&format!(
                "INSERT INTO {target_table} SELECT * FROM {source_table}"
            ))
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to copy rows into {target_table}"))?;

            // The branch gets its own id sequence primed with main's current
            // value, so identity generation does not collide at copy time.
            let seq_name = format!("{}_id_seq", def.name);
            sqlx::query(&format!(
                "CREATE SEQUENCE {}",
                qualified(target, &seq_name)
            ))
            .execute(&mut *tx)
            .await?;
            let last_value: i64 =
                sqlx::query_scalar(&format!("SELECT last_value FROM {}", qualified(source, &seq_name)))
                    .fetch_one(&mut *tx)
                    .await
                    .with_context(|| format!("Failed to read sequence {seq_name}"))?;
            sqlx::query(&format!(
                "SELECT setval('{}', {}, true)",
                qualified(target, &seq_name),
                last_value
            ))
            .fetch_one(&mut *tx)
            .await?;

            if def.hierarchical {
                let closure = format!("{}_closure", def.name);
                let source_closure = qualified(source, &closure);
                let target_closure = qualified(target, &closure);
                sqlx::query(&format!(
                    "CREATE TABLE {target_closure} (LIKE {source_closure} INCLUDING ALL)"
                ))
                .execute(&mut *tx)
                .await?;
                sqlx::query(&format!(
                    "INSERT INTO {target_closure} SELECT * FROM {source_closure}"
                ))
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit()
            .await
            .context("Failed to commit provisioning transaction")?;
        Ok(())
    }

    async fn deprovision_namespace(&self, namespace: &str) -> Result<()> {
        sqlx::query(&format!("DROP SCHEMA IF EXISTS \"{}\" CASCADE", namespace))
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to drop schema {namespace}"))?;
        Ok(())
    }

    async fn namespace_exists(&self, namespace: &str) -> Result<bool> {
        let exists: Option<String> = sqlx::query_scalar(
            "SELECT schema_name FROM information_schema.schemata WHERE schema_name = $1",
        )
        .bind(namespace)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to check namespace existence")?;
        Ok(exists.is_some())
    }

    async fn next_object_id(&self, namespace: &str, object_type: &str) -> Result<i64> {
        self.object_table(namespace, object_type)?;
        let sql = format!(
            "SELECT nextval('{}')",
            qualified(namespace, &format!("{}_id_seq", object_type))
        );
        let id: i64 = sqlx::query_scalar(&sql)
            .fetch_one(&self.pool)
            .await
            .context("Failed to allocate object id")?;
        Ok(id)
    }

    async fn get_object(
        &self,
        namespace: &str,
        object: &ObjectKey,
    ) -> Result<Option<SnapshotData>> {
        let table = self.object_table(namespace, &object.object_type)?;
        let sql = format!("SELECT data FROM {table} WHERE id = $1");
        let data: Option<serde_json::Value> = sqlx::query_scalar(&sql)
            .bind(object.object_id)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("Failed to fetch object {object}"))?;
        Ok(json_to_snapshot(data))
    }

    async fn begin(&self, namespace: &str) -> Result<Box<dyn ObjectTx>> {
        let tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin namespace transaction")?;
        Ok(Box::new(PgObjectTx {
            tx,
            registry: self.registry.clone(),
            namespace: namespace.to_string(),
            main_schema: self.main_schema.clone(),
        }))
    }
}

struct PgObjectTx {
    tx: Transaction<'static, Postgres>,
    registry: Arc<TypeRegistry>,
    namespace: String,
    main_schema: String,
}

impl PgObjectTx {
    fn object_table(&self, object_type: &str) -> Result<String> {
        if !self.registry.is_branchable(object_type) {
            bail!("object type {:?} is not branchable", object_type);
        }
        Ok(qualified(&self.namespace, object_type))
    }
}

#[async_trait::async_trait]
impl ObjectTx for PgObjectTx {
    async fn get(&mut self, object: &ObjectKey) -> Result<Option<SnapshotData>> {
        let table = self.object_table(&object.object_type)?;
        let sql = format!("SELECT data FROM {table} WHERE id = $1");
        let data: Option<serde_json::Value> = sqlx::query_scalar(&sql)
            .bind(object.object_id)
            .fetch_optional(&mut *self.tx)
            .await
            .with_context(|| format!("Failed to fetch object {object}"))?;
        Ok(json_to_snapshot(data))
    }

    async fn insert(&mut self, object: &ObjectKey, data: &SnapshotData) -> Result<InsertOutcome> {
        let table = self.object_table(&object.object_type)?;
        let sql = format!("INSERT INTO {table} (id, data) VALUES ($1, $2)");
        let result = sqlx::query(&sql)
            .bind(object.object_id)
            .bind(serde_json::Value::Object(data.clone()))
            .execute(&mut *self.tx)
            .await;
        match result {
            Ok(_) => Ok(InsertOutcome::Inserted),
            Err(sqlx::Error::Database(db)) if db.code().as_deref() == Some("23505") => {
                Ok(InsertOutcome::Conflict {
                    constraint: db
                        .constraint()
                        .unwrap_or(&format!("{}_pkey", object.object_type))
                        .to_string(),
                })
            }
            Err(e) => Err(e).with_context(|| format!("Failed to insert object {object}")),
        }
    }

    async fn update(&mut self, object: &ObjectKey, attrs: &SnapshotData) -> Result<bool> {
        let table = self.object_table(&object.object_type)?;
        let sql = format!("UPDATE {table} SET data = data || $2 WHERE id = $1");
        let result = sqlx::query(&sql)
            .bind(object.object_id)
            .bind(serde_json::Value::Object(attrs.clone()))
            .execute(&mut *self.tx)
            .await
            .with_context(|| format!("Failed to update object {object}"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete(&mut self, object: &ObjectKey) -> Result<bool> {
        let table = self.object_table(&object.object_type)?;
        let sql = format!("DELETE FROM {table} WHERE id = $1");
        let result = sqlx::query(&sql)
            .bind(object.object_id)
            .execute(&mut *self.tx)
            .await
            .with_context(|| format!("Failed to delete object {object}"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn rebuild_hierarchy(&mut self, object_type: &str) -> Result<()> {
        let Some(parent_attr) = self
            .registry
            .get(object_type)
            .and_then(|d| d.parent_attr().map(|a| a.to_string()))
        else {
            return Ok(());
        };
        let table = self.object_table(object_type)?;
        let closure = qualified(&self.namespace, &format!("{}_closure", object_type));

        sqlx::query(&format!("DELETE FROM {closure}"))
            .execute(&mut *self.tx)
            .await?;
        let rebuild = format!(
            "WITH RECURSIVE tree AS (
                SELECT id AS descendant, (data->>'{parent_attr}')::bigint AS ancestor, 1 AS depth
                FROM {table}
                WHERE data->>'{parent_attr}' IS NOT NULL
                UNION ALL
                SELECT t.descendant, (o.data->>'{parent_attr}')::bigint, t.depth + 1
                FROM tree t
                JOIN {table} o ON o.id = t.ancestor
                WHERE o.data->>'{parent_attr}' IS NOT NULL
            )
            INSERT INTO {closure} (ancestor, descendant, depth)
            SELECT ancestor, descendant, depth FROM tree"
        );
        sqlx::query(&rebuild)
            .execute(&mut *self.tx)
            .await
            .with_context(|| format!("Failed to rebuild hierarchy for {object_type}"))?;
        Ok(())
    }

    async fn record_event(&mut self, event: BranchEvent) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (time, branch_id, related_branch_id, actor, kind)
             VALUES ($1, $2, $3, $4, $5)",
            qualified(&self.main_schema, "branch_event")
        );
        sqlx::query(&sql)
            .bind(event.time)
            .bind(event.branch_id)
            .bind(event.related_branch_id)
            .bind(&event.user)
            .bind(event.kind.as_str())
            .execute(&mut *self.tx)
            .await
            .context("Failed to record branch event")?;
        Ok(())
    }

    async fn record_applied(&mut self, branch_id: &BranchId, change: &ChangeRecord) -> Result<()> {
        let table = qualified(&self.main_schema, "applied_change");
        let sql = format!(
            "INSERT INTO {table} (branch_id, position, seq, time, actor, object_type,
                object_id, action, prechange, postchange)
             VALUES ($1, (SELECT COALESCE(MAX(position), 0) + 1 FROM {table} WHERE branch_id = $1),
                $2, $3, $4, $5, $6, $7, $8, $9)"
        );
        sqlx::query(&sql)
            .bind(branch_id)
            .bind(change.seq)
            .bind(change.time)
            .bind(&change.user)
            .bind(&change.object_type)
            .bind(change.object_id)
            .bind(change.action.as_str())
            .bind(snapshot_to_json(&change.prechange))
            .bind(snapshot_to_json(&change.postchange))
            .execute(&mut *self.tx)
            .await
            .context("Failed to record applied change")?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let this = *self;
        this.tx
            .commit()
            .await
            .context("Failed to commit namespace transaction")?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        let this = *self;
        this.tx
            .rollback()
            .await
            .context("Failed to roll back namespace transaction")?;
        Ok(())
    }
}
