//! WorkStore - SQLite persistence for work items, history, and locks.
//!
//! Tables: `work_items`, `work_history`, `bug_metadata`.
//!
//! All lock operations are single conditional UPDATEs. `rows_affected`
//! is the claim verdict, so two agents racing for the same item resolve
//! inside SQLite and exactly one of them wins.

use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::{debug, info, warn};

use crate::error::{Result, StoreError};
use crate::types::{
    BugMetadata, BugMetadataRow, HistoryAction, HistoryRow, RoleKind, WorkHistory, WorkItem,
    WorkItemKind, WorkItemRow, WorkItemStatus,
};

/// SQLite-backed work-item store shared by all dispatchers and agents.
#[derive(Clone)]
pub struct WorkStore {
    pool: SqlitePool,
    /// Locks older than this are considered abandoned and reclaimable.
    stale_timeout: chrono::Duration,
}

impl WorkStore {
    /// Open (or create) a store at the given path.
    pub async fn from_path(db_path: &Path, stale_lock_timeout: Duration) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Internal(format!("mkdir: {e}")))?;
        }
        let url = format!("sqlite:{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;

        // Enable WAL for read/write concurrency
        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&pool)
            .await?;

        let store = Self {
            pool,
            stale_timeout: Self::to_chrono(stale_lock_timeout)?,
        };
        store.migrate().await?;
        info!("Work store initialized at {}", db_path.display());
        Ok(store)
    }

    /// In-memory store (for tests).
    pub async fn in_memory(stale_lock_timeout: Duration) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self {
            pool,
            stale_timeout: Self::to_chrono(stale_lock_timeout)?,
        };
        store.migrate().await?;
        debug!("In-memory work store initialized");
        Ok(store)
    }

    fn to_chrono(timeout: Duration) -> Result<chrono::Duration> {
        chrono::Duration::from_std(timeout)
            .map_err(|e| StoreError::Internal(format!("stale lock timeout out of range: {e}")))
    }

    /// Oldest `processing_started_at` a live lock may have.
    fn stale_cutoff(&self) -> chrono::DateTime<Utc> {
        Utc::now() - self.stale_timeout
    }

    // ── Migrations ──────────────────────────────────────────────

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS work_items (
                id                    TEXT PRIMARY KEY,
                kind                  TEXT NOT NULL,
                parent_id             TEXT REFERENCES work_items(id),
                title                 TEXT NOT NULL,
                description           TEXT NOT NULL DEFAULT '',
                status                TEXT NOT NULL,
                assigned_role         TEXT,
                processing_agent_id   TEXT,
                processing_started_at TIMESTAMP,
                source_error_id       TEXT UNIQUE,
                created_at            TIMESTAMP NOT NULL,
                updated_at            TIMESTAMP NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_items_parent ON work_items(parent_id)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_items_status
             ON work_items(status, assigned_role)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS work_history (
                id           TEXT PRIMARY KEY,
                work_item_id TEXT NOT NULL REFERENCES work_items(id),
                action       TEXT NOT NULL,
                content      TEXT NOT NULL,
                created_by   TEXT NOT NULL,
                created_at   TIMESTAMP NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_history_item
             ON work_history(work_item_id, created_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_history_action
             ON work_history(action, created_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS bug_metadata (
                work_item_id        TEXT PRIMARY KEY REFERENCES work_items(id),
                reproduction_test   TEXT,
                root_cause          TEXT,
                reproduction_steps  TEXT,
                temporary_artifacts TEXT,
                suggested_fix       TEXT
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ── Work items ──────────────────────────────────────────────

    /// Insert a new work item.
    pub async fn create_item(&self, item: &WorkItem) -> Result<()> {
        sqlx::query(
            "INSERT INTO work_items (
                id, kind, parent_id, title, description, status,
                assigned_role, processing_agent_id, processing_started_at,
                source_error_id, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&item.id)
        .bind(item.kind.to_string())
        .bind(&item.parent_id)
        .bind(&item.title)
        .bind(&item.description)
        .bind(item.status.to_string())
        .bind(item.assigned_role.map(|r| r.to_string()))
        .bind(&item.processing_agent_id)
        .bind(item.processing_started_at)
        .bind(&item.source_error_id)
        .bind(item.created_at)
        .bind(item.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Insert a bug synthesized from an error history entry. No-op when
    /// a bug for that error already exists (idempotent re-sweep).
    ///
    /// Returns whether a new row was inserted.
    pub async fn create_linked_bug(&self, item: &WorkItem) -> Result<bool> {
        if item.source_error_id.is_none() {
            return Err(StoreError::Internal(
                "linked bug requires source_error_id".to_string(),
            ));
        }
        let result = sqlx::query(
            "INSERT OR IGNORE INTO work_items (
                id, kind, parent_id, title, description, status,
                assigned_role, processing_agent_id, processing_started_at,
                source_error_id, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&item.id)
        .bind(item.kind.to_string())
        .bind(&item.parent_id)
        .bind(&item.title)
        .bind(&item.description)
        .bind(item.status.to_string())
        .bind(item.assigned_role.map(|r| r.to_string()))
        .bind(&item.processing_agent_id)
        .bind(item.processing_started_at)
        .bind(&item.source_error_id)
        .bind(item.created_at)
        .bind(item.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Get an item by ID.
    pub async fn get_item(&self, id: &str) -> Result<Option<WorkItem>> {
        let row: Option<WorkItemRow> = sqlx::query_as("SELECT * FROM work_items WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(TryInto::try_into).transpose()
    }

    /// Get an item by ID, erroring when absent.
    pub async fn require_item(&self, id: &str) -> Result<WorkItem> {
        self.get_item(id)
            .await?
            .ok_or_else(|| StoreError::ItemNotFound(id.to_string()))
    }

    /// Update an item's descriptive fields (title, description, parent,
    /// assigned role, source error link). Status and lock fields have
    /// dedicated operations.
    pub async fn update_item(&self, item: &WorkItem) -> Result<()> {
        let result = sqlx::query(
            "UPDATE work_items SET
                title = ?, description = ?, parent_id = ?,
                assigned_role = ?, source_error_id = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(&item.title)
        .bind(&item.description)
        .bind(&item.parent_id)
        .bind(item.assigned_role.map(|r| r.to_string()))
        .bind(&item.source_error_id)
        .bind(Utc::now())
        .bind(&item.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::ItemNotFound(item.id.clone()));
        }
        Ok(())
    }

    /// Delete an item together with its descendants, history, and bug
    /// metadata. Not part of the normal lifecycle.
    pub async fn delete_item(&self, id: &str) -> Result<()> {
        self.require_item(id).await?;

        // Collect the subtree first, then delete leaves before parents.
        let mut ids = vec![id.to_string()];
        let mut i = 0;
        while i < ids.len() {
            let children = self.list_children(&ids[i]).await?;
            ids.extend(children.into_iter().map(|c| c.id));
            i += 1;
        }

        for item_id in ids.iter().rev() {
            sqlx::query("DELETE FROM work_history WHERE work_item_id = ?")
                .bind(item_id)
                .execute(&self.pool)
                .await?;
            sqlx::query("DELETE FROM bug_metadata WHERE work_item_id = ?")
                .bind(item_id)
                .execute(&self.pool)
                .await?;
            sqlx::query("DELETE FROM work_items WHERE id = ?")
                .bind(item_id)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    /// Move an item to a new status and record the transition.
    ///
    /// Non-epic transitions must follow the work-item state machine.
    /// Epics are exempt: their status is derived from children (see
    /// [`WorkStore::recompute_epic_status`]) or set by the dispatcher
    /// when accepting or rejecting them.
    pub async fn set_status(
        &self,
        id: &str,
        next: WorkItemStatus,
        actor: &str,
    ) -> Result<()> {
        let item = self.require_item(id).await?;
        if item.status == next {
            return Ok(());
        }
        if item.kind != WorkItemKind::Epic && !item.status.can_transition_to(next) {
            return Err(StoreError::InvalidTransition {
                from: item.status,
                to: next,
                id: id.to_string(),
            });
        }

        sqlx::query("UPDATE work_items SET status = ?, updated_at = ? WHERE id = ?")
            .bind(next.to_string())
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;

        self.append_history(&WorkHistory::new(
            id,
            HistoryAction::StatusChange,
            format!("{} -> {}", item.status, next),
            actor,
        ))
        .await?;

        debug!(item_id = %id, from = %item.status, to = %next, actor = %actor, "status changed");
        Ok(())
    }

    /// Route an item to a role (or clear the routing with `None`).
    pub async fn set_assigned_role(&self, id: &str, role: Option<RoleKind>) -> Result<()> {
        let result = sqlx::query(
            "UPDATE work_items SET assigned_role = ?, updated_at = ? WHERE id = ?",
        )
        .bind(role.map(|r| r.to_string()))
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::ItemNotFound(id.to_string()));
        }
        Ok(())
    }

    /// All direct children of an item, oldest first.
    pub async fn list_children(&self, parent_id: &str) -> Result<Vec<WorkItem>> {
        let rows: Vec<WorkItemRow> =
            sqlx::query_as("SELECT * FROM work_items WHERE parent_id = ? ORDER BY created_at")
                .bind(parent_id)
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// All non-done items whose lock is free or stale, oldest first.
    /// This is the dispatcher's per-cycle work set.
    pub async fn list_available(&self) -> Result<Vec<WorkItem>> {
        let rows: Vec<WorkItemRow> = sqlx::query_as(
            "SELECT * FROM work_items
             WHERE status <> 'done'
               AND (processing_agent_id IS NULL
                    OR processing_started_at IS NULL
                    OR processing_started_at <= ?)
             ORDER BY created_at",
        )
        .bind(self.stale_cutoff())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Number of in-progress items routed to the developer role,
    /// optionally not counting one candidate item.
    pub async fn count_active_developers(&self, exclude_id: Option<&str>) -> Result<u32> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS cnt FROM work_items
             WHERE status = 'in_progress'
               AND assigned_role = 'developer'
               AND (? IS NULL OR id <> ?)",
        )
        .bind(exclude_id)
        .bind(exclude_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get::<i64, _>("cnt")? as u32)
    }

    /// Recompute an epic's derived status from its children and persist
    /// it when changed. Returns the status the epic ends up with.
    pub async fn recompute_epic_status(
        &self,
        epic_id: &str,
        actor: &str,
    ) -> Result<WorkItemStatus> {
        let epic = self.require_item(epic_id).await?;
        if epic.kind != WorkItemKind::Epic {
            return Err(StoreError::KindMismatch {
                expected: WorkItemKind::Epic,
                actual: epic.kind,
                id: epic_id.to_string(),
            });
        }

        let children = self.list_children(epic_id).await?;
        let derived = WorkItemStatus::roll_up(children.iter().map(|c| c.status));
        match derived {
            Some(status) if status != epic.status => {
                self.set_status(epic_id, status, actor).await?;
                Ok(status)
            }
            Some(status) => Ok(status),
            None => Ok(epic.status),
        }
    }

    // ── Locking ─────────────────────────────────────────────────

    /// Try to take the processing lock. Succeeds iff the item is
    /// unlocked or its current lock is stale.
    ///
    /// The conditional UPDATE alone decides the outcome; the preceding
    /// read feeds only the takeover log line, so under a race that
    /// attribution is best-effort and may name a holder that changed
    /// before the UPDATE landed.
    pub async fn claim(&self, id: &str, agent_id: &str) -> Result<bool> {
        // Current holder, only for the takeover log line below.
        let previous: Option<Option<String>> =
            sqlx::query_scalar("SELECT processing_agent_id FROM work_items WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE work_items
             SET processing_agent_id = ?, processing_started_at = ?, updated_at = ?
             WHERE id = ?
               AND (processing_agent_id IS NULL
                    OR processing_started_at IS NULL
                    OR processing_started_at <= ?)",
        )
        .bind(agent_id)
        .bind(now)
        .bind(now)
        .bind(id)
        .bind(self.stale_cutoff())
        .execute(&self.pool)
        .await?;

        let claimed = result.rows_affected() == 1;
        if claimed {
            if let Some(Some(holder)) = previous {
                if holder != agent_id {
                    warn!(
                        item_id = %id,
                        previous_holder = %holder,
                        agent_id = %agent_id,
                        "recovered orphaned lock"
                    );
                }
            }
        } else {
            debug!(item_id = %id, agent_id = %agent_id, "claim lost, item already locked");
        }
        Ok(claimed)
    }

    /// Release the processing lock, but only when still held by
    /// `agent_id`. A late release from a timed-out holder is a no-op so
    /// it cannot clobber a newer claim. Returns whether the lock was
    /// actually released.
    pub async fn release(&self, id: &str, agent_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE work_items
             SET processing_agent_id = NULL, processing_started_at = NULL, updated_at = ?
             WHERE id = ? AND processing_agent_id = ?",
        )
        .bind(Utc::now())
        .bind(id)
        .bind(agent_id)
        .execute(&self.pool)
        .await?;

        let released = result.rows_affected() == 1;
        if !released {
            debug!(item_id = %id, agent_id = %agent_id, "release skipped, lock not held");
        }
        Ok(released)
    }

    /// Refresh the lock timestamp so a long-running agent does not get
    /// swept as stale. Returns whether the lock is still held.
    pub async fn heartbeat(&self, id: &str, agent_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE work_items SET processing_started_at = ? WHERE id = ? AND processing_agent_id = ?",
        )
        .bind(Utc::now())
        .bind(id)
        .bind(agent_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Force-clear every lock older than the staleness threshold.
    /// Returns the IDs whose locks were recovered.
    pub async fn sweep_stale(&self) -> Result<Vec<String>> {
        let cutoff = self.stale_cutoff();
        let rows = sqlx::query(
            "SELECT id FROM work_items
             WHERE processing_agent_id IS NOT NULL
               AND (processing_started_at IS NULL OR processing_started_at <= ?)",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        let mut recovered = Vec::new();
        for row in &rows {
            let id: String = row.try_get("id")?;
            // Re-checked per item: a heartbeat may have landed since the scan.
            let result = sqlx::query(
                "UPDATE work_items
                 SET processing_agent_id = NULL, processing_started_at = NULL, updated_at = ?
                 WHERE id = ?
                   AND processing_agent_id IS NOT NULL
                   AND (processing_started_at IS NULL OR processing_started_at <= ?)",
            )
            .bind(Utc::now())
            .bind(&id)
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 1 {
                warn!(item_id = %id, "cleared stale lock");
                recovered.push(id);
            }
        }
        Ok(recovered)
    }

    // ── History ─────────────────────────────────────────────────

    /// Append a history entry.
    pub async fn append_history(&self, entry: &WorkHistory) -> Result<()> {
        sqlx::query(
            "INSERT INTO work_history (id, work_item_id, action, content, created_by, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry.id)
        .bind(&entry.work_item_id)
        .bind(entry.action.to_string())
        .bind(&entry.content)
        .bind(&entry.created_by)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// The most recent `limit` history entries for an item, oldest
    /// first (ready to be rendered into a prompt).
    pub async fn recent_history(&self, work_item_id: &str, limit: u32) -> Result<Vec<WorkHistory>> {
        let rows: Vec<HistoryRow> = sqlx::query_as(
            "SELECT * FROM work_history
             WHERE work_item_id = ?
             ORDER BY created_at DESC
             LIMIT ?",
        )
        .bind(work_item_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut entries: Vec<WorkHistory> = rows
            .into_iter()
            .map(TryInto::try_into)
            .collect::<Result<_>>()?;
        entries.reverse();
        Ok(entries)
    }

    /// All error entries written since the given instant, oldest first.
    pub async fn recent_errors(
        &self,
        since: chrono::DateTime<Utc>,
    ) -> Result<Vec<WorkHistory>> {
        let rows: Vec<HistoryRow> = sqlx::query_as(
            "SELECT * FROM work_history
             WHERE action = 'error' AND created_at >= ?
             ORDER BY created_at",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Whether some bug was already synthesized from this error entry.
    pub async fn bug_exists_for_error(&self, history_id: &str) -> Result<bool> {
        let row: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM work_items WHERE source_error_id = ? LIMIT 1")
                .bind(history_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }

    // ── Bug metadata ────────────────────────────────────────────

    /// Insert or replace the investigation metadata for a bug.
    pub async fn save_bug_metadata(&self, meta: &BugMetadata) -> Result<()> {
        let item = self.require_item(&meta.work_item_id).await?;
        if item.kind != WorkItemKind::Bug {
            return Err(StoreError::KindMismatch {
                expected: WorkItemKind::Bug,
                actual: item.kind,
                id: meta.work_item_id.clone(),
            });
        }

        sqlx::query(
            "INSERT INTO bug_metadata (
                work_item_id, reproduction_test, root_cause,
                reproduction_steps, temporary_artifacts, suggested_fix
            ) VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(work_item_id) DO UPDATE SET
                reproduction_test = excluded.reproduction_test,
                root_cause = excluded.root_cause,
                reproduction_steps = excluded.reproduction_steps,
                temporary_artifacts = excluded.temporary_artifacts,
                suggested_fix = excluded.suggested_fix",
        )
        .bind(&meta.work_item_id)
        .bind(&meta.reproduction_test)
        .bind(&meta.root_cause)
        .bind(&meta.reproduction_steps)
        .bind(&meta.temporary_artifacts)
        .bind(&meta.suggested_fix)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Get the investigation metadata for a bug, if any was recorded.
    pub async fn get_bug_metadata(&self, work_item_id: &str) -> Result<Option<BugMetadata>> {
        let row: Option<BugMetadataRow> =
            sqlx::query_as("SELECT * FROM bug_metadata WHERE work_item_id = ?")
                .bind(work_item_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(Into::into))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct TestContext {
        store: WorkStore,
    }

    async fn create_test_context() -> TestContext {
        create_test_context_with_ttl(Duration::from_secs(60)).await
    }

    async fn create_test_context_with_ttl(ttl: Duration) -> TestContext {
        let store = WorkStore::in_memory(ttl).await.unwrap();
        TestContext { store }
    }

    #[tokio::test]
    async fn test_from_path_creates_parent_dirs() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("work.db");
        let store = WorkStore::from_path(&path, Duration::from_secs(60))
            .await
            .unwrap();

        let item = WorkItem::new(WorkItemKind::Task, "persisted");
        store.create_item(&item).await.unwrap();
        let loaded = store.get_item(&item.id).await.unwrap().unwrap();
        assert_eq!(loaded.title, "persisted");
    }

    #[tokio::test]
    async fn test_create_and_get_item() {
        let ctx = create_test_context().await;
        let store = &ctx.store;

        let item = WorkItem::new(WorkItemKind::Story, "Login page")
            .with_description("As a user I can log in")
            .with_status(WorkItemStatus::Ready)
            .with_assigned_role(RoleKind::Developer);
        store.create_item(&item).await.unwrap();

        let loaded = store.get_item(&item.id).await.unwrap().unwrap();
        assert_eq!(loaded.kind, WorkItemKind::Story);
        assert_eq!(loaded.status, WorkItemStatus::Ready);
        assert_eq!(loaded.assigned_role, Some(RoleKind::Developer));
        assert_eq!(loaded.description, "As a user I can log in");
        assert!(loaded.processing_agent_id.is_none());

        assert!(store.get_item("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_item() {
        let ctx = create_test_context().await;
        let store = &ctx.store;

        let mut item = WorkItem::new(WorkItemKind::Task, "old title");
        store.create_item(&item).await.unwrap();

        item.title = "new title".to_string();
        item.description = "details".to_string();
        store.update_item(&item).await.unwrap();

        let loaded = store.require_item(&item.id).await.unwrap();
        assert_eq!(loaded.title, "new title");
        assert_eq!(loaded.description, "details");

        let ghost = WorkItem::new(WorkItemKind::Task, "ghost");
        assert!(matches!(
            store.update_item(&ghost).await,
            Err(StoreError::ItemNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_set_status_records_history() {
        let ctx = create_test_context().await;
        let store = &ctx.store;

        let item = WorkItem::new(WorkItemKind::Story, "groomed");
        store.create_item(&item).await.unwrap();
        store
            .set_status(&item.id, WorkItemStatus::Ready, "dispatcher-1")
            .await
            .unwrap();

        let loaded = store.require_item(&item.id).await.unwrap();
        assert_eq!(loaded.status, WorkItemStatus::Ready);

        let history = store.recent_history(&item.id, 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].action, HistoryAction::StatusChange);
        assert_eq!(history[0].content, "backlog -> ready");
        assert_eq!(history[0].created_by, "dispatcher-1");
    }

    #[tokio::test]
    async fn test_set_status_rejects_illegal_transition() {
        let ctx = create_test_context().await;
        let store = &ctx.store;

        let item = WorkItem::new(WorkItemKind::Task, "skipping ahead");
        store.create_item(&item).await.unwrap();

        let result = store
            .set_status(&item.id, WorkItemStatus::Review, "tester")
            .await;
        assert!(matches!(
            result,
            Err(StoreError::InvalidTransition { .. })
        ));

        // Same status is an idempotent no-op, not a violation.
        store
            .set_status(&item.id, WorkItemStatus::Backlog, "tester")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_epic_status_not_machine_checked() {
        let ctx = create_test_context().await;
        let store = &ctx.store;

        let epic = WorkItem::new(WorkItemKind::Epic, "big thing")
            .with_status(WorkItemStatus::Review);
        store.create_item(&epic).await.unwrap();

        // Roll-up style write that no worker machine edge allows.
        store
            .set_status(&epic.id, WorkItemStatus::Backlog, "roll-up")
            .await
            .unwrap();
        let loaded = store.require_item(&epic.id).await.unwrap();
        assert_eq!(loaded.status, WorkItemStatus::Backlog);
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let ctx = create_test_context().await;
        let store = &ctx.store;

        let item = WorkItem::new(WorkItemKind::Bug, "crash on save");
        store.create_item(&item).await.unwrap();

        assert!(store.claim(&item.id, "agent-a").await.unwrap());
        assert!(!store.claim(&item.id, "agent-b").await.unwrap());

        let loaded = store.require_item(&item.id).await.unwrap();
        assert_eq!(loaded.processing_agent_id.as_deref(), Some("agent-a"));
        assert!(loaded.processing_started_at.is_some());
    }

    #[tokio::test]
    async fn test_claim_succeeds_after_stale_timeout() {
        let ctx = create_test_context_with_ttl(Duration::from_millis(200)).await;
        let store = &ctx.store;

        let item = WorkItem::new(WorkItemKind::Task, "abandoned");
        store.create_item(&item).await.unwrap();

        assert!(store.claim(&item.id, "agent-a").await.unwrap());
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(store.claim(&item.id, "agent-b").await.unwrap());

        let loaded = store.require_item(&item.id).await.unwrap();
        assert_eq!(loaded.processing_agent_id.as_deref(), Some("agent-b"));
    }

    #[tokio::test]
    async fn test_release_requires_holder() {
        let ctx = create_test_context().await;
        let store = &ctx.store;

        let item = WorkItem::new(WorkItemKind::Task, "contested");
        store.create_item(&item).await.unwrap();

        assert!(store.claim(&item.id, "agent-a").await.unwrap());

        // A late release from someone else must not clobber the lock.
        assert!(!store.release(&item.id, "agent-b").await.unwrap());
        assert!(!store.claim(&item.id, "agent-c").await.unwrap());

        assert!(store.release(&item.id, "agent-a").await.unwrap());
        assert!(store.claim(&item.id, "agent-c").await.unwrap());
    }

    #[tokio::test]
    async fn test_stale_holder_release_is_noop_after_reclaim() {
        let ctx = create_test_context_with_ttl(Duration::from_millis(200)).await;
        let store = &ctx.store;

        let item = WorkItem::new(WorkItemKind::Bug, "slow agent");
        store.create_item(&item).await.unwrap();

        assert!(store.claim(&item.id, "agent-a").await.unwrap());
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(store.claim(&item.id, "agent-b").await.unwrap());

        // agent-a wakes up late; its release must not free agent-b's lock.
        assert!(!store.release(&item.id, "agent-a").await.unwrap());
        let loaded = store.require_item(&item.id).await.unwrap();
        assert_eq!(loaded.processing_agent_id.as_deref(), Some("agent-b"));
    }

    #[tokio::test]
    async fn test_heartbeat_extends_lease() {
        let ctx = create_test_context_with_ttl(Duration::from_millis(400)).await;
        let store = &ctx.store;

        let item = WorkItem::new(WorkItemKind::Task, "long running");
        store.create_item(&item).await.unwrap();

        assert!(store.claim(&item.id, "agent-a").await.unwrap());
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(store.heartbeat(&item.id, "agent-a").await.unwrap());
        tokio::time::sleep(Duration::from_millis(250)).await;

        // 500ms since claim but only 250ms since the heartbeat.
        assert!(!store.claim(&item.id, "agent-b").await.unwrap());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(store.claim(&item.id, "agent-b").await.unwrap());

        // Heartbeat from an agent that lost the lock reports failure.
        assert!(!store.heartbeat(&item.id, "agent-a").await.unwrap());
    }

    #[tokio::test]
    async fn test_sweep_stale_clears_expired_locks() {
        let ctx = create_test_context_with_ttl(Duration::from_millis(200)).await;
        let store = &ctx.store;

        let old = WorkItem::new(WorkItemKind::Task, "stale");
        let fresh = WorkItem::new(WorkItemKind::Task, "fresh");
        store.create_item(&old).await.unwrap();
        store.create_item(&fresh).await.unwrap();

        assert!(store.claim(&old.id, "agent-a").await.unwrap());
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(store.claim(&fresh.id, "agent-b").await.unwrap());

        let recovered = store.sweep_stale().await.unwrap();
        assert_eq!(recovered, vec![old.id.clone()]);

        let loaded = store.require_item(&old.id).await.unwrap();
        assert!(loaded.processing_agent_id.is_none());
        let loaded = store.require_item(&fresh.id).await.unwrap();
        assert_eq!(loaded.processing_agent_id.as_deref(), Some("agent-b"));
    }

    #[tokio::test]
    async fn test_list_available_filters_locked_and_done() {
        let ctx = create_test_context().await;
        let store = &ctx.store;

        let open = WorkItem::new(WorkItemKind::Story, "open");
        let locked = WorkItem::new(WorkItemKind::Story, "locked");
        let done = WorkItem::new(WorkItemKind::Story, "done").with_status(WorkItemStatus::Done);
        store.create_item(&open).await.unwrap();
        store.create_item(&locked).await.unwrap();
        store.create_item(&done).await.unwrap();
        assert!(store.claim(&locked.id, "agent-a").await.unwrap());

        let available = store.list_available().await.unwrap();
        let ids: Vec<_> = available.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec![open.id.as_str()]);
    }

    #[tokio::test]
    async fn test_list_available_includes_stale_locked() {
        let ctx = create_test_context_with_ttl(Duration::from_millis(200)).await;
        let store = &ctx.store;

        let item = WorkItem::new(WorkItemKind::Bug, "orphaned");
        store.create_item(&item).await.unwrap();
        assert!(store.claim(&item.id, "agent-a").await.unwrap());

        assert!(store.list_available().await.unwrap().is_empty());
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(store.list_available().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_count_active_developers() {
        let ctx = create_test_context().await;
        let store = &ctx.store;

        for title in ["a", "b"] {
            let item = WorkItem::new(WorkItemKind::Story, title)
                .with_status(WorkItemStatus::InProgress)
                .with_assigned_role(RoleKind::Developer);
            store.create_item(&item).await.unwrap();
        }
        let candidate = WorkItem::new(WorkItemKind::Story, "candidate")
            .with_status(WorkItemStatus::InProgress)
            .with_assigned_role(RoleKind::Developer);
        store.create_item(&candidate).await.unwrap();

        let reviewing = WorkItem::new(WorkItemKind::Story, "reviewing")
            .with_status(WorkItemStatus::Review)
            .with_assigned_role(RoleKind::Developer);
        store.create_item(&reviewing).await.unwrap();

        assert_eq!(store.count_active_developers(None).await.unwrap(), 3);
        assert_eq!(
            store
                .count_active_developers(Some(&candidate.id))
                .await
                .unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn test_recent_history_is_chronological_and_limited() {
        let ctx = create_test_context().await;
        let store = &ctx.store;

        let item = WorkItem::new(WorkItemKind::Task, "chatty");
        store.create_item(&item).await.unwrap();
        for i in 0..5 {
            store
                .append_history(&WorkHistory::new(
                    &item.id,
                    HistoryAction::Decision,
                    format!("decision {i}"),
                    "dispatcher-1",
                ))
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let recent = store.recent_history(&item.id, 3).await.unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].content, "decision 2");
        assert_eq!(recent[2].content, "decision 4");
    }

    #[tokio::test]
    async fn test_recent_errors_filters_by_action_and_time() {
        let ctx = create_test_context().await;
        let store = &ctx.store;

        let item = WorkItem::new(WorkItemKind::Story, "flaky");
        store.create_item(&item).await.unwrap();
        store
            .append_history(&WorkHistory::new(
                &item.id,
                HistoryAction::Error,
                "{\"error_type\":\"EXECUTION_ERROR\"}",
                "developer-1",
            ))
            .await
            .unwrap();
        store
            .append_history(&WorkHistory::new(
                &item.id,
                HistoryAction::Decision,
                "assign developer",
                "dispatcher-1",
            ))
            .await
            .unwrap();

        let since = Utc::now() - chrono::Duration::hours(1);
        let errors = store.recent_errors(since).await.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].action, HistoryAction::Error);

        let future = Utc::now() + chrono::Duration::seconds(5);
        assert!(store.recent_errors(future).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bug_metadata_upsert() {
        let ctx = create_test_context().await;
        let store = &ctx.store;

        let bug = WorkItem::new(WorkItemKind::Bug, "panic in parser");
        store.create_item(&bug).await.unwrap();

        let mut meta = BugMetadata::new(&bug.id);
        meta.root_cause = Some("unchecked index".to_string());
        store.save_bug_metadata(&meta).await.unwrap();

        meta.reproduction_test = Some("test_parse_empty_input".to_string());
        store.save_bug_metadata(&meta).await.unwrap();

        let loaded = store.get_bug_metadata(&bug.id).await.unwrap().unwrap();
        assert_eq!(loaded.root_cause.as_deref(), Some("unchecked index"));
        assert_eq!(
            loaded.reproduction_test.as_deref(),
            Some("test_parse_empty_input")
        );

        assert!(store.get_bug_metadata("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_bug_metadata_rejects_non_bug() {
        let ctx = create_test_context().await;
        let store = &ctx.store;

        let story = WorkItem::new(WorkItemKind::Story, "not a bug");
        store.create_item(&story).await.unwrap();

        let meta = BugMetadata::new(&story.id);
        assert!(matches!(
            store.save_bug_metadata(&meta).await,
            Err(StoreError::KindMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_create_linked_bug_is_idempotent() {
        let ctx = create_test_context().await;
        let store = &ctx.store;

        let first = WorkItem::new(WorkItemKind::Bug, "auto bug")
            .with_status(WorkItemStatus::Ready)
            .with_source_error("history-123");
        assert!(store.create_linked_bug(&first).await.unwrap());

        // Re-sweep synthesizes the same bug with a fresh UUID.
        let second = WorkItem::new(WorkItemKind::Bug, "auto bug")
            .with_status(WorkItemStatus::Ready)
            .with_source_error("history-123");
        assert!(!store.create_linked_bug(&second).await.unwrap());

        assert!(store.bug_exists_for_error("history-123").await.unwrap());
        assert!(!store.bug_exists_for_error("history-999").await.unwrap());
    }

    #[tokio::test]
    async fn test_recompute_epic_status() {
        let ctx = create_test_context().await;
        let store = &ctx.store;

        let epic = WorkItem::new(WorkItemKind::Epic, "checkout flow");
        store.create_item(&epic).await.unwrap();

        // No children: epic keeps its current status.
        assert_eq!(
            store.recompute_epic_status(&epic.id, "dispatcher-1").await.unwrap(),
            WorkItemStatus::Backlog
        );

        let a = WorkItem::new(WorkItemKind::Story, "cart")
            .with_parent(&epic.id)
            .with_status(WorkItemStatus::Done);
        let b = WorkItem::new(WorkItemKind::Story, "payment")
            .with_parent(&epic.id)
            .with_status(WorkItemStatus::InProgress);
        store.create_item(&a).await.unwrap();
        store.create_item(&b).await.unwrap();

        assert_eq!(
            store.recompute_epic_status(&epic.id, "dispatcher-1").await.unwrap(),
            WorkItemStatus::InProgress
        );

        store
            .set_status(&b.id, WorkItemStatus::Review, "developer-1")
            .await
            .unwrap();
        store
            .set_status(&b.id, WorkItemStatus::Done, "reviewer-1")
            .await
            .unwrap();
        assert_eq!(
            store.recompute_epic_status(&epic.id, "dispatcher-1").await.unwrap(),
            WorkItemStatus::Done
        );

        let story = WorkItem::new(WorkItemKind::Story, "not an epic");
        store.create_item(&story).await.unwrap();
        assert!(matches!(
            store.recompute_epic_status(&story.id, "x").await,
            Err(StoreError::KindMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_delete_item_cascades() {
        let ctx = create_test_context().await;
        let store = &ctx.store;

        let epic = WorkItem::new(WorkItemKind::Epic, "doomed");
        store.create_item(&epic).await.unwrap();
        let child = WorkItem::new(WorkItemKind::Story, "child").with_parent(&epic.id);
        store.create_item(&child).await.unwrap();
        store
            .append_history(&WorkHistory::new(
                &child.id,
                HistoryAction::Decision,
                "assign developer",
                "dispatcher-1",
            ))
            .await
            .unwrap();

        store.delete_item(&epic.id).await.unwrap();
        assert!(store.get_item(&epic.id).await.unwrap().is_none());
        assert!(store.get_item(&child.id).await.unwrap().is_none());
        assert!(store.recent_history(&child.id, 10).await.unwrap().is_empty());
    }
}
