//! Append-only audit journal.
//!
//! Every state transition the engine drives lands here, redacted before it
//! is written. Mutation is rejected by storage-level triggers, so the
//! journal's history is trustworthy even against buggy callers.

use chrono::{DateTime, Utc};
use libsql::params;

use crate::db::{get_i64, get_opt_text, get_text, get_ts, opt_text_owned, Database};
use crate::error::DatabaseError;
use crate::redact::redact_value;

#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub id: i64,
    pub ts: DateTime<Utc>,
    pub task_id: Option<String>,
    pub project_alias: Option<String>,
    pub thread_id: Option<String>,
    pub actor: String,
    pub action: String,
    pub detail: serde_json::Value,
}

/// Insert parameters; ids are optional because not every event belongs to a
/// task (e.g. startup warnings).
#[derive(Debug, Clone, Default)]
pub struct AuditEvent {
    pub task_id: Option<String>,
    pub project_alias: Option<String>,
    pub thread_id: Option<String>,
    pub actor: String,
    pub action: String,
    pub detail: serde_json::Value,
}

impl AuditEvent {
    pub fn new(actor: &str, action: &str) -> Self {
        Self {
            actor: actor.to_string(),
            action: action.to_string(),
            detail: serde_json::json!({}),
            ..Default::default()
        }
    }

    pub fn task(mut self, task_id: &str) -> Self {
        self.task_id = Some(task_id.to_string());
        self
    }

    pub fn project(mut self, alias: &str) -> Self {
        self.project_alias = Some(alias.to_string());
        self
    }

    pub fn thread(mut self, thread_id: &str) -> Self {
        self.thread_id = Some(thread_id.to_string());
        self
    }

    pub fn detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }
}

const AUDIT_COLUMNS: &str = "id, ts, task_id, project_alias, thread_id, actor, action, detail";

fn row_to_entry(row: &libsql::Row) -> AuditEntry {
    AuditEntry {
        id: get_i64(row, 0),
        ts: get_ts(row, 1),
        task_id: get_opt_text(row, 2),
        project_alias: get_opt_text(row, 3),
        thread_id: get_opt_text(row, 4),
        actor: get_text(row, 5),
        action: get_text(row, 6),
        detail: get_opt_text(row, 7)
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or(serde_json::Value::Null),
    }
}

impl Database {
    /// Redacts the detail tree, then appends. Failures are returned so the
    /// caller can log them; they are never silently swallowed here.
    pub async fn audit(&self, event: AuditEvent) -> Result<(), DatabaseError> {
        let detail = redact_value(&event.detail);
        let conn = self.connect().await?;
        conn.execute(
            "INSERT INTO audit_log (ts, task_id, project_alias, thread_id, actor, action, detail) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                crate::db::fmt_ts(&Utc::now()),
                opt_text_owned(event.task_id),
                opt_text_owned(event.project_alias),
                opt_text_owned(event.thread_id),
                event.actor,
                event.action,
                detail.to_string()
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn audit_by_task(&self, task_id: &str) -> Result<Vec<AuditEntry>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {AUDIT_COLUMNS} FROM audit_log WHERE task_id = ?1 ORDER BY id"),
                params![task_id],
            )
            .await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(row_to_entry(&row));
        }
        Ok(out)
    }

    pub async fn audit_by_project(
        &self,
        project_alias: &str,
        limit: u32,
    ) -> Result<Vec<AuditEntry>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {AUDIT_COLUMNS} FROM audit_log WHERE project_alias = ?1 \
                     ORDER BY id DESC LIMIT ?2"
                ),
                params![project_alias, i64::from(limit)],
            )
            .await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(row_to_entry(&row));
        }
        Ok(out)
    }

    pub async fn audit_recent(&self, limit: u32) -> Result<Vec<AuditEntry>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {AUDIT_COLUMNS} FROM audit_log ORDER BY id DESC LIMIT ?1"),
                params![i64::from(limit)],
            )
            .await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(row_to_entry(&row));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn entries_are_redacted_before_insert() {
        let db = Database::open_memory().await.unwrap();
        db.audit(
            AuditEvent::new("engine", "task_failed")
                .task("task-1")
                .detail(serde_json::json!({
                    "excerpt": "leaked ghp_FAKEtoken12345678 in output"
                })),
        )
        .await
        .unwrap();
        let entries = db.audit_by_task("task-1").await.unwrap();
        assert_eq!(entries.len(), 1);
        let text = entries[0].detail.to_string();
        assert!(!text.contains("ghp_FAKE"));
        assert!(text.contains("[REDACTED]"));
    }

    #[tokio::test]
    async fn update_and_delete_are_rejected_by_triggers() {
        let db = Database::open_memory().await.unwrap();
        db.audit(AuditEvent::new("engine", "task_created").task("task-1"))
            .await
            .unwrap();
        let conn = db.connect().await.unwrap();
        let update = conn
            .execute("UPDATE audit_log SET action = 'rewritten'", ())
            .await;
        assert!(update.is_err(), "UPDATE on audit_log must abort");
        let delete = conn.execute("DELETE FROM audit_log", ()).await;
        assert!(delete.is_err(), "DELETE on audit_log must abort");

        // the row is untouched
        let entries = db.audit_by_task("task-1").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, "task_created");
    }

    #[tokio::test]
    async fn recent_is_newest_first_and_limited() {
        let db = Database::open_memory().await.unwrap();
        for i in 0..5 {
            db.audit(AuditEvent::new("engine", &format!("event_{i}")))
                .await
                .unwrap();
        }
        let recent = db.audit_recent(2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].action, "event_4");
        assert_eq!(recent[1].action, "event_3");
    }
}
