//! Thread -> project bindings.
//!
//! An adapter conversation thread is bound to exactly one project; prompts
//! arriving on the thread run against that project until rebound.

use chrono::{DateTime, Utc};
use libsql::params;

use crate::db::{fmt_ts, get_text, get_ts, Database};
use crate::error::DatabaseError;

#[derive(Debug, Clone)]
pub struct ThreadBinding {
    pub thread_id: String,
    pub project_alias: String,
    pub adapter: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

impl Database {
    pub async fn bind_thread_row(
        &self,
        thread_id: &str,
        project_alias: &str,
        adapter: &str,
        created_by: &str,
    ) -> Result<(), DatabaseError> {
        let conn = self.connect().await?;
        conn.execute(
            "INSERT INTO thread_bindings (thread_id, project_alias, adapter, created_by, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(thread_id) DO UPDATE SET \
                 project_alias = excluded.project_alias, \
                 adapter = excluded.adapter, \
                 created_by = excluded.created_by, \
                 created_at = excluded.created_at",
            params![thread_id, project_alias, adapter, created_by, fmt_ts(&Utc::now())],
        )
        .await?;
        Ok(())
    }

    pub async fn get_binding(
        &self,
        thread_id: &str,
    ) -> Result<Option<ThreadBinding>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT thread_id, project_alias, adapter, created_by, created_at \
                 FROM thread_bindings WHERE thread_id = ?1",
                params![thread_id],
            )
            .await?;
        Ok(rows.next().await?.map(|row| ThreadBinding {
            thread_id: get_text(&row, 0),
            project_alias: get_text(&row, 1),
            adapter: get_text(&row, 2),
            created_by: get_text(&row, 3),
            created_at: get_ts(&row, 4),
        }))
    }
}
