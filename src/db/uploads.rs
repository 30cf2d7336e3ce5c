//! Upload reference store.
//!
//! Rows are opaque handles; path validation happens in `crate::uploads`
//! before anything is inserted here.

use chrono::{DateTime, Duration, Utc};
use libsql::params;
use uuid::Uuid;

use crate::db::{fmt_opt_ts, fmt_ts, get_opt_ts, get_text, get_ts, Database};
use crate::error::DatabaseError;

/// Default lifetime of an unconsumed upload.
pub const UPLOAD_TTL_HOURS: i64 = 24;

#[derive(Debug, Clone)]
pub struct UploadRef {
    pub id: String,
    pub project_alias: String,
    /// Client-supplied name, display only; never used to build paths.
    pub original_name: String,
    pub server_path: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub consumed_at: Option<DateTime<Utc>>,
}

const UPLOAD_COLUMNS: &str =
    "id, project_alias, original_name, server_path, created_at, expires_at, consumed_at";

fn row_to_upload(row: &libsql::Row) -> UploadRef {
    UploadRef {
        id: get_text(row, 0),
        project_alias: get_text(row, 1),
        original_name: get_text(row, 2),
        server_path: get_text(row, 3),
        created_at: get_ts(row, 4),
        expires_at: get_opt_ts(row, 5),
        consumed_at: get_opt_ts(row, 6),
    }
}

impl Database {
    pub async fn insert_upload_ref(
        &self,
        project_alias: &str,
        original_name: &str,
        server_path: &str,
    ) -> Result<UploadRef, DatabaseError> {
        let upload = UploadRef {
            id: Uuid::new_v4().to_string(),
            project_alias: project_alias.to_string(),
            original_name: original_name.to_string(),
            server_path: server_path.to_string(),
            created_at: Utc::now(),
            expires_at: Some(Utc::now() + Duration::hours(UPLOAD_TTL_HOURS)),
            consumed_at: None,
        };
        let conn = self.connect().await?;
        conn.execute(
            "INSERT INTO upload_refs (id, project_alias, original_name, server_path, \
             created_at, expires_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                upload.id.clone(),
                upload.project_alias.clone(),
                upload.original_name.clone(),
                upload.server_path.clone(),
                fmt_ts(&upload.created_at),
                fmt_opt_ts(&upload.expires_at)
            ],
        )
        .await?;
        Ok(upload)
    }

    pub async fn get_upload_ref(&self, id: &str) -> Result<Option<UploadRef>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {UPLOAD_COLUMNS} FROM upload_refs WHERE id = ?1"),
                params![id],
            )
            .await?;
        Ok(rows.next().await?.map(|row| row_to_upload(&row)))
    }

    pub async fn mark_upload_consumed(&self, id: &str) -> Result<bool, DatabaseError> {
        let conn = self.connect().await?;
        let changed = conn
            .execute(
                "UPDATE upload_refs SET consumed_at = ?1 \
                 WHERE id = ?2 AND consumed_at IS NULL",
                params![fmt_ts(&Utc::now()), id],
            )
            .await?;
        Ok(changed > 0)
    }

    /// Remove expired refs, returning them so the caller can unlink files.
    pub async fn sweep_expired_uploads(&self) -> Result<Vec<UploadRef>, DatabaseError> {
        let now = fmt_ts(&Utc::now());
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {UPLOAD_COLUMNS} FROM upload_refs \
                     WHERE expires_at IS NOT NULL AND expires_at < ?1"
                ),
                params![now.clone()],
            )
            .await?;
        let mut expired = Vec::new();
        while let Some(row) = rows.next().await? {
            expired.push(row_to_upload(&row));
        }
        if !expired.is_empty() {
            conn.execute(
                "DELETE FROM upload_refs WHERE expires_at IS NOT NULL AND expires_at < ?1",
                params![now],
            )
            .await?;
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn consume_is_single_shot() {
        let db = Database::open_memory().await.unwrap();
        let up = db
            .insert_upload_ref("alpha", "diagram.png", "/srv/uploads/alpha/x/y.png")
            .await
            .unwrap();
        assert!(db.mark_upload_consumed(&up.id).await.unwrap());
        assert!(!db.mark_upload_consumed(&up.id).await.unwrap());
        let stored = db.get_upload_ref(&up.id).await.unwrap().unwrap();
        assert!(stored.consumed_at.is_some());
    }

    #[tokio::test]
    async fn sweep_removes_only_expired_rows() {
        let db = Database::open_memory().await.unwrap();
        let old = db
            .insert_upload_ref("alpha", "a.txt", "/srv/uploads/alpha/x/a.txt")
            .await
            .unwrap();
        let conn = db.connect().await.unwrap();
        conn.execute(
            "UPDATE upload_refs SET expires_at = ?1 WHERE id = ?2",
            params![fmt_ts(&(Utc::now() - Duration::hours(1))), old.id.clone()],
        )
        .await
        .unwrap();
        let fresh = db
            .insert_upload_ref("alpha", "b.txt", "/srv/uploads/alpha/x/b.txt")
            .await
            .unwrap();

        let swept = db.sweep_expired_uploads().await.unwrap();
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].id, old.id);
        assert!(db.get_upload_ref(&old.id).await.unwrap().is_none());
        assert!(db.get_upload_ref(&fresh.id).await.unwrap().is_some());
    }
}
