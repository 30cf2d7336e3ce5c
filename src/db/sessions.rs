//! Session continuity store.
//!
//! Maps a thread to the last Agent session reference seen for it. Sessions
//! are advisory: a missing or stale entry must never block a run, it only
//! downgrades `--resume` to a fresh invocation.

use chrono::{DateTime, Duration, Utc};
use libsql::params;

use crate::db::{fmt_ts, get_text, get_ts, Database};
use crate::error::DatabaseError;

pub const SESSION_TTL_HOURS: i64 = 24;

#[derive(Debug, Clone)]
pub struct Session {
    pub thread_id: String,
    pub project_alias: String,
    pub session_ref: String,
    pub last_used_at: DateTime<Utc>,
}

impl Database {
    pub async fn upsert_session(
        &self,
        thread_id: &str,
        project_alias: &str,
        session_ref: &str,
    ) -> Result<(), DatabaseError> {
        let conn = self.connect().await?;
        conn.execute(
            "INSERT INTO sessions (thread_id, project_alias, session_ref, last_used_at) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(thread_id) DO UPDATE SET \
                 project_alias = excluded.project_alias, \
                 session_ref = excluded.session_ref, \
                 last_used_at = excluded.last_used_at",
            params![thread_id, project_alias, session_ref, fmt_ts(&Utc::now())],
        )
        .await?;
        Ok(())
    }

    /// Live (non-expired) session for a thread, if any.
    pub async fn get_session(&self, thread_id: &str) -> Result<Option<Session>, DatabaseError> {
        let cutoff = Utc::now() - Duration::hours(SESSION_TTL_HOURS);
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT thread_id, project_alias, session_ref, last_used_at \
                 FROM sessions WHERE thread_id = ?1 AND last_used_at >= ?2",
                params![thread_id, fmt_ts(&cutoff)],
            )
            .await?;
        Ok(rows.next().await?.map(|row| Session {
            thread_id: get_text(&row, 0),
            project_alias: get_text(&row, 1),
            session_ref: get_text(&row, 2),
            last_used_at: get_ts(&row, 3),
        }))
    }

    pub async fn delete_session(&self, thread_id: &str) -> Result<(), DatabaseError> {
        let conn = self.connect().await?;
        conn.execute(
            "DELETE FROM sessions WHERE thread_id = ?1",
            params![thread_id],
        )
        .await?;
        Ok(())
    }

    /// Drop sessions idle past the TTL. Returns the number pruned.
    pub async fn prune_stale_sessions(&self) -> Result<u64, DatabaseError> {
        let cutoff = Utc::now() - Duration::hours(SESSION_TTL_HOURS);
        let conn = self.connect().await?;
        let pruned = conn
            .execute(
                "DELETE FROM sessions WHERE last_used_at < ?1",
                params![fmt_ts(&cutoff)],
            )
            .await?;
        Ok(pruned)
    }
}
