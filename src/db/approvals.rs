//! Approval records for the terminate-and-replay protocol.
//!
//! Resolution is race-safe by construction: the pending -> terminal flip is
//! a conditional UPDATE, and whoever changes zero rows lost the race.

use chrono::{DateTime, Utc};
use libsql::params;
use uuid::Uuid;

use crate::db::{fmt_ts, get_opt_text, get_opt_ts, get_text, get_ts, Database};
use crate::error::DatabaseError;

/// What kind of gated action the Agent attempted, inferred from the
/// permission-denial event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionClass {
    FileDelete,
    GitPush,
    GitForce,
    DestructiveCmd,
    ExternalRequest,
    InstallPackage,
    Unknown,
}

impl ActionClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionClass::FileDelete => "file_delete",
            ActionClass::GitPush => "git_push",
            ActionClass::GitForce => "git_force",
            ActionClass::DestructiveCmd => "destructive_cmd",
            ActionClass::ExternalRequest => "external_request",
            ActionClass::InstallPackage => "install_package",
            ActionClass::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> ActionClass {
        match s {
            "file_delete" => ActionClass::FileDelete,
            "git_push" => ActionClass::GitPush,
            "git_force" => ActionClass::GitForce,
            "destructive_cmd" => ActionClass::DestructiveCmd,
            "external_request" => ActionClass::ExternalRequest,
            "install_package" => ActionClass::InstallPackage,
            _ => ActionClass::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Denied => "denied",
        }
    }

    pub fn parse(s: &str) -> ApprovalStatus {
        match s {
            "approved" => ApprovalStatus::Approved,
            "denied" => ApprovalStatus::Denied,
            _ => ApprovalStatus::Pending,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Approval {
    pub id: String,
    pub task_id: String,
    pub action_class: ActionClass,
    /// Redacted human-readable description of the gated action.
    pub description: String,
    pub status: ApprovalStatus,
    pub requested_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
}

const APPROVAL_COLUMNS: &str =
    "id, task_id, action_class, description, status, requested_at, resolved_at, resolved_by";

fn row_to_approval(row: &libsql::Row) -> Approval {
    Approval {
        id: get_text(row, 0),
        task_id: get_text(row, 1),
        action_class: ActionClass::parse(&get_text(row, 2)),
        description: get_text(row, 3),
        status: ApprovalStatus::parse(&get_text(row, 4)),
        requested_at: get_ts(row, 5),
        resolved_at: get_opt_ts(row, 6),
        resolved_by: get_opt_text(row, 7),
    }
}

impl Database {
    pub async fn insert_approval(
        &self,
        task_id: &str,
        action_class: ActionClass,
        description: &str,
    ) -> Result<Approval, DatabaseError> {
        let approval = Approval {
            id: Uuid::new_v4().to_string(),
            task_id: task_id.to_string(),
            action_class,
            description: description.to_string(),
            status: ApprovalStatus::Pending,
            requested_at: Utc::now(),
            resolved_at: None,
            resolved_by: None,
        };
        let conn = self.connect().await?;
        conn.execute(
            "INSERT INTO approvals (id, task_id, action_class, description, status, requested_at) \
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5)",
            params![
                approval.id.clone(),
                approval.task_id.clone(),
                approval.action_class.as_str(),
                approval.description.clone(),
                fmt_ts(&approval.requested_at)
            ],
        )
        .await?;
        Ok(approval)
    }

    pub async fn get_approval(&self, id: &str) -> Result<Option<Approval>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {APPROVAL_COLUMNS} FROM approvals WHERE id = ?1"),
                params![id],
            )
            .await?;
        Ok(rows.next().await?.map(|row| row_to_approval(&row)))
    }

    /// Atomically flip pending -> approved/denied. Returns false when the
    /// row was no longer pending (double resolve, or already expired).
    pub async fn resolve_approval_row(
        &self,
        id: &str,
        approve: bool,
        resolver: &str,
    ) -> Result<bool, DatabaseError> {
        let status = if approve {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Denied
        };
        let conn = self.connect().await?;
        let changed = conn
            .execute(
                "UPDATE approvals SET status = ?1, resolved_at = ?2, resolved_by = ?3 \
                 WHERE id = ?4 AND status = 'pending'",
                params![status.as_str(), fmt_ts(&Utc::now()), resolver, id],
            )
            .await?;
        Ok(changed > 0)
    }

    /// Deny every pending approval requested before `cutoff`, attributing the
    /// resolution to `system_timeout`. Returns the expired approvals so the
    /// caller can fail their tasks and notify adapters.
    pub async fn expire_pending_approvals(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Approval>, DatabaseError> {
        let conn = self.connect().await?;
        let tx = conn
            .transaction_with_behavior(libsql::TransactionBehavior::Immediate)
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        let mut rows = tx
            .query(
                &format!(
                    "SELECT {APPROVAL_COLUMNS} FROM approvals \
                     WHERE status = 'pending' AND requested_at < ?1"
                ),
                params![fmt_ts(&cutoff)],
            )
            .await?;
        let mut expired = Vec::new();
        while let Some(row) = rows.next().await? {
            expired.push(row_to_approval(&row));
        }
        if !expired.is_empty() {
            tx.execute(
                "UPDATE approvals SET status = 'denied', resolved_at = ?1, \
                 resolved_by = 'system_timeout' \
                 WHERE status = 'pending' AND requested_at < ?2",
                params![fmt_ts(&Utc::now()), fmt_ts(&cutoff)],
            )
            .await?;
        }
        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        for approval in &mut expired {
            approval.status = ApprovalStatus::Denied;
            approval.resolved_by = Some("system_timeout".to_string());
        }
        Ok(expired)
    }

}
