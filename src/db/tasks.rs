//! Durable task queue.
//!
//! The queue owns the per-project mutual exclusion: dequeue is a single
//! transaction that skips any project which already has a row in
//! {running, needs_approval}. A restart therefore cannot leak a second
//! concurrent run into a project: the invariant lives in the data, not in
//! an engine-side lock map.

use chrono::{DateTime, Utc};
use libsql::params;
use uuid::Uuid;

use crate::db::{
    fmt_ts, get_bool, get_i64, get_opt_i64, get_opt_text, get_opt_ts, get_text, get_ts, Database,
};
use crate::error::{DatabaseError, EngineError};

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Queued,
    Running,
    NeedsApproval,
    Done,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::NeedsApproval => "needs_approval",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> TaskStatus {
        match s {
            "running" => TaskStatus::Running,
            "needs_approval" => TaskStatus::NeedsApproval,
            "done" => TaskStatus::Done,
            "failed" => TaskStatus::Failed,
            _ => TaskStatus::Queued,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed)
    }
}

/// Engine-visible failure codes, stored verbatim in `tasks.error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    QueueFull,
    UnknownProject,
    SilenceTimeout,
    Timeout,
    BudgetExceeded,
    ApprovalDenied,
    ApprovalTimeout,
    CancelledByUser,
    CliError,
    WorkerCrashedRecovery,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::QueueFull => "queue_full",
            ErrorCode::UnknownProject => "unknown_project",
            ErrorCode::SilenceTimeout => "silence_timeout",
            ErrorCode::Timeout => "timeout",
            ErrorCode::BudgetExceeded => "budget_exceeded",
            ErrorCode::ApprovalDenied => "approval_denied",
            ErrorCode::ApprovalTimeout => "approval_timeout",
            ErrorCode::CancelledByUser => "cancelled_by_user",
            ErrorCode::CliError => "cli_error",
            ErrorCode::WorkerCrashedRecovery => "worker_crashed_recovery",
        }
    }
}

/// A queued or executed prompt run.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: String,
    pub project_alias: String,
    /// Project path snapshot taken at enqueue.
    pub project_path: String,
    pub prompt: String,
    pub thread_id: String,
    pub adapter: String,
    pub continue_session: bool,
    pub status: TaskStatus,
    pub result: Option<String>,
    pub error: Option<String>,
    pub tokens_used: i64,
    pub token_budget: Option<i64>,
    pub worker_pid: Option<i64>,
    /// Wall-clock start time (epoch seconds) of the worker process.
    pub worker_pid_start_ts: Option<i64>,
    pub checkpoint: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Input for `enqueue`.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub project_alias: String,
    pub project_path: String,
    pub prompt: String,
    pub thread_id: String,
    pub adapter: String,
    pub continue_session: bool,
    pub token_budget: Option<i64>,
}

/// Per-project queue snapshot for `get_queue_status`.
#[derive(Debug, Clone)]
pub struct ProjectQueueStatus {
    pub project_alias: String,
    pub queued: i64,
    /// The task currently holding the project lock, if any.
    pub active_task_id: Option<String>,
    pub active_status: Option<TaskStatus>,
}

const TASK_COLUMNS: &str = "\
    id, project_alias, project_path, prompt, thread_id, adapter, continue_session, \
    status, result, error, tokens_used, token_budget, worker_pid, worker_pid_start_ts, \
    checkpoint, created_at, started_at, completed_at";

fn row_to_task(row: &libsql::Row) -> Task {
    Task {
        id: get_text(row, 0),
        project_alias: get_text(row, 1),
        project_path: get_text(row, 2),
        prompt: get_text(row, 3),
        thread_id: get_text(row, 4),
        adapter: get_text(row, 5),
        continue_session: get_bool(row, 6),
        status: TaskStatus::parse(&get_text(row, 7)),
        result: get_opt_text(row, 8),
        error: get_opt_text(row, 9),
        tokens_used: get_i64(row, 10),
        token_budget: get_opt_i64(row, 11),
        worker_pid: get_opt_i64(row, 12),
        worker_pid_start_ts: get_opt_i64(row, 13),
        checkpoint: get_opt_text(row, 14),
        created_at: get_ts(row, 15),
        started_at: get_opt_ts(row, 16),
        completed_at: get_opt_ts(row, 17),
    }
}

impl Database {
    /// Atomically check the per-project queued cap and insert. The count and
    /// the insert share one IMMEDIATE transaction, so two racing enqueues
    /// cannot both squeeze under the cap.
    pub async fn enqueue(&self, input: NewTask, cap: u32) -> Result<Task, EngineError> {
        let conn = self.connect().await.map_err(EngineError::Database)?;
        let tx = conn
            .transaction_with_behavior(libsql::TransactionBehavior::Immediate)
            .await
            .map_err(|e| EngineError::Database(DatabaseError::Query(e.to_string())))?;

        let mut rows = tx
            .query(
                "SELECT COUNT(*) FROM tasks WHERE project_alias = ?1 AND status = 'queued'",
                params![input.project_alias.clone()],
            )
            .await
            .map_err(|e| EngineError::Database(e.into()))?;
        let queued = match rows.next().await.map_err(|e| EngineError::Database(e.into()))? {
            Some(row) => get_i64(&row, 0),
            None => 0,
        };
        if queued >= i64::from(cap) {
            // Rolls back on drop; nothing was written.
            return Err(EngineError::QueueFull {
                alias: input.project_alias,
            });
        }

        let task = Task {
            id: Uuid::new_v4().to_string(),
            project_alias: input.project_alias,
            project_path: input.project_path,
            prompt: input.prompt,
            thread_id: input.thread_id,
            adapter: input.adapter,
            continue_session: input.continue_session,
            status: TaskStatus::Queued,
            result: None,
            error: None,
            tokens_used: 0,
            token_budget: input.token_budget,
            worker_pid: None,
            worker_pid_start_ts: None,
            checkpoint: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        tx.execute(
            "INSERT INTO tasks (id, project_alias, project_path, prompt, thread_id, adapter, \
             continue_session, status, tokens_used, token_budget, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'queued', 0, ?8, ?9)",
            params![
                task.id.clone(),
                task.project_alias.clone(),
                task.project_path.clone(),
                task.prompt.clone(),
                task.thread_id.clone(),
                task.adapter.clone(),
                task.continue_session as i64,
                crate::db::opt_i64(task.token_budget),
                fmt_ts(&task.created_at),
            ],
        )
        .await
        .map_err(|e| EngineError::Database(e.into()))?;
        tx.commit()
            .await
            .map_err(|e| EngineError::Database(DatabaseError::Query(e.to_string())))?;
        Ok(task)
    }

    /// Pop the oldest queued task whose project holds no lock, flipping it to
    /// running in the same transaction. Returns None when every queued row is
    /// blocked by its project.
    pub async fn dequeue_next(&self) -> Result<Option<Task>, DatabaseError> {
        let conn = self.connect().await?;
        let tx = conn
            .transaction_with_behavior(libsql::TransactionBehavior::Immediate)
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;

        let mut rows = tx
            .query(
                "SELECT id FROM tasks \
                 WHERE status = 'queued' \
                   AND project_alias NOT IN ( \
                       SELECT project_alias FROM tasks \
                       WHERE status IN ('running', 'needs_approval')) \
                 ORDER BY created_at ASC, rowid ASC \
                 LIMIT 1",
                (),
            )
            .await?;
        let Some(row) = rows.next().await? else {
            return Ok(None);
        };
        let id = get_text(&row, 0);
        let started = Utc::now();
        tx.execute(
            "UPDATE tasks SET status = 'running', started_at = ?1 \
             WHERE id = ?2 AND status = 'queued'",
            params![fmt_ts(&started), id.clone()],
        )
        .await?;

        let mut rows = tx
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id],
            )
            .await?;
        let task = rows
            .next()
            .await?
            .map(|row| row_to_task(&row))
            .ok_or_else(|| DatabaseError::Decode("dequeued task vanished".to_string()))?;
        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        Ok(Some(task))
    }

    pub async fn get_task(&self, id: &str) -> Result<Option<Task>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id],
            )
            .await?;
        Ok(rows.next().await?.map(|row| row_to_task(&row)))
    }

    pub async fn tasks_by_thread(
        &self,
        thread_id: &str,
        limit: u32,
    ) -> Result<Vec<Task>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE thread_id = ?1 \
                     ORDER BY created_at DESC, rowid DESC LIMIT ?2"
                ),
                params![thread_id, i64::from(limit)],
            )
            .await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(row_to_task(&row));
        }
        Ok(out)
    }

    pub async fn tasks_by_project(
        &self,
        project_alias: &str,
        limit: u32,
    ) -> Result<Vec<Task>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE project_alias = ?1 \
                     ORDER BY created_at DESC, rowid DESC LIMIT ?2"
                ),
                params![project_alias, i64::from(limit)],
            )
            .await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(row_to_task(&row));
        }
        Ok(out)
    }

    /// Most recent terminal tasks in a thread, newest first. Used for the
    /// fresh-session fallback prompt.
    pub async fn recent_terminal_tasks(
        &self,
        thread_id: &str,
        limit: u32,
    ) -> Result<Vec<Task>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks \
                     WHERE thread_id = ?1 AND status IN ('done', 'failed') \
                     ORDER BY created_at DESC, rowid DESC LIMIT ?2"
                ),
                params![thread_id, i64::from(limit)],
            )
            .await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(row_to_task(&row));
        }
        Ok(out)
    }

    pub async fn update_tokens(&self, id: &str, tokens: i64) -> Result<(), DatabaseError> {
        let conn = self.connect().await?;
        conn.execute(
            "UPDATE tasks SET tokens_used = ?1 WHERE id = ?2",
            params![tokens, id],
        )
        .await?;
        Ok(())
    }

    /// running -> done. Returns false if the task was no longer running
    /// (e.g. cancelled while the subprocess was finishing).
    pub async fn mark_done(
        &self,
        id: &str,
        result: &str,
        tokens: i64,
    ) -> Result<bool, DatabaseError> {
        let conn = self.connect().await?;
        let changed = conn
            .execute(
                "UPDATE tasks SET status = 'done', result = ?1, tokens_used = ?2, \
                 completed_at = ?3, worker_pid = NULL, worker_pid_start_ts = NULL \
                 WHERE id = ?4 AND status = 'running'",
                params![result, tokens, fmt_ts(&Utc::now()), id],
            )
            .await?;
        Ok(changed > 0)
    }

    /// Any non-terminal state -> failed with the given code. Returns false if
    /// the task was already terminal.
    pub async fn mark_failed(&self, id: &str, code: ErrorCode) -> Result<bool, DatabaseError> {
        let conn = self.connect().await?;
        let changed = conn
            .execute(
                "UPDATE tasks SET status = 'failed', error = ?1, completed_at = ?2, \
                 worker_pid = NULL, worker_pid_start_ts = NULL \
                 WHERE id = ?3 AND status IN ('queued', 'running', 'needs_approval')",
                params![code.as_str(), fmt_ts(&Utc::now()), id],
            )
            .await?;
        Ok(changed > 0)
    }

    /// running -> needs_approval. The checkpoint lands in the same UPDATE as
    /// the status flip, so a crash can never observe the state without its
    /// checkpoint.
    pub async fn mark_needs_approval(
        &self,
        id: &str,
        checkpoint_json: &str,
    ) -> Result<bool, DatabaseError> {
        let conn = self.connect().await?;
        let changed = conn
            .execute(
                "UPDATE tasks SET status = 'needs_approval', checkpoint = ?1, \
                 worker_pid = NULL, worker_pid_start_ts = NULL \
                 WHERE id = ?2 AND status = 'running'",
                params![checkpoint_json, id],
            )
            .await?;
        Ok(changed > 0)
    }

    /// needs_approval -> running, for the post-approval replay run.
    pub async fn resume_for_replay(&self, id: &str) -> Result<bool, DatabaseError> {
        let conn = self.connect().await?;
        let changed = conn
            .execute(
                "UPDATE tasks SET status = 'running' \
                 WHERE id = ?1 AND status = 'needs_approval'",
                params![id],
            )
            .await?;
        Ok(changed > 0)
    }

    /// Record the spawned worker identity. Done before any long operation so
    /// orphan recovery always has something to verify against.
    pub async fn set_worker_pid(
        &self,
        id: &str,
        pid: i64,
        start_ts: i64,
    ) -> Result<(), DatabaseError> {
        let conn = self.connect().await?;
        conn.execute(
            "UPDATE tasks SET worker_pid = ?1, worker_pid_start_ts = ?2 \
             WHERE id = ?3 AND status = 'running'",
            params![pid, start_ts, id],
        )
        .await?;
        Ok(())
    }

    pub async fn clear_worker_pid(&self, id: &str) -> Result<(), DatabaseError> {
        let conn = self.connect().await?;
        conn.execute(
            "UPDATE tasks SET worker_pid = NULL, worker_pid_start_ts = NULL WHERE id = ?1",
            params![id],
        )
        .await?;
        Ok(())
    }

    /// Request-only cancel: conditional flip to failed(cancelled_by_user).
    /// Killing any associated subprocess is the engine's job.
    pub async fn cancel_task_row(&self, id: &str) -> Result<bool, DatabaseError> {
        let conn = self.connect().await?;
        let changed = conn
            .execute(
                "UPDATE tasks SET status = 'failed', error = ?1, completed_at = ?2 \
                 WHERE id = ?3 AND status IN ('queued', 'running', 'needs_approval')",
                params![
                    ErrorCode::CancelledByUser.as_str(),
                    fmt_ts(&Utc::now()),
                    id
                ],
            )
            .await?;
        Ok(changed > 0)
    }

    /// Every row still marked running at engine start is an orphan candidate.
    pub async fn running_orphans(&self) -> Result<Vec<Task>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE status = 'running'"),
                (),
            )
            .await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(row_to_task(&row));
        }
        Ok(out)
    }

    pub async fn queued_count(&self, project_alias: &str) -> Result<i64, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM tasks WHERE project_alias = ?1 AND status = 'queued'",
                params![project_alias],
            )
            .await?;
        Ok(match rows.next().await? {
            Some(row) => get_i64(&row, 0),
            None => 0,
        })
    }

    /// One row per project that has any live (queued/running/needs_approval)
    /// task.
    pub async fn queue_status(&self) -> Result<Vec<ProjectQueueStatus>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT project_alias, \
                        SUM(CASE WHEN status = 'queued' THEN 1 ELSE 0 END), \
                        MAX(CASE WHEN status IN ('running', 'needs_approval') THEN id END), \
                        MAX(CASE WHEN status IN ('running', 'needs_approval') THEN status END) \
                 FROM tasks \
                 WHERE status IN ('queued', 'running', 'needs_approval') \
                 GROUP BY project_alias ORDER BY project_alias",
                (),
            )
            .await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(ProjectQueueStatus {
                project_alias: get_text(&row, 0),
                queued: get_i64(&row, 1),
                active_task_id: get_opt_text(&row, 2),
                active_status: get_opt_text(&row, 3).map(|s| TaskStatus::parse(&s)),
            });
        }
        Ok(out)
    }

    /// Tokens spent per project on tasks that reached a terminal state since
    /// UTC midnight. Passing an alias filters to that project.
    pub async fn budget_today(
        &self,
        project_alias: Option<&str>,
    ) -> Result<Vec<(String, i64)>, DatabaseError> {
        let midnight = Utc::now()
            .date_naive()
            .and_time(chrono::NaiveTime::MIN)
            .and_utc();
        let conn = self.connect().await?;
        let mut rows = match project_alias {
            Some(alias) => {
                conn.query(
                    "SELECT project_alias, COALESCE(SUM(tokens_used), 0) FROM tasks \
                     WHERE completed_at >= ?1 AND project_alias = ?2 \
                     GROUP BY project_alias",
                    params![fmt_ts(&midnight), alias],
                )
                .await?
            }
            None => {
                conn.query(
                    "SELECT project_alias, COALESCE(SUM(tokens_used), 0) FROM tasks \
                     WHERE completed_at >= ?1 GROUP BY project_alias ORDER BY project_alias",
                    params![fmt_ts(&midnight)],
                )
                .await?
            }
        };
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push((get_text(&row, 0), get_i64(&row, 1)));
        }
        Ok(out)
    }

    /// Test/recovery helper: force a raw status + pid, bypassing transition
    /// guards. Used to simulate crashed workers.
    #[doc(hidden)]
    pub async fn force_running_with_pid(
        &self,
        id: &str,
        pid: i64,
        start_ts: i64,
    ) -> Result<(), DatabaseError> {
        let conn = self.connect().await?;
        conn.execute(
            "UPDATE tasks SET status = 'running', started_at = ?1, \
             worker_pid = ?2, worker_pid_start_ts = ?3 WHERE id = ?4",
            params![fmt_ts(&Utc::now()), pid, start_ts, id],
        )
        .await?;
        Ok(())
    }
}
