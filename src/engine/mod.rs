//! Execution engine.
//!
//! A single long-lived driver: recover orphans at start, then tick every
//! ~2 s to expire stale approvals, prune sessions, sweep uploads, and fill
//! free slots from the queue. Each dequeued task is owned by exactly one
//! spawned worker future from dequeue to terminal status, which is what
//! serializes its state transitions.

pub mod pid;
pub mod stream;
pub mod summary;
pub mod supervisor;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::channels::{AdapterBus, ApprovalPrompt, TaskUpdate};
use crate::config::{EngineConfig, ProjectConfig, ProjectsConfig};
use crate::db::approvals::Approval;
use crate::db::audit::AuditEvent;
use crate::db::tasks::{ErrorCode, Task, TaskStatus};
use crate::db::Database;
use crate::error::EngineError;
use crate::redact::{redact, redact_excerpt};
use self::pid::{verified_kill, KillOutcome, WorkerIdentity};
use self::summary::{summarize_or_fallback, Summarizer, SummaryInput};
use self::supervisor::{OutcomeKind, RunContext, RunResult, Supervisor};

const PROGRESS_SUMMARY_CHARS: usize = 700;

pub struct Engine {
    store: Database,
    config: EngineConfig,
    projects: ProjectsConfig,
    bus: Arc<AdapterBus>,
    supervisor: Supervisor,
    summarizer: Option<Arc<dyn Summarizer>>,
    in_flight: Arc<RwLock<HashMap<String, JoinHandle<()>>>>,
    stopping: Arc<AtomicBool>,
    tick_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    pub fn new(
        store: Database,
        config: EngineConfig,
        projects: ProjectsConfig,
        bus: Arc<AdapterBus>,
        summarizer: Option<Arc<dyn Summarizer>>,
    ) -> Arc<Self> {
        let supervisor = Supervisor::new(
            store.clone(),
            config.agent_bin.clone(),
            config.api_key_env.clone(),
            config.silence_timeout,
        );
        Arc::new(Self {
            store,
            config,
            projects,
            bus,
            supervisor,
            summarizer,
            in_flight: Arc::new(RwLock::new(HashMap::new())),
            stopping: Arc::new(AtomicBool::new(false)),
            tick_handle: Mutex::new(None),
        })
    }

    pub fn store(&self) -> &Database {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn projects(&self) -> &ProjectsConfig {
        &self.projects
    }

    pub fn bus(&self) -> &Arc<AdapterBus> {
        &self.bus
    }

    /// Startup: log configured projects, audit permission opt-outs, recover
    /// orphans, then start the periodic tick.
    pub async fn start(self: &Arc<Self>) {
        for project in self.projects.iter() {
            tracing::info!(
                alias = %project.alias,
                path = %project.path.display(),
                skip_permissions = project.skip_permissions,
                "project configured"
            );
            if project.skip_permissions {
                tracing::warn!(
                    alias = %project.alias,
                    reason = project.skip_permissions_reason.as_deref().unwrap_or(""),
                    "project runs with permissions disabled"
                );
                self.audit_or_log(
                    AuditEvent::new("engine", "skip_permissions_enabled")
                        .project(&project.alias)
                        .detail(serde_json::json!({
                            "reason": project.skip_permissions_reason,
                        })),
                )
                .await;
            }
        }
        tracing::info!(
            max_concurrent = self.config.max_concurrent_tasks,
            queue_cap = self.config.max_queued_per_project,
            "engine limits resolved"
        );

        self.recover_orphans().await;

        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(engine.config.tick_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if engine.stopping.load(Ordering::SeqCst) {
                    break;
                }
                engine.tick_once().await;
            }
        });
        *self.tick_handle.lock().await = Some(handle);
        tracing::info!("engine started");
    }

    /// Stop the tick, refuse new launches, wait out in-flight runs up to the
    /// grace window, abort the rest.
    pub async fn stop(self: &Arc<Self>) {
        self.stopping.store(true, Ordering::SeqCst);
        if let Some(handle) = self.tick_handle.lock().await.take() {
            handle.abort();
        }
        let deadline = tokio::time::Instant::now() + self.config.shutdown_grace;
        loop {
            if self.in_flight.read().await.is_empty() {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                let mut remaining = self.in_flight.write().await;
                tracing::warn!(
                    count = remaining.len(),
                    "aborting in-flight runs at shutdown"
                );
                for (_, handle) in remaining.drain() {
                    handle.abort();
                }
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        tracing::info!("engine stopped");
    }

    /// One scheduler pass. Public within the crate so tests can drive the
    /// engine deterministically.
    pub async fn tick_once(self: &Arc<Self>) {
        self.expire_approvals().await;
        if let Err(e) = self.store.prune_stale_sessions().await {
            tracing::warn!("session prune failed: {e}");
        }
        match self.store.sweep_expired_uploads().await {
            Ok(expired) => {
                for upload in expired {
                    if let Err(e) = std::fs::remove_file(&upload.server_path) {
                        tracing::debug!(path = %upload.server_path, "expired upload unlink: {e}");
                    }
                }
            }
            Err(e) => tracing::warn!("upload sweep failed: {e}"),
        }

        loop {
            if self.stopping.load(Ordering::SeqCst) {
                break;
            }
            if self.in_flight.read().await.len() >= self.config.max_concurrent_tasks {
                break;
            }
            match self.store.dequeue_next().await {
                Ok(Some(task)) => self.launch(task, None).await,
                Ok(None) => break,
                Err(e) => {
                    tracing::error!("dequeue failed: {e}");
                    break;
                }
            }
        }
    }

    pub async fn in_flight_count(&self) -> usize {
        self.in_flight.read().await.len()
    }

    /// Mark every task left `running` by a previous process as failed, after
    /// a PID-verified best-effort kill. Identity mismatches are never
    /// signalled, only audited.
    pub async fn recover_orphans(self: &Arc<Self>) {
        let orphans = match self.store.running_orphans().await {
            Ok(orphans) => orphans,
            Err(e) => {
                tracing::error!("orphan scan failed: {e}");
                return;
            }
        };
        for task in orphans {
            let identity = match (task.worker_pid, task.worker_pid_start_ts) {
                (Some(pid), Some(start_ts)) => Some(WorkerIdentity {
                    pid: pid as i32,
                    start_ts,
                }),
                _ => None,
            };
            if let Some(identity) = identity {
                match verified_kill(&identity).await {
                    KillOutcome::Terminated | KillOutcome::Killed => {
                        self.audit_or_log(
                            AuditEvent::new("engine", "orphan_killed")
                                .task(&task.id)
                                .project(&task.project_alias)
                                .detail(serde_json::json!({ "pid": identity.pid })),
                        )
                        .await;
                    }
                    KillOutcome::NotRunning => {}
                    KillOutcome::Mismatch { reason } => {
                        self.audit_or_log(
                            AuditEvent::new("engine", "zombie_pid_reused")
                                .task(&task.id)
                                .project(&task.project_alias)
                                .detail(serde_json::json!({
                                    "pid": identity.pid,
                                    "reason": reason,
                                })),
                        )
                        .await;
                    }
                }
            }
            if let Err(e) = self
                .store
                .mark_failed(&task.id, ErrorCode::WorkerCrashedRecovery)
                .await
            {
                tracing::error!(task_id = %task.id, "orphan mark_failed failed: {e}");
                continue;
            }
            self.audit_or_log(
                AuditEvent::new("engine", "task_failed")
                    .task(&task.id)
                    .project(&task.project_alias)
                    .thread(&task.thread_id)
                    .detail(serde_json::json!({
                        "error": ErrorCode::WorkerCrashedRecovery.as_str(),
                    })),
            )
            .await;
            tracing::warn!(task_id = %task.id, "recovered orphaned task");
        }
    }

    /// Expire pending approvals older than the configured window; their
    /// tasks fail with `approval_timeout`.
    async fn expire_approvals(self: &Arc<Self>) {
        let cutoff = chrono::Utc::now()
            - chrono::Duration::milliseconds(self.config.approval_timeout.as_millis() as i64);
        let expired = match self.store.expire_pending_approvals(cutoff).await {
            Ok(expired) => expired,
            Err(e) => {
                tracing::warn!("approval expiry sweep failed: {e}");
                return;
            }
        };
        for approval in expired {
            tracing::info!(
                approval_id = %approval.id,
                task_id = %approval.task_id,
                "pending approval expired"
            );
            self.audit_or_log(
                AuditEvent::new("system_timeout", "approval_denied")
                    .task(&approval.task_id)
                    .detail(serde_json::json!({
                        "approval_id": approval.id,
                        "expired": true,
                    })),
            )
            .await;
            match self
                .store
                .mark_failed(&approval.task_id, ErrorCode::ApprovalTimeout)
                .await
            {
                Ok(true) => {
                    if let Ok(Some(task)) = self.store.get_task(&approval.task_id).await {
                        self.audit_or_log(
                            AuditEvent::new("engine", "task_failed")
                                .task(&task.id)
                                .project(&task.project_alias)
                                .thread(&task.thread_id)
                                .detail(serde_json::json!({
                                    "error": ErrorCode::ApprovalTimeout.as_str(),
                                })),
                        )
                        .await;
                        self.bus
                            .send_task_update(
                                &task.adapter,
                                TaskUpdate {
                                    task_id: task.id.clone(),
                                    thread_id: task.thread_id.clone(),
                                    status: TaskStatus::Failed,
                                    summary: None,
                                    error: Some(ErrorCode::ApprovalTimeout.as_str().to_string()),
                                },
                            )
                            .await;
                    }
                }
                Ok(false) => {} // task reached a terminal state some other way
                Err(e) => tracing::warn!("approval timeout mark_failed failed: {e}"),
            }
        }
    }

    /// Spawn the worker future for a dequeued task. `replay` carries the
    /// approval context for post-approval runs.
    async fn launch(self: &Arc<Self>, task: Task, replay: Option<ReplaySpec>) {
        let engine = Arc::clone(self);
        let task_id = task.id.clone();
        // hold the write lock across spawn + insert so the worker's own
        // removal cannot run before the insert
        let mut in_flight = self.in_flight.write().await;
        let key = task_id.clone();
        let handle = tokio::spawn(async move {
            engine.run_task(task, replay).await;
            engine.in_flight.write().await.remove(&key);
        });
        in_flight.insert(task_id, handle);
    }

    async fn run_task(self: &Arc<Self>, task: Task, replay: Option<ReplaySpec>) {
        let Some(project) = self.projects.get(&task.project_alias) else {
            tracing::error!(task_id = %task.id, alias = %task.project_alias,
                "task references a project missing from configuration");
            self.fail_task(&task, ErrorCode::CliError).await;
            return;
        };

        let is_replay = replay.is_some();
        self.audit_or_log(
            AuditEvent::new(
                "engine",
                if is_replay { "task_replayed" } else { "task_started" },
            )
            .task(&task.id)
            .project(&task.project_alias)
            .thread(&task.thread_id),
        )
        .await;
        self.bus
            .send_task_update(
                &task.adapter,
                TaskUpdate {
                    task_id: task.id.clone(),
                    thread_id: task.thread_id.clone(),
                    status: TaskStatus::Running,
                    summary: None,
                    error: None,
                },
            )
            .await;

        // Project-level opt-out runs everything pre-approved.
        if project.skip_permissions && !is_replay {
            self.audit_or_log(
                AuditEvent::new("engine", "auto_approved")
                    .task(&task.id)
                    .project(&task.project_alias)
                    .detail(serde_json::json!({
                        "reason": project.skip_permissions_reason,
                    })),
            )
            .await;
        }

        let budget = task
            .token_budget
            .or(project.token_budget.map(|b| b as i64))
            .unwrap_or(self.config.default_token_budget as i64);
        let (prompt, ctx) = match &replay {
            Some(spec) => (
                spec.prompt.clone(),
                RunContext {
                    replay_mode: true,
                    force_skip_permissions: true,
                    timeout: self.config.replay_timeout,
                    token_budget: budget,
                    allow_resume: true,
                },
            ),
            None => (
                task.prompt.clone(),
                RunContext {
                    replay_mode: false,
                    force_skip_permissions: project.skip_permissions,
                    timeout: project
                        .timeout_ms
                        .map(Duration::from_millis)
                        .unwrap_or(self.config.default_timeout),
                    token_budget: budget,
                    allow_resume: task.continue_session,
                },
            ),
        };

        let result = self.supervisor.run(&task, &project, &prompt, &ctx).await;
        self.route_outcome(&task, &project, result, budget).await;
    }

    async fn route_outcome(
        self: &Arc<Self>,
        task: &Task,
        project: &ProjectConfig,
        result: RunResult,
        budget: i64,
    ) {
        if result.update.looks_like_schema_drift() {
            self.audit_or_log(
                AuditEvent::new("engine", "schema_drift")
                    .task(&task.id)
                    .project(&task.project_alias)
                    .detail(serde_json::json!({
                        "parse_failures": result.update.parse_failures,
                        "first_line": result
                            .update
                            .failed_lines
                            .first()
                            .map(|l| redact_excerpt(l, 200)),
                    })),
            )
            .await;
        }

        match result.kind {
            OutcomeKind::Done => self.complete_task(task, result, budget).await,
            OutcomeKind::NeedsApproval => self.request_approval(task, result).await,
            OutcomeKind::SilenceTimeout => {
                self.fail_task(task, ErrorCode::SilenceTimeout).await;
            }
            OutcomeKind::HardTimeout => {
                self.fail_task(task, ErrorCode::Timeout).await;
            }
            OutcomeKind::BudgetExceeded => {
                self.fail_task(task, ErrorCode::BudgetExceeded).await;
            }
            OutcomeKind::CliError => {
                if let Some(detail) = &result.error_detail {
                    self.audit_or_log(
                        AuditEvent::new("engine", "cli_error")
                            .task(&task.id)
                            .project(&project.alias)
                            .detail(serde_json::json!({ "detail": redact(detail) })),
                    )
                    .await;
                }
                self.fail_task(task, ErrorCode::CliError).await;
            }
        }
    }

    async fn complete_task(self: &Arc<Self>, task: &Task, result: RunResult, budget: i64) {
        let update = &result.update;
        let mut raw_text = update.assistant_text.clone();
        if raw_text.trim().is_empty() && !result.stderr_tail.is_empty() {
            raw_text = result.stderr_tail.join("\n");
        }
        let input = SummaryInput {
            raw_text: redact(&raw_text),
            tool_summaries: update.tool_summaries.iter().map(|s| redact(s)).collect(),
            tokens_used: result.tokens_used,
            token_budget: budget,
            replay_actions: update.replay_actions.iter().map(|s| redact(s)).collect(),
        };
        let summarizer = if self.config.summarizer_enabled {
            self.summarizer.as_deref()
        } else {
            None
        };
        let mut summary = summarize_or_fallback(summarizer, &input).await;
        if result.fresh_session_fallback {
            summary = format!(
                "Couldn't resume the previous session; ran with a fresh session instead.\n\n\
                 {summary}"
            );
        }
        let summary = redact(&summary);

        match self.store.mark_done(&task.id, &summary, result.tokens_used).await {
            Ok(true) => {}
            Ok(false) => {
                self.emit_lost_race_update(task).await;
                return;
            }
            Err(e) => {
                tracing::error!(task_id = %task.id, "mark_done failed: {e}");
                return;
            }
        }

        if let Some(session_ref) = &update.session_ref {
            if let Err(e) = self
                .store
                .upsert_session(&task.thread_id, &task.project_alias, session_ref)
                .await
            {
                tracing::warn!(task_id = %task.id, "session upsert failed: {e}");
            }
        }

        self.audit_or_log(
            AuditEvent::new("engine", "task_completed")
                .task(&task.id)
                .project(&task.project_alias)
                .thread(&task.thread_id)
                .detail(serde_json::json!({
                    "tokens_used": result.tokens_used,
                    "replayed": !update.replay_actions.is_empty(),
                })),
        )
        .await;
        self.bus
            .send_task_update(
                &task.adapter,
                TaskUpdate {
                    task_id: task.id.clone(),
                    thread_id: task.thread_id.clone(),
                    status: TaskStatus::Done,
                    summary: Some(summary),
                    error: None,
                },
            )
            .await;
    }

    async fn request_approval(self: &Arc<Self>, task: &Task, result: RunResult) {
        let update = &result.update;
        let denial = match update.permission_denial.clone() {
            Some(denial) => denial,
            None => {
                // classify() only emits NeedsApproval when a denial was parsed
                tracing::error!(task_id = %task.id, "needs_approval without a denial event");
                self.fail_task(task, ErrorCode::CliError).await;
                return;
            }
        };

        let mut progress = update.assistant_text.clone();
        if !update.tool_summaries.is_empty() {
            progress.push_str("\nTools so far: ");
            progress.push_str(&update.tool_summaries.join("; "));
        }
        let checkpoint = serde_json::json!({
            "original_prompt": task.prompt,
            "progress_summary": redact_excerpt(&progress, PROGRESS_SUMMARY_CHARS),
            "replay_actions": update.replay_actions,
        });

        match self
            .store
            .mark_needs_approval(&task.id, &checkpoint.to_string())
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                self.emit_lost_race_update(task).await;
                return;
            }
            Err(e) => {
                tracing::error!(task_id = %task.id, "mark_needs_approval failed: {e}");
                return;
            }
        }

        let description = redact(&denial.description);
        let approval = match self
            .store
            .insert_approval(&task.id, denial.action_class, &description)
            .await
        {
            Ok(approval) => approval,
            Err(e) => {
                tracing::error!(task_id = %task.id, "approval insert failed: {e}");
                self.fail_task(task, ErrorCode::CliError).await;
                return;
            }
        };

        self.audit_or_log(
            AuditEvent::new("engine", "approval_requested")
                .task(&task.id)
                .project(&task.project_alias)
                .thread(&task.thread_id)
                .detail(serde_json::json!({
                    "approval_id": approval.id,
                    "action_class": denial.action_class.as_str(),
                    "description": description,
                })),
        )
        .await;

        self.bus
            .send_task_update(
                &task.adapter,
                TaskUpdate {
                    task_id: task.id.clone(),
                    thread_id: task.thread_id.clone(),
                    status: TaskStatus::NeedsApproval,
                    summary: Some(description.clone()),
                    error: None,
                },
            )
            .await;
        self.bus
            .request_approval(
                &task.adapter,
                ApprovalPrompt {
                    approval_id: approval.id,
                    task_id: task.id.clone(),
                    thread_id: task.thread_id.clone(),
                    description,
                },
            )
            .await;
    }

    /// Resolve a pending approval. Returns false when it was not pending
    /// anymore (double resolve, expiry, cancel).
    pub async fn resolve_approval(
        self: &Arc<Self>,
        approval_id: &str,
        actor: &str,
        approve: bool,
    ) -> Result<bool, EngineError> {
        let Some(approval) = self.store.get_approval(approval_id).await? else {
            return Ok(false);
        };
        if !self
            .store
            .resolve_approval_row(approval_id, approve, actor)
            .await?
        {
            return Ok(false);
        }

        if approve {
            self.audit_or_log(
                AuditEvent::new(actor, "approval_granted")
                    .task(&approval.task_id)
                    .detail(serde_json::json!({ "approval_id": approval.id })),
            )
            .await;
            self.launch_replay(&approval).await;
        } else {
            self.audit_or_log(
                AuditEvent::new(actor, "approval_denied")
                    .task(&approval.task_id)
                    .detail(serde_json::json!({ "approval_id": approval.id })),
            )
            .await;
            if let Ok(Some(task)) = self.store.get_task(&approval.task_id).await {
                if self
                    .store
                    .mark_failed(&task.id, ErrorCode::ApprovalDenied)
                    .await
                    .unwrap_or(false)
                {
                    self.audit_or_log(
                        AuditEvent::new("engine", "task_failed")
                            .task(&task.id)
                            .project(&task.project_alias)
                            .thread(&task.thread_id)
                            .detail(serde_json::json!({
                                "error": ErrorCode::ApprovalDenied.as_str(),
                            })),
                    )
                    .await;
                    self.bus
                        .send_task_update(
                            &task.adapter,
                            TaskUpdate {
                                task_id: task.id.clone(),
                                thread_id: task.thread_id.clone(),
                                status: TaskStatus::Failed,
                                summary: None,
                                error: Some(ErrorCode::ApprovalDenied.as_str().to_string()),
                            },
                        )
                        .await;
                }
            }
        }
        Ok(true)
    }

    /// Approved: move the task back to running and spawn the scoped replay.
    async fn launch_replay(self: &Arc<Self>, approval: &Approval) {
        let Ok(Some(task)) = self.store.get_task(&approval.task_id).await else {
            tracing::warn!(task_id = %approval.task_id, "approved task vanished");
            return;
        };
        match self.store.resume_for_replay(&task.id).await {
            Ok(true) => {}
            Ok(false) => {
                // cancelled while pending; the approval is moot
                tracing::info!(task_id = %task.id, "approved task no longer awaits replay");
                return;
            }
            Err(e) => {
                tracing::error!(task_id = %task.id, "resume_for_replay failed: {e}");
                return;
            }
        }

        let checkpoint: serde_json::Value = task
            .checkpoint
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_else(|| serde_json::json!({}));
        let original_prompt = checkpoint
            .get("original_prompt")
            .and_then(serde_json::Value::as_str)
            .unwrap_or(&task.prompt);
        let progress = checkpoint
            .get("progress_summary")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("(none)");
        let prompt = format!(
            "[APPROVED ACTION ONLY] The user approved: {}.\n\
             Previous progress: {}.\n\
             Perform the approved action, then continue the original task: {}",
            approval.description, progress, original_prompt
        );

        let task = match self.store.get_task(&task.id).await {
            Ok(Some(task)) => task,
            _ => return,
        };
        self.launch(task, Some(ReplaySpec { prompt })).await;
    }

    /// Cancel from any adapter: flip the status first, then best-effort kill
    /// the current subprocess. The run's own post-exit handling observes the
    /// cancelled row and emits the final failed update.
    pub async fn cancel_task(self: &Arc<Self>, task_id: &str, actor: &str) -> Result<bool, EngineError> {
        let Some(task) = self.store.get_task(task_id).await? else {
            return Ok(false);
        };
        if !self.store.cancel_task_row(task_id).await? {
            return Ok(false);
        }
        self.audit_or_log(
            AuditEvent::new(actor, "task_cancelled")
                .task(task_id)
                .project(&task.project_alias)
                .thread(&task.thread_id),
        )
        .await;

        let has_live_run = self.in_flight.read().await.contains_key(task_id);
        if let (Some(pid), Some(start_ts)) = (task.worker_pid, task.worker_pid_start_ts) {
            let identity = WorkerIdentity {
                pid: pid as i32,
                start_ts,
            };
            match verified_kill(&identity).await {
                KillOutcome::Mismatch { reason } => {
                    self.audit_or_log(
                        AuditEvent::new("engine", "zombie_pid_reused")
                            .task(task_id)
                            .detail(serde_json::json!({ "pid": pid, "reason": reason })),
                    )
                    .await;
                }
                outcome => {
                    tracing::info!(task_id, ?outcome, "cancel signalled worker");
                }
            }
        }
        if !has_live_run {
            // nothing in flight will report; emit the terminal update here
            self.bus
                .send_task_update(
                    &task.adapter,
                    TaskUpdate {
                        task_id: task.id.clone(),
                        thread_id: task.thread_id.clone(),
                        status: TaskStatus::Failed,
                        summary: None,
                        error: Some(ErrorCode::CancelledByUser.as_str().to_string()),
                    },
                )
                .await;
        }
        Ok(true)
    }

    async fn fail_task(self: &Arc<Self>, task: &Task, code: ErrorCode) {
        match self.store.mark_failed(&task.id, code).await {
            Ok(true) => {}
            Ok(false) => {
                self.emit_lost_race_update(task).await;
                return;
            }
            Err(e) => {
                tracing::error!(task_id = %task.id, "mark_failed failed: {e}");
                return;
            }
        }
        self.audit_or_log(
            AuditEvent::new("engine", "task_failed")
                .task(&task.id)
                .project(&task.project_alias)
                .thread(&task.thread_id)
                .detail(serde_json::json!({ "error": code.as_str() })),
        )
        .await;
        self.bus
            .send_task_update(
                &task.adapter,
                TaskUpdate {
                    task_id: task.id.clone(),
                    thread_id: task.thread_id.clone(),
                    status: TaskStatus::Failed,
                    summary: None,
                    error: Some(code.as_str().to_string()),
                },
            )
            .await;
    }

    /// The conditional transition lost: some other path (almost always a
    /// user cancel) already made the task terminal. Report that state.
    async fn emit_lost_race_update(self: &Arc<Self>, task: &Task) {
        if let Ok(Some(current)) = self.store.get_task(&task.id).await {
            if current.status == TaskStatus::Failed {
                self.bus
                    .send_task_update(
                        &task.adapter,
                        TaskUpdate {
                            task_id: current.id.clone(),
                            thread_id: current.thread_id.clone(),
                            status: TaskStatus::Failed,
                            summary: None,
                            error: current.error.clone(),
                        },
                    )
                    .await;
            }
        }
    }

    /// Audit failures must never take the engine down; they are logged.
    async fn audit_or_log(&self, event: AuditEvent) {
        let action = event.action.clone();
        if let Err(e) = self.store.audit(event).await {
            tracing::error!(action, "audit write failed: {e}");
        }
    }
}

struct ReplaySpec {
    prompt: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::testing::RecordingAdapter;
    use crate::db::approvals::ApprovalStatus;
    use crate::db::tasks::NewTask;
    use crate::settings::Settings;
    use std::path::{Path, PathBuf};

    fn write_shim(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("agent_shim.sh");
        std::fs::write(&path, format!("#!/usr/bin/env bash\n{body}\n")).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&path).unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&path, perms).unwrap();
        }
        path
    }

    struct Harness {
        engine: Arc<Engine>,
        db: Database,
        adapter: Arc<RecordingAdapter>,
        _root: tempfile::TempDir,
    }

    /// Engine wired to a shim agent and one temp-dir project per alias.
    async fn harness(shim_body: &str, aliases: &[&str], tweak: impl Fn(&mut EngineConfig)) -> Harness {
        let root = tempfile::tempdir().unwrap();
        let shim = write_shim(root.path(), shim_body);

        let mut settings = Settings::default();
        for alias in aliases {
            let dir = root.path().join(alias);
            std::fs::create_dir_all(&dir).unwrap();
            settings.projects.insert(
                alias.to_string(),
                crate::settings::ProjectSettings {
                    path: dir.to_string_lossy().to_string(),
                    description: None,
                    skip_permissions: false,
                    skip_permissions_reason: None,
                    token_budget: None,
                    timeout_ms: None,
                },
            );
        }
        let mut config = EngineConfig::resolve(&settings).unwrap();
        config.agent_bin = shim.to_string_lossy().to_string();
        config.silence_timeout = Duration::from_secs(10);
        tweak(&mut config);
        let projects = ProjectsConfig::resolve(&settings).unwrap();

        let db = Database::open_memory().await.unwrap();
        let bus = Arc::new(AdapterBus::new());
        let adapter = RecordingAdapter::new("web");
        bus.register(adapter.clone()).await;

        let engine = Engine::new(db.clone(), config, projects, bus, None);
        Harness {
            engine,
            db,
            adapter,
            _root: root,
        }
    }

    fn new_task(alias: &str, thread: &str, prompt: &str) -> NewTask {
        NewTask {
            project_alias: alias.to_string(),
            project_path: String::new(),
            prompt: prompt.to_string(),
            thread_id: thread.to_string(),
            adapter: "web".to_string(),
            continue_session: false,
            token_budget: None,
        }
    }

    async fn wait_for_status(db: &Database, task_id: &str, status: TaskStatus) -> Task {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
        loop {
            let task = db.get_task(task_id).await.unwrap().unwrap();
            if task.status == status {
                return task;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "task {task_id} stuck in {:?} waiting for {status:?}",
                task.status
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    async fn drain(engine: &Arc<Engine>) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
        while engine.in_flight_count().await > 0 {
            assert!(tokio::time::Instant::now() < deadline, "in-flight never drained");
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    const HAPPY_SHIM: &str = r#"printf '%s\n' '{"session_id":"sess-abc"}'
printf '%s\n' '{"role":"assistant","content":"did the thing"}'
printf '%s\n' '{"usage":{"total_tokens":42}}'"#;

    #[cfg(unix)]
    #[tokio::test]
    async fn happy_path_runs_to_done() {
        let h = harness(HAPPY_SHIM, &["alpha"], |_| {}).await;
        let task = h.db.enqueue(new_task("alpha", "t1", "hello"), 5).await.unwrap();

        h.engine.tick_once().await;
        let done = wait_for_status(&h.db, &task.id, TaskStatus::Done).await;
        drain(&h.engine).await;

        assert!(done.result.as_deref().unwrap().contains("did the thing"));
        assert_eq!(done.tokens_used, 42);
        assert!(done.worker_pid.is_none());

        let actions: Vec<String> = h
            .db
            .audit_by_task(&task.id)
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.action)
            .collect();
        assert!(actions.contains(&"task_started".to_string()));
        assert!(actions.contains(&"task_completed".to_string()));

        // session captured because the stubbed agent emitted one
        let session = h.db.get_session("t1").await.unwrap().unwrap();
        assert_eq!(session.session_ref, "sess-abc");

        // let the fire-and-forget bus dispatches land
        tokio::time::sleep(Duration::from_millis(100)).await;
        let statuses = h.adapter.statuses();
        assert_eq!(statuses, vec![TaskStatus::Running, TaskStatus::Done]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn per_project_fifo_with_cross_project_parallelism() {
        let shim = r#"sleep 0.3
printf '%s\n' '{"role":"assistant","content":"done"}'"#;
        let h = harness(shim, &["alpha", "beta"], |_| {}).await;
        let a1 = h.db.enqueue(new_task("alpha", "ta", "a1"), 5).await.unwrap();
        let a2 = h.db.enqueue(new_task("alpha", "ta", "a2"), 5).await.unwrap();
        let b1 = h.db.enqueue(new_task("beta", "tb", "b1"), 5).await.unwrap();

        h.engine.tick_once().await;

        // a1 and b1 run concurrently; a2 stays queued behind alpha's lock
        assert_eq!(h.engine.in_flight_count().await, 2);
        assert_eq!(
            h.db.get_task(&a1.id).await.unwrap().unwrap().status,
            TaskStatus::Running
        );
        assert_eq!(
            h.db.get_task(&b1.id).await.unwrap().unwrap().status,
            TaskStatus::Running
        );
        assert_eq!(
            h.db.get_task(&a2.id).await.unwrap().unwrap().status,
            TaskStatus::Queued
        );

        wait_for_status(&h.db, &a1.id, TaskStatus::Done).await;
        drain(&h.engine).await;
        h.engine.tick_once().await;
        wait_for_status(&h.db, &a2.id, TaskStatus::Done).await;
        drain(&h.engine).await;
        wait_for_status(&h.db, &b1.id, TaskStatus::Done).await;
    }

    /// Denies once, then succeeds when replayed with permissions skipped.
    fn approval_shim(argv_file: &Path) -> String {
        format!(
            r#"printf '%s\n' "$@" > {argv}
case "$*" in
  *--dangerously-skip-permissions*)
    printf '%s\n' '{{"type":"tool_use","tool_name":"shell","input":{{"command":"git push origin main"}}}}'
    printf '%s\n' '{{"role":"assistant","content":"pushed the branch"}}'
    ;;
  *)
    printf '%s\n' '{{"role":"assistant","content":"started work"}}'
    printf '%s\n' '{{"type":"error","text":"Permission denied: git push origin main"}}'
    exit 1
    ;;
esac"#,
            argv = argv_file.display()
        )
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn approval_and_replay_flow() {
        let root = tempfile::tempdir().unwrap();
        let argv_file = root.path().join("argv.txt");
        let h = harness(&approval_shim(&argv_file), &["alpha"], |_| {}).await;
        let task = h
            .db
            .enqueue(new_task("alpha", "t1", "push my branch"), 5)
            .await
            .unwrap();

        h.engine.tick_once().await;
        let pending = wait_for_status(&h.db, &task.id, TaskStatus::NeedsApproval).await;
        drain(&h.engine).await;

        // checkpoint persisted with the status flip
        let checkpoint: serde_json::Value =
            serde_json::from_str(pending.checkpoint.as_deref().unwrap()).unwrap();
        assert_eq!(checkpoint["original_prompt"], "push my branch");
        assert!(checkpoint["progress_summary"]
            .as_str()
            .unwrap()
            .contains("started work"));

        let actions: Vec<String> = h
            .db
            .audit_by_task(&task.id)
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.action)
            .collect();
        assert!(actions.contains(&"approval_requested".to_string()));

        // exactly one approval prompt went out
        tokio::time::sleep(Duration::from_millis(100)).await;
        let prompts = h.adapter.approvals.lock().unwrap().clone();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].description.contains("git push"));
        let approval_id = prompts[0].approval_id.clone();

        assert!(h
            .engine
            .resolve_approval(&approval_id, "amir", true)
            .await
            .unwrap());
        let done = wait_for_status(&h.db, &task.id, TaskStatus::Done).await;
        drain(&h.engine).await;

        let summary = done.result.unwrap();
        assert!(summary.contains("Replay"), "summary missing replay section: {summary}");
        assert!(summary.contains("git push origin main"));

        let actions: Vec<String> = h
            .db
            .audit_by_task(&task.id)
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.action)
            .collect();
        assert!(actions.contains(&"approval_granted".to_string()));
        assert!(actions.contains(&"task_replayed".to_string()));

        // the replay spawn carried the elevated flag
        let argv = std::fs::read_to_string(&argv_file).unwrap();
        assert!(argv.contains("--dangerously-skip-permissions"));
        assert!(argv.contains("[APPROVED ACTION ONLY]"));

        // second resolution of the same approval is refused
        assert!(!h
            .engine
            .resolve_approval(&approval_id, "eve", false)
            .await
            .unwrap());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn deny_fails_the_task() {
        let root = tempfile::tempdir().unwrap();
        let argv_file = root.path().join("argv.txt");
        let h = harness(&approval_shim(&argv_file), &["alpha"], |_| {}).await;
        let task = h
            .db
            .enqueue(new_task("alpha", "t1", "push my branch"), 5)
            .await
            .unwrap();
        h.engine.tick_once().await;
        wait_for_status(&h.db, &task.id, TaskStatus::NeedsApproval).await;
        drain(&h.engine).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let approval_id = h.adapter.approvals.lock().unwrap()[0].approval_id.clone();
        assert!(h
            .engine
            .resolve_approval(&approval_id, "amir", false)
            .await
            .unwrap());

        let failed = wait_for_status(&h.db, &task.id, TaskStatus::Failed).await;
        assert_eq!(failed.error.as_deref(), Some("approval_denied"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn pending_approval_expires_into_approval_timeout() {
        let root = tempfile::tempdir().unwrap();
        let argv_file = root.path().join("argv.txt");
        let h = harness(&approval_shim(&argv_file), &["alpha"], |c| {
            c.approval_timeout = Duration::from_millis(0);
        })
        .await;
        let task = h
            .db
            .enqueue(new_task("alpha", "t1", "push my branch"), 5)
            .await
            .unwrap();
        h.engine.tick_once().await;
        wait_for_status(&h.db, &task.id, TaskStatus::NeedsApproval).await;
        drain(&h.engine).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        let approval_id = h.adapter.approvals.lock().unwrap()[0].approval_id.clone();

        h.engine.tick_once().await;
        let failed = wait_for_status(&h.db, &task.id, TaskStatus::Failed).await;
        assert_eq!(failed.error.as_deref(), Some("approval_timeout"));

        let approval = h.db.get_approval(&approval_id).await.unwrap().unwrap();
        assert_eq!(approval.status, ApprovalStatus::Denied);
        assert_eq!(approval.resolved_by.as_deref(), Some("system_timeout"));
    }

    #[tokio::test]
    async fn orphan_with_reused_pid_is_recovered_without_signalling() {
        let h = harness("exit 0", &["alpha"], |_| {}).await;
        let task = h.db.enqueue(new_task("alpha", "t1", "p"), 5).await.unwrap();
        h.db.force_running_with_pid(&task.id, 99_999, 0).await.unwrap();

        h.engine.recover_orphans().await;

        let failed = wait_for_status(&h.db, &task.id, TaskStatus::Failed).await;
        assert_eq!(failed.error.as_deref(), Some("worker_crashed_recovery"));

        let actions: Vec<String> = h
            .db
            .audit_by_task(&task.id)
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.action)
            .collect();
        // either the pid slot is free (no entry at all) or it belongs to a
        // foreign process; only the latter writes the zombie marker, and in
        // neither case was anything signalled
        if pid::process_exists(99_999) {
            assert!(actions.contains(&"zombie_pid_reused".to_string()));
        }
        assert!(!actions.contains(&"orphan_killed".to_string()));
        assert!(actions.contains(&"task_failed".to_string()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancel_during_run_reports_cancelled_by_user() {
        let h = harness("exec sleep 30", &["alpha"], |c| {
            c.silence_timeout = Duration::from_millis(400);
        })
        .await;
        let task = h.db.enqueue(new_task("alpha", "t1", "p"), 5).await.unwrap();
        h.engine.tick_once().await;
        wait_for_status(&h.db, &task.id, TaskStatus::Running).await;

        assert!(h.engine.cancel_task(&task.id, "amir").await.unwrap());
        let failed = wait_for_status(&h.db, &task.id, TaskStatus::Failed).await;
        assert_eq!(failed.error.as_deref(), Some("cancelled_by_user"));

        drain(&h.engine).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        // the final adapter update reports the cancel, not the silence kill
        let updates = h.adapter.updates.lock().unwrap().clone();
        let last = updates.last().unwrap();
        assert_eq!(last.status, TaskStatus::Failed);
        assert_eq!(last.error.as_deref(), Some("cancelled_by_user"));

        // cancelling again is a no-op
        assert!(!h.engine.cancel_task(&task.id, "amir").await.unwrap());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn schema_drift_is_audited_when_nothing_parses() {
        let shim = r#"printf '%s\n' 'plain text, not json'
printf '%s\n' 'more noise'
exit 1"#;
        let h = harness(shim, &["alpha"], |_| {}).await;
        let task = h.db.enqueue(new_task("alpha", "t1", "p"), 5).await.unwrap();
        h.engine.tick_once().await;
        let failed = wait_for_status(&h.db, &task.id, TaskStatus::Failed).await;
        assert_eq!(failed.error.as_deref(), Some("cli_error"));
        drain(&h.engine).await;

        let actions: Vec<String> = h
            .db
            .audit_by_task(&task.id)
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.action)
            .collect();
        assert!(actions.contains(&"schema_drift".to_string()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn resume_fallback_notice_leads_the_summary() {
        let shim = r#"case "$*" in
  *--resume*)
    printf '%s\n' '{"type":"error","text":"unable to resume session stale-ref"}'
    exit 1
    ;;
  *)
    printf '%s\n' '{"role":"assistant","content":"fresh session result"}'
    ;;
esac"#;
        let h = harness(shim, &["alpha"], |_| {}).await;
        h.db.upsert_session("t1", "alpha", "stale-ref").await.unwrap();
        let mut input = new_task("alpha", "t1", "keep going");
        input.continue_session = true;
        let task = h.db.enqueue(input, 5).await.unwrap();

        h.engine.tick_once().await;
        let done = wait_for_status(&h.db, &task.id, TaskStatus::Done).await;
        drain(&h.engine).await;

        let summary = done.result.unwrap();
        assert!(
            summary.starts_with("Couldn't resume"),
            "summary must lead with the fresh-session notice: {summary}"
        );
        assert!(summary.contains("fresh session result"));

        let actions: Vec<String> = h
            .db
            .audit_by_task(&task.id)
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.action)
            .collect();
        assert!(actions.contains(&"session_resume_failed".to_string()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stop_waits_for_in_flight_work() {
        let h = harness(HAPPY_SHIM, &["alpha"], |_| {}).await;
        let task = h.db.enqueue(new_task("alpha", "t1", "p"), 5).await.unwrap();
        h.engine.start().await;
        wait_for_status(&h.db, &task.id, TaskStatus::Done).await;
        h.engine.stop().await;
        assert_eq!(h.engine.in_flight_count().await, 0);
    }
}
