//! Subprocess supervisor.
//!
//! One fresh Agent CLI process per run. The supervisor builds a locked-down
//! spawn (argv only, minimal env whitelist, project working directory),
//! watches the stream under three concurrent limits (silence, hard timeout,
//! token budget), records the worker's durable identity, and classifies the
//! exit into an outcome. Anomalies become outcomes here; nothing below this
//! module leaks exceptions into the engine loop.

use std::collections::VecDeque;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::Instant;

use crate::config::ProjectConfig;
use crate::db::audit::AuditEvent;
use crate::db::tasks::Task;
use crate::db::Database;
use crate::engine::pid::observed_start_ts;
use crate::engine::stream::{consume, StreamUpdate};
use crate::redact::redact_excerpt;

const TERM_GRACE: Duration = Duration::from_secs(5);
const TOKEN_PERSIST_INTERVAL: Duration = Duration::from_millis(500);
const STDERR_TAIL_LINES: usize = 20;
const HISTORY_TASKS: u32 = 3;
const HISTORY_LINE_CHARS: usize = 160;
const HISTORY_TOTAL_CHARS: usize = 700;

/// Per-run parameters decided by the engine.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub replay_mode: bool,
    pub force_skip_permissions: bool,
    pub timeout: Duration,
    pub token_budget: i64,
    pub allow_resume: bool,
}

/// Final classification of a run. Variants are checked in this order:
/// a permission denial outranks a kill, which outranks the exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    Done,
    NeedsApproval,
    SilenceTimeout,
    HardTimeout,
    BudgetExceeded,
    CliError,
}

#[derive(Debug)]
pub struct RunResult {
    pub kind: OutcomeKind,
    pub update: StreamUpdate,
    pub exit_code: Option<i32>,
    pub stderr_tail: Vec<String>,
    pub tokens_used: i64,
    /// True when the resume-failure fallback re-ran with a fresh session.
    pub fresh_session_fallback: bool,
    /// Populated for CliError outcomes the stream cannot explain.
    pub error_detail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KillReason {
    Silence,
    Hard,
    Budget,
}

/// Raw observations from a single spawn.
struct Attempt {
    update: StreamUpdate,
    exit_code: Option<i32>,
    kill: Option<KillReason>,
    stderr_tail: Vec<String>,
    attempted_resume: bool,
    tokens: i64,
    spawn_error: Option<String>,
}

pub struct Supervisor {
    store: Database,
    agent_bin: String,
    api_key_env: String,
    silence_timeout: Duration,
}

impl Supervisor {
    pub fn new(
        store: Database,
        agent_bin: String,
        api_key_env: String,
        silence_timeout: Duration,
    ) -> Self {
        Self {
            store,
            agent_bin,
            api_key_env,
            silence_timeout,
        }
    }

    /// Run the Agent once for `task` (plus at most one fresh-session retry),
    /// classify, and return. Worker pid columns are always cleared by the
    /// time this returns, whatever the exit path.
    pub async fn run(
        &self,
        task: &Task,
        project: &ProjectConfig,
        prompt: &str,
        ctx: &RunContext,
    ) -> RunResult {
        // Hard configuration check: the configured canonical path must still
        // resolve to itself and be a directory. Anything else is cli_error.
        match project.path.canonicalize() {
            Ok(resolved) if resolved == project.path && resolved.is_dir() => {}
            Ok(resolved) => {
                return self
                    .config_error(
                        task,
                        format!(
                            "project path moved: configured {:?}, resolves to {resolved:?}",
                            project.path
                        ),
                    )
                    .await;
            }
            Err(e) => {
                return self
                    .config_error(task, format!("project path {:?}: {e}", project.path))
                    .await;
            }
        }

        let deadline = Instant::now() + ctx.timeout;
        let resume_ref = if ctx.allow_resume {
            self.store
                .get_session(&task.thread_id)
                .await
                .ok()
                .flatten()
                .map(|s| s.session_ref)
        } else {
            None
        };

        let attempt = self
            .attempt(task, project, prompt, resume_ref.as_deref(), ctx, deadline)
            .await;
        let (attempt, fresh_session_fallback) = self
            .maybe_retry_without_session(task, project, prompt, ctx, deadline, attempt)
            .await;

        if let Err(e) = self.store.clear_worker_pid(&task.id).await {
            tracing::warn!(task_id = %task.id, "failed to clear worker pid: {e}");
        }

        self.classify(ctx, attempt, fresh_session_fallback)
    }

    async fn config_error(&self, task: &Task, detail: String) -> RunResult {
        tracing::error!(task_id = %task.id, "refusing to spawn: {detail}");
        RunResult {
            kind: OutcomeKind::CliError,
            update: StreamUpdate::default(),
            exit_code: None,
            stderr_tail: Vec::new(),
            tokens_used: 0,
            fresh_session_fallback: false,
            error_detail: Some(detail),
        }
    }

    /// One retry with a fresh session when the exit smells like a resume
    /// failure. Returns the attempt to classify plus whether the fallback
    /// ran.
    async fn maybe_retry_without_session(
        &self,
        task: &Task,
        project: &ProjectConfig,
        prompt: &str,
        ctx: &RunContext,
        deadline: Instant,
        attempt: Attempt,
    ) -> (Attempt, bool) {
        let nonzero_exit = attempt.exit_code.map(|c| c != 0).unwrap_or(false);
        // a permission denial outranks the resume fallback: that attempt must
        // reach classify() intact so the task goes to needs_approval
        if !attempt.attempted_resume
            || !nonzero_exit
            || attempt.kill.is_some()
            || attempt.update.permission_denial.is_some()
        {
            return (attempt, false);
        }
        let combined = format!(
            "{}\n{}",
            attempt.update.assistant_text,
            attempt.stderr_tail.join("\n")
        );
        if !looks_like_resume_failure(&combined) {
            return (attempt, false);
        }

        if let Err(e) = self
            .store
            .audit(
                AuditEvent::new("supervisor", "session_resume_failed")
                    .task(&task.id)
                    .project(&task.project_alias)
                    .thread(&task.thread_id)
                    .detail(serde_json::json!({
                        "excerpt": redact_excerpt(&combined, 300),
                    })),
            )
            .await
        {
            tracing::warn!(task_id = %task.id, "audit write failed: {e}");
        }
        // the stored ref is dead weight now
        let _ = self.store.delete_session(&task.thread_id).await;

        let fallback_prompt = if task.continue_session && !ctx.replay_mode {
            let history = self.thread_history_summary(&task.thread_id).await;
            if history.is_empty() {
                prompt.to_string()
            } else {
                format!("Context from recent work in this thread: {history}\n\n{prompt}")
            }
        } else {
            prompt.to_string()
        };

        tracing::info!(task_id = %task.id, "resume failed, retrying once with a fresh session");
        let retry = self
            .attempt(task, project, &fallback_prompt, None, ctx, deadline)
            .await;
        (retry, true)
    }

    /// Compact history of the last few terminal tasks in the thread, used to
    /// give a fresh session some context.
    pub async fn thread_history_summary(&self, thread_id: &str) -> String {
        let tasks = match self.store.recent_terminal_tasks(thread_id, HISTORY_TASKS).await {
            Ok(tasks) => tasks,
            Err(e) => {
                tracing::warn!("history lookup failed: {e}");
                return String::new();
            }
        };
        let lines: Vec<String> = tasks
            .iter()
            .map(|t| {
                let ts = t
                    .completed_at
                    .unwrap_or(t.created_at)
                    .to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
                let detail = t
                    .result
                    .as_deref()
                    .or(t.error.as_deref())
                    .unwrap_or(&t.prompt);
                let one_line = detail.split_whitespace().collect::<Vec<_>>().join(" ");
                format!(
                    "{ts} {}: {}",
                    t.status.as_str(),
                    redact_excerpt(&one_line, HISTORY_LINE_CHARS)
                )
            })
            .collect();
        crate::redact::truncate_chars(&lines.join(" | "), HISTORY_TOTAL_CHARS)
    }

    fn classify(
        &self,
        ctx: &RunContext,
        attempt: Attempt,
        fresh_session_fallback: bool,
    ) -> RunResult {
        let kind = if attempt.spawn_error.is_some() {
            OutcomeKind::CliError
        } else if attempt.update.permission_denial.is_some() && !ctx.force_skip_permissions {
            OutcomeKind::NeedsApproval
        } else {
            match attempt.kill {
                Some(KillReason::Silence) => OutcomeKind::SilenceTimeout,
                Some(KillReason::Hard) => OutcomeKind::HardTimeout,
                Some(KillReason::Budget) => OutcomeKind::BudgetExceeded,
                None => {
                    let nonzero = attempt.exit_code.map(|c| c != 0).unwrap_or(true);
                    let no_text = attempt.update.assistant_text.trim().is_empty()
                        && attempt.stderr_tail.is_empty();
                    if nonzero && no_text {
                        OutcomeKind::CliError
                    } else {
                        OutcomeKind::Done
                    }
                }
            }
        };
        RunResult {
            kind,
            exit_code: attempt.exit_code,
            tokens_used: attempt.tokens,
            fresh_session_fallback,
            error_detail: attempt.spawn_error,
            stderr_tail: attempt.stderr_tail,
            update: attempt.update,
        }
    }

    /// One spawn + monitored read to completion.
    async fn attempt(
        &self,
        task: &Task,
        project: &ProjectConfig,
        prompt: &str,
        resume_ref: Option<&str>,
        ctx: &RunContext,
        deadline: Instant,
    ) -> Attempt {
        let mut attempt = Attempt {
            update: StreamUpdate::default(),
            exit_code: None,
            kill: None,
            stderr_tail: Vec::new(),
            attempted_resume: resume_ref.is_some(),
            tokens: 0,
            spawn_error: None,
        };

        let mut cmd = Command::new(&self.agent_bin);
        cmd.arg("--print").arg("--output-format").arg("stream-json");
        if let Some(session) = resume_ref {
            cmd.arg("--resume").arg(session);
        }
        cmd.arg("-p").arg(prompt);
        if ctx.force_skip_permissions || project.skip_permissions {
            cmd.arg("--dangerously-skip-permissions");
        }
        cmd.current_dir(&project.path);

        // Minimal whitelist; everything else is stripped so nothing secret
        // bleeds into the child.
        cmd.env_clear();
        for key in ["PATH", "HOME", "NODE_ENV", self.api_key_env.as_str()] {
            if let Ok(value) = std::env::var(key) {
                cmd.env(key, value);
            }
        }

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                attempt.spawn_error = Some(format!("failed to spawn {}: {e}", self.agent_bin));
                return attempt;
            }
        };
        let pid = child.id().map(|p| p as i32).unwrap_or(-1);
        if pid > 0 {
            let start_ts = observed_start_ts(pid);
            if let Err(e) = self.store.set_worker_pid(&task.id, pid.into(), start_ts).await {
                tracing::warn!(task_id = %task.id, "failed to record worker pid: {e}");
            }
        }
        tracing::debug!(task_id = %task.id, pid, "agent process spawned");

        let stderr_handle = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut tail: VecDeque<String> = VecDeque::new();
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
                tail.into_iter().collect::<Vec<_>>()
            })
        });

        let Some(stdout) = child.stdout.take() else {
            attempt.spawn_error = Some("failed to capture agent stdout".to_string());
            let _ = child.kill().await;
            return attempt;
        };
        let mut lines = BufReader::new(stdout).lines();

        let mut silence_deadline = Instant::now() + self.silence_timeout;
        let mut raw_bytes: u64 = 0;
        let mut last_persist: Option<Instant> = None;

        loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        raw_bytes += line.len() as u64 + 1;
                        silence_deadline = Instant::now() + self.silence_timeout;
                        attempt.update = consume(attempt.update, &line, ctx.replay_mode);
                        let tokens =
                            attempt.update.tokens_used.unwrap_or(raw_bytes / 4) as i64;
                        attempt.tokens = tokens;
                        let due = last_persist
                            .map(|t| t.elapsed() >= TOKEN_PERSIST_INTERVAL)
                            .unwrap_or(true);
                        if due {
                            if let Err(e) = self.store.update_tokens(&task.id, tokens).await {
                                tracing::warn!(task_id = %task.id, "token persist failed: {e}");
                            }
                            last_persist = Some(Instant::now());
                        }
                        if tokens > ctx.token_budget {
                            attempt.kill = Some(KillReason::Budget);
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(task_id = %task.id, "stdout read error: {e}");
                        break;
                    }
                },
                _ = tokio::time::sleep_until(silence_deadline) => {
                    attempt.kill = Some(KillReason::Silence);
                    break;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    attempt.kill = Some(KillReason::Hard);
                    break;
                }
            }
        }

        attempt.exit_code = if let Some(reason) = attempt.kill {
            self.audit_kill(task, reason).await;
            terminate(&mut child, pid).await
        } else {
            // natural EOF; the hard deadline still bounds the final wait
            tokio::select! {
                status = child.wait() => status.ok().and_then(|s| s.code()),
                _ = tokio::time::sleep_until(deadline) => {
                    attempt.kill = Some(KillReason::Hard);
                    self.audit_kill(task, KillReason::Hard).await;
                    terminate(&mut child, pid).await
                }
            }
        };

        if let Some(handle) = stderr_handle {
            if let Ok(tail) = handle.await {
                attempt.stderr_tail = tail;
            }
        }
        if let Err(e) = self.store.update_tokens(&task.id, attempt.tokens).await {
            tracing::warn!(task_id = %task.id, "final token persist failed: {e}");
        }
        attempt
    }

    async fn audit_kill(&self, task: &Task, reason: KillReason) {
        let reason = match reason {
            KillReason::Silence => "killed_by_silence",
            KillReason::Hard => "killed_by_hard_timeout",
            KillReason::Budget => "killed_by_budget",
        };
        tracing::warn!(task_id = %task.id, reason, "terminating agent process");
        if let Err(e) = self
            .store
            .audit(
                AuditEvent::new("supervisor", reason)
                    .task(&task.id)
                    .project(&task.project_alias)
                    .thread(&task.thread_id),
            )
            .await
        {
            tracing::warn!(task_id = %task.id, "audit write failed: {e}");
        }
    }
}

/// SIGTERM, bounded grace, SIGKILL. Operates on a child we own, so the pid
/// cannot have been recycled (the unreaped child pins it).
async fn terminate(child: &mut Child, pid: i32) -> Option<i32> {
    if pid > 0 {
        let _ = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid),
            nix::sys::signal::Signal::SIGTERM,
        );
    }
    match tokio::time::timeout(TERM_GRACE, child.wait()).await {
        Ok(status) => status.ok().and_then(|s| s.code()),
        Err(_) => {
            let _ = child.kill().await;
            child.wait().await.ok().and_then(|s| s.code())
        }
    }
}

/// Heuristic for "the Agent rejected our --resume reference".
pub fn looks_like_resume_failure(text: &str) -> bool {
    let t = text.to_lowercase();
    let mentions_session =
        t.contains("resume") || t.contains("session") || t.contains("conversation");
    let mentions_failure = t.contains("not found")
        || t.contains("invalid")
        || t.contains("unable to resume")
        || t.contains("no such")
        || t.contains("expired");
    mentions_session && mentions_failure
}
