//! Consolidated SQLite schema.
//!
//! Applied once on open; idempotent via `IF NOT EXISTS`. The audit table is
//! physically append-only: BEFORE UPDATE / BEFORE DELETE triggers abort any
//! mutation at the storage layer, so no code path can rewrite history.

pub const SCHEMA: &str = r#"

-- ==================== Tasks (queue + lifecycle) ====================

CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    project_alias TEXT NOT NULL,
    project_path TEXT NOT NULL,
    prompt TEXT NOT NULL,
    thread_id TEXT NOT NULL,
    adapter TEXT NOT NULL,
    continue_session INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL CHECK (status IN ('queued','running','needs_approval','done','failed')),
    result TEXT,
    error TEXT,
    tokens_used INTEGER NOT NULL DEFAULT 0,
    token_budget INTEGER,
    worker_pid INTEGER,
    worker_pid_start_ts INTEGER,
    checkpoint TEXT,
    created_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
CREATE INDEX IF NOT EXISTS idx_tasks_project_status ON tasks(project_alias, status);
CREATE INDEX IF NOT EXISTS idx_tasks_thread ON tasks(thread_id, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_tasks_created ON tasks(created_at DESC);

-- ==================== Sessions (thread -> agent session ref) ====================

CREATE TABLE IF NOT EXISTS sessions (
    thread_id TEXT PRIMARY KEY,
    project_alias TEXT NOT NULL,
    session_ref TEXT NOT NULL,
    last_used_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sessions_last_used ON sessions(last_used_at);

-- ==================== Approvals ====================

CREATE TABLE IF NOT EXISTS approvals (
    id TEXT PRIMARY KEY,
    task_id TEXT NOT NULL REFERENCES tasks(id),
    action_class TEXT NOT NULL,
    description TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending' CHECK (status IN ('pending','approved','denied')),
    requested_at TEXT NOT NULL,
    resolved_at TEXT,
    resolved_by TEXT
);

CREATE INDEX IF NOT EXISTS idx_approvals_status ON approvals(status, requested_at);
CREATE INDEX IF NOT EXISTS idx_approvals_task ON approvals(task_id);

-- ==================== Thread bindings ====================

CREATE TABLE IF NOT EXISTS thread_bindings (
    thread_id TEXT PRIMARY KEY,
    project_alias TEXT NOT NULL,
    adapter TEXT NOT NULL,
    created_by TEXT NOT NULL,
    created_at TEXT NOT NULL
);

-- ==================== Audit log (append-only) ====================

CREATE TABLE IF NOT EXISTS audit_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ts TEXT NOT NULL,
    task_id TEXT,
    project_alias TEXT,
    thread_id TEXT,
    actor TEXT NOT NULL,
    action TEXT NOT NULL,
    detail TEXT NOT NULL DEFAULT '{}'
);

CREATE INDEX IF NOT EXISTS idx_audit_task ON audit_log(task_id);
CREATE INDEX IF NOT EXISTS idx_audit_project ON audit_log(project_alias, id DESC);

CREATE TRIGGER IF NOT EXISTS audit_log_no_update
BEFORE UPDATE ON audit_log
BEGIN
    SELECT RAISE(ABORT, 'audit_log is append-only: UPDATE rejected');
END;

CREATE TRIGGER IF NOT EXISTS audit_log_no_delete
BEFORE DELETE ON audit_log
BEGIN
    SELECT RAISE(ABORT, 'audit_log is append-only: DELETE rejected');
END;

-- ==================== Upload references ====================

CREATE TABLE IF NOT EXISTS upload_refs (
    id TEXT PRIMARY KEY,
    project_alias TEXT NOT NULL,
    original_name TEXT NOT NULL,
    server_path TEXT NOT NULL,
    created_at TEXT NOT NULL,
    expires_at TEXT,
    consumed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_upload_refs_project ON upload_refs(project_alias);
CREATE INDEX IF NOT EXISTS idx_upload_refs_expires ON upload_refs(expires_at);
"#;
