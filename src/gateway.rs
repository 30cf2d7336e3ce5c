//! Adapter-facing API facade.
//!
//! Everything a transport (chat bot, web UI) may do goes through here:
//! enqueue, bind, cancel, resolve, read-only queries, uploads. Synchronous
//! failures (`unknown_project`, `queue_full`) surface as errors to the
//! caller; everything asynchronous flows back over the adapter bus.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::db::audit::{AuditEntry, AuditEvent};
use crate::db::tasks::{NewTask, Task, TaskStatus};
use crate::db::uploads::UploadRef;
use crate::engine::Engine;
use crate::error::{EngineError, UploadError};
use crate::redact::redact;
use crate::uploads::{UploadHandle, UploadStore};

#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub project_alias: String,
    pub prompt: String,
    pub thread_id: String,
    pub adapter: String,
    pub continue_session: bool,
    pub actor_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalAction {
    Approve,
    Deny,
}

/// Task as shown to adapters; free-text fields are redacted on the way out.
#[derive(Debug, Clone)]
pub struct TaskView {
    pub id: String,
    pub project_alias: String,
    pub thread_id: String,
    pub status: TaskStatus,
    pub prompt: String,
    pub result: Option<String>,
    pub error: Option<String>,
    pub tokens_used: i64,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskView {
    fn from_task(task: Task) -> Self {
        Self {
            id: task.id,
            project_alias: task.project_alias,
            thread_id: task.thread_id,
            status: task.status,
            prompt: redact(&task.prompt),
            result: task.result.as_deref().map(redact),
            error: task.error,
            tokens_used: task.tokens_used,
            created_at: task.created_at,
            completed_at: task.completed_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProjectInfo {
    pub alias: String,
    pub path: String,
    pub description: Option<String>,
    pub skip_permissions: bool,
}

#[derive(Debug, Clone)]
pub struct QueueStatusEntry {
    pub project_alias: String,
    pub queued: i64,
    pub cap: u32,
    pub active_task_id: Option<String>,
    pub active_status: Option<TaskStatus>,
}

pub struct Gateway {
    engine: Arc<Engine>,
    uploads: UploadStore,
}

impl Gateway {
    pub fn new(engine: Arc<Engine>) -> Self {
        let uploads = UploadStore::new(
            engine.config().uploads_root.clone(),
            engine.store().clone(),
        );
        Self { engine, uploads }
    }

    pub fn uploads(&self) -> &UploadStore {
        &self.uploads
    }

    // ==================== Mutations ====================

    pub async fn enqueue_task(&self, req: EnqueueRequest) -> Result<String, EngineError> {
        let Some(project) = self.engine.projects().get(&req.project_alias) else {
            return Err(EngineError::UnknownProject {
                alias: req.project_alias,
            });
        };
        let task = self
            .engine
            .store()
            .enqueue(
                NewTask {
                    project_alias: project.alias.clone(),
                    project_path: project.path.to_string_lossy().to_string(),
                    prompt: req.prompt,
                    thread_id: req.thread_id.clone(),
                    adapter: req.adapter,
                    continue_session: req.continue_session,
                    token_budget: None,
                },
                self.engine.config().max_queued_per_project,
            )
            .await?;
        if let Err(e) = self
            .engine
            .store()
            .audit(
                AuditEvent::new(&req.actor_id, "task_created")
                    .task(&task.id)
                    .project(&task.project_alias)
                    .thread(&task.thread_id),
            )
            .await
        {
            tracing::error!(task_id = %task.id, "audit write failed: {e}");
        }
        tracing::info!(task_id = %task.id, project = %task.project_alias, "task enqueued");
        Ok(task.id)
    }

    pub async fn bind_thread(
        &self,
        thread_id: &str,
        project_alias: &str,
        adapter: &str,
        actor_id: &str,
    ) -> Result<(), EngineError> {
        if !self.engine.projects().contains(project_alias) {
            return Err(EngineError::UnknownProject {
                alias: project_alias.to_string(),
            });
        }
        self.engine
            .store()
            .bind_thread_row(thread_id, project_alias, adapter, actor_id)
            .await?;
        Ok(())
    }

    pub async fn cancel_task(&self, task_id: &str, actor_id: &str) -> Result<bool, EngineError> {
        self.engine.cancel_task(task_id, actor_id).await
    }

    pub async fn resolve_approval(
        &self,
        approval_id: &str,
        actor_id: &str,
        action: ApprovalAction,
    ) -> Result<bool, EngineError> {
        self.engine
            .resolve_approval(approval_id, actor_id, action == ApprovalAction::Approve)
            .await
    }

    // ==================== Read-only queries ====================

    pub async fn get_binding(&self, thread_id: &str) -> Result<Option<String>, EngineError> {
        Ok(self
            .engine
            .store()
            .get_binding(thread_id)
            .await?
            .map(|b| b.project_alias))
    }

    pub fn get_projects(&self) -> Vec<ProjectInfo> {
        self.engine
            .projects()
            .iter()
            .map(|p| ProjectInfo {
                alias: p.alias.clone(),
                path: p.path.to_string_lossy().to_string(),
                description: p.description.clone(),
                skip_permissions: p.skip_permissions,
            })
            .collect()
    }

    /// One entry per configured project, including idle ones.
    pub async fn get_queue_status(&self) -> Result<Vec<QueueStatusEntry>, EngineError> {
        let live = self.engine.store().queue_status().await?;
        let cap = self.engine.config().max_queued_per_project;
        Ok(self
            .engine
            .projects()
            .iter()
            .map(|p| {
                let row = live.iter().find(|s| s.project_alias == p.alias);
                QueueStatusEntry {
                    project_alias: p.alias.clone(),
                    queued: row.map(|r| r.queued).unwrap_or(0),
                    cap,
                    active_task_id: row.and_then(|r| r.active_task_id.clone()),
                    active_status: row.and_then(|r| r.active_status),
                }
            })
            .collect())
    }

    pub async fn get_thread_task_history(
        &self,
        thread_id: &str,
        limit: u32,
    ) -> Result<Vec<TaskView>, EngineError> {
        Ok(self
            .engine
            .store()
            .tasks_by_thread(thread_id, limit)
            .await?
            .into_iter()
            .map(TaskView::from_task)
            .collect())
    }

    pub async fn get_project_task_history(
        &self,
        project_alias: &str,
        limit: u32,
    ) -> Result<Vec<TaskView>, EngineError> {
        Ok(self
            .engine
            .store()
            .tasks_by_project(project_alias, limit)
            .await?
            .into_iter()
            .map(TaskView::from_task)
            .collect())
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Option<TaskView>, EngineError> {
        Ok(self
            .engine
            .store()
            .get_task(task_id)
            .await?
            .map(TaskView::from_task))
    }

    pub async fn get_audit(
        &self,
        project_alias: Option<&str>,
        limit: u32,
    ) -> Result<Vec<AuditEntry>, EngineError> {
        Ok(match project_alias {
            Some(alias) => self.engine.store().audit_by_project(alias, limit).await?,
            None => self.engine.store().audit_recent(limit).await?,
        })
    }

    /// Tokens spent since UTC midnight, per project.
    pub async fn get_budget_today(
        &self,
        project_alias: Option<&str>,
    ) -> Result<Vec<(String, i64)>, EngineError> {
        Ok(self.engine.store().budget_today(project_alias).await?)
    }

    // ==================== Uploads ====================

    pub async fn save_upload(
        &self,
        project_alias: &str,
        scope_id: &str,
        original_name: &str,
        declared_mime: &str,
        bytes: &[u8],
    ) -> Result<UploadHandle, UploadError> {
        if !self.engine.projects().contains(project_alias) {
            return Err(UploadError::UnknownProject {
                alias: project_alias.to_string(),
            });
        }
        self.uploads
            .save(project_alias, scope_id, original_name, declared_mime, bytes)
            .await
    }

    pub async fn create_upload_reference(
        &self,
        project_alias: &str,
        original_name: &str,
        server_path: &std::path::Path,
    ) -> Result<UploadRef, UploadError> {
        self.uploads
            .create_reference(project_alias, original_name, server_path)
            .await
    }

    pub async fn resolve_upload_ref(&self, id: &str) -> Result<Option<UploadRef>, UploadError> {
        self.uploads.resolve(id).await
    }

    pub async fn mark_upload_consumed(&self, id: &str) -> Result<bool, UploadError> {
        self.uploads.mark_consumed(id).await
    }

    pub async fn cleanup_task_upload_dir(
        &self,
        project_alias: &str,
        task_id: &str,
    ) -> Result<(), UploadError> {
        self.uploads.cleanup_scope_dir(project_alias, task_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::AdapterBus;
    use crate::config::{EngineConfig, ProjectsConfig};
    use crate::db::Database;
    use crate::settings::{ProjectSettings, Settings};

    async fn gateway_with_projects(aliases: &[&str]) -> (Gateway, tempfile::TempDir) {
        let root = tempfile::tempdir().unwrap();
        let mut settings = Settings::default();
        for alias in aliases {
            let dir = root.path().join(alias);
            std::fs::create_dir_all(&dir).unwrap();
            settings.projects.insert(
                alias.to_string(),
                ProjectSettings {
                    path: dir.to_string_lossy().to_string(),
                    description: Some(format!("{alias} project")),
                    skip_permissions: false,
                    skip_permissions_reason: None,
                    token_budget: None,
                    timeout_ms: None,
                },
            );
        }
        let mut config = EngineConfig::resolve(&settings).unwrap();
        config.uploads_root = root.path().join("uploads");
        std::fs::create_dir_all(&config.uploads_root).unwrap();
        let projects = ProjectsConfig::resolve(&settings).unwrap();
        let db = Database::open_memory().await.unwrap();
        let engine = Engine::new(db, config, projects, Arc::new(AdapterBus::new()), None);
        (Gateway::new(engine), root)
    }

    fn request(alias: &str) -> EnqueueRequest {
        EnqueueRequest {
            project_alias: alias.to_string(),
            prompt: "do the thing".to_string(),
            thread_id: "t1".to_string(),
            adapter: "web".to_string(),
            continue_session: false,
            actor_id: "user-1".to_string(),
        }
    }

    #[tokio::test]
    async fn enqueue_creates_task_and_audits() {
        let (gw, _root) = gateway_with_projects(&["alpha"]).await;
        let task_id = gw.enqueue_task(request("alpha")).await.unwrap();
        let view = gw.get_task(&task_id).await.unwrap().unwrap();
        assert_eq!(view.status, TaskStatus::Queued);

        let audit = gw.get_audit(Some("alpha"), 10).await.unwrap();
        assert!(audit.iter().any(|a| a.action == "task_created"));
    }

    #[tokio::test]
    async fn enqueue_rejects_unknown_project() {
        let (gw, _root) = gateway_with_projects(&["alpha"]).await;
        let err = gw.enqueue_task(request("nope")).await.unwrap_err();
        assert!(matches!(err, EngineError::UnknownProject { .. }));
    }

    #[tokio::test]
    async fn enqueue_enforces_queue_cap_without_side_effects() {
        let (gw, _root) = gateway_with_projects(&["alpha"]).await;
        // cap comes from resolved config (default 5); fill it
        for _ in 0..5 {
            gw.enqueue_task(request("alpha")).await.unwrap();
        }
        let err = gw.enqueue_task(request("alpha")).await.unwrap_err();
        assert!(matches!(err, EngineError::QueueFull { .. }));
        let status = gw.get_queue_status().await.unwrap();
        assert_eq!(status[0].queued, 5);
    }

    #[tokio::test]
    async fn bind_thread_validates_project() {
        let (gw, _root) = gateway_with_projects(&["alpha"]).await;
        gw.bind_thread("t1", "alpha", "telegram", "user-1")
            .await
            .unwrap();
        assert_eq!(gw.get_binding("t1").await.unwrap().as_deref(), Some("alpha"));
        assert!(gw
            .bind_thread("t2", "ghost", "telegram", "user-1")
            .await
            .is_err());
        assert!(gw.get_binding("t2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn queue_status_lists_idle_projects() {
        let (gw, _root) = gateway_with_projects(&["alpha", "beta"]).await;
        gw.enqueue_task(request("alpha")).await.unwrap();
        let status = gw.get_queue_status().await.unwrap();
        assert_eq!(status.len(), 2);
        let alpha = status.iter().find(|s| s.project_alias == "alpha").unwrap();
        let beta = status.iter().find(|s| s.project_alias == "beta").unwrap();
        assert_eq!(alpha.queued, 1);
        assert_eq!(beta.queued, 0);
        assert_eq!(beta.cap, 5);
    }

    #[tokio::test]
    async fn history_views_are_redacted() {
        let (gw, _root) = gateway_with_projects(&["alpha"]).await;
        let mut req = request("alpha");
        req.prompt = "use key ghp_FAKEtoken12345678 to fetch".to_string();
        gw.enqueue_task(req).await.unwrap();
        let history = gw.get_thread_task_history("t1", 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(!history[0].prompt.contains("ghp_FAKE"));
        assert!(history[0].prompt.contains("[REDACTED]"));
    }

    #[tokio::test]
    async fn projects_listing_matches_config() {
        let (gw, _root) = gateway_with_projects(&["alpha", "beta"]).await;
        let projects = gw.get_projects();
        assert_eq!(projects.len(), 2);
        assert!(projects.iter().all(|p| !p.skip_permissions));
    }

    #[tokio::test]
    async fn upload_roundtrip_through_gateway() {
        let (gw, _root) = gateway_with_projects(&["alpha"]).await;
        let handle = gw
            .save_upload("alpha", "task-1", "notes.md", "text/markdown", b"# hi\n")
            .await
            .unwrap();
        let row = gw.resolve_upload_ref(&handle.id).await.unwrap().unwrap();
        assert_eq!(row.original_name, "notes.md");
        assert!(gw.mark_upload_consumed(&handle.id).await.unwrap());
        gw.cleanup_task_upload_dir("alpha", "task-1").await.unwrap();
    }
}
