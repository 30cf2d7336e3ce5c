//! Adapter bus.
//!
//! Client transports (chat bots, web UIs) register here under a tag; the
//! engine fans task updates and approval prompts out by the tag stored on
//! each task. Dispatch is fire-and-catch: a broken adapter gets logged,
//! never a stalled engine loop.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::db::tasks::TaskStatus;
use crate::error::ChannelError;

/// Status notification pushed on every engine-driven transition.
/// All strings are post-redaction.
#[derive(Debug, Clone)]
pub struct TaskUpdate {
    pub task_id: String,
    pub thread_id: String,
    pub status: TaskStatus,
    pub summary: Option<String>,
    pub error: Option<String>,
}

/// Prompt asking a human to resolve a pending approval.
#[derive(Debug, Clone)]
pub struct ApprovalPrompt {
    pub approval_id: String,
    pub task_id: String,
    pub thread_id: String,
    pub description: String,
}

#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Tag tasks carry to route back to this adapter.
    fn tag(&self) -> &str;

    async fn send_task_update(&self, update: TaskUpdate) -> Result<(), ChannelError>;

    async fn request_approval(&self, prompt: ApprovalPrompt) -> Result<(), ChannelError>;
}

/// Registry + async fan-out.
#[derive(Default)]
pub struct AdapterBus {
    adapters: RwLock<HashMap<String, Arc<dyn ChannelAdapter>>>,
}

impl AdapterBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, adapter: Arc<dyn ChannelAdapter>) {
        let tag = adapter.tag().to_string();
        self.adapters.write().await.insert(tag, adapter);
    }

    async fn get(&self, tag: &str) -> Option<Arc<dyn ChannelAdapter>> {
        self.adapters.read().await.get(tag).cloned()
    }

    /// Dispatch off the caller's path. Unknown tags and adapter failures are
    /// logged and dropped.
    pub async fn send_task_update(&self, tag: &str, update: TaskUpdate) {
        let Some(adapter) = self.get(tag).await else {
            tracing::warn!(tag, task_id = %update.task_id, "no adapter registered for update");
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = adapter.send_task_update(update).await {
                tracing::warn!("adapter dispatch failed: {e}");
            }
        });
    }

    pub async fn request_approval(&self, tag: &str, prompt: ApprovalPrompt) {
        let Some(adapter) = self.get(tag).await else {
            tracing::warn!(tag, approval_id = %prompt.approval_id, "no adapter registered for approval prompt");
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = adapter.request_approval(prompt).await {
                tracing::warn!("approval prompt dispatch failed: {e}");
            }
        });
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory adapter used across engine tests.

    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct RecordingAdapter {
        tag: String,
        pub updates: Mutex<Vec<TaskUpdate>>,
        pub approvals: Mutex<Vec<ApprovalPrompt>>,
        pub fail: bool,
    }

    impl RecordingAdapter {
        pub fn new(tag: &str) -> Arc<Self> {
            Arc::new(Self {
                tag: tag.to_string(),
                ..Default::default()
            })
        }

        pub fn failing(tag: &str) -> Arc<Self> {
            Arc::new(Self {
                tag: tag.to_string(),
                fail: true,
                ..Default::default()
            })
        }

        pub fn statuses(&self) -> Vec<TaskStatus> {
            self.updates.lock().unwrap().iter().map(|u| u.status).collect()
        }
    }

    #[async_trait]
    impl ChannelAdapter for RecordingAdapter {
        fn tag(&self) -> &str {
            &self.tag
        }

        async fn send_task_update(&self, update: TaskUpdate) -> Result<(), ChannelError> {
            if self.fail {
                return Err(ChannelError {
                    tag: self.tag.clone(),
                    reason: "synthetic failure".to_string(),
                });
            }
            self.updates.lock().unwrap().push(update);
            Ok(())
        }

        async fn request_approval(&self, prompt: ApprovalPrompt) -> Result<(), ChannelError> {
            if self.fail {
                return Err(ChannelError {
                    tag: self.tag.clone(),
                    reason: "synthetic failure".to_string(),
                });
            }
            self.approvals.lock().unwrap().push(prompt);
            Ok(())
        }
    }
}
