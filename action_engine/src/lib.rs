use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use domain::{Action, Breach, TokenId};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

/// A close or consult decision handed to whatever performs the trade.
#[derive(Debug, Clone, Serialize)]
pub struct ActionRequest {
    pub id: Uuid,
    pub token_id: TokenId,
    pub action: Action,
    pub breach: Option<Breach>,
    pub context: String,
    pub created_at: DateTime<Utc>,
}

impl ActionRequest {
    pub fn new(
        token_id: impl Into<TokenId>,
        action: Action,
        breach: Option<Breach>,
        context: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            token_id: token_id.into(),
            action,
            breach,
            context: context.into(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("action rejected: {0}")]
    Rejected(String),
    #[error("executor unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, request: &ActionRequest) -> Result<(), ExecutionError>;
}

/// Logs decisions without trading. Default when no exchange integration is wired in.
#[derive(Clone, Default)]
pub struct LoggingExecutor;

#[async_trait]
impl ActionExecutor for LoggingExecutor {
    async fn execute(&self, request: &ActionRequest) -> Result<(), ExecutionError> {
        match request.action {
            Action::None => {}
            Action::Close => warn!(
                id = %request.id,
                token = %request.token_id,
                context = %request.context,
                "close requested"
            ),
            Action::ConsultAi => info!(
                id = %request.id,
                token = %request.token_id,
                context = %request.context,
                "ai confirmation requested"
            ),
        }
        Ok(())
    }
}

/// Keeps the most recent requests in memory and forwards them to the inner executor.
pub struct RecordingExecutor {
    inner: Arc<dyn ActionExecutor>,
    history: Mutex<VecDeque<ActionRequest>>,
    capacity: usize,
}

impl RecordingExecutor {
    pub fn new(inner: Arc<dyn ActionExecutor>, capacity: usize) -> Self {
        Self {
            inner,
            history: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    /// Newest first.
    pub async fn recent(&self) -> Vec<ActionRequest> {
        self.history.lock().await.iter().rev().cloned().collect()
    }
}

#[async_trait]
impl ActionExecutor for RecordingExecutor {
    async fn execute(&self, request: &ActionRequest) -> Result<(), ExecutionError> {
        {
            let mut history = self.history.lock().await;
            if history.len() == self.capacity {
                history.pop_front();
            }
            history.push_back(request.clone());
        }
        self.inner.execute(request).await
    }
}
