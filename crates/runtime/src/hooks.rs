//! Lifecycle hook events and the per-run recorder.

use crate::interfaces::RuntimeError;
use crate::model_selector::ModelTier;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Permission outcome a gating hook may return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Allow,
    Deny,
    Ask,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HookResult {
    #[serde(default)]
    pub decision: Option<Decision>,
    #[serde(default)]
    pub reason: Option<String>,
    /// Replacement tool arguments, honoured for `PreToolUse` only.
    #[serde(default)]
    pub updated_input: Option<serde_json::Value>,
}

impl HookResult {
    pub fn allow() -> Self {
        Self {
            decision: Some(Decision::Allow),
            ..Self::default()
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            decision: Some(Decision::Deny),
            reason: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn ask(reason: impl Into<String>) -> Self {
        Self {
            decision: Some(Decision::Ask),
            reason: Some(reason.into()),
            ..Self::default()
        }
    }

    /// Deny and ask both stop the guarded action; there is no interactive
    /// approver inside the runtime.
    pub fn blocks(&self) -> bool {
        matches!(self.decision, Some(Decision::Deny) | Some(Decision::Ask))
    }
}

/// First result that blocks the guarded action, if any.
pub fn first_blocking(results: &[HookResult]) -> Option<&HookResult> {
    results.iter().find(|r| r.blocks())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum HookEvent {
    UserPrompt {
        session_id: String,
        prompt: String,
    },
    PreToolUse {
        session_id: String,
        tool_use_id: String,
        tool: String,
        params: serde_json::Value,
    },
    PostToolUse {
        session_id: String,
        tool_use_id: String,
        tool: String,
        output: String,
        error: Option<String>,
        duration_ms: u64,
    },
    PreCompact {
        session_id: String,
        estimated_tokens: usize,
        token_limit: usize,
        threshold: f64,
        preserve_count: usize,
    },
    ContextCompacted {
        session_id: String,
        original_messages: usize,
        preserved_messages: usize,
        tokens_before: usize,
        tokens_after: usize,
    },
    ModelSelected {
        session_id: String,
        tier: ModelTier,
        reason: String,
    },
    SubagentStart {
        session_id: String,
        subagent: String,
        task_dispatch: bool,
    },
    SubagentStop {
        session_id: String,
        subagent: String,
        error: Option<String>,
    },
}

impl HookEvent {
    pub fn name(&self) -> &'static str {
        match self {
            HookEvent::UserPrompt { .. } => "UserPrompt",
            HookEvent::PreToolUse { .. } => "PreToolUse",
            HookEvent::PostToolUse { .. } => "PostToolUse",
            HookEvent::PreCompact { .. } => "PreCompact",
            HookEvent::ContextCompacted { .. } => "ContextCompacted",
            HookEvent::ModelSelected { .. } => "ModelSelected",
            HookEvent::SubagentStart { .. } => "SubagentStart",
            HookEvent::SubagentStop { .. } => "SubagentStop",
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            HookEvent::UserPrompt { session_id, .. }
            | HookEvent::PreToolUse { session_id, .. }
            | HookEvent::PostToolUse { session_id, .. }
            | HookEvent::PreCompact { session_id, .. }
            | HookEvent::ContextCompacted { session_id, .. }
            | HookEvent::ModelSelected { session_id, .. }
            | HookEvent::SubagentStart { session_id, .. }
            | HookEvent::SubagentStop { session_id, .. } => session_id,
        }
    }
}

/// User-registered hook runner (typically shell commands).
#[async_trait]
pub trait HookExecutor: Send + Sync {
    /// Fire-and-forget notification.
    fn publish(&self, event: &HookEvent) -> Result<(), RuntimeError>;

    /// Gating call; results may carry decisions or rewritten input.
    async fn execute(
        &self,
        cancel: &CancellationToken,
        event: &HookEvent,
    ) -> Result<Vec<HookResult>, RuntimeError>;
}

/// Executor used when no hooks are configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

#[async_trait]
impl HookExecutor for NoopHooks {
    fn publish(&self, _event: &HookEvent) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn execute(
        &self,
        _cancel: &CancellationToken,
        _event: &HookEvent,
    ) -> Result<Vec<HookResult>, RuntimeError> {
        Ok(Vec::new())
    }
}

/// Hook front-end for one run: forwards to the executor and keeps every
/// event so the response can report what fired.
pub struct HookRecorder {
    executor: Arc<dyn HookExecutor>,
    events: Mutex<Vec<HookEvent>>,
}

impl HookRecorder {
    pub fn new(executor: Arc<dyn HookExecutor>) -> Self {
        Self {
            executor,
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn publish(&self, event: HookEvent) -> Result<(), RuntimeError> {
        let result = self.executor.publish(&event);
        self.events.lock().push(event);
        result
    }

    /// Publish and only log a failure.
    pub fn notify(&self, event: HookEvent) {
        let name = event.name();
        if let Err(e) = self.publish(event) {
            warn!("{} hook notification failed: {}", name, e);
        }
    }

    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        event: HookEvent,
    ) -> Result<Vec<HookResult>, RuntimeError> {
        let result = self.executor.execute(cancel, &event).await;
        self.events.lock().push(event);
        result
    }

    pub fn events(&self) -> Vec<HookEvent> {
        self.events.lock().clone()
    }
}
