//! Request-scoped execution context.

use crate::stream::ProgressSender;
use tokio_util::sync::CancellationToken;

/// Everything a turn needs to know about the call it belongs to.
///
/// Passed explicitly through adapters, the agent loop and subagent dispatch
/// instead of living in ambient task-local state.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub cancel: CancellationToken,
    pub session_id: String,
    pub request_id: String,
    /// Set when the turn runs on behalf of a `task` tool call. Such turns
    /// never touch the session gate and do not advertise the task tool again.
    pub task_dispatch: bool,
    /// Progress sink of a streaming call; `None` for synchronous runs.
    pub stream: Option<ProgressSender>,
}

impl ExecutionContext {
    pub fn new(cancel: CancellationToken, session_id: &str, request_id: &str) -> Self {
        Self {
            cancel,
            session_id: session_id.to_string(),
            request_id: request_id.to_string(),
            task_dispatch: false,
            stream: None,
        }
    }

    pub fn with_stream(mut self, stream: ProgressSender) -> Self {
        self.stream = Some(stream);
        self
    }

    /// Context for a nested task dispatch. Drops the stream sink so the
    /// nested turn cannot keep the parent's progress channel open.
    pub fn for_task(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            session_id: self.session_id.clone(),
            request_id: self.request_id.clone(),
            task_dispatch: true,
            stream: None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
