#![allow(dead_code, clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Mock collaborators shared by the integration tests.

use async_trait::async_trait;
use claw_sdk_runtime::*;
use claw_sdk_tools::{Tool, ToolContext, ToolDefinition, ToolError, ToolRegistry, ToolResult};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;

pub fn reply(text: &str) -> Message {
    Message::new(Role::Assistant, text)
}

pub fn tool_call(id: &str, name: &str, arguments: serde_json::Value) -> Message {
    Message::assistant(
        "",
        vec![ToolCall {
            id: id.to_string(),
            name: name.to_string(),
            arguments,
        }],
    )
}

fn response(message: Message) -> ModelResponse {
    ModelResponse {
        message,
        usage: Usage {
            input_tokens: 10,
            output_tokens: 4,
        },
        stop_reason: "end_turn".to_string(),
    }
}

/// Model that answers by inspecting the request.
pub struct FnModel {
    respond: Box<dyn Fn(&ModelRequest) -> Message + Send + Sync>,
    pub requests: Mutex<Vec<ModelRequest>>,
}

impl FnModel {
    pub fn new(respond: impl Fn(&ModelRequest) -> Message + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            respond: Box::new(respond),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Replies with `text` to every request.
    pub fn fixed(text: &'static str) -> Arc<Self> {
        Self::new(move |_| reply(text))
    }

    /// Calls `name` once, then answers with the last tool result.
    pub fn calls_tool(name: &'static str, arguments: serde_json::Value) -> Arc<Self> {
        Self::new(move |request| match request.messages.last() {
            Some(last) if last.role == Role::Tool => reply(&format!("result: {}", last.content)),
            _ => tool_call("call_1", name, arguments.clone()),
        })
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn tool_names(&self, index: usize) -> Vec<String> {
        self.requests.lock()[index]
            .tools
            .iter()
            .map(|t| t.name.clone())
            .collect()
    }
}

#[async_trait]
impl Model for FnModel {
    async fn complete(
        &self,
        _cancel: &CancellationToken,
        request: ModelRequest,
    ) -> Result<ModelResponse, RuntimeError> {
        let message = (self.respond)(&request);
        self.requests.lock().push(request);
        Ok(response(message))
    }
}

/// Model that parks every call until the test releases it.
pub struct BlockingModel {
    pub started: Notify,
    release: Semaphore,
    pub calls: AtomicUsize,
}

impl BlockingModel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            started: Notify::new(),
            release: Semaphore::new(0),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn release(&self, calls: usize) {
        self.release.add_permits(calls);
    }
}

#[async_trait]
impl Model for BlockingModel {
    async fn complete(
        &self,
        cancel: &CancellationToken,
        _request: ModelRequest,
    ) -> Result<ModelResponse, RuntimeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.started.notify_one();
        tokio::select! {
            permit = self.release.acquire() => {
                permit.map_err(|e| RuntimeError::LLMError(e.to_string()))?.forget();
            }
            _ = cancel.cancelled() => return Err(RuntimeError::Cancelled),
        }
        Ok(response(reply("released")))
    }
}

/// Returns its arguments as output.
#[derive(Default)]
pub struct EchoTool {
    pub calls: AtomicUsize,
    pub last_args: Mutex<Option<serde_json::Value>>,
}

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo the arguments"
    }

    fn schema(&self) -> serde_json::Value {
        json!({"type": "object"})
    }

    async fn execute(
        &self,
        args: serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<ToolResult, ToolError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_args.lock() = Some(args.clone());
        Ok(ToolResult::ok(args))
    }
}

/// Writes `lines` stdout chunks and one stderr chunk.
pub struct StreamingTool {
    pub lines: usize,
}

#[async_trait]
impl Tool for StreamingTool {
    fn name(&self) -> &str {
        "stream"
    }

    fn description(&self) -> &str {
        "Produce incremental output"
    }

    fn schema(&self) -> serde_json::Value {
        json!({"type": "object"})
    }

    async fn execute(
        &self,
        _args: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolResult, ToolError> {
        for i in 0..self.lines {
            ctx.emit_stdout(format!("line {}", i)).await;
        }
        ctx.emit_stderr("warning: almost done").await;
        Ok(ToolResult::ok(json!(format!("{} lines", self.lines))))
    }
}

/// Always fails at the executor level.
#[derive(Default)]
pub struct FailingTool;

#[async_trait]
impl Tool for FailingTool {
    fn name(&self) -> &str {
        "fail"
    }

    fn description(&self) -> &str {
        "Always fails"
    }

    fn schema(&self) -> serde_json::Value {
        json!({"type": "object"})
    }

    async fn execute(
        &self,
        _args: serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<ToolResult, ToolError> {
        Err(ToolError::Execution("disk full".to_string()))
    }
}

pub struct Tools {
    pub registry: Arc<ToolRegistry>,
    pub echo: Arc<EchoTool>,
}

pub fn tools() -> Tools {
    let echo = Arc::new(EchoTool::default());
    let mut registry = ToolRegistry::new();
    registry.register(echo.clone()).unwrap();
    registry.register(Arc::new(StreamingTool { lines: 3 })).unwrap();
    registry.register(Arc::new(FailingTool)).unwrap();
    Tools {
        registry: Arc::new(registry),
        echo,
    }
}

pub fn definition_names(definitions: &[ToolDefinition]) -> Vec<String> {
    definitions.iter().map(|d| d.name.clone()).collect()
}

/// Hook executor with scripted answers that records every event name.
#[derive(Default)]
pub struct RecordingHooks {
    pub pre_tool: Vec<HookResult>,
    pub pre_compact: Vec<HookResult>,
    pub fail_post_tool: bool,
    pub seen: Mutex<Vec<HookEvent>>,
}

impl RecordingHooks {
    pub fn names(&self) -> Vec<&'static str> {
        self.seen.lock().iter().map(|e| e.name()).collect()
    }
}

#[async_trait]
impl HookExecutor for RecordingHooks {
    fn publish(&self, event: &HookEvent) -> Result<(), RuntimeError> {
        self.seen.lock().push(event.clone());
        Ok(())
    }

    async fn execute(
        &self,
        _cancel: &CancellationToken,
        event: &HookEvent,
    ) -> Result<Vec<HookResult>, RuntimeError> {
        self.seen.lock().push(event.clone());
        match event {
            HookEvent::PreToolUse { .. } => Ok(self.pre_tool.clone()),
            HookEvent::PreCompact { .. } => Ok(self.pre_compact.clone()),
            HookEvent::PostToolUse { .. } if self.fail_post_tool => {
                Err(RuntimeError::HookError("post hook exited 2".to_string()))
            }
            _ => Ok(Vec::new()),
        }
    }
}

/// Subagent manager with fixed tool grants per subagent type.
#[derive(Default)]
pub struct StaticSubagents {
    pub grants: Vec<(&'static str, Vec<&'static str>)>,
    pub dispatched: Mutex<Vec<(SubagentRequest, bool)>>,
}

#[async_trait]
impl SubagentManager for StaticSubagents {
    async fn dispatch(
        &self,
        ctx: &ExecutionContext,
        request: SubagentRequest,
    ) -> Result<SubagentResult, RuntimeError> {
        let allowed_tools = self
            .grants
            .iter()
            .find(|(name, _)| *name == request.target)
            .map(|(_, tools)| tools.iter().map(|t| t.to_string()).collect())
            .unwrap_or_default();
        let subagent = request.target.clone();
        self.dispatched.lock().push((request, ctx.task_dispatch));
        Ok(SubagentResult {
            subagent,
            output: String::new(),
            allowed_tools,
        })
    }
}

pub fn quiet_settings() -> Settings {
    Settings {
        compact: CompactConfig {
            enabled: false,
            ..CompactConfig::default()
        },
        ..Settings::default()
    }
}

pub fn options(model: Arc<dyn Model>) -> RuntimeOptions {
    RuntimeOptions::new(model)
        .with_settings(quiet_settings())
        .without_rules()
}
