//! Tool side of the agent loop: whitelist, hooks, sandbox, streaming output
//! and history bookkeeping around a `ToolExecutor`.

use crate::agent_loop::ToolStep;
use crate::context::ExecutionContext;
use crate::history::History;
use crate::hooks::{first_blocking, HookEvent, HookRecorder};
use crate::interfaces::{RuntimeError, SandboxManager, ToolExecutor, ToolInvocation};
use crate::metrics::{MetricTimer, TOOL_LATENCY};
use crate::stream::ProgressSender;
use crate::types::{Message, StreamEvent, ToolCall};
use crate::whitelist::{ToolWhitelist, WhitelistScopes};
use async_trait::async_trait;
use claw_sdk_tools::{
    canonical_name, OutputChunk, OutputSink, OutputStream, ToolDefinition, ToolResult,
};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Name of the built-in subagent dispatch tool.
pub const TASK_TOOL: &str = "task";

pub fn task_tool_definition() -> ToolDefinition {
    ToolDefinition {
        name: TASK_TOOL.to_string(),
        description: "Delegate a self-contained task to a specialised subagent and return \
                      its final answer."
            .to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "subagent_type": {"type": "string", "description": "Subagent to dispatch"},
                "prompt": {"type": "string", "description": "Full instructions for the subagent"},
                "description": {"type": "string", "description": "Short label for the task"}
            },
            "required": ["subagent_type", "prompt"]
        }),
    }
}

/// Arguments of a `task` tool call.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskArgs {
    pub subagent_type: String,
    pub prompt: String,
    pub description: Option<String>,
}

impl TaskArgs {
    pub fn parse(arguments: &serde_json::Value) -> Result<Self, String> {
        let field = |key: &str| {
            arguments
                .get(key)
                .and_then(|v| v.as_str())
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        let subagent_type = field("subagent_type").ok_or("task requires 'subagent_type'")?;
        let prompt = field("prompt").ok_or("task requires 'prompt'")?;
        Ok(Self {
            subagent_type,
            prompt,
            description: field("description"),
        })
    }
}

/// Re-enters the pipeline for a `task` tool call.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    /// `whitelist` is the dispatching turn's effective whitelist; `hooks` is
    /// its recorder, so subagent events land in the parent response.
    async fn run_task(
        &self,
        ctx: &ExecutionContext,
        args: TaskArgs,
        whitelist: &ToolWhitelist,
        hooks: &HookRecorder,
    ) -> Result<ToolResult, RuntimeError>;
}

/// Host a tool call is about to contact, taken from a `url` or `host`
/// argument.
pub fn extract_host(arguments: &serde_json::Value) -> Option<String> {
    if let Some(raw) = arguments.get("url").and_then(|v| v.as_str()) {
        if let Ok(parsed) = url::Url::parse(raw.trim()) {
            if let Some(host) = parsed.host_str() {
                return Some(host.to_lowercase());
            }
        }
    }
    arguments
        .get("host")
        .and_then(|v| v.as_str())
        .map(|h| h.trim().to_lowercase())
        .filter(|h| !h.is_empty())
}

/// Forwards tool output chunks to the progress channel.
struct ProgressSink {
    sender: ProgressSender,
    tool_use_id: String,
    name: String,
}

#[async_trait]
impl OutputSink for ProgressSink {
    async fn emit(&self, chunk: OutputChunk) {
        let event = StreamEvent::tool_output(
            &self.tool_use_id,
            &self.name,
            chunk.text,
            chunk.stream == OutputStream::Stderr,
        );
        self.sender.emit(event).await;
    }
}

pub struct ToolAdapter {
    executor: Arc<dyn ToolExecutor>,
    history: Arc<History>,
    hooks: Arc<HookRecorder>,
    scopes: WhitelistScopes,
    sandbox: Option<Arc<dyn SandboxManager>>,
    sandbox_root: PathBuf,
    task_runner: Option<Arc<dyn TaskRunner>>,
}

impl ToolAdapter {
    pub fn new(
        executor: Arc<dyn ToolExecutor>,
        history: Arc<History>,
        hooks: Arc<HookRecorder>,
        scopes: WhitelistScopes,
        sandbox_root: PathBuf,
    ) -> Self {
        Self {
            executor,
            history,
            hooks,
            scopes,
            sandbox: None,
            sandbox_root,
            task_runner: None,
        }
    }

    pub fn with_sandbox(mut self, sandbox: Arc<dyn SandboxManager>) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    pub fn with_task_runner(mut self, runner: Arc<dyn TaskRunner>) -> Self {
        self.task_runner = Some(runner);
        self
    }

    /// Whether `task` calls are routed to a runner.
    pub fn handles_tasks(&self) -> bool {
        self.task_runner.is_some()
    }

    fn record(&self, call: &ToolCall, name: &str, result: &Result<ToolResult, RuntimeError>) {
        let content = match result {
            Ok(res) if res.success => res.output_text(),
            Ok(res) => {
                let error = res.error.clone().unwrap_or_else(|| "tool failed".to_string());
                json!({ "error": error }).to_string()
            }
            Err(e) => json!({ "error": e.to_string() }).to_string(),
        };
        self.history
            .append(Message::tool_result(&call.id, name, content));
    }

    /// Run PreToolUse and return the (possibly rewritten) arguments.
    async fn pre_tool_use(
        &self,
        ctx: &ExecutionContext,
        call: &ToolCall,
        name: &str,
    ) -> Result<serde_json::Value, RuntimeError> {
        let results = self
            .hooks
            .execute(
                &ctx.cancel,
                HookEvent::PreToolUse {
                    session_id: ctx.session_id.clone(),
                    tool_use_id: call.id.clone(),
                    tool: name.to_string(),
                    params: call.arguments.clone(),
                },
            )
            .await?;

        if let Some(blocking) = first_blocking(&results) {
            return Err(RuntimeError::HookError(format!(
                "PreToolUse hook blocked tool '{}': {}",
                name,
                blocking.reason.as_deref().unwrap_or("no reason given")
            )));
        }

        let rewritten = results.into_iter().rev().find_map(|r| r.updated_input);
        if rewritten.is_some() {
            debug!("PreToolUse hook rewrote arguments for {}", name);
        }
        Ok(rewritten.unwrap_or_else(|| call.arguments.clone()))
    }

    async fn dispatch(
        &self,
        ctx: &ExecutionContext,
        call: &ToolCall,
        name: &str,
        params: serde_json::Value,
    ) -> Result<ToolResult, RuntimeError> {
        if name == TASK_TOOL {
            if let Some(runner) = &self.task_runner {
                return match TaskArgs::parse(&params) {
                    Ok(args) => {
                        info!("Dispatching task to subagent: {}", args.subagent_type);
                        runner
                            .run_task(ctx, args, &self.scopes.effective(), &self.hooks)
                            .await
                    }
                    Err(msg) => Ok(ToolResult::failed(msg)),
                };
            }
        }

        let host = extract_host(&params);
        if let (Some(host), Some(sandbox)) = (&host, &self.sandbox) {
            sandbox.check_network(host).map_err(|e| match e {
                RuntimeError::SandboxError(_) => e,
                other => RuntimeError::SandboxError(other.to_string()),
            })?;
        }

        let sink: Option<Arc<dyn OutputSink>> = ctx.stream.as_ref().map(|sender| {
            Arc::new(ProgressSink {
                sender: sender.clone(),
                tool_use_id: call.id.clone(),
                name: name.to_string(),
            }) as Arc<dyn OutputSink>
        });

        self.executor
            .execute(
                &ctx.cancel,
                ToolInvocation {
                    session_id: ctx.session_id.clone(),
                    name: name.to_string(),
                    params,
                    sandbox_root: self.sandbox_root.clone(),
                    host,
                },
                sink,
            )
            .await
    }
}

#[async_trait]
impl ToolStep for ToolAdapter {
    async fn execute(
        &self,
        ctx: &ExecutionContext,
        call: &ToolCall,
    ) -> Result<ToolResult, RuntimeError> {
        let name = canonical_name(&call.name);

        if let Some(scope) = self.scopes.denied_by(&name) {
            warn!("Tool '{}' rejected by {} whitelist", name, scope);
            let result = Err(RuntimeError::ToolError(format!(
                "Tool '{}' is not permitted by the {} whitelist",
                name, scope
            )));
            self.record(call, &name, &result);
            return result;
        }

        let params = match self.pre_tool_use(ctx, call, &name).await {
            Ok(params) => params,
            Err(e) => {
                warn!("PreToolUse failed for {}: {}", name, e);
                let result = Err(e);
                self.record(call, &name, &result);
                return result;
            }
        };

        info!("Executing tool: {}", name);
        let timer = MetricTimer::new(TOOL_LATENCY);
        let result = self.dispatch(ctx, call, &name, params).await;
        let duration_ms = timer.elapsed_ms() as u64;
        drop(timer);

        let (output, error) = match &result {
            Ok(res) => (res.output_text(), res.error.clone()),
            Err(e) => (String::new(), Some(e.to_string())),
        };
        let post = self
            .hooks
            .execute(
                &ctx.cancel,
                HookEvent::PostToolUse {
                    session_id: ctx.session_id.clone(),
                    tool_use_id: call.id.clone(),
                    tool: name.clone(),
                    output,
                    error,
                    duration_ms,
                },
            )
            .await;

        self.record(call, &name, &result);

        match (result, post) {
            (Err(e), _) => Err(e),
            (Ok(_), Err(hook_err)) => {
                warn!("PostToolUse hook failed for {}: {}", name, hook_err);
                Err(hook_err)
            }
            (Ok(res), Ok(_)) => Ok(res),
        }
    }
}
