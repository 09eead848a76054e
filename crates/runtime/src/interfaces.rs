//! Abstract interfaces for runtime collaborators.
//!
//! The runtime only talks to models, tools, commands, skills, subagents, the
//! sandbox and tracing through these traits. Concrete implementations live
//! outside this crate, except for the `ToolExecutor` impl on the default
//! tool registry.

use crate::context::ExecutionContext;
use crate::types::{Message, Response, Usage};
use async_trait::async_trait;
use claw_sdk_tools::{OutputSink, ToolContext, ToolDefinition, ToolRegistry, ToolResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Runtime errors.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Concurrent execution: session {0} already has a turn in flight")]
    ConcurrentExecution(String),

    #[error("Runtime closed")]
    Closed,

    #[error("Command error: {0}")]
    CommandError(String),

    #[error("Skill error: {0}")]
    SkillError(String),

    #[error("Subagent error: {0}")]
    SubagentError(String),

    #[error("Tool error: {0}")]
    ToolError(String),

    #[error("LLM error: {0}")]
    LLMError(String),

    #[error("Hook error: {0}")]
    HookError(String),

    #[error("Sandbox error: {0}")]
    SandboxError(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Max iterations ({0}) exceeded without final response")]
    MaxIterations(usize),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl From<serde_yaml::Error> for RuntimeError {
    fn from(err: serde_yaml::Error) -> Self {
        RuntimeError::ConfigError(format!("Invalid YAML: {}", err))
    }
}

impl From<claw_sdk_tools::ToolError> for RuntimeError {
    fn from(err: claw_sdk_tools::ToolError) -> Self {
        RuntimeError::ToolError(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelRequest {
    pub session_id: String,
    pub system: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    /// Explicit model identifier, used by the compactor's summary call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ModelResponse {
    pub message: Message,
    pub usage: Usage,
    pub stop_reason: String,
}

/// LLM backend.
#[async_trait]
pub trait Model: Send + Sync {
    async fn complete(
        &self,
        cancel: &CancellationToken,
        request: ModelRequest,
    ) -> Result<ModelResponse, RuntimeError>;
}

// ---------------------------------------------------------------------------
// Tools
// ---------------------------------------------------------------------------

/// A single tool call as handed to the executor.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub session_id: String,
    pub name: String,
    pub params: serde_json::Value,
    pub sandbox_root: PathBuf,
    pub host: Option<String>,
}

/// Tool execution interface.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Every tool this executor can run, before whitelist filtering.
    fn definitions(&self) -> Vec<ToolDefinition>;

    async fn execute(
        &self,
        cancel: &CancellationToken,
        call: ToolInvocation,
        output: Option<Arc<dyn OutputSink>>,
    ) -> Result<ToolResult, RuntimeError>;

    /// Release the executor. Called once by `Runtime::close`.
    async fn close(&self) -> Result<(), RuntimeError> {
        Ok(())
    }
}

#[async_trait]
impl ToolExecutor for ToolRegistry {
    fn definitions(&self) -> Vec<ToolDefinition> {
        ToolRegistry::definitions(self)
    }

    async fn execute(
        &self,
        cancel: &CancellationToken,
        call: ToolInvocation,
        output: Option<Arc<dyn OutputSink>>,
    ) -> Result<ToolResult, RuntimeError> {
        let mut ctx = ToolContext::new(call.session_id, call.sandbox_root);
        if let Some(sink) = output {
            ctx = ctx.with_output(sink);
        }
        tokio::select! {
            result = ToolRegistry::execute(self, &call.name, call.params, &ctx) => {
                result.map_err(RuntimeError::from)
            }
            _ = cancel.cancelled() => Err(RuntimeError::Cancelled),
        }
    }

    async fn close(&self) -> Result<(), RuntimeError> {
        ToolRegistry::close(self);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Slash commands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandInvocation {
    pub name: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// The prompt text this invocation was parsed from.
    pub raw: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub command: String,
    #[serde(default)]
    pub output: String,
}

#[async_trait]
pub trait CommandExecutor: Send + Sync {
    fn parse(&self, prompt: &str) -> Result<Vec<CommandInvocation>, RuntimeError>;

    async fn execute(
        &self,
        cancel: &CancellationToken,
        invocations: &[CommandInvocation],
    ) -> Result<Vec<CommandResult>, RuntimeError>;
}

// ---------------------------------------------------------------------------
// Skills
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct ActivationContext {
    pub session_id: String,
    pub prompt: String,
    pub tags: HashMap<String, String>,
    /// Canonical names of skills the caller insists on.
    pub forced: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SkillMatch {
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillResult {
    pub skill: String,
    #[serde(default)]
    pub output: String,
}

#[async_trait]
pub trait SkillRegistry: Send + Sync {
    fn match_skills(&self, ctx: &ActivationContext) -> Vec<SkillMatch>;

    async fn execute(
        &self,
        cancel: &CancellationToken,
        name: &str,
        ctx: &ActivationContext,
    ) -> Result<SkillResult, RuntimeError>;
}

// ---------------------------------------------------------------------------
// Subagents
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct SubagentRequest {
    pub target: String,
    pub instruction: String,
    pub session_id: String,
    /// Effective whitelist of the dispatching turn; empty means unrestricted.
    pub tool_whitelist: Vec<String>,
    pub metadata: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubagentResult {
    pub subagent: String,
    #[serde(default)]
    pub output: String,
    /// Tools this subagent may use; empty means unrestricted.
    #[serde(default)]
    pub allowed_tools: Vec<String>,
}

#[async_trait]
pub trait SubagentManager: Send + Sync {
    async fn dispatch(
        &self,
        ctx: &ExecutionContext,
        request: SubagentRequest,
    ) -> Result<SubagentResult, RuntimeError>;
}

// ---------------------------------------------------------------------------
// Sandbox & tracing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SandboxSnapshot {
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub disk_bytes: u64,
}

pub trait SandboxManager: Send + Sync {
    fn check_network(&self, host: &str) -> Result<(), RuntimeError>;

    fn snapshot(&self) -> SandboxSnapshot;
}

/// Turn-level tracer. Shut down last when the runtime closes.
pub trait Tracer: Send + Sync {
    fn record_turn(&self, response: &Response);

    fn shutdown(&self) -> Result<(), RuntimeError>;
}
