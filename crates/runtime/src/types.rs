//! Core type definitions for the SDK runtime.

use crate::compactor::CompactResult;
use crate::hooks::HookEvent;
use crate::interfaces::{CommandResult, SandboxSnapshot, SkillResult, SubagentResult};
use crate::model_selector::ModelTier;
use chrono::{DateTime, Utc};
use claw_sdk_tools::canonical_name;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Message role in conversation.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
    System,
}

/// A tool invocation requested by the model.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// A single message in the conversation.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl Message {
    /// Create a new message.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            metadata: None,
        }
    }

    /// Create a new message with metadata.
    pub fn with_metadata(
        role: Role,
        content: impl Into<String>,
        metadata: serde_json::Value,
    ) -> Self {
        Self {
            metadata: Some(metadata),
            ..Self::new(role, content)
        }
    }

    /// Assistant reply carrying tool calls.
    pub fn assistant(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::new(Role::Assistant, content)
        }
    }

    /// Tool-role entry answering the call with `tool_call_id`.
    pub fn tool_result(tool_call_id: &str, name: &str, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.to_string()),
            metadata: Some(serde_json::json!({ "tool_name": name })),
            ..Self::new(Role::Tool, content)
        }
    }
}

/// Token accounting reported by the model.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    pub fn add(&mut self, other: Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// Where a request entered the SDK.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EntryPoint {
    #[default]
    Cli,
    Ci,
    Platform,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct ModeContext {
    pub entry_point: EntryPoint,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

/// A single prompt submitted to the runtime.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Request {
    pub prompt: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub mode: ModeContext,
    #[serde(default)]
    pub target_subagent: Option<String>,
    #[serde(default)]
    pub tool_whitelist: Vec<String>,
    #[serde(default)]
    pub forced_skills: Vec<String>,
    #[serde(default)]
    pub model_tier: Option<ModelTier>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Request {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    /// Trim the prompt, fill missing ids and canonicalize tool/skill names.
    ///
    /// After this call `session_id` and `request_id` are never empty.
    pub fn normalize(mut self) -> Self {
        self.prompt = self.prompt.trim().to_string();
        self.session_id = self.session_id.trim().to_string();
        if self.session_id.is_empty() {
            self.session_id = generate_session_id();
        }
        self.request_id = self.request_id.trim().to_string();
        if self.request_id.is_empty() {
            self.request_id = uuid::Uuid::new_v4().to_string();
        }
        self.target_subagent = self
            .target_subagent
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty());
        self.tool_whitelist = canonical_names(&self.tool_whitelist);
        self.forced_skills = canonical_names(&self.forced_skills);
        self
    }
}

pub(crate) fn generate_session_id() -> String {
    format!("session-{}", uuid::Uuid::new_v4())
}

fn canonical_names(names: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(names.len());
    for name in names {
        let name = canonical_name(name);
        if !name.is_empty() && !out.contains(&name) {
            out.push(name);
        }
    }
    out
}

/// Outcome of the agent loop for one turn. Immutable once built.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct RunResult {
    pub output: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Usage,
    pub stop_reason: String,
}

/// Everything a caller learns about a completed turn.
#[derive(Debug, Serialize, Clone, Default)]
pub struct Response {
    pub request_id: String,
    pub session_id: String,
    pub mode: ModeContext,
    pub result: Option<RunResult>,
    pub command_results: Vec<CommandResult>,
    pub skill_results: Vec<SkillResult>,
    pub subagent: Option<SubagentResult>,
    pub model_tier: Option<ModelTier>,
    pub compactions: Vec<CompactResult>,
    pub hook_events: Vec<HookEvent>,
    pub sandbox: Option<SandboxSnapshot>,
    pub tags: HashMap<String, String>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StreamEventKind {
    AgentStart,
    IterationStart,
    MessageDelta,
    ToolExecutionStart,
    ToolExecutionOutput,
    ToolExecutionResult,
    AgentStop,
    Completed,
    Error,
}

/// One event on the caller-facing stream.
#[derive(Debug, Serialize, Clone)]
pub struct StreamEvent {
    pub kind: StreamEventKind,
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub output: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub is_error: bool,
    pub is_stderr: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iteration: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<Box<Response>>,
}

impl StreamEvent {
    pub fn new(kind: StreamEventKind) -> Self {
        Self {
            kind,
            output: serde_json::Value::Null,
            tool_use_id: None,
            name: None,
            is_error: false,
            is_stderr: false,
            iteration: None,
            response: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            output: serde_json::Value::String(message.into()),
            is_error: true,
            ..Self::new(StreamEventKind::Error)
        }
    }

    pub fn completed(response: Response) -> Self {
        Self {
            response: Some(Box::new(response)),
            ..Self::new(StreamEventKind::Completed)
        }
    }

    pub fn tool_output(tool_use_id: &str, name: &str, text: String, is_stderr: bool) -> Self {
        Self {
            output: serde_json::Value::String(text),
            tool_use_id: Some(tool_use_id.to_string()),
            name: Some(name.to_string()),
            is_stderr,
            ..Self::new(StreamEventKind::ToolExecutionOutput)
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, StreamEventKind::Completed | StreamEventKind::Error)
    }
}
