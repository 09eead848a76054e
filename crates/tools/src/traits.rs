use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Execution error: {0}")]
    Execution(String),
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("Tool not found: {0}")]
    NotFound(String),
    #[error("Tool already registered: {0}")]
    Duplicate(String),
    #[error("Tool registry is closed")]
    Closed,
}

/// Canonical form of a tool name: trimmed and lowercased.
///
/// Whitelists, registry lookups and hook payloads all compare tool names in
/// this form, so `Bash`, ` bash ` and `BASH` name the same tool.
pub fn canonical_name(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Model-facing description of a tool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    pub output: serde_json::Value,
    pub error: Option<String>,
}

impl ToolResult {
    pub fn ok(output: serde_json::Value) -> Self {
        Self {
            success: true,
            output,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: serde_json::Value::Null,
            error: Some(error.into()),
        }
    }

    /// Output rendered as text for history entries. String outputs are
    /// returned verbatim, anything else as compact JSON.
    pub fn output_text(&self) -> String {
        match &self.output {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// An incremental piece of tool output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub stream: OutputStream,
    pub text: String,
}

/// Receiver for incremental tool output while a call is still running.
#[async_trait]
pub trait OutputSink: Send + Sync {
    async fn emit(&self, chunk: OutputChunk);
}

/// Per-call context handed to a tool.
#[derive(Clone)]
pub struct ToolContext {
    pub session_id: String,
    pub sandbox_root: PathBuf,
    pub output: Option<Arc<dyn OutputSink>>,
}

impl ToolContext {
    pub fn new(session_id: impl Into<String>, sandbox_root: impl Into<PathBuf>) -> Self {
        Self {
            session_id: session_id.into(),
            sandbox_root: sandbox_root.into(),
            output: None,
        }
    }

    pub fn with_output(mut self, sink: Arc<dyn OutputSink>) -> Self {
        self.output = Some(sink);
        self
    }

    pub async fn emit_stdout(&self, text: impl Into<String>) {
        self.emit(OutputStream::Stdout, text.into()).await;
    }

    pub async fn emit_stderr(&self, text: impl Into<String>) {
        self.emit(OutputStream::Stderr, text.into()).await;
    }

    async fn emit(&self, stream: OutputStream, text: String) {
        if let Some(sink) = &self.output {
            sink.emit(OutputChunk { stream, text }).await;
        }
    }
}

impl fmt::Debug for ToolContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolContext")
            .field("session_id", &self.session_id)
            .field("sandbox_root", &self.sandbox_root)
            .field("streaming", &self.output.is_some())
            .finish()
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn schema(&self) -> serde_json::Value;

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: canonical_name(self.name()),
            description: self.description().to_string(),
            parameters: self.schema(),
        }
    }

    async fn execute(
        &self,
        args: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolResult, ToolError>;
}
