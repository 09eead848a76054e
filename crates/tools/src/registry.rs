use crate::traits::{canonical_name, Tool, ToolContext, ToolDefinition, ToolError, ToolResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Tools keyed by canonical name.
///
/// Registration happens before the registry is shared; after that it is
/// read-only apart from the closed flag, so concurrent turns can execute
/// through the same instance.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    closed: AtomicBool,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<(), ToolError> {
        let name = canonical_name(tool.name());
        if name.is_empty() {
            return Err(ToolError::Validation("tool name is empty".to_string()));
        }
        if self.tools.contains_key(&name) {
            return Err(ToolError::Duplicate(name));
        }
        tracing::debug!("Registered tool: {}", name);
        self.tools.insert(name, tool);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(&canonical_name(name)).cloned()
    }

    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Definitions sorted by name so the model sees a stable tool list.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> =
            self.tools.values().map(|tool| tool.definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub async fn execute(
        &self,
        name: &str,
        args: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolResult, ToolError> {
        if self.is_closed() {
            return Err(ToolError::Closed);
        }
        let tool = self
            .get(name)
            .ok_or_else(|| ToolError::NotFound(canonical_name(name)))?;

        tracing::debug!("Executing tool {} for session {}", name, ctx.session_id);
        tool.execute(args, ctx).await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop accepting executions. Safe to call more than once.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::info!("Tool registry closed ({} tools)", self.tools.len());
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
