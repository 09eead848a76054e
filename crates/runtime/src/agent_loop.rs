//! Agent loop - the generic model/tool iteration kernel.
//!
//! The loop knows nothing about history, hooks or whitelists. It alternates
//! between a `ModelStep` and a `ToolStep` and reports progress through a
//! middleware chain; the runtime supplies adapters that carry the semantics.

use crate::context::ExecutionContext;
use crate::interfaces::RuntimeError;
use crate::types::ToolCall;
use async_trait::async_trait;
use claw_sdk_tools::ToolResult;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What the model side hands back to the loop.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelOutput {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    /// True when the reply carries no tool calls and the turn is finished.
    pub done: bool,
}

#[async_trait]
pub trait ModelStep: Send + Sync {
    async fn generate(&self, ctx: &ExecutionContext) -> Result<ModelOutput, RuntimeError>;
}

#[async_trait]
pub trait ToolStep: Send + Sync {
    async fn execute(
        &self,
        ctx: &ExecutionContext,
        call: &ToolCall,
    ) -> Result<ToolResult, RuntimeError>;
}

/// Observer around each loop stage. An error from any stage aborts the turn.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn before_agent(&self, _ctx: &ExecutionContext) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn before_model(
        &self,
        _ctx: &ExecutionContext,
        _iteration: usize,
    ) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn after_model(
        &self,
        _ctx: &ExecutionContext,
        _output: &ModelOutput,
    ) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn before_tool(
        &self,
        _ctx: &ExecutionContext,
        _call: &ToolCall,
    ) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn after_tool(
        &self,
        _ctx: &ExecutionContext,
        _call: &ToolCall,
        _result: &Result<ToolResult, RuntimeError>,
    ) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn after_agent(&self, _ctx: &ExecutionContext) -> Result<(), RuntimeError> {
        Ok(())
    }
}

/// Ordered middleware list, invoked front to back at every stage.
#[derive(Clone, Default)]
pub struct MiddlewareChain {
    items: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, middleware: Arc<dyn Middleware>) {
        self.items.push(middleware);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    async fn before_agent(&self, ctx: &ExecutionContext) -> Result<(), RuntimeError> {
        for m in &self.items {
            m.before_agent(ctx).await?;
        }
        Ok(())
    }

    async fn before_model(
        &self,
        ctx: &ExecutionContext,
        iteration: usize,
    ) -> Result<(), RuntimeError> {
        for m in &self.items {
            m.before_model(ctx, iteration).await?;
        }
        Ok(())
    }

    async fn after_model(
        &self,
        ctx: &ExecutionContext,
        output: &ModelOutput,
    ) -> Result<(), RuntimeError> {
        for m in &self.items {
            m.after_model(ctx, output).await?;
        }
        Ok(())
    }

    async fn before_tool(&self, ctx: &ExecutionContext, call: &ToolCall) -> Result<(), RuntimeError> {
        for m in &self.items {
            m.before_tool(ctx, call).await?;
        }
        Ok(())
    }

    async fn after_tool(
        &self,
        ctx: &ExecutionContext,
        call: &ToolCall,
        result: &Result<ToolResult, RuntimeError>,
    ) -> Result<(), RuntimeError> {
        for m in &self.items {
            m.after_tool(ctx, call, result).await?;
        }
        Ok(())
    }

    async fn after_agent(&self, ctx: &ExecutionContext) -> Result<(), RuntimeError> {
        for m in &self.items {
            m.after_agent(ctx).await?;
        }
        Ok(())
    }
}

/// Result of a completed loop.
#[derive(Debug, Clone, Default)]
pub struct LoopOutcome {
    pub output: ModelOutput,
    pub iterations: usize,
    /// Every tool call executed during the turn, in order.
    pub tool_calls: Vec<ToolCall>,
}

/// Core agent execution loop.
#[derive(Debug, Clone)]
pub struct AgentLoop {
    max_iterations: usize,
}

impl AgentLoop {
    pub fn new(max_iterations: usize) -> Self {
        Self {
            max_iterations: max_iterations.max(1),
        }
    }

    pub fn max_iterations(&self) -> usize {
        self.max_iterations
    }

    /// Run model/tool iterations until the model reports done.
    ///
    /// A tool error aborts the turn; tool-reported failures (`success ==
    /// false`) are ordinary results the model gets to see.
    pub async fn run(
        &self,
        ctx: &ExecutionContext,
        model: &dyn ModelStep,
        tools: &dyn ToolStep,
        chain: &MiddlewareChain,
    ) -> Result<LoopOutcome, RuntimeError> {
        chain.before_agent(ctx).await?;
        let mut executed = Vec::new();

        for iteration in 0..self.max_iterations {
            if ctx.is_cancelled() {
                return Err(RuntimeError::Cancelled);
            }
            debug!(
                "Agent loop iteration {}/{} for session {}",
                iteration + 1,
                self.max_iterations,
                ctx.session_id
            );

            chain.before_model(ctx, iteration).await?;
            let output = model.generate(ctx).await?;
            chain.after_model(ctx, &output).await?;

            if output.done || output.tool_calls.is_empty() {
                info!(
                    "Model returned final response after {} iterations",
                    iteration + 1
                );
                chain.after_agent(ctx).await?;
                return Ok(LoopOutcome {
                    output,
                    iterations: iteration + 1,
                    tool_calls: executed,
                });
            }

            for call in &output.tool_calls {
                if ctx.is_cancelled() {
                    return Err(RuntimeError::Cancelled);
                }
                chain.before_tool(ctx, call).await?;
                let result = tools.execute(ctx, call).await;
                chain.after_tool(ctx, call, &result).await?;

                let result = result.map_err(|e| {
                    warn!("Tool {} failed: {}", call.name, e);
                    e
                })?;
                if !result.success {
                    debug!("Tool {} reported failure: {:?}", call.name, result.error);
                }
                executed.push(call.clone());
            }
        }

        Err(RuntimeError::MaxIterations(self.max_iterations))
    }
}
