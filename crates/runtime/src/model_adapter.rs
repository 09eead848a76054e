//! Model side of the agent loop: history, compaction, trimming and usage
//! accounting around a `Model`.

use crate::agent_loop::{ModelOutput, ModelStep};
use crate::compactor::{CompactResult, Compactor};
use crate::context::ExecutionContext;
use crate::history::{trim_to_limit, History};
use crate::hooks::{first_blocking, HookEvent, HookRecorder};
use crate::interfaces::{Model, ModelRequest, RuntimeError};
use crate::metrics::{MetricTimer, MODEL_LATENCY};
use crate::rules::RulesWatcher;
use crate::types::{Message, Role, Usage};
use crate::whitelist::WhitelistScopes;
use async_trait::async_trait;
use claw_sdk_tools::ToolDefinition;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};

/// Accounting gathered over the turn.
#[derive(Debug, Clone, Default)]
pub struct ModelSummary {
    pub usage: Usage,
    pub stop_reason: String,
    pub compactions: Vec<CompactResult>,
}

pub struct ModelAdapter {
    model: Arc<dyn Model>,
    history: Arc<History>,
    hooks: Arc<HookRecorder>,
    compactor: Option<Arc<Compactor>>,
    rules: Option<Arc<RulesWatcher>>,
    tools: Vec<ToolDefinition>,
    system_prompt: String,
    token_limit: usize,
    pending_prompt: Mutex<Option<String>>,
    summary: Mutex<ModelSummary>,
}

impl ModelAdapter {
    /// `prompt` is appended to history on the first `generate` call.
    pub fn new(
        model: Arc<dyn Model>,
        history: Arc<History>,
        hooks: Arc<HookRecorder>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            model,
            history,
            hooks,
            compactor: None,
            rules: None,
            tools: Vec::new(),
            system_prompt: String::new(),
            token_limit: 0,
            pending_prompt: Mutex::new(Some(prompt.into())),
            summary: Mutex::new(ModelSummary::default()),
        }
    }

    pub fn with_compactor(mut self, compactor: Arc<Compactor>) -> Self {
        self.compactor = Some(compactor);
        self
    }

    pub fn with_rules(mut self, rules: Arc<RulesWatcher>) -> Self {
        self.rules = Some(rules);
        self
    }

    /// Advertise the definitions every whitelist scope permits.
    pub fn with_tools(
        mut self,
        definitions: Vec<ToolDefinition>,
        scopes: &WhitelistScopes,
    ) -> Self {
        self.tools = definitions
            .into_iter()
            .filter(|d| scopes.allows(&d.name))
            .collect();
        self
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = system_prompt.into();
        self
    }

    /// Outgoing history is trimmed to this estimate; 0 disables trimming.
    pub fn with_token_limit(mut self, token_limit: usize) -> Self {
        self.token_limit = token_limit;
        self
    }

    pub fn tools(&self) -> &[ToolDefinition] {
        &self.tools
    }

    pub fn summary(&self) -> ModelSummary {
        self.summary.lock().clone()
    }

    fn system(&self) -> String {
        match &self.rules {
            Some(rules) => rules.augment(&self.system_prompt),
            None => self.system_prompt.clone(),
        }
    }

    async fn submit_prompt(
        &self,
        ctx: &ExecutionContext,
        prompt: String,
    ) -> Result<(), RuntimeError> {
        let results = self
            .hooks
            .execute(
                &ctx.cancel,
                HookEvent::UserPrompt {
                    session_id: ctx.session_id.clone(),
                    prompt: prompt.clone(),
                },
            )
            .await?;
        if let Some(blocking) = first_blocking(&results) {
            return Err(RuntimeError::HookError(format!(
                "UserPrompt hook rejected the prompt: {}",
                blocking.reason.as_deref().unwrap_or("no reason given")
            )));
        }
        self.history.append(Message::new(Role::User, prompt));
        Ok(())
    }
}

#[async_trait]
impl ModelStep for ModelAdapter {
    async fn generate(&self, ctx: &ExecutionContext) -> Result<ModelOutput, RuntimeError> {
        let pending = self.pending_prompt.lock().take();
        if let Some(prompt) = pending {
            self.submit_prompt(ctx, prompt).await?;
        }

        if let Some(compactor) = &self.compactor {
            let compacted = compactor
                .maybe_compact(ctx, &self.history, &self.hooks)
                .await?;
            if let Some(result) = compacted {
                self.summary.lock().compactions.push(result);
            }
        }

        let messages = trim_to_limit(self.history.snapshot(), self.token_limit);
        let request = ModelRequest {
            session_id: ctx.session_id.clone(),
            system: self.system(),
            messages,
            tools: self.tools.clone(),
            model: None,
        };

        debug!(
            "Calling model with {} messages and {} tools",
            request.messages.len(),
            request.tools.len()
        );
        let response = {
            let _timer = MetricTimer::new(MODEL_LATENCY);
            self.model.complete(&ctx.cancel, request).await?
        };

        {
            let mut summary = self.summary.lock();
            summary.usage.add(response.usage);
            summary.stop_reason = response.stop_reason.clone();
        }

        let mut message = response.message;
        message.role = Role::Assistant;
        let output = ModelOutput {
            content: message.content.clone(),
            tool_calls: message.tool_calls.clone(),
            done: message.tool_calls.is_empty(),
        };
        info!(
            "Model replied ({}, {} tool calls)",
            response.stop_reason,
            output.tool_calls.len()
        );
        self.history.append(message);
        Ok(output)
    }
}
