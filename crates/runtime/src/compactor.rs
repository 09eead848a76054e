//! History compactor for managing context window size.

use crate::context::ExecutionContext;
use crate::history::{estimate_tokens, History};
use crate::hooks::{first_blocking, HookEvent, HookRecorder};
use crate::interfaces::{Model, ModelRequest, RuntimeError};
use crate::types::{Message, Role};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// System prompt of the summarization call.
pub const SUMMARY_SYSTEM_PROMPT: &str = "You compress conversation history for an agent that \
must keep working without the original messages. Write a dense, lossless summary: keep every \
user requirement, decision, file path, command, tool result and open question. Drop pleasantries \
and repetition. Output only the summary.";

const SUMMARY_REQUEST: &str = "Summarize the conversation above.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactConfig {
    pub enabled: bool,
    /// Fraction of the context limit that triggers compaction.
    pub threshold: f64,
    /// Trailing messages kept verbatim.
    pub preserve_count: usize,
    /// Model identifier for the summary call; empty uses the model's default.
    pub summary_model: String,
}

impl Default for CompactConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 0.8,
            preserve_count: 5,
            summary_model: String::new(),
        }
    }
}

impl CompactConfig {
    pub fn validate(&self) -> Result<(), RuntimeError> {
        if !(self.threshold > 0.0 && self.threshold <= 1.0) {
            return Err(RuntimeError::ConfigError(format!(
                "compact.threshold must be in (0, 1], got {}",
                self.threshold
            )));
        }
        Ok(())
    }
}

/// What one compaction did.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompactResult {
    pub summary: String,
    pub original_messages: usize,
    pub preserved_messages: usize,
    pub tokens_before: usize,
    pub tokens_after: usize,
}

/// Threshold-triggered, hook-gated history summarizer.
pub struct Compactor {
    config: CompactConfig,
    token_limit: usize,
    summarizer: Arc<dyn Model>,
    // Serializes maybe_compact; the session gate already keeps one turn per
    // session, this keeps the compactor safe to share regardless.
    lock: Mutex<()>,
}

impl Compactor {
    /// Create a new compactor.
    ///
    /// # Arguments
    /// * `config` - Trigger and preservation settings
    /// * `token_limit` - Context limit the threshold is a fraction of
    /// * `summarizer` - Model used for the summary call
    pub fn new(config: CompactConfig, token_limit: usize, summarizer: Arc<dyn Model>) -> Self {
        Self {
            config,
            token_limit,
            summarizer,
            lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &CompactConfig {
        &self.config
    }

    pub fn token_limit(&self) -> usize {
        self.token_limit
    }

    /// True iff there is something to evict and the estimate reaches the
    /// threshold fraction of the context limit.
    pub fn should_compact(&self, messages: &[Message]) -> bool {
        if !self.config.enabled || self.token_limit == 0 {
            return false;
        }
        if messages.len() <= self.config.preserve_count {
            return false;
        }
        let ratio = estimate_tokens(messages) as f64 / self.token_limit as f64;
        ratio >= self.config.threshold
    }

    /// Compact `history` in place if it crossed the threshold.
    ///
    /// Returns `Ok(None)` when nothing happened, including when a
    /// `PreCompact` hook denied or asked.
    pub async fn maybe_compact(
        &self,
        ctx: &ExecutionContext,
        history: &History,
        hooks: &HookRecorder,
    ) -> Result<Option<CompactResult>, RuntimeError> {
        let _guard = self.lock.lock().await;

        let snapshot = history.snapshot();
        if !self.should_compact(&snapshot) {
            return Ok(None);
        }
        let tokens_before = estimate_tokens(&snapshot);
        info!(
            "History for session {} at ~{} of {} tokens, compacting",
            ctx.session_id, tokens_before, self.token_limit
        );

        let results = hooks
            .execute(
                &ctx.cancel,
                HookEvent::PreCompact {
                    session_id: ctx.session_id.clone(),
                    estimated_tokens: tokens_before,
                    token_limit: self.token_limit,
                    threshold: self.config.threshold,
                    preserve_count: self.config.preserve_count,
                },
            )
            .await?;
        if let Some(blocking) = first_blocking(&results) {
            info!(
                "Compaction skipped by PreCompact hook: {}",
                blocking.reason.as_deref().unwrap_or("no reason given")
            );
            return Ok(None);
        }

        let preserved = self.config.preserve_count.min(snapshot.len());
        let evicted = snapshot.len() - preserved;
        let summary = self.summarize(ctx, &snapshot[..evicted]).await?;

        history.replace_prefix(
            evicted,
            Message::with_metadata(
                Role::System,
                summary.clone(),
                json!({
                    "compacted": true,
                    "original_count": evicted
                }),
            ),
        );
        let tokens_after = estimate_tokens(&history.snapshot());
        crate::metrics::increment_compaction_count();

        info!(
            "Compacted {} messages to {} (~{} -> ~{} tokens)",
            snapshot.len(),
            preserved + 1,
            tokens_before,
            tokens_after
        );
        hooks.notify(HookEvent::ContextCompacted {
            session_id: ctx.session_id.clone(),
            original_messages: snapshot.len(),
            preserved_messages: preserved,
            tokens_before,
            tokens_after,
        });

        Ok(Some(CompactResult {
            summary,
            original_messages: snapshot.len(),
            preserved_messages: preserved,
            tokens_before,
            tokens_after,
        }))
    }

    async fn summarize(
        &self,
        ctx: &ExecutionContext,
        messages: &[Message],
    ) -> Result<String, RuntimeError> {
        let mut request_messages = messages.to_vec();
        request_messages.push(Message::new(Role::User, SUMMARY_REQUEST));

        let model = if self.config.summary_model.is_empty() {
            None
        } else {
            Some(self.config.summary_model.clone())
        };
        debug!("Summarizing {} messages", messages.len());
        let response = self
            .summarizer
            .complete(
                &ctx.cancel,
                ModelRequest {
                    session_id: ctx.session_id.clone(),
                    system: SUMMARY_SYSTEM_PROMPT.to_string(),
                    messages: request_messages,
                    tools: Vec::new(),
                    model,
                },
            )
            .await?;

        let summary = response.message.content.trim().to_string();
        if summary.is_empty() {
            return Err(RuntimeError::LLMError(
                "Summarizer returned an empty summary".to_string(),
            ));
        }
        Ok(summary)
    }
}
