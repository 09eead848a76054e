//! Runtime - main entry point for agent turns.
//!
//! Owns every subsystem, serializes turns per session, runs the prepare
//! phase and the agent loop, and drains in-flight work on close.

use crate::agent_loop::{AgentLoop, Middleware, MiddlewareChain};
use crate::compactor::{CompactConfig, Compactor};
use crate::context::ExecutionContext;
use crate::history::HistoryStore;
use crate::hooks::{HookEvent, HookExecutor, HookRecorder, NoopHooks};
use crate::interfaces::{
    CommandExecutor, Model, RuntimeError, SandboxManager, SkillRegistry, SubagentManager,
    SubagentRequest, ToolExecutor, Tracer,
};
use crate::metrics::{MetricTimer, TURN_DURATION};
use crate::model_adapter::ModelAdapter;
use crate::model_selector::{ModelPool, ModelTier};
use crate::prepare::{dispatch_subagent, Preparer};
use crate::rules::RulesWatcher;
use crate::settings::Settings;
use crate::stream::{send_terminal, ProgressMiddleware, StreamRelay, OUTPUT_BUFFER};
use crate::tool_adapter::{task_tool_definition, TaskArgs, TaskRunner, ToolAdapter};
use crate::types::{Message, Request, Response, RunResult, StreamEvent};
use crate::whitelist::ToolWhitelist;
use async_trait::async_trait;
use chrono::Utc;
use claw_sdk_tools::{ToolDefinition, ToolRegistry, ToolResult};
use parking_lot::RwLock;
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle of a `Runtime`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Created,
    Accepting,
    Draining,
    Closed,
}

/// A started streaming turn.
///
/// The ids are resolved before the turn is spawned, so callers that let the
/// runtime generate a session id can still continue that session.
#[derive(Debug)]
pub struct StreamHandle {
    pub session_id: String,
    pub request_id: String,
    pub events: mpsc::Receiver<StreamEvent>,
}

/// Collaborators and overrides a `Runtime` is built from.
///
/// Only `model` is required. Unset overrides fall back to the project
/// settings file, then to built-in defaults.
pub struct RuntimeOptions {
    pub project_root: PathBuf,
    /// Use these settings instead of reading `.claw/settings.yaml`.
    pub settings: Option<Settings>,
    pub model: Option<Arc<dyn Model>>,
    pub tier_models: HashMap<ModelTier, Arc<dyn Model>>,
    /// Model for compaction summaries; the default model when unset.
    pub summary_model: Option<Arc<dyn Model>>,
    /// Defaults to an empty `ToolRegistry`.
    pub tools: Option<Arc<dyn ToolExecutor>>,
    pub hooks: Option<Arc<dyn HookExecutor>>,
    pub commands: Option<Arc<dyn CommandExecutor>>,
    pub skills: Option<Arc<dyn SkillRegistry>>,
    pub subagents: Option<Arc<dyn SubagentManager>>,
    pub sandbox: Option<Arc<dyn SandboxManager>>,
    pub tracer: Option<Arc<dyn Tracer>>,
    pub middleware: Vec<Arc<dyn Middleware>>,
    pub system_prompt: Option<String>,
    pub max_iterations: Option<usize>,
    pub token_limit: Option<usize>,
    pub compact: Option<CompactConfig>,
    /// Load and poll the rules file.
    pub watch_rules: bool,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            project_root: PathBuf::from("."),
            settings: None,
            model: None,
            tier_models: HashMap::new(),
            summary_model: None,
            tools: None,
            hooks: None,
            commands: None,
            skills: None,
            subagents: None,
            sandbox: None,
            tracer: None,
            middleware: Vec::new(),
            system_prompt: None,
            max_iterations: None,
            token_limit: None,
            compact: None,
            watch_rules: true,
        }
    }
}

impl RuntimeOptions {
    pub fn new(model: Arc<dyn Model>) -> Self {
        Self {
            model: Some(model),
            ..Self::default()
        }
    }

    pub fn with_project_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.project_root = root.into();
        self
    }

    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn with_tier(mut self, tier: ModelTier, model: Arc<dyn Model>) -> Self {
        self.tier_models.insert(tier, model);
        self
    }

    pub fn with_summary_model(mut self, model: Arc<dyn Model>) -> Self {
        self.summary_model = Some(model);
        self
    }

    pub fn with_tools(mut self, tools: Arc<dyn ToolExecutor>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn HookExecutor>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn with_commands(mut self, commands: Arc<dyn CommandExecutor>) -> Self {
        self.commands = Some(commands);
        self
    }

    pub fn with_skills(mut self, skills: Arc<dyn SkillRegistry>) -> Self {
        self.skills = Some(skills);
        self
    }

    pub fn with_subagents(mut self, subagents: Arc<dyn SubagentManager>) -> Self {
        self.subagents = Some(subagents);
        self
    }

    pub fn with_sandbox(mut self, sandbox: Arc<dyn SandboxManager>) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    pub fn with_tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = Some(tracer);
        self
    }

    pub fn with_middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middleware.push(middleware);
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = Some(max_iterations);
        self
    }

    pub fn with_token_limit(mut self, token_limit: usize) -> Self {
        self.token_limit = Some(token_limit);
        self
    }

    pub fn with_compact(mut self, compact: CompactConfig) -> Self {
        self.compact = Some(compact);
        self
    }

    pub fn without_rules(mut self) -> Self {
        self.watch_rules = false;
        self
    }
}

/// Main runtime. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<Inner>,
}

struct Inner {
    settings: Settings,
    project_root: PathBuf,
    models: ModelPool,
    tools: Arc<dyn ToolExecutor>,
    hooks: Arc<dyn HookExecutor>,
    preparer: Preparer,
    sandbox: Option<Arc<dyn SandboxManager>>,
    tracer: Option<Arc<dyn Tracer>>,
    compactor: Option<Arc<Compactor>>,
    rules: Option<Arc<RulesWatcher>>,
    gate: crate::session_gate::SessionGate,
    histories: HistoryStore,
    agent_loop: AgentLoop,
    middleware: MiddlewareChain,
    lifecycle: RwLock<Lifecycle>,
    in_flight: AtomicUsize,
    drained: Notify,
    close_latch: tokio::sync::Mutex<bool>,
}

/// Counts one in-flight call; dropping it may complete a drain.
struct InFlightGuard {
    inner: Arc<Inner>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.inner.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.drained.notify_waiters();
        }
    }
}

impl Runtime {
    /// Build a runtime and every subsystem it owns.
    ///
    /// Must be called from within a Tokio runtime: the rules watcher is
    /// spawned here.
    ///
    /// # Errors
    /// `ConfigError` when no model is given, the settings file is invalid, or
    /// no Tokio runtime is available.
    pub fn new(options: RuntimeOptions) -> Result<Self, RuntimeError> {
        let model = options
            .model
            .ok_or_else(|| RuntimeError::ConfigError("No model configured".to_string()))?;
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(RuntimeError::ConfigError(
                "Runtime::new must be called within a Tokio runtime".to_string(),
            ));
        }

        let mut settings = match options.settings {
            Some(settings) => settings,
            None => Settings::load(&options.project_root)?,
        };
        if let Some(prompt) = options.system_prompt {
            settings.system_prompt = prompt;
        }
        if let Some(max_iterations) = options.max_iterations {
            settings.max_iterations = max_iterations;
        }
        if let Some(token_limit) = options.token_limit {
            settings.token_limit = token_limit;
        }
        if let Some(compact) = options.compact {
            settings.compact = compact;
        }
        settings.validate()?;

        let mut models = ModelPool::new(Arc::clone(&model));
        for (tier, tier_model) in options.tier_models {
            models = models.with_tier(tier, tier_model);
        }
        for (subagent, tier) in &settings.subagent_tiers {
            models = models.with_subagent_tier(subagent, *tier);
        }

        let compactor = if settings.compact.enabled {
            let summarizer = options.summary_model.unwrap_or_else(|| Arc::clone(&model));
            Some(Arc::new(Compactor::new(
                settings.compact.clone(),
                settings.token_limit,
                summarizer,
            )))
        } else {
            None
        };

        let rules = if options.watch_rules {
            let path = settings.rules_path(&options.project_root);
            debug!("Watching rules file: {}", path.display());
            Some(Arc::new(RulesWatcher::spawn(path)))
        } else {
            None
        };

        let tools = options
            .tools
            .unwrap_or_else(|| Arc::new(ToolRegistry::new()) as Arc<dyn ToolExecutor>);
        let hooks = options
            .hooks
            .unwrap_or_else(|| Arc::new(NoopHooks) as Arc<dyn HookExecutor>);

        let mut middleware = MiddlewareChain::new();
        for m in options.middleware {
            middleware.push(m);
        }

        let inner = Inner {
            agent_loop: AgentLoop::new(settings.max_iterations),
            histories: HistoryStore::new(settings.max_sessions),
            project_root: options.project_root,
            models,
            tools,
            hooks,
            preparer: Preparer {
                commands: options.commands,
                skills: options.skills,
                subagents: options.subagents,
            },
            sandbox: options.sandbox,
            tracer: options.tracer,
            compactor,
            rules,
            gate: crate::session_gate::SessionGate::new(),
            middleware,
            lifecycle: RwLock::new(Lifecycle::Created),
            in_flight: AtomicUsize::new(0),
            drained: Notify::new(),
            close_latch: tokio::sync::Mutex::new(false),
            settings,
        };
        *inner.lifecycle.write() = Lifecycle::Accepting;
        info!(
            "Runtime ready (max_iterations={}, token_limit={})",
            inner.settings.max_iterations, inner.settings.token_limit
        );

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.inner.lifecycle.read()
    }

    /// Calls currently counted against `close`.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Whether a turn currently holds `session_id`.
    pub fn is_session_busy(&self, session_id: &str) -> bool {
        self.inner.gate.is_held(session_id)
    }

    /// Copy of a session's stored history.
    pub fn history(&self, session_id: &str) -> Vec<Message> {
        if !self.inner.histories.contains(session_id) {
            return Vec::new();
        }
        self.inner.histories.get(session_id).snapshot()
    }

    /// Run one turn to completion.
    ///
    /// # Errors
    /// `Closed` once `close` has begun, `InvalidRequest` for an empty prompt,
    /// `ConcurrentExecution` when the session already has a turn in flight,
    /// otherwise the first collaborator or hook error of the turn.
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        request: Request,
    ) -> Result<Response, RuntimeError> {
        let _guard = self.inner.enter()?;
        let request = request.normalize();
        if request.prompt.is_empty() {
            return Err(RuntimeError::InvalidRequest("Prompt is empty".to_string()));
        }

        info!(
            "Processing request: session={}, request={}",
            request.session_id, request.request_id
        );
        let _permit = self.inner.gate.acquire(cancel, &request.session_id)?;
        let ctx = ExecutionContext::new(cancel.clone(), &request.session_id, &request.request_id);

        self.inner.execute(&ctx, request).await.map_err(|e| {
            error!("Turn failed: {}", e);
            e
        })
    }

    /// Start one turn and stream its events.
    ///
    /// Validation happens before anything is spawned. The returned channel
    /// carries progress events and then exactly one terminal event
    /// (`Completed` or `Error`) unless the caller cancels first, and closes
    /// once the turn is over. Must be called within a Tokio runtime.
    pub fn run_stream(
        &self,
        cancel: &CancellationToken,
        request: Request,
    ) -> Result<StreamHandle, RuntimeError> {
        let request = request.normalize();
        if request.prompt.is_empty() {
            return Err(RuntimeError::InvalidRequest("Prompt is empty".to_string()));
        }
        let guard = self.inner.enter()?;

        let (tx, rx) = mpsc::channel(OUTPUT_BUFFER);
        let inner = Arc::clone(&self.inner);
        let cancel = cancel.clone();
        info!(
            "Streaming request: session={}, request={}",
            request.session_id, request.request_id
        );
        let session_id = request.session_id.clone();
        let request_id = request.request_id.clone();
        tokio::spawn(async move {
            let _guard = guard;
            inner.stream_turn(cancel, request, tx).await;
        });
        Ok(StreamHandle {
            session_id,
            request_id,
            events: rx,
        })
    }

    /// Run a nested turn on behalf of a `task` tool call.
    ///
    /// `ctx` must be a task-dispatch context (see `ExecutionContext::for_task`).
    /// The call is not counted against `close`, so it still runs while the
    /// dispatching turn drains, but is rejected once the runtime is closed.
    /// The gate is skipped only for the dispatching session itself, whose
    /// permit the parent turn already holds; any other session is acquired
    /// like a regular `run`. A request without a session id gets a fresh one
    /// so the nested turn never writes into the parent's history.
    ///
    /// # Errors
    /// `Closed` after `close` has finished, `ConcurrentExecution` when the
    /// target session belongs to another in-flight turn.
    pub async fn run_task_dispatch(
        &self,
        ctx: &ExecutionContext,
        request: Request,
    ) -> Result<Response, RuntimeError> {
        if !ctx.task_dispatch {
            return Err(RuntimeError::InvalidRequest(
                "run_task_dispatch requires a task dispatch context".to_string(),
            ));
        }
        if self.lifecycle() == Lifecycle::Closed {
            return Err(RuntimeError::Closed);
        }
        let request = request.normalize();
        if request.prompt.is_empty() {
            return Err(RuntimeError::InvalidRequest("Prompt is empty".to_string()));
        }
        let _permit = if request.session_id == ctx.session_id {
            None
        } else {
            Some(self.inner.gate.acquire(&ctx.cancel, &request.session_id)?)
        };
        let nested = ExecutionContext {
            session_id: request.session_id.clone(),
            request_id: request.request_id.clone(),
            stream: None,
            ..ctx.clone()
        };
        self.inner.execute(&nested, request).await
    }

    /// Stop accepting calls, wait for in-flight ones, then release the rules
    /// watcher, the tool executor and the tracer in that order.
    ///
    /// Idempotent; concurrent callers all return after the drain. The first
    /// release error is returned, later steps still run.
    pub async fn close(&self) -> Result<(), RuntimeError> {
        let mut closed = self.inner.close_latch.lock().await;
        if *closed {
            return Ok(());
        }

        *self.inner.lifecycle.write() = Lifecycle::Draining;
        info!("Runtime draining, {} calls in flight", self.in_flight());
        self.inner.wait_drained().await;

        let mut first_error = None;
        if let Some(rules) = &self.inner.rules {
            if let Err(e) = rules.close().await {
                warn!("Failed to stop rules watcher: {}", e);
                first_error.get_or_insert(e);
            }
        }
        if let Err(e) = self.inner.tools.close().await {
            warn!("Failed to close tool executor: {}", e);
            first_error.get_or_insert(e);
        }
        if let Some(tracer) = &self.inner.tracer {
            if let Err(e) = tracer.shutdown() {
                warn!("Failed to shut down tracer: {}", e);
                first_error.get_or_insert(e);
            }
        }

        *self.inner.lifecycle.write() = Lifecycle::Closed;
        *closed = true;
        info!("Runtime closed");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Inner {
    fn enter(self: &Arc<Self>) -> Result<InFlightGuard, RuntimeError> {
        // Incremented under the read lock so `close` cannot flip to Draining
        // between the check and the increment.
        let lifecycle = self.lifecycle.read();
        if *lifecycle != Lifecycle::Accepting {
            return Err(RuntimeError::Closed);
        }
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        Ok(InFlightGuard {
            inner: Arc::clone(self),
        })
    }

    async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    fn tool_definitions(&self, ctx: &ExecutionContext) -> Vec<ToolDefinition> {
        let mut definitions = self.tools.definitions();
        if self.offers_tasks(ctx) {
            definitions.push(task_tool_definition());
        }
        definitions
    }

    fn offers_tasks(&self, ctx: &ExecutionContext) -> bool {
        self.preparer.subagents.is_some() && !ctx.task_dispatch
    }

    async fn stream_turn(
        self: Arc<Self>,
        cancel: CancellationToken,
        request: Request,
        output: mpsc::Sender<StreamEvent>,
    ) {
        let permit = match self.gate.acquire(&cancel, &request.session_id) {
            Ok(permit) => permit,
            Err(e) => {
                send_terminal(&output, &cancel, StreamEvent::error(e.to_string())).await;
                return;
            }
        };

        let (relay, progress) = StreamRelay::start(output.clone(), cancel.clone());
        let ctx = ExecutionContext::new(cancel.clone(), &request.session_id, &request.request_id)
            .with_stream(progress);
        let result = self.execute(&ctx, request).await;
        // Last progress producer; the relay drains and exits once it is gone.
        drop(ctx);
        let stats = relay.finish().await;
        debug!(
            "Stream relay drained: forwarded={}, dropped={}",
            stats.forwarded, stats.dropped
        );

        let terminal = match result {
            Ok(response) => StreamEvent::completed(response),
            Err(e) => {
                error!("Streaming turn failed: {}", e);
                StreamEvent::error(e.to_string())
            }
        };
        send_terminal(&output, &cancel, terminal).await;
        drop(permit);
    }

    /// Prepare and run one turn. The caller holds the session gate (or is a
    /// task dispatch riding on its parent's).
    async fn execute(
        self: &Arc<Self>,
        ctx: &ExecutionContext,
        request: Request,
    ) -> Result<Response, RuntimeError> {
        let _timer = MetricTimer::new(TURN_DURATION);
        let hooks = Arc::new(HookRecorder::new(Arc::clone(&self.hooks)));
        let history = self.histories.get(&request.session_id);

        let prepared = self
            .preparer
            .prepare(ctx, request, history, Arc::clone(&hooks))
            .await?;

        let selection = self.models.select(
            prepared.request.model_tier,
            prepared.request.target_subagent.as_deref(),
        );
        if let Some(tier) = selection.tier {
            hooks.notify(HookEvent::ModelSelected {
                session_id: ctx.session_id.clone(),
                tier,
                reason: selection.reason.to_string(),
            });
        }

        let (outcome, summary) = {
            let mut model_adapter = ModelAdapter::new(
                selection.model,
                Arc::clone(&prepared.history),
                Arc::clone(&hooks),
                prepared.prompt.clone(),
            )
            .with_tools(self.tool_definitions(ctx), &prepared.scopes)
            .with_system_prompt(self.settings.system_prompt.clone())
            .with_token_limit(self.settings.token_limit);
            if let Some(compactor) = &self.compactor {
                model_adapter = model_adapter.with_compactor(Arc::clone(compactor));
            }
            if let Some(rules) = &self.rules {
                model_adapter = model_adapter.with_rules(Arc::clone(rules));
            }

            let mut tool_adapter = ToolAdapter::new(
                Arc::clone(&self.tools),
                Arc::clone(&prepared.history),
                Arc::clone(&hooks),
                prepared.scopes.clone(),
                self.project_root.clone(),
            );
            if let Some(sandbox) = &self.sandbox {
                tool_adapter = tool_adapter.with_sandbox(Arc::clone(sandbox));
            }
            if self.offers_tasks(ctx) {
                tool_adapter =
                    tool_adapter.with_task_runner(Arc::clone(self) as Arc<dyn TaskRunner>);
            }

            let mut chain = self.middleware.clone();
            if let Some(progress) = &ctx.stream {
                chain.push(Arc::new(ProgressMiddleware::new(progress.clone())));
            }

            let outcome = self
                .agent_loop
                .run(ctx, &model_adapter, &tool_adapter, &chain)
                .await?;
            (outcome, model_adapter.summary())
        };

        let mut tags = self.settings.tags.clone();
        tags.extend(prepared.request.tags.clone());

        let response = Response {
            request_id: prepared.request.request_id.clone(),
            session_id: prepared.request.session_id.clone(),
            mode: prepared.request.mode.clone(),
            result: Some(RunResult {
                output: outcome.output.content,
                tool_calls: outcome.tool_calls,
                usage: summary.usage,
                stop_reason: summary.stop_reason,
            }),
            command_results: prepared.command_results,
            skill_results: prepared.skill_results,
            subagent: prepared.subagent,
            model_tier: selection.tier,
            compactions: summary.compactions,
            hook_events: hooks.events(),
            sandbox: self.sandbox.as_ref().map(|s| s.snapshot()),
            tags,
            completed_at: Some(Utc::now()),
        };

        if let Some(tracer) = &self.tracer {
            tracer.record_turn(&response);
        }
        info!(
            "Turn completed for session {} after {} iterations",
            response.session_id, outcome.iterations
        );
        Ok(response)
    }
}

#[async_trait]
impl TaskRunner for Inner {
    async fn run_task(
        &self,
        ctx: &ExecutionContext,
        args: TaskArgs,
        whitelist: &ToolWhitelist,
        hooks: &HookRecorder,
    ) -> Result<ToolResult, RuntimeError> {
        let manager = self.preparer.subagents.as_ref().ok_or_else(|| {
            RuntimeError::SubagentError("No subagent manager configured".to_string())
        })?;

        let mut metadata = HashMap::new();
        if let Some(description) = args.description {
            metadata.insert("description".to_string(), json!(description));
        }
        let task_ctx = ctx.for_task();
        let result = dispatch_subagent(
            &task_ctx,
            manager.as_ref(),
            hooks,
            SubagentRequest {
                target: args.subagent_type,
                instruction: args.prompt,
                session_id: ctx.session_id.clone(),
                tool_whitelist: whitelist.names(),
                metadata,
            },
        )
        .await?;
        Ok(ToolResult::ok(json!(result.output)))
    }
}
