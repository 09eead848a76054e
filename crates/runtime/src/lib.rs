//! Claw SDK Runtime
//!
//! Turns a single prompt into an orchestrated agent turn: slash commands,
//! skills, model generation, whitelisted tool execution, subagent dispatch,
//! context compaction and lifecycle hooks, delivered as one response or as a
//! live event stream.

pub mod agent_loop;
pub mod compactor;
pub mod context;
pub mod history;
pub mod hooks;
pub mod interfaces;
pub mod metrics;
pub mod model_adapter;
pub mod model_selector;
pub mod prepare;
pub mod rules;
pub mod runtime;
pub mod session_gate;
pub mod settings;
pub mod stream;
pub mod telemetry;
pub mod tool_adapter;
pub mod types;
pub mod whitelist;

pub use agent_loop::{
    AgentLoop, LoopOutcome, Middleware, MiddlewareChain, ModelOutput, ModelStep, ToolStep,
};
pub use compactor::{CompactConfig, CompactResult, Compactor};
pub use context::ExecutionContext;
pub use history::{History, HistoryStore};
pub use hooks::{Decision, HookEvent, HookExecutor, HookRecorder, HookResult, NoopHooks};
pub use interfaces::{
    ActivationContext, CommandExecutor, CommandInvocation, CommandResult, Model, ModelRequest,
    ModelResponse, RuntimeError, SandboxManager, SandboxSnapshot, SkillMatch, SkillRegistry,
    SkillResult, SubagentManager, SubagentRequest, SubagentResult, ToolExecutor, ToolInvocation,
    Tracer,
};
pub use model_adapter::{ModelAdapter, ModelSummary};
pub use model_selector::{ModelPool, ModelTier, Selection, SelectionReason};
pub use prepare::{PreparedRun, Preparer};
pub use rules::RulesWatcher;
pub use runtime::{Lifecycle, Runtime, RuntimeOptions, StreamHandle};
pub use session_gate::{SessionGate, SessionPermit};
pub use settings::Settings;
pub use stream::{ProgressSender, RelayStats, StreamRelay, OUTPUT_BUFFER, PROGRESS_BUFFER};
pub use tool_adapter::{TaskArgs, TaskRunner, ToolAdapter, TASK_TOOL};
pub use types::{
    EntryPoint, Message, ModeContext, Request, Response, Role, RunResult, StreamEvent,
    StreamEventKind, ToolCall, Usage,
};
pub use whitelist::{ToolWhitelist, WhitelistScopes};
