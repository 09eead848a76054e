#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! End-to-end turns through `Runtime::run`.

mod common;

use claw_sdk_runtime::*;
use common::*;
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn token() -> CancellationToken {
    CancellationToken::new()
}

#[tokio::test]
async fn test_same_session_turns_are_mutually_exclusive() {
    let model = BlockingModel::new();
    let runtime = Runtime::new(options(model.clone())).unwrap();

    let first = {
        let runtime = runtime.clone();
        tokio::spawn(async move { runtime.run(&token(), Request::new("one").with_session("s1")).await })
    };
    model.started.notified().await;
    assert!(runtime.is_session_busy("s1"));

    let second = runtime
        .run(&token(), Request::new("two").with_session("s1"))
        .await;
    assert!(matches!(second, Err(RuntimeError::ConcurrentExecution(ref s)) if s == "s1"));
    assert_eq!(model.calls.load(Ordering::SeqCst), 1);

    model.release(1);
    let response = first.await.unwrap().unwrap();
    assert_eq!(response.result.unwrap().output, "released");
    assert!(!runtime.is_session_busy("s1"));

    // The rejected prompt never reached history.
    let history = runtime.history("s1");
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].content, "one");

    model.release(1);
    runtime
        .run(&token(), Request::new("three").with_session("s1"))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_distinct_sessions_run_concurrently() {
    let model = BlockingModel::new();
    let runtime = Runtime::new(options(model.clone())).unwrap();

    let mut handles = Vec::new();
    for session in ["a", "b"] {
        let runtime = runtime.clone();
        handles.push(tokio::spawn(async move {
            runtime.run(&token(), Request::new("hi").with_session(session)).await
        }));
        model.started.notified().await;
    }
    assert!(runtime.is_session_busy("a"));
    assert!(runtime.is_session_busy("b"));
    assert_eq!(runtime.in_flight(), 2);

    model.release(2);
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    assert_eq!(runtime.in_flight(), 0);
}

#[tokio::test]
async fn test_run_after_close_is_rejected() {
    let model = FnModel::fixed("done");
    let runtime = Runtime::new(options(model.clone())).unwrap();
    runtime.close().await.unwrap();

    let result = runtime
        .run(&token(), Request::new("hi").with_session("s1"))
        .await;
    assert!(matches!(result, Err(RuntimeError::Closed)));
    assert_eq!(model.calls(), 0);
    assert!(runtime.history("s1").is_empty());
    assert_eq!(runtime.lifecycle(), Lifecycle::Closed);
}

#[tokio::test]
async fn test_close_releases_tool_executor() {
    let tools = tools();
    let runtime = Runtime::new(
        options(FnModel::fixed("done")).with_tools(tools.registry.clone()),
    )
    .unwrap();
    runtime.close().await.unwrap();
    assert!(tools.registry.is_closed());
}

#[tokio::test]
async fn test_tool_result_reaches_model() {
    let tools = tools();
    let model = FnModel::calls_tool("echo", json!({"text": "hello"}));
    let runtime = Runtime::new(options(model.clone()).with_tools(tools.registry.clone())).unwrap();

    let response = runtime
        .run(&token(), Request::new("say hello").with_session("s1"))
        .await
        .unwrap();

    let result = response.result.unwrap();
    assert_eq!(result.output, r#"result: {"text":"hello"}"#);
    assert_eq!(result.tool_calls.len(), 1);
    assert_eq!(result.usage.input_tokens, 20);
    assert_eq!(tools.echo.calls.load(Ordering::SeqCst), 1);

    let roles: Vec<Role> = runtime.history("s1").iter().map(|m| m.role).collect();
    assert_eq!(
        roles,
        vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]
    );
}

#[tokio::test]
async fn test_request_whitelist_limits_advertised_and_executed_tools() {
    let tools = tools();
    let model = FnModel::calls_tool("stream", json!({}));
    let runtime = Runtime::new(options(model.clone()).with_tools(tools.registry.clone())).unwrap();

    let mut request = Request::new("go").with_session("s1");
    request.tool_whitelist = vec!["Echo".to_string()];
    let result = runtime.run(&token(), request).await;

    assert!(matches!(result, Err(RuntimeError::ToolError(ref msg)) if msg.contains("request")));
    assert_eq!(model.tool_names(0), vec!["echo"]);
    let history = runtime.history("s1");
    let last = history.last().unwrap();
    assert_eq!(last.role, Role::Tool);
    assert!(last.content.contains("error"));
}

#[tokio::test]
async fn test_subagent_grant_intersects_request_whitelist() {
    let tools = tools();
    let subagents = Arc::new(StaticSubagents {
        grants: vec![("explore", vec!["echo", "fail"])],
        ..StaticSubagents::default()
    });
    let model = FnModel::calls_tool("stream", json!({}));
    let runtime = Runtime::new(
        options(model.clone())
            .with_tools(tools.registry.clone())
            .with_subagents(subagents.clone()),
    )
    .unwrap();

    let mut request = Request::new("explore the repo").with_session("s1");
    request.tool_whitelist = vec!["echo".to_string(), "stream".to_string()];
    request.target_subagent = Some("explore".to_string());
    let result = runtime.run(&token(), request).await;

    // `stream` passes the request scope but not the subagent scope.
    assert!(matches!(result, Err(RuntimeError::ToolError(ref msg)) if msg.contains("subagent")));
    assert_eq!(model.tool_names(0), vec!["echo"]);

    let dispatched = subagents.dispatched.lock();
    assert_eq!(dispatched.len(), 1);
    assert_eq!(dispatched[0].0.tool_whitelist, vec!["echo", "stream"]);
    assert!(!dispatched[0].1);
}

#[tokio::test]
async fn test_pre_tool_use_deny_blocks_execution() {
    let tools = tools();
    let hooks = Arc::new(RecordingHooks {
        pre_tool: vec![HookResult::deny("no echo today")],
        ..RecordingHooks::default()
    });
    let runtime = Runtime::new(
        options(FnModel::calls_tool("echo", json!({"text": "hi"})))
            .with_tools(tools.registry.clone())
            .with_hooks(hooks.clone()),
    )
    .unwrap();

    let result = runtime
        .run(&token(), Request::new("go").with_session("s1"))
        .await;

    assert!(matches!(result, Err(RuntimeError::HookError(ref msg)) if msg.contains("no echo today")));
    assert_eq!(tools.echo.calls.load(Ordering::SeqCst), 0);
    assert_eq!(hooks.names(), vec!["UserPrompt", "PreToolUse"]);
}

#[tokio::test]
async fn test_pre_tool_use_ask_blocks_execution() {
    let tools = tools();
    let hooks = Arc::new(RecordingHooks {
        pre_tool: vec![HookResult::allow(), HookResult::ask("confirm first")],
        ..RecordingHooks::default()
    });
    let runtime = Runtime::new(
        options(FnModel::calls_tool("echo", json!({})))
            .with_tools(tools.registry.clone())
            .with_hooks(hooks),
    )
    .unwrap();

    let result = runtime.run(&token(), Request::new("go")).await;
    assert!(matches!(result, Err(RuntimeError::HookError(_))));
    assert_eq!(tools.echo.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_pre_tool_use_rewrites_arguments() {
    let tools = tools();
    let hooks = Arc::new(RecordingHooks {
        pre_tool: vec![
            HookResult {
                updated_input: Some(json!({"text": "first"})),
                ..HookResult::default()
            },
            HookResult {
                updated_input: Some(json!({"text": "rewritten"})),
                ..HookResult::default()
            },
        ],
        ..RecordingHooks::default()
    });
    let runtime = Runtime::new(
        options(FnModel::calls_tool("echo", json!({"text": "original"})))
            .with_tools(tools.registry.clone())
            .with_hooks(hooks),
    )
    .unwrap();

    let response = runtime
        .run(&token(), Request::new("go").with_session("s1"))
        .await
        .unwrap();

    assert_eq!(
        *tools.echo.last_args.lock(),
        Some(json!({"text": "rewritten"}))
    );
    assert!(response.result.unwrap().output.contains("rewritten"));
}

#[tokio::test]
async fn test_post_tool_use_failure_fails_successful_call() {
    let tools = tools();
    let hooks = Arc::new(RecordingHooks {
        fail_post_tool: true,
        ..RecordingHooks::default()
    });
    let runtime = Runtime::new(
        options(FnModel::calls_tool("echo", json!({})))
            .with_tools(tools.registry.clone())
            .with_hooks(hooks),
    )
    .unwrap();

    let result = runtime.run(&token(), Request::new("go")).await;
    assert!(matches!(result, Err(RuntimeError::HookError(_))));
    assert_eq!(tools.echo.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_tool_error_takes_precedence_over_post_hook_error() {
    let tools = tools();
    let hooks = Arc::new(RecordingHooks {
        fail_post_tool: true,
        ..RecordingHooks::default()
    });
    let runtime = Runtime::new(
        options(FnModel::calls_tool("fail", json!({})))
            .with_tools(tools.registry.clone())
            .with_hooks(hooks.clone()),
    )
    .unwrap();

    let result = runtime.run(&token(), Request::new("go")).await;
    assert!(matches!(result, Err(RuntimeError::ToolError(ref msg)) if msg.contains("disk full")));
    assert!(hooks.names().contains(&"PostToolUse"));
}

#[tokio::test]
async fn test_compaction_summarizes_old_messages() {
    let settings = Settings {
        token_limit: 100,
        compact: CompactConfig {
            enabled: true,
            threshold: 0.8,
            preserve_count: 2,
            ..CompactConfig::default()
        },
        ..Settings::default()
    };
    let summarizer = FnModel::fixed("summary of earlier work");
    let model = FnModel::fixed("ok");
    let hooks = Arc::new(RecordingHooks::default());
    let runtime = Runtime::new(
        RuntimeOptions::new(model.clone())
            .with_settings(settings)
            .with_summary_model(summarizer.clone())
            .with_hooks(hooks.clone())
            .without_rules(),
    )
    .unwrap();

    let long = "x".repeat(200);
    let first = runtime
        .run(&token(), Request::new(long.clone()).with_session("s1"))
        .await
        .unwrap();
    assert!(first.compactions.is_empty());

    let second = runtime
        .run(&token(), Request::new(long).with_session("s1"))
        .await
        .unwrap();
    assert_eq!(second.compactions.len(), 1);
    assert_eq!(second.compactions[0].original_messages, 3);
    assert_eq!(second.compactions[0].preserved_messages, 2);
    assert_eq!(summarizer.calls(), 1);

    let history = runtime.history("s1");
    assert_eq!(history[0].role, Role::System);
    assert_eq!(history[0].content, "summary of earlier work");
    assert_eq!(history[0].metadata.as_ref().unwrap()["compacted"], json!(true));
    assert_eq!(history.len(), 4);
    assert!(hooks.names().contains(&"ContextCompacted"));
}

#[tokio::test]
async fn test_pre_compact_veto_keeps_history() {
    let settings = Settings {
        token_limit: 100,
        compact: CompactConfig {
            enabled: true,
            threshold: 0.8,
            preserve_count: 2,
            ..CompactConfig::default()
        },
        ..Settings::default()
    };
    let summarizer = FnModel::fixed("summary");
    let hooks = Arc::new(RecordingHooks {
        pre_compact: vec![HookResult::deny("keep everything")],
        ..RecordingHooks::default()
    });
    let runtime = Runtime::new(
        RuntimeOptions::new(FnModel::fixed("ok"))
            .with_settings(settings)
            .with_summary_model(summarizer.clone())
            .with_hooks(hooks.clone())
            .without_rules(),
    )
    .unwrap();

    let long = "x".repeat(200);
    for _ in 0..2 {
        let response = runtime
            .run(&token(), Request::new(long.clone()).with_session("s1"))
            .await
            .unwrap();
        assert!(response.compactions.is_empty());
    }
    assert_eq!(summarizer.calls(), 0);
    assert_eq!(runtime.history("s1").len(), 4);
    assert!(hooks.names().contains(&"PreCompact"));
    assert!(!hooks.names().contains(&"ContextCompacted"));
}

#[tokio::test]
async fn test_model_tier_selection() {
    let mut settings = quiet_settings();
    settings
        .subagent_tiers
        .insert("explore".to_string(), ModelTier::Low);
    let default = FnModel::fixed("default");
    let high = FnModel::fixed("high");
    let low = FnModel::fixed("low");
    let runtime = Runtime::new(
        RuntimeOptions::new(default)
            .with_settings(settings)
            .with_tier(ModelTier::High, high)
            .with_tier(ModelTier::Low, low)
            .with_subagents(Arc::new(StaticSubagents::default()))
            .without_rules(),
    )
    .unwrap();

    // Explicit tier beats the subagent mapping.
    let mut request = Request::new("go");
    request.model_tier = Some(ModelTier::High);
    request.target_subagent = Some("explore".to_string());
    let response = runtime.run(&token(), request).await.unwrap();
    assert_eq!(response.model_tier, Some(ModelTier::High));
    assert_eq!(response.result.unwrap().output, "high");
    assert!(response
        .hook_events
        .iter()
        .any(|e| matches!(e, HookEvent::ModelSelected { tier: ModelTier::High, .. })));

    let mut request = Request::new("go");
    request.target_subagent = Some("Explore".to_string());
    let response = runtime.run(&token(), request).await.unwrap();
    assert_eq!(response.model_tier, Some(ModelTier::Low));
    assert_eq!(response.result.unwrap().output, "low");

    let mut request = Request::new("go");
    request.target_subagent = Some("reviewer".to_string());
    let response = runtime.run(&token(), request).await.unwrap();
    assert_eq!(response.model_tier, None);
    assert_eq!(response.result.unwrap().output, "default");
    assert!(!response
        .hook_events
        .iter()
        .any(|e| matches!(e, HookEvent::ModelSelected { .. })));
}

/// Subagent manager that answers `task` calls by re-entering the runtime.
#[derive(Default)]
struct ReentrantSubagents {
    runtime: OnceLock<Runtime>,
}

#[async_trait::async_trait]
impl SubagentManager for ReentrantSubagents {
    async fn dispatch(
        &self,
        ctx: &ExecutionContext,
        request: SubagentRequest,
    ) -> Result<SubagentResult, RuntimeError> {
        let runtime = self
            .runtime
            .get()
            .ok_or_else(|| RuntimeError::SubagentError("runtime not set".to_string()))?;
        let response = runtime
            .run_task_dispatch(ctx, Request::new(request.instruction))
            .await?;
        Ok(SubagentResult {
            subagent: request.target,
            output: response.result.map(|r| r.output).unwrap_or_default(),
            allowed_tools: Vec::new(),
        })
    }
}

#[tokio::test]
async fn test_task_tool_reenters_pipeline() {
    let model = FnModel::new(|request| {
        let offers_task = request.tools.iter().any(|t| t.name == TASK_TOOL);
        match request.messages.last() {
            Some(last) if last.role == Role::Tool => reply(&format!("final: {}", last.content)),
            _ if offers_task => tool_call(
                "call_task",
                TASK_TOOL,
                json!({"subagent_type": "explore", "prompt": "look around", "description": "scan"}),
            ),
            _ => reply("nested answer"),
        }
    });
    let subagents = Arc::new(ReentrantSubagents::default());
    let runtime = Runtime::new(options(model.clone()).with_subagents(subagents.clone())).unwrap();
    subagents.runtime.set(runtime.clone()).ok().unwrap();

    let response = tokio::time::timeout(
        Duration::from_secs(5),
        runtime.run(&token(), Request::new("investigate").with_session("parent")),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(response.result.unwrap().output, "final: nested answer");
    assert!(response.hook_events.iter().any(|e| matches!(
        e,
        HookEvent::SubagentStart { task_dispatch: true, subagent, .. } if subagent == "explore"
    )));

    // The nested turn neither advertised the task tool nor wrote to the parent session.
    assert_eq!(model.calls(), 3);
    assert!(!model.tool_names(1).contains(&TASK_TOOL.to_string()));
    let parent = runtime.history("parent");
    assert!(parent.iter().all(|m| m.content != "look around"));
    assert!(!runtime.is_session_busy("parent"));
}

#[tokio::test]
async fn test_task_tool_respects_whitelist() {
    let model = FnModel::calls_tool(
        TASK_TOOL,
        json!({"subagent_type": "explore", "prompt": "look"}),
    );
    let subagents = Arc::new(StaticSubagents::default());
    let runtime = Runtime::new(
        options(model.clone())
            .with_tools(tools().registry)
            .with_subagents(subagents.clone()),
    )
    .unwrap();

    let mut request = Request::new("go");
    request.tool_whitelist = vec!["echo".to_string()];
    let result = runtime.run(&token(), request).await;

    assert!(matches!(result, Err(RuntimeError::ToolError(_))));
    assert!(subagents.dispatched.lock().is_empty());
    assert_eq!(model.tool_names(0), vec!["echo"]);
}

#[tokio::test]
async fn test_response_carries_merged_tags() {
    let mut settings = quiet_settings();
    settings.tags.insert("team".to_string(), "infra".to_string());
    settings.tags.insert("env".to_string(), "dev".to_string());
    let runtime = Runtime::new(
        RuntimeOptions::new(FnModel::fixed("done"))
            .with_settings(settings)
            .without_rules(),
    )
    .unwrap();

    let mut request = Request::new("go");
    request.tags.insert("env".to_string(), "ci".to_string());
    request.mode.entry_point = EntryPoint::Ci;
    let response = runtime.run(&token(), request).await.unwrap();

    assert_eq!(response.tags.get("team").map(String::as_str), Some("infra"));
    assert_eq!(response.tags.get("env").map(String::as_str), Some("ci"));
    assert_eq!(response.mode.entry_point, EntryPoint::Ci);
    assert!(response.completed_at.is_some());
    assert!(response.session_id.starts_with("session-"));
}

#[derive(Default)]
struct FlakyTracer {
    turns: parking_lot::Mutex<Vec<String>>,
    shutdowns: std::sync::atomic::AtomicUsize,
}

impl Tracer for FlakyTracer {
    fn record_turn(&self, response: &Response) {
        self.turns.lock().push(response.request_id.clone());
    }

    fn shutdown(&self) -> Result<(), RuntimeError> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Err(RuntimeError::IoError(std::io::Error::other("exporter unreachable")))
    }
}

#[tokio::test]
async fn test_close_reports_release_error_and_still_closes() {
    let tools = tools();
    let tracer = Arc::new(FlakyTracer::default());
    let runtime = Runtime::new(
        options(FnModel::fixed("done"))
            .with_tools(tools.registry.clone())
            .with_tracer(tracer.clone()),
    )
    .unwrap();

    let mut request = Request::new("go");
    request.request_id = "req-1".to_string();
    runtime.run(&token(), request).await.unwrap();
    assert_eq!(*tracer.turns.lock(), vec!["req-1".to_string()]);

    let result = runtime.close().await;
    assert!(matches!(result, Err(RuntimeError::IoError(_))));
    assert!(tools.registry.is_closed());
    assert_eq!(runtime.lifecycle(), Lifecycle::Closed);

    // Closing again is a no-op.
    runtime.close().await.unwrap();
    assert_eq!(tracer.shutdowns.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_task_dispatch_respects_gate_of_other_sessions() {
    let model = BlockingModel::new();
    let runtime = Runtime::new(options(model.clone())).unwrap();

    let holder = {
        let runtime = runtime.clone();
        tokio::spawn(async move { runtime.run(&token(), Request::new("one").with_session("s1")).await })
    };
    model.started.notified().await;

    let ctx = ExecutionContext::new(token(), "parent", "r1").for_task();
    let result = runtime
        .run_task_dispatch(&ctx, Request::new("two").with_session("s1"))
        .await;
    assert!(matches!(result, Err(RuntimeError::ConcurrentExecution(ref s)) if s == "s1"));
    assert_eq!(model.calls.load(Ordering::SeqCst), 1);

    model.release(1);
    holder.await.unwrap().unwrap();
    let history = runtime.history("s1");
    assert_eq!(history.len(), 2);
    assert!(history.iter().all(|m| m.content != "two"));
}

#[tokio::test]
async fn test_task_dispatch_after_close_is_rejected() {
    let model = FnModel::fixed("done");
    let runtime = Runtime::new(options(model.clone())).unwrap();
    runtime.close().await.unwrap();

    let ctx = ExecutionContext::new(token(), "parent", "r1").for_task();
    let result = runtime
        .run_task_dispatch(&ctx, Request::new("nested"))
        .await;
    assert!(matches!(result, Err(RuntimeError::Closed)));
    assert_eq!(model.calls(), 0);
}
