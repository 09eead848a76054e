//! Prepare phase: slash commands, skills and subagent dispatch rewrite the
//! prompt and settle the tool whitelists before the agent loop starts.

use crate::context::ExecutionContext;
use crate::history::History;
use crate::hooks::{HookEvent, HookRecorder};
use crate::interfaces::{
    ActivationContext, CommandExecutor, CommandResult, RuntimeError, SkillRegistry, SkillResult,
    SubagentManager, SubagentRequest, SubagentResult,
};
use crate::types::Request;
use crate::whitelist::{ToolWhitelist, WhitelistScopes};
use claw_sdk_tools::canonical_name;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A request ready for the agent loop. Owned by exactly one in-flight call.
pub struct PreparedRun {
    pub request: Request,
    /// Prompt after command, skill and subagent rewriting.
    pub prompt: String,
    pub history: Arc<History>,
    pub scopes: WhitelistScopes,
    pub hooks: Arc<HookRecorder>,
    pub command_results: Vec<CommandResult>,
    pub skill_results: Vec<SkillResult>,
    pub subagent: Option<SubagentResult>,
}

/// Optional collaborators the prepare phase consults.
#[derive(Clone, Default)]
pub struct Preparer {
    pub commands: Option<Arc<dyn CommandExecutor>>,
    pub skills: Option<Arc<dyn SkillRegistry>>,
    pub subagents: Option<Arc<dyn SubagentManager>>,
}

impl Preparer {
    /// `request` must already be normalized.
    pub async fn prepare(
        &self,
        ctx: &ExecutionContext,
        request: Request,
        history: Arc<History>,
        hooks: Arc<HookRecorder>,
    ) -> Result<PreparedRun, RuntimeError> {
        let mut prompt = request.prompt.clone();

        let command_results = match &self.commands {
            Some(commands) => self.run_commands(ctx, commands.as_ref(), &mut prompt).await?,
            None => Vec::new(),
        };

        let skill_results = self.run_skills(ctx, &request, &mut prompt).await?;

        let request_whitelist = ToolWhitelist::from_names(&request.tool_whitelist);
        let mut subagent_whitelist = ToolWhitelist::Unrestricted;
        let mut subagent = None;
        if let Some(target) = &request.target_subagent {
            match &self.subagents {
                Some(manager) => {
                    let result = dispatch_subagent(
                        ctx,
                        manager.as_ref(),
                        &hooks,
                        SubagentRequest {
                            target: target.clone(),
                            instruction: prompt.clone(),
                            session_id: ctx.session_id.clone(),
                            tool_whitelist: request.tool_whitelist.clone(),
                            metadata: request.metadata.clone(),
                        },
                    )
                    .await?;
                    let output = result.output.trim();
                    if !output.is_empty() {
                        prompt = output.to_string();
                    }
                    subagent_whitelist = ToolWhitelist::from_names(&result.allowed_tools);
                    subagent = Some(result);
                }
                None => warn!(
                    "Request targets subagent {} but no subagent manager is configured",
                    target
                ),
            }
        }

        let prompt = prompt.trim().to_string();
        if prompt.is_empty() {
            return Err(RuntimeError::InvalidRequest(
                "Prompt is empty after command and skill expansion".to_string(),
            ));
        }

        let scopes = WhitelistScopes::new(request_whitelist, subagent_whitelist);
        debug!(
            "Prepared request {}: whitelist request={} subagent={}",
            request.request_id, scopes.request, scopes.subagent
        );

        Ok(PreparedRun {
            request,
            prompt,
            history,
            scopes,
            hooks,
            command_results,
            skill_results,
            subagent,
        })
    }

    async fn run_commands(
        &self,
        ctx: &ExecutionContext,
        commands: &dyn CommandExecutor,
        prompt: &mut String,
    ) -> Result<Vec<CommandResult>, RuntimeError> {
        let invocations = commands.parse(prompt)?;
        if invocations.is_empty() {
            return Ok(Vec::new());
        }
        info!("Running {} slash commands", invocations.len());
        let results = commands.execute(&ctx.cancel, &invocations).await?;

        let mut remaining = prompt.clone();
        for invocation in &invocations {
            remaining = remaining.replacen(&invocation.raw, "", 1);
        }
        let mut parts = vec![remaining.trim().to_string()];
        parts.extend(
            results
                .iter()
                .map(|r| r.output.trim().to_string())
                .filter(|o| !o.is_empty()),
        );
        *prompt = join_parts(parts);
        Ok(results)
    }

    async fn run_skills(
        &self,
        ctx: &ExecutionContext,
        request: &Request,
        prompt: &mut String,
    ) -> Result<Vec<SkillResult>, RuntimeError> {
        let skills = match &self.skills {
            Some(skills) => skills,
            None if request.forced_skills.is_empty() => return Ok(Vec::new()),
            None => {
                return Err(RuntimeError::SkillError(format!(
                    "Forced skills {:?} but no skill registry is configured",
                    request.forced_skills
                )))
            }
        };

        let activation = ActivationContext {
            session_id: ctx.session_id.clone(),
            prompt: prompt.clone(),
            tags: request.tags.clone(),
            forced: request.forced_skills.clone(),
        };
        let matches = skills.match_skills(&activation);

        for forced in &request.forced_skills {
            if !matches.iter().any(|m| canonical_name(&m.name) == *forced) {
                return Err(RuntimeError::SkillError(format!(
                    "Forced skill not available: {}",
                    forced
                )));
            }
        }

        let mut results = Vec::with_capacity(matches.len());
        for matched in &matches {
            debug!("Activating skill {} ({})", matched.name, matched.reason);
            results.push(skills.execute(&ctx.cancel, &matched.name, &activation).await?);
        }

        let mut parts: Vec<String> = results
            .iter()
            .map(|r| r.output.trim().to_string())
            .filter(|o| !o.is_empty())
            .collect();
        if !parts.is_empty() {
            parts.push(prompt.trim().to_string());
            *prompt = join_parts(parts);
        }
        Ok(results)
    }
}

/// Dispatch one subagent, bracketed by `SubagentStart`/`SubagentStop`.
pub(crate) async fn dispatch_subagent(
    ctx: &ExecutionContext,
    manager: &dyn SubagentManager,
    hooks: &HookRecorder,
    request: SubagentRequest,
) -> Result<SubagentResult, RuntimeError> {
    let target = request.target.clone();
    hooks.notify(HookEvent::SubagentStart {
        session_id: ctx.session_id.clone(),
        subagent: target.clone(),
        task_dispatch: ctx.task_dispatch,
    });
    info!("Dispatching subagent: {}", target);

    let result = manager.dispatch(ctx, request).await;

    hooks.notify(HookEvent::SubagentStop {
        session_id: ctx.session_id.clone(),
        subagent: target,
        error: result.as_ref().err().map(|e| e.to_string()),
    });
    result
}

fn join_parts(parts: Vec<String>) -> String {
    parts
        .into_iter()
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}
