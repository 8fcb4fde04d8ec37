//! Think-Act-Reflect executor.

use std::collections::HashMap;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::error::{EngineError, ErrorInfo, Result};
use crate::llm::CallMode;
use crate::session::{AgentState, MessagePayload, SessionMode};
use crate::task::{Task, TaskResult};

use super::parser::{parse_act, parse_reflect, parse_think, ThinkOutput};
use super::{AgentContext, QualityReview, RoleSpec};

pub struct AgentRuntime {
    config: AgentConfig,
}

impl AgentRuntime {
    pub fn new(config: AgentConfig) -> Self {
        Self { config }
    }

    fn cycle_budget(&self, mode: SessionMode) -> Duration {
        let secs = match mode {
            SessionMode::Quick => self.config.timeout_quick_secs,
            SessionMode::Deep => self.config.timeout_deep_secs,
            SessionMode::Standard | SessionMode::Workflow => self.config.timeout_standard_secs,
        };
        Duration::from_secs(secs)
    }

    /// Runs one agent instance through its cycle and produces a result.
    /// The task-level budget bounds the whole cycle; on expiry a partial
    /// `reflect.error` snapshot is published and the task reports
    /// `Cancelled`.
    pub async fn run(&self, task: &Task, role: &RoleSpec, ctx: &AgentContext) -> Result<TaskResult> {
        ctx.events
            .set_role_state(&role.id, AgentState::Preparing)
            .await;

        let budget = self.cycle_budget(ctx.mode);
        let operation = format!("agent:{}", role.id);

        ctx.events.set_role_state(&role.id, AgentState::Running).await;

        let outcome = ctx
            .scope
            .run_with_deadline(&operation, budget, self.cycles(task, role, ctx))
            .await;

        match outcome {
            Ok(Ok(result)) => {
                ctx.events
                    .set_role_state(&role.id, AgentState::Succeeded)
                    .await;
                ctx.events.task_progress(&task.id, 1.0).await;
                Ok(result)
            }
            Ok(Err(EngineError::Cancelled)) | Err(EngineError::Cancelled) => {
                ctx.events
                    .set_role_state(&role.id, AgentState::Interrupted)
                    .await;
                Err(EngineError::Cancelled)
            }
            Ok(Err(err)) => {
                ctx.events.set_role_state(&role.id, AgentState::Failed).await;
                Err(err)
            }
            Err(timeout) => {
                // One attempt to surface partial content, then Cancelled.
                warn!(
                    session_id = %ctx.session_id,
                    role = %role.id,
                    budget_secs = budget.as_secs(),
                    "Agent cycle exceeded budget"
                );
                ctx.events
                    .agent_message(
                        &role.id,
                        MessagePayload::Error {
                            error: ErrorInfo::new("reflect.error", timeout.to_string()),
                        },
                    )
                    .await;
                ctx.events
                    .set_role_state(&role.id, AgentState::Interrupted)
                    .await;
                Err(EngineError::Cancelled)
            }
        }
    }

    async fn cycles(
        &self,
        task: &Task,
        role: &RoleSpec,
        ctx: &AgentContext,
    ) -> Result<TaskResult> {
        let mut last: Option<(String, QualityReview, HashMap<String, serde_json::Value>)> = None;

        for cycle in 1..=self.config.max_cycles {
            ctx.scope.check()?;

            let think = self.think(task, role, ctx).await?;
            ctx.events.task_progress(&task.id, 0.25).await;

            let (content, staging) = self.act(task, role, ctx, &think).await?;
            ctx.events.task_progress(&task.id, 0.75).await;

            let review = self.reflect(role, ctx, &content).await?;
            ctx.events.task_progress(&task.id, 0.9).await;

            debug!(
                session_id = %ctx.session_id,
                role = %role.id,
                cycle,
                overall = review.overall,
                passed = review.passed,
                "Reflect verdict"
            );

            if review.passed || cycle == self.config.max_cycles {
                if !review.passed {
                    info!(
                        session_id = %ctx.session_id,
                        role = %role.id,
                        overall = review.overall,
                        threshold = role.threshold,
                        "Quality gate not met after final cycle, surfacing result"
                    );
                }
                last = Some((content, review, staging));
                break;
            }
            // Gate failed with retries remaining: the staging map is
            // discarded and the cycle repeats.
            last = Some((content, review, HashMap::new()));
        }

        let (content, review, staging) =
            last.ok_or_else(|| EngineError::Internal("agent ran zero cycles".into()))?;

        if !staging.is_empty() {
            let revision = ctx.events.commit_shared(staging).await;
            debug!(
                session_id = %ctx.session_id,
                role = %role.id,
                revision,
                "Staging committed"
            );
        }

        Ok(TaskResult {
            content,
            quality: Some(review),
            artifacts: Vec::new(),
        })
    }

    async fn think(
        &self,
        task: &Task,
        role: &RoleSpec,
        ctx: &AgentContext,
    ) -> Result<ThinkOutput> {
        let snapshot = ctx.collab.snapshot();
        let knowledge = self.knowledge_context(ctx).await;
        let prompt = role.think_prompt(&ctx.requirement, &task.name, &snapshot, &knowledge);

        let mut attempts = 0;
        loop {
            let text = ctx
                .gateway
                .generate(&prompt, CallMode::Quick, &ctx.scope)
                .await?;
            match parse_think(&text) {
                Ok(output) => return Ok(output),
                Err(_) if attempts < self.config.think_parse_retries => {
                    attempts += 1;
                    debug!(role = %role.id, attempts, "Think parse failed, retrying");
                }
                Err(_) => return Err(EngineError::Transient("think_parse".into())),
            }
        }
    }

    async fn act(
        &self,
        task: &Task,
        role: &RoleSpec,
        ctx: &AgentContext,
        think: &ThinkOutput,
    ) -> Result<(String, HashMap<String, serde_json::Value>)> {
        let snapshot = ctx.collab.snapshot();
        let mode = CallMode::from(ctx.mode);
        let mut staging: HashMap<String, serde_json::Value> = HashMap::new();
        let mut sections: Vec<String> = Vec::new();
        let total = role.sub_steps.len().max(1);

        for (index, sub_step) in role.sub_steps.iter().enumerate() {
            ctx.scope.check()?;
            let prompt = role.act_prompt(sub_step, &ctx.requirement, think, &snapshot);
            let text = ctx.gateway.generate(&prompt, mode, &ctx.scope).await?;
            let output = parse_act(&text);

            if output.content.is_empty() {
                return Err(EngineError::Transient("act_parse".into()));
            }
            sections.push(output.content);
            staging.extend(output.data);

            // Midway progress marker across sub-steps.
            if index + 1 == total.div_ceil(2) {
                ctx.events.task_progress(&task.id, 0.5).await;
            }
        }

        Ok((sections.join("\n\n"), staging))
    }

    async fn reflect(
        &self,
        role: &RoleSpec,
        ctx: &AgentContext,
        content: &str,
    ) -> Result<QualityReview> {
        let prompt = role.reflect_prompt(content);
        let text = ctx
            .gateway
            .generate(&prompt, CallMode::Quick, &ctx.scope)
            .await?;
        let scores = parse_reflect(&text)?;
        let overall = role.quality_weights.overall(&scores);
        Ok(QualityReview {
            scores,
            overall,
            passed: overall + 1e-9 >= role.threshold,
        })
    }

    async fn knowledge_context(&self, ctx: &AgentContext) -> String {
        match ctx.knowledge.search(&ctx.requirement, 3).await {
            Ok(snippets) if !snippets.is_empty() => snippets
                .iter()
                .map(|s| format!("- [{}] {}", s.source, s.text))
                .collect::<Vec<_>>()
                .join("\n"),
            _ => String::new(),
        }
    }
}
