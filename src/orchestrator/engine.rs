//! Phase driver: advances a session clarifying → analyzing → documenting →
//! reviewing → done, applying mode-specific shortcuts and retries.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::agent::RoleSpec;
use crate::error::{EngineError, ErrorInfo, Result};
use crate::roles::{
    ANALYSIS_SUB_STEPS, ROLE_ANALYST, ROLE_REVIEWER, ROLE_WRITER, RoleRegistry,
    SPEC_ARTIFACT_NAME,
};
use crate::session::{
    AgentState, Artifact, MessagePayload, MessageRole, SessionPhase,
};
use crate::task::{Participant, Task, TaskResult};

use super::clarify::ClarifyEngine;
use super::context::SessionCtx;
use super::scheduler::PhaseScheduler;
use super::{ANALYZE_TASK_ID, AnswerBatch, CLARIFY_TASK_ID, ROOT_TASK_ID};

pub(crate) struct SessionDriver {
    pub scheduler: PhaseScheduler,
    pub roles: RoleRegistry,
}

impl SessionDriver {
    /// Runs the session to its terminal state. Always leaves exactly one
    /// terminal event behind.
    pub async fn run(
        &self,
        ctx: Arc<SessionCtx>,
        mut answers_rx: mpsc::Receiver<AnswerBatch>,
    ) {
        match self.drive(&ctx, &mut answers_rx).await {
            Ok(()) => {
                self.finish_root(&ctx, true).await;
                ctx.finish(SessionPhase::Done, None).await;
            }
            Err(err) => {
                self.finish_root(&ctx, false).await;
                warn!(
                    session_id = %ctx.session_id,
                    kind = err.kind(),
                    error = %err,
                    "Session failed"
                );
                ctx.finish(SessionPhase::Failed, Some(ErrorInfo::from(&err)))
                    .await;
            }
        }
    }

    async fn drive(
        &self,
        ctx: &Arc<SessionCtx>,
        answers_rx: &mut mpsc::Receiver<AnswerBatch>,
    ) -> Result<()> {
        let mode = ctx.record.lock().await.mode;
        self.reset_inflight_tasks(ctx).await?;

        // A resumed deep session may already be on its second group.
        let mut document_group: u32 = {
            let tree = ctx.tree.lock().await;
            if tree.get("document-2").is_some() { 2 } else { 1 }
        };
        loop {
            ctx.scope.check()?;
            match ctx.phase().await {
                SessionPhase::Clarifying => {
                    let engine = ClarifyEngine {
                        scheduler: &self.scheduler,
                        role: self.roles.get(crate::roles::ROLE_CLARIFIER)?,
                    };
                    engine.run(ctx, answers_rx).await?;
                    ctx.change_phase(SessionPhase::Analyzing).await?;
                }
                SessionPhase::Analyzing => {
                    self.analyze(ctx).await?;
                    ctx.change_phase(SessionPhase::Documenting).await?;
                }
                SessionPhase::Documenting => {
                    self.document(ctx, document_group).await?;
                    if mode.skips_review() {
                        return Ok(());
                    }
                    ctx.change_phase(SessionPhase::Reviewing).await?;
                }
                SessionPhase::Reviewing => {
                    let passed = self.review(ctx, document_group).await?;
                    if passed {
                        return Ok(());
                    }
                    if mode.allows_redocument() && document_group == 1 {
                        info!(
                            session_id = %ctx.session_id,
                            "Review failed, re-documenting once"
                        );
                        document_group = 2;
                        ctx.change_phase(SessionPhase::Documenting).await?;
                    } else {
                        return Err(EngineError::Fatal(
                            "review rejected the specification".into(),
                        ));
                    }
                }
                SessionPhase::Done | SessionPhase::Failed => return Ok(()),
            }
        }
    }

    /// Tasks left active by a crash are reset so they reschedule cleanly.
    async fn reset_inflight_tasks(&self, ctx: &Arc<SessionCtx>) -> Result<()> {
        let active: Vec<String> = {
            let tree = ctx.tree.lock().await;
            tree.running_tasks()
        };
        if active.is_empty() {
            return Ok(());
        }
        let mut tree = ctx.tree.lock().await;
        for task_id in active {
            warn!(session_id = %ctx.session_id, task_id = %task_id, "Recovering interrupted task");
            tree.reset_for_retry(&task_id)?;
        }
        Ok(())
    }

    async fn analyze(&self, ctx: &Arc<SessionCtx>) -> Result<()> {
        let analyst = self.roles.get(ROLE_ANALYST)?;
        let mut task_ids = Vec::new();
        let mut roles_by_task: HashMap<String, Arc<RoleSpec>> = HashMap::new();

        {
            let mut tree = ctx.tree.lock().await;
            for sub_step_id in ANALYSIS_SUB_STEPS {
                let task_id = format!("{}.{}", ANALYZE_TASK_ID, sub_step_id);
                if tree.get(&task_id).is_none() {
                    tree.insert(
                        Task::new(&task_id, &ctx.session_id, format!("analyze {}", sub_step_id))
                            .with_parent(ANALYZE_TASK_ID)
                            .with_dependencies(vec![CLARIFY_TASK_ID.to_string()])
                            .with_participant(Participant::new(ROLE_ANALYST, &task_id)),
                    )?;
                } else if tree
                    .get(&task_id)
                    .is_some_and(|t| !t.status.is_success() && t.status != AgentState::Idle)
                {
                    tree.reset_for_retry(&task_id)?;
                }
                // Each sub-step task runs the analyst restricted to that step.
                let scoped = Arc::new(RoleSpec {
                    sub_steps: analyst
                        .sub_steps
                        .iter()
                        .filter(|s| s.id == sub_step_id)
                        .cloned()
                        .collect(),
                    ..(*analyst).clone()
                });
                roles_by_task.insert(task_id.clone(), scoped);
                task_ids.push(task_id);
            }
        }
        ctx.persist().await?;

        // Only tasks that are not already terminal-successful get scheduled.
        let pending: Vec<String> = {
            let tree = ctx.tree.lock().await;
            task_ids
                .iter()
                .filter(|id| tree.get(id).is_some_and(|t| !t.status.is_success()))
                .cloned()
                .collect()
        };
        if !pending.is_empty() {
            self.scheduler.run(ctx, &pending, &roles_by_task).await?;
        }

        self.finish_container(ctx, ANALYZE_TASK_ID).await
    }

    async fn document(&self, ctx: &Arc<SessionCtx>, group: u32) -> Result<()> {
        let writer = self.roles.get(ROLE_WRITER)?;
        let task_id = format!("document-{}", group);
        let dependency = if group == 1 {
            ANALYZE_TASK_ID.to_string()
        } else {
            format!("review-{}", group - 1)
        };

        {
            let mut tree = ctx.tree.lock().await;
            if tree.get(&task_id).is_none() {
                tree.insert(
                    Task::new(&task_id, &ctx.session_id, "write specification")
                        .with_parent(ROOT_TASK_ID)
                        .with_dependencies(vec![dependency])
                        .with_participant(Participant::new(ROLE_WRITER, &task_id)),
                )?;
            } else if tree
                .get(&task_id)
                .is_some_and(|t| !t.status.is_success() && t.status != AgentState::Idle)
            {
                tree.reset_for_retry(&task_id)?;
            }
        }
        ctx.persist().await?;

        let mut roles_by_task = HashMap::new();
        roles_by_task.insert(task_id.clone(), writer);
        self.scheduler
            .run(ctx, std::slice::from_ref(&task_id), &roles_by_task)
            .await?;

        // The produced document becomes an artifact, visible only now that
        // the producing task is terminal-successful, and lands in shared
        // state for the reviewer.
        let content = {
            let tree = ctx.tree.lock().await;
            tree.get(&task_id)
                .and_then(|t| t.result.as_ref())
                .map(|r| r.content.clone())
                .ok_or_else(|| EngineError::Internal("document task left no result".into()))?
        };

        // A resumed session may have produced this group's artifact already.
        let existing = {
            let record = ctx.record.lock().await;
            record
                .artifacts
                .iter()
                .find(|a| a.produced_by == task_id)
                .map(|a| a.id.clone())
        };
        if existing.is_some() {
            return ctx.persist().await;
        }

        let artifact = Artifact::new(
            &ctx.session_id,
            SPEC_ARTIFACT_NAME,
            "text/markdown",
            content.clone(),
            &task_id,
        );
        let artifact_id = artifact.id.clone();
        {
            let mut record = ctx.record.lock().await;
            record.artifacts.push(artifact);
        }
        {
            let mut tree = ctx.tree.lock().await;
            if let Some(result) = tree.get_mut(&task_id).and_then(|t| t.result.as_mut()) {
                result.artifacts.push(artifact_id.clone());
            }
        }

        let mut staging = HashMap::new();
        staging.insert(
            "document.spec_markdown".to_string(),
            serde_json::Value::String(content),
        );
        crate::agent::AgentEvents::commit_shared(ctx.as_ref(), staging).await;

        ctx.message(
            MessageRole::Agent,
            ROLE_WRITER,
            MessagePayload::ArtifactRef {
                artifact_id,
                name: SPEC_ARTIFACT_NAME.to_string(),
            },
        )
        .await;
        ctx.persist().await
    }

    /// Runs the reviewer and reports whether the specification passed.
    async fn review(&self, ctx: &Arc<SessionCtx>, group: u32) -> Result<bool> {
        let reviewer = self.roles.get(ROLE_REVIEWER)?;
        let task_id = format!("review-{}", group);

        {
            let mut tree = ctx.tree.lock().await;
            if tree.get(&task_id).is_none() {
                tree.insert(
                    Task::new(&task_id, &ctx.session_id, "review specification")
                        .with_parent(ROOT_TASK_ID)
                        .with_dependencies(vec![format!("document-{}", group)])
                        .with_participant(Participant::new(ROLE_REVIEWER, &task_id)),
                )?;
            } else if tree
                .get(&task_id)
                .is_some_and(|t| !t.status.is_success() && t.status != AgentState::Idle)
            {
                tree.reset_for_retry(&task_id)?;
            }
        }
        ctx.persist().await?;

        let mut roles_by_task = HashMap::new();
        roles_by_task.insert(task_id.clone(), reviewer);
        self.scheduler
            .run(ctx, std::slice::from_ref(&task_id), &roles_by_task)
            .await?;

        let passed = {
            let tree = ctx.tree.lock().await;
            tree.get(&task_id)
                .and_then(|t| t.result.as_ref())
                .and_then(|r| r.quality.as_ref())
                .map(|q| q.passed)
                .unwrap_or(false)
        };
        ctx.persist().await?;
        Ok(passed)
    }

    /// Marks a container task succeeded once all its children are.
    async fn finish_container(&self, ctx: &Arc<SessionCtx>, container_id: &str) -> Result<()> {
        {
            let mut tree = ctx.tree.lock().await;
            let all_ok = tree
                .children_of(container_id)
                .iter()
                .all(|t| t.status.is_success());
            if !all_ok {
                return Err(EngineError::Internal(format!(
                    "container {} closed with unfinished children",
                    container_id
                )));
            }
            tree.succeed(
                container_id,
                TaskResult {
                    content: String::new(),
                    quality: None,
                    artifacts: Vec::new(),
                },
            )?;
        }
        ctx.task_update(container_id).await;
        ctx.persist().await
    }

    /// Resolves the root task at session end.
    async fn finish_root(&self, ctx: &Arc<SessionCtx>, success: bool) {
        let mut tree = ctx.tree.lock().await;
        let Some(root) = tree.get(ROOT_TASK_ID) else {
            return;
        };
        if root.is_terminal() {
            return;
        }
        let result = if success {
            tree.succeed(
                ROOT_TASK_ID,
                TaskResult {
                    content: String::new(),
                    quality: None,
                    artifacts: Vec::new(),
                },
            )
        } else {
            // Interrupted rather than failed when cancellation tore it down.
            if tree
                .get(ROOT_TASK_ID)
                .is_some_and(|t| t.status == AgentState::Running)
            {
                tree.interrupt(ROOT_TASK_ID)
            } else {
                tree.fail(ROOT_TASK_ID, "session failed")
            }
        };
        drop(tree);
        if result.is_ok() {
            ctx.task_update(ROOT_TASK_ID).await;
        }
    }
}
