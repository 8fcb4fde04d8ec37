//! Ready-set task scheduler for one phase.
//!
//! Tasks become ready when all dependencies are terminal-successful; ready
//! tasks start in FIFO insertion order, bounded by the per-session agent
//! cap. Transient failures retry in place with backoff; a fatal failure
//! aborts the phase after cancelling its siblings.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::agent::{AgentContext, AgentRuntime, RoleSpec};
use crate::error::{EngineError, Result};
use crate::knowledge::KnowledgeSearch;
use crate::llm::LlmGateway;
use crate::task::{Task, TaskResult};

use super::context::SessionCtx;

pub(crate) struct PhaseScheduler {
    pub runtime: Arc<AgentRuntime>,
    pub gateway: Arc<LlmGateway>,
    pub knowledge: Arc<dyn KnowledgeSearch>,
}

type TaskOutcome = (String, u32, Result<TaskResult>);

impl PhaseScheduler {
    /// Runs the given tasks to terminal state. Returns Ok when every task
    /// succeeded; the first permanent failure aborts the remainder.
    pub async fn run(
        &self,
        ctx: &Arc<SessionCtx>,
        task_ids: &[String],
        roles_by_task: &HashMap<String, Arc<RoleSpec>>,
    ) -> Result<()> {
        ctx.scope.check()?;
        let semaphore = Arc::new(Semaphore::new(
            ctx.config.orchestrator.max_agents_per_session,
        ));
        let phase_scope = ctx.scope.child();
        let wanted: HashSet<&str> = task_ids.iter().map(|s| s.as_str()).collect();
        let mut join_set: JoinSet<TaskOutcome> = JoinSet::new();
        let mut in_flight: HashSet<String> = HashSet::new();
        let mut failure: Option<EngineError> = None;

        loop {
            // Launch every ready task within the concurrency cap.
            if failure.is_none() && !phase_scope.is_cancelled() {
                let ready: Vec<(String, Task)> = {
                    let tree = ctx.tree.lock().await;
                    tree.ready_tasks()
                        .into_iter()
                        .filter(|id| wanted.contains(id.as_str()) && !in_flight.contains(id))
                        .filter_map(|id| tree.get(&id).map(|t| (id, t.clone())))
                        .collect()
                };

                for (task_id, task) in ready {
                    let Some(role) = roles_by_task.get(&task_id) else {
                        return Err(EngineError::Internal(format!(
                            "no role mapped for task {}",
                            task_id
                        )));
                    };

                    {
                        let mut tree = ctx.tree.lock().await;
                        tree.start(&task_id)?;
                    }
                    ctx.task_update(&task_id).await;

                    in_flight.insert(task_id.clone());
                    join_set.spawn(Self::attempt_loop(
                        Arc::clone(ctx),
                        task,
                        Arc::clone(role),
                        Arc::clone(&self.runtime),
                        Arc::clone(&self.gateway),
                        Arc::clone(&self.knowledge),
                        Arc::clone(&semaphore),
                        phase_scope.clone(),
                    ));
                }
            }

            if join_set.is_empty() {
                break;
            }

            tokio::select! {
                _ = ctx.scope.cancelled(), if !ctx.scope.is_cancelled() => {
                    failure.get_or_insert(EngineError::Cancelled);
                    phase_scope.cancel();
                }
                joined = join_set.join_next() => {
                    let Some(joined) = joined else { break };
                    let (task_id, attempts, result) = match joined {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            error!(error = %e, "Scheduled task panicked");
                            failure.get_or_insert(EngineError::Internal(format!(
                                "task panicked: {}",
                                e
                            )));
                            continue;
                        }
                    };
                    in_flight.remove(&task_id);
                    self.apply_outcome(ctx, &task_id, attempts, result, &mut failure, &phase_scope)
                        .await?;
                }
            }

            // Abort: cancel siblings and wait out the windup below.
            if failure.is_some() && !join_set.is_empty() {
                phase_scope.cancel();
                self.windup(ctx, &mut join_set, &mut in_flight).await;
                break;
            }
        }

        // Anything still marked active in the tree is interrupted.
        self.mark_inflight_interrupted(ctx, &in_flight).await;
        ctx.persist().await?;

        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn attempt_loop(
        ctx: Arc<SessionCtx>,
        task: Task,
        role: Arc<RoleSpec>,
        runtime: Arc<AgentRuntime>,
        gateway: Arc<LlmGateway>,
        knowledge: Arc<dyn KnowledgeSearch>,
        semaphore: Arc<Semaphore>,
        phase_scope: crate::scope::CancelScope,
    ) -> TaskOutcome {
        let task_id = task.id.clone();
        let permit = match phase_scope.run(semaphore.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) | Err(_) => return (task_id, 0, Err(EngineError::Cancelled)),
        };

        let (requirement, mode) = {
            let record = ctx.record.lock().await;
            (record.requirement.clone(), record.mode)
        };

        let agent_ctx = AgentContext {
            session_id: ctx.session_id.clone(),
            requirement,
            mode,
            collab: ctx.collab.clone(),
            gateway,
            knowledge,
            events: Arc::clone(&ctx) as Arc<dyn crate::agent::AgentEvents>,
            scope: phase_scope.child(),
        };

        let max_retries = ctx.config.orchestrator.transient_retries;
        let backoff = ctx.config.orchestrator.transient_backoff_ms.clone();
        let mut attempt: u32 = 0;

        let result = loop {
            let result = runtime.run(&task, &role, &agent_ctx).await;
            match result {
                Err(ref err) if err.is_transient() && attempt < max_retries => {
                    let delay_ms = backoff
                        .get(attempt as usize)
                        .copied()
                        .or_else(|| backoff.last().copied())
                        .unwrap_or(500);
                    warn!(
                        task_id = %task_id,
                        attempt = attempt + 1,
                        delay_ms,
                        error = %err,
                        "Transient task failure, retrying"
                    );
                    if phase_scope
                        .sleep(Duration::from_millis(delay_ms))
                        .await
                        .is_err()
                    {
                        break Err(EngineError::Cancelled);
                    }
                    attempt += 1;
                }
                other => break other,
            }
        };

        drop(permit);
        (task_id, attempt, result)
    }

    async fn apply_outcome(
        &self,
        ctx: &Arc<SessionCtx>,
        task_id: &str,
        attempts: u32,
        result: Result<TaskResult>,
        failure: &mut Option<EngineError>,
        phase_scope: &crate::scope::CancelScope,
    ) -> Result<()> {
        match result {
            Ok(task_result) => {
                let mut tree = ctx.tree.lock().await;
                if let Some(task) = tree.get_mut(task_id) {
                    task.retry_count = attempts;
                }
                tree.succeed(task_id, task_result)?;
                drop(tree);
                ctx.task_update(task_id).await;
                debug!(task_id, "Task succeeded");
            }
            Err(EngineError::Cancelled) => {
                {
                    let mut tree = ctx.tree.lock().await;
                    tree.interrupt(task_id)?;
                }
                ctx.task_update(task_id).await;
                failure.get_or_insert(EngineError::Cancelled);
            }
            Err(err) => {
                {
                    let mut tree = ctx.tree.lock().await;
                    if let Some(task) = tree.get_mut(task_id) {
                        task.retry_count = attempts;
                    }
                    tree.fail(task_id, err.to_string())?;
                }
                ctx.task_update(task_id).await;
                info!(task_id, error = %err, "Task failed permanently, aborting phase");
                phase_scope.cancel();
                failure.get_or_insert(err);
            }
        }
        Ok(())
    }

    /// After cancellation, in-flight tasks get a bounded windup before
    /// being abandoned and marked interrupted.
    async fn windup(
        &self,
        ctx: &Arc<SessionCtx>,
        join_set: &mut JoinSet<TaskOutcome>,
        in_flight: &mut HashSet<String>,
    ) {
        let windup = Duration::from_secs(ctx.config.orchestrator.cancel_windup_secs);
        let drain = async {
            while let Some(joined) = join_set.join_next().await {
                if let Ok((task_id, _, result)) = joined {
                    in_flight.remove(&task_id);
                    let mut tree = ctx.tree.lock().await;
                    let _ = match result {
                        Ok(task_result) => tree.succeed(&task_id, task_result),
                        Err(_) => tree.interrupt(&task_id),
                    };
                    drop(tree);
                    ctx.task_update(&task_id).await;
                }
            }
        };

        if tokio::time::timeout(windup, drain).await.is_err() {
            warn!(
                session_id = %ctx.session_id,
                remaining = join_set.len(),
                "Windup budget exceeded, abandoning tasks"
            );
            join_set.abort_all();
        }
    }

    async fn mark_inflight_interrupted(&self, ctx: &Arc<SessionCtx>, in_flight: &HashSet<String>) {
        for task_id in in_flight {
            {
                let mut tree = ctx.tree.lock().await;
                let still_active = tree
                    .get(task_id)
                    .map(|t| !t.is_terminal())
                    .unwrap_or(false);
                if !still_active {
                    continue;
                }
                let _ = tree.interrupt(task_id);
            }
            ctx.task_update(task_id).await;
        }
    }
}
