//! Quality-driven clarification engine.
//!
//! Each turn runs the Clarifier role, evaluates the eight-dimension gate,
//! and either promotes the session to analysis or asks the user targeted
//! questions, lowest-scoring dimensions first.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::agent::{ClarifierAssessment, QuestionDraft, RoleSpec};
use crate::config::OrchestratorConfig;
use crate::error::{EngineError, Result};
use crate::roles::ROLE_CLARIFIER;
use crate::session::{
    ClarificationRound, Dimension, DimensionScore, MessagePayload, MessageRole, QualitySnapshot,
    Question, QuestionPriority, RecordOutcome,
};
use crate::task::{Participant, Task};

use super::context::SessionCtx;
use super::scheduler::PhaseScheduler;
use super::{AnswerBatch, CLARIFY_TASK_ID};

pub(crate) struct ClarifyEngine<'a> {
    pub scheduler: &'a PhaseScheduler,
    pub role: Arc<RoleSpec>,
}

impl ClarifyEngine<'_> {
    /// Drives clarification rounds until the gate passes, the round cap
    /// resolves the session one way or the other, or the user goes idle.
    pub async fn run(
        &self,
        ctx: &Arc<SessionCtx>,
        answers_rx: &mut mpsc::Receiver<AnswerBatch>,
    ) -> Result<()> {
        let orchestrator_config = ctx.config.orchestrator.clone();
        let start_round = {
            let record = ctx.record.lock().await;
            record.rounds.len() as u32
        };

        // A resumed session may still owe answers for its open round.
        let pending_round = {
            let record = ctx.record.lock().await;
            record
                .current_round()
                .filter(|round| !round.all_answered())
                .map(|round| round.sequence)
        };
        if let Some(round_no) = pending_round {
            self.await_answers(ctx, answers_rx, round_no).await?;
        }

        for round_no in (start_round + 1)..=orchestrator_config.max_rounds {
            ctx.scope.check()?;

            let assessment = self.assess(ctx, round_no).await?;
            let snapshot = snapshot_from(&assessment, ctx.as_ref());
            ctx.quality(round_no, snapshot.clone()).await;

            info!(
                session_id = %ctx.session_id,
                round = round_no,
                overall = snapshot.overall,
                gate_passed = snapshot.gate_passed,
                "Clarification turn evaluated"
            );

            if snapshot.gate_passed {
                self.finish_clarify_task(ctx).await?;
                return Ok(());
            }

            if round_no == orchestrator_config.max_rounds {
                return if snapshot.meets_floor(&ctx.config.quality) {
                    debug!(
                        session_id = %ctx.session_id,
                        overall = snapshot.overall,
                        "Round cap reached above floor, promoting"
                    );
                    self.finish_clarify_task(ctx).await?;
                    Ok(())
                } else {
                    Err(EngineError::ClarificationExhausted {
                        rounds: round_no,
                        overall: snapshot.overall,
                    })
                };
            }

            let questions =
                select_questions(&snapshot, assessment.questions, &orchestrator_config);
            let round = ClarificationRound::new(round_no, questions.clone(), snapshot);
            {
                let mut record = ctx.record.lock().await;
                record.rounds.push(round);
            }
            ctx.persist().await?;

            ctx.message(
                MessageRole::Agent,
                ROLE_CLARIFIER,
                MessagePayload::Questions {
                    round: round_no,
                    questions,
                },
            )
            .await;

            self.await_answers(ctx, answers_rx, round_no).await?;
        }

        Ok(())
    }

    /// Runs the Clarifier agent for one round as a child task of the
    /// clarify phase task, then reads its committed assessment.
    async fn assess(&self, ctx: &Arc<SessionCtx>, round_no: u32) -> Result<ClarifierAssessment> {
        let task_id = format!("{}-{}", CLARIFY_TASK_ID, round_no);
        {
            let mut tree = ctx.tree.lock().await;
            if tree.get(&task_id).is_some() {
                // Left over from an interrupted run of this round.
                tree.reset_for_retry(&task_id)?;
            } else {
                tree.insert(
                    Task::new(&task_id, &ctx.session_id, format!("clarify round {}", round_no))
                        .with_parent(CLARIFY_TASK_ID)
                        .with_participant(Participant::new(ROLE_CLARIFIER, &task_id)),
                )?;
            }
        }

        let mut roles = HashMap::new();
        roles.insert(task_id.clone(), Arc::clone(&self.role));
        self.scheduler.run(ctx, &[task_id], &roles).await?;

        let value = ctx
            .collab
            .get("clarifier.assessment")
            .ok_or_else(|| EngineError::Transient("clarifier_parse".into()))?;
        serde_json::from_value(value)
            .map_err(|_| EngineError::Transient("clarifier_parse".into()))
    }

    async fn finish_clarify_task(&self, ctx: &Arc<SessionCtx>) -> Result<()> {
        {
            let mut tree = ctx.tree.lock().await;
            tree.succeed(
                CLARIFY_TASK_ID,
                crate::task::TaskResult {
                    content: "clarification gate passed".into(),
                    quality: None,
                    artifacts: Vec::new(),
                },
            )?;
        }
        ctx.task_update(CLARIFY_TASK_ID).await;
        ctx.persist().await
    }

    /// Waits for `submit_answer` batches, applying them idempotently.
    /// Returns once at least one new answer landed, so quality can be
    /// re-evaluated; duplicates alone keep waiting.
    async fn await_answers(
        &self,
        ctx: &Arc<SessionCtx>,
        answers_rx: &mut mpsc::Receiver<AnswerBatch>,
        round_no: u32,
    ) -> Result<()> {
        let idle = Duration::from_secs(ctx.config.orchestrator.idle_timeout_secs);

        loop {
            let batch = tokio::select! {
                _ = ctx.scope.cancelled() => return Err(EngineError::Cancelled),
                _ = tokio::time::sleep(idle) => return Err(EngineError::IdleTimeout),
                batch = answers_rx.recv() => {
                    batch.ok_or(EngineError::Cancelled)?
                }
            };

            let mut recorded = 0usize;
            {
                let mut record = ctx.record.lock().await;
                let Some(round) = record.current_round_mut() else {
                    continue;
                };
                for (question_id, answer) in &batch {
                    match round.record_answer(question_id, answer) {
                        RecordOutcome::Recorded => recorded += 1,
                        RecordOutcome::Duplicate => {}
                        RecordOutcome::UnknownQuestion => {
                            debug!(
                                session_id = %ctx.session_id,
                                question_id,
                                "Answer for unknown question ignored"
                            );
                        }
                    }
                }
            }

            if recorded == 0 {
                // Fully duplicate batch: idempotent, no events, keep waiting.
                debug!(session_id = %ctx.session_id, "Duplicate answer batch ignored");
                continue;
            }

            // Answers become shared findings so later turns build on them.
            let answered = {
                let record = ctx.record.lock().await;
                record
                    .current_round()
                    .map(|round| {
                        let pairs: serde_json::Map<String, serde_json::Value> = round
                            .questions
                            .iter()
                            .filter_map(|q| {
                                round
                                    .answers
                                    .get(&q.id)
                                    .map(|a| (q.text.clone(), serde_json::Value::String(a.clone())))
                            })
                            .collect();
                        serde_json::Value::Object(pairs)
                    })
                    .unwrap_or(serde_json::Value::Null)
            };
            let mut staging = HashMap::new();
            staging.insert(format!("clarifier.answers.round{}", round_no), answered);
            crate::agent::AgentEvents::commit_shared(ctx.as_ref(), staging).await;

            ctx.persist().await?;
            ctx.message(
                MessageRole::User,
                "user",
                MessagePayload::Answers {
                    round: round_no,
                    count: recorded,
                },
            )
            .await;
            return Ok(());
        }
    }
}

fn snapshot_from(assessment: &ClarifierAssessment, ctx: &SessionCtx) -> QualitySnapshot {
    let scores: BTreeMap<Dimension, DimensionScore> = assessment
        .dimensions
        .iter()
        .map(|(dimension, value)| {
            (
                *dimension,
                DimensionScore {
                    score: value.score.clamp(0.0, 1.0),
                    missing: value.missing_aspects.clone(),
                },
            )
        })
        .collect();
    QualitySnapshot::compute(scores, &ctx.config.quality)
}

/// Selects up to the per-round budget, lowest-scoring dimensions first,
/// with at most the configured number of high-priority questions (extras
/// are demoted, not dropped).
fn select_questions(
    snapshot: &QualitySnapshot,
    drafts: Vec<QuestionDraft>,
    config: &OrchestratorConfig,
) -> Vec<Question> {
    let dimension_rank: HashMap<Dimension, usize> = snapshot
        .lowest_dimensions()
        .into_iter()
        .enumerate()
        .map(|(rank, dimension)| (dimension, rank))
        .collect();

    let mut drafts = drafts;
    drafts.sort_by_key(|draft| {
        (
            dimension_rank.get(&draft.category).copied().unwrap_or(usize::MAX),
            draft.priority,
        )
    });

    let mut high_budget = config.max_high_priority_per_round;
    drafts
        .into_iter()
        .take(config.max_questions_per_round)
        .map(|draft| {
            let priority = if draft.priority == QuestionPriority::High {
                if high_budget > 0 {
                    high_budget -= 1;
                    QuestionPriority::High
                } else {
                    QuestionPriority::Med
                }
            } else {
                draft.priority
            };
            Question::new(draft.text, draft.category, priority)
        })
        .collect()
}
