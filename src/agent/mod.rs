//! Agent runtime: a single executor parameterized by a `RoleSpec`.
//!
//! Adding a role is a data change, not a type change: behavior lives in the
//! role's sub-steps, prompt templates, rubric weights and threshold.

mod parser;
mod runtime;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use parser::{
    ActOutput, ClarifierAssessment, DimensionAssessment, QuestionDraft, ReflectScores,
    ThinkOutput, extract_json, parse_act, parse_clarifier, parse_reflect, parse_think,
};
pub use runtime::AgentRuntime;

use crate::knowledge::KnowledgeSearch;
use crate::llm::LlmGateway;
use crate::scope::CancelScope;
use crate::session::{AgentState, CollabSnapshot, MessagePayload, SessionMode};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubStep {
    pub id: String,
    pub name: String,
    pub prompt_template: String,
}

/// Rubric weights for the Reflect stage. Equal by default; roles override
/// where a dimension matters more to them.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RubricWeights {
    pub completeness: f64,
    pub accuracy: f64,
    pub professionalism: f64,
    pub clarity: f64,
    pub actionability: f64,
    pub innovation: f64,
}

impl Default for RubricWeights {
    fn default() -> Self {
        Self {
            completeness: 1.0,
            accuracy: 1.0,
            professionalism: 1.0,
            clarity: 1.0,
            actionability: 1.0,
            innovation: 1.0,
        }
    }
}

impl RubricWeights {
    pub fn overall(&self, scores: &ReflectScores) -> f64 {
        let total = self.completeness
            + self.accuracy
            + self.professionalism
            + self.clarity
            + self.actionability
            + self.innovation;
        if total <= 0.0 {
            return 0.0;
        }
        (scores.completeness * self.completeness
            + scores.accuracy * self.accuracy
            + scores.professionalism * self.professionalism
            + scores.clarity * self.clarity
            + scores.actionability * self.actionability
            + scores.innovation * self.innovation)
            / total
    }
}

/// Final Reflect verdict attached to a `TaskResult`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityReview {
    pub scores: ReflectScores,
    pub overall: f64,
    pub passed: bool,
}

/// Declarative description of an agent role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleSpec {
    pub id: String,
    pub name: String,
    pub system_prompt: String,
    pub think_template: String,
    pub sub_steps: Vec<SubStep>,
    pub reflect_template: String,
    #[serde(default)]
    pub quality_weights: RubricWeights,
    pub threshold: f64,
}

impl RoleSpec {
    pub fn think_prompt(
        &self,
        requirement: &str,
        task_name: &str,
        snapshot: &CollabSnapshot,
        knowledge: &str,
    ) -> String {
        self.think_template
            .replace("{requirement}", requirement)
            .replace("{task}", task_name)
            .replace("{shared}", &snapshot.render_shared())
            .replace("{knowledge}", knowledge)
    }

    pub fn act_prompt(
        &self,
        sub_step: &SubStep,
        requirement: &str,
        think: &ThinkOutput,
        snapshot: &CollabSnapshot,
    ) -> String {
        sub_step
            .prompt_template
            .replace("{requirement}", requirement)
            .replace("{summary}", &think.summary)
            .replace("{insights}", &think.insights.join("; "))
            .replace("{shared}", &snapshot.render_shared())
    }

    pub fn reflect_prompt(&self, content: &str) -> String {
        self.reflect_template.replace("{content}", content)
    }
}

/// Event sink an agent uses during a cycle. Implemented by the
/// orchestrator's session context; tests substitute a recorder.
#[async_trait]
pub trait AgentEvents: Send + Sync {
    /// Role transition: bumps the collaboration revision and publishes the
    /// corresponding state-delta.
    async fn set_role_state(&self, role: &str, state: AgentState);

    /// Atomic staging-map commit; returns the post-commit revision.
    async fn commit_shared(&self, staging: HashMap<String, serde_json::Value>) -> u64;

    /// Rate-limited task progress.
    async fn task_progress(&self, task_id: &str, progress: f64);

    /// Chat/error message authored by the agent.
    async fn agent_message(&self, role: &str, payload: MessagePayload);
}

/// Borrowed execution context for one task.
pub struct AgentContext {
    pub session_id: String,
    pub requirement: String,
    pub mode: SessionMode,
    pub collab: crate::session::CollaborationState,
    pub gateway: Arc<LlmGateway>,
    pub knowledge: Arc<dyn KnowledgeSearch>,
    pub events: Arc<dyn AgentEvents>,
    pub scope: CancelScope,
}
