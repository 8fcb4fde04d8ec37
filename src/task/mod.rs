//! Task entities for the per-session task tree.

mod tree;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use tree::TaskTree;

use crate::agent::QualityReview;
use crate::session::AgentState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub role: String,
    pub agent_id: String,
}

impl Participant {
    pub fn new(role: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            agent_id: agent_id.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub content: String,
    #[serde(default)]
    pub quality: Option<QualityReview>,
    /// Ids of artifacts produced by this task.
    #[serde(default)]
    pub artifacts: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub session_id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub participants: Vec<Participant>,
    pub status: AgentState,
    /// Non-decreasing; 1.0 exactly on terminal success.
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Weight used in the parent's progress roll-up.
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default)]
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub result: Option<TaskResult>,
}

fn default_weight() -> f64 {
    1.0
}

impl Task {
    pub fn new(
        id: impl Into<String>,
        session_id: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            session_id: session_id.into(),
            parent_id: None,
            name: name.into(),
            participants: Vec::new(),
            status: AgentState::Idle,
            progress: 0.0,
            dependencies: Vec::new(),
            weight: 1.0,
            retry_count: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
        }
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_dependencies(mut self, deps: Vec<String>) -> Self {
        self.dependencies = deps;
        self
    }

    pub fn with_participant(mut self, participant: Participant) -> Self {
        self.participants.push(participant);
        self
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn start(&mut self) {
        self.status = AgentState::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn succeed(&mut self, result: TaskResult) {
        self.status = AgentState::Succeeded;
        self.progress = 1.0;
        self.completed_at = Some(Utc::now());
        self.result = Some(result);
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = AgentState::Failed;
        self.completed_at = Some(Utc::now());
        self.result = Some(TaskResult {
            content: error.into(),
            quality: None,
            artifacts: Vec::new(),
        });
    }

    pub fn interrupt(&mut self) {
        self.status = AgentState::Interrupted;
        self.completed_at = Some(Utc::now());
    }

    /// Progress only moves forward; regressions are ignored.
    pub fn set_progress(&mut self, value: f64) {
        let clamped = value.clamp(0.0, 1.0);
        if clamped > self.progress {
            self.progress = clamped;
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_is_monotone() {
        let mut task = Task::new("t-1", "s-1", "analyze");
        task.set_progress(0.5);
        task.set_progress(0.25);
        assert_eq!(task.progress, 0.5);
        task.set_progress(2.0);
        assert_eq!(task.progress, 1.0);
    }

    #[test]
    fn test_success_pins_progress_to_one() {
        let mut task = Task::new("t-1", "s-1", "analyze");
        task.start();
        assert_eq!(task.status, AgentState::Running);
        task.succeed(TaskResult {
            content: "done".into(),
            quality: None,
            artifacts: Vec::new(),
        });
        assert_eq!(task.status, AgentState::Succeeded);
        assert_eq!(task.progress, 1.0);
        assert!(task.is_terminal());
    }

    #[test]
    fn test_interrupt_is_terminal_without_result() {
        let mut task = Task::new("t-1", "s-1", "analyze");
        task.start();
        task.interrupt();
        assert_eq!(task.status, AgentState::Interrupted);
        assert!(task.is_terminal());
        assert!(task.result.is_none());
    }
}
