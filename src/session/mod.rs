//! Session entities: modes, phase machine, messages, artifacts.

mod clarification;
mod collaboration;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use clarification::{
    ClarificationRound, Dimension, DimensionScore, Question, QuestionPriority, QualitySnapshot,
    RecordOutcome,
};
pub use collaboration::{AgentState, CollabSnapshot, CollaborationState};

use crate::error::ErrorInfo;
use crate::task::Task;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    Quick,
    #[default]
    Standard,
    Deep,
    Workflow,
}

impl SessionMode {
    /// Quick mode skips the review phase entirely.
    pub fn skips_review(&self) -> bool {
        matches!(self, Self::Quick)
    }

    /// Deep mode may re-document once after a failed review.
    pub fn allows_redocument(&self) -> bool {
        matches!(self, Self::Deep)
    }
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Quick => "quick",
            Self::Standard => "standard",
            Self::Deep => "deep",
            Self::Workflow => "workflow",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    #[default]
    Clarifying,
    Analyzing,
    Documenting,
    Reviewing,
    Done,
    Failed,
}

impl SessionPhase {
    pub fn allowed_transitions(&self) -> &'static [SessionPhase] {
        use SessionPhase::*;
        match self {
            Clarifying => &[Analyzing, Failed],
            Analyzing => &[Documenting, Failed],
            Documenting => &[Reviewing, Done, Failed],
            Reviewing => &[Done, Documenting, Failed],
            Done => &[],
            Failed => &[],
        }
    }

    pub fn can_transition_to(&self, target: SessionPhase) -> bool {
        self.allowed_transitions().contains(&target)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Clarifying => "clarifying",
            Self::Analyzing => "analyzing",
            Self::Documenting => "documenting",
            Self::Reviewing => "reviewing",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Agent,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Chat,
    Progress,
    Artifact,
    Error,
}

/// Typed message bodies; no free-form maps cross component boundaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePayload {
    Chat { text: String },
    Questions { round: u32, questions: Vec<Question> },
    Answers { round: u32, count: usize },
    ArtifactRef { artifact_id: String, name: String },
    Error { error: ErrorInfo },
}

impl MessagePayload {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Chat { .. } | Self::Questions { .. } | Self::Answers { .. } => MessageKind::Chat,
            Self::ArtifactRef { .. } => MessageKind::Artifact,
            Self::Error { .. } => MessageKind::Error,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub session_id: String,
    pub role: MessageRole,
    /// Role id of the author: a role name, "user", or "system".
    pub author: String,
    pub kind: MessageKind,
    pub timestamp: DateTime<Utc>,
    pub payload: MessagePayload,
}

impl Message {
    pub fn new(
        session_id: impl Into<String>,
        role: MessageRole,
        author: impl Into<String>,
        payload: MessagePayload,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            role,
            author: author.into(),
            kind: payload.kind(),
            timestamp: Utc::now(),
            payload,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,
    pub session_id: String,
    pub name: String,
    pub content_type: String,
    pub text: String,
    /// Task that produced this artifact; must be terminal-successful before
    /// the artifact becomes externally visible.
    pub produced_by: String,
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    pub fn new(
        session_id: impl Into<String>,
        name: impl Into<String>,
        content_type: impl Into<String>,
        text: impl Into<String>,
        produced_by: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            name: name.into(),
            content_type: content_type.into(),
            text: text.into(),
            produced_by: produced_by.into(),
            created_at: Utc::now(),
        }
    }
}

/// Durable session record. The whole record is written atomically; the task
/// tree and clarification history are snapshotted into it on every save so
/// that recovery reproduces phase, revision and last event sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub mode: SessionMode,
    pub phase: SessionPhase,
    pub requirement: String,
    #[serde(default)]
    pub project_context: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub progress: f64,
    /// Collaboration state revision at last save.
    #[serde(default)]
    pub revision: u64,
    /// Collaboration shared data at last save, for resume.
    #[serde(default)]
    pub collab_shared: std::collections::HashMap<String, serde_json::Value>,
    /// Role states at last save, for resume.
    #[serde(default)]
    pub collab_roles: std::collections::HashMap<String, AgentState>,
    /// Last event sequence assigned for this session.
    #[serde(default)]
    pub last_seq: u64,
    #[serde(default)]
    pub error: Option<ErrorInfo>,
    #[serde(default)]
    pub rounds: Vec<ClarificationRound>,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl Session {
    pub fn new(id: impl Into<String>, requirement: impl Into<String>, mode: SessionMode) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            mode,
            phase: SessionPhase::Clarifying,
            requirement: requirement.into(),
            project_context: None,
            created_at: now,
            updated_at: now,
            progress: 0.0,
            revision: 0,
            collab_shared: std::collections::HashMap::new(),
            collab_roles: std::collections::HashMap::new(),
            last_seq: 0,
            error: None,
            rounds: Vec::new(),
            tasks: Vec::new(),
            artifacts: Vec::new(),
            messages: Vec::new(),
        }
    }

    pub fn with_project_context(mut self, context: Option<String>) -> Self {
        self.project_context = context;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    pub fn current_round(&self) -> Option<&ClarificationRound> {
        self.rounds.last()
    }

    pub fn current_round_mut(&mut self) -> Option<&mut ClarificationRound> {
        self.rounds.last_mut()
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Snapshot returned by `get_session`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: String,
    pub mode: SessionMode,
    pub phase: SessionPhase,
    pub progress: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub error: Option<ErrorInfo>,
    pub last_round: Option<ClarificationRound>,
    pub artifacts: Vec<Artifact>,
}

impl From<&Session> for SessionSnapshot {
    fn from(session: &Session) -> Self {
        Self {
            id: session.id.clone(),
            mode: session.mode,
            phase: session.phase,
            progress: session.progress,
            created_at: session.created_at,
            updated_at: session.updated_at,
            error: session.error.clone(),
            last_round: session.rounds.last().cloned(),
            artifacts: session.artifacts.clone(),
        }
    }
}
