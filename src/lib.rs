pub mod agent;
pub mod bus;
pub mod config;
pub mod error;
pub mod knowledge;
pub mod llm;
pub mod orchestrator;
pub mod roles;
pub mod scope;
pub mod session;
pub mod store;
pub mod task;

pub use agent::{AgentRuntime, QualityReview, RoleSpec};
pub use bus::{EventBus, EventKind, EventPayload, EventStream, SessionEvent};
pub use config::EngineConfig;
pub use error::{EngineError, ErrorInfo, Result};
pub use knowledge::{KnowledgeSearch, NullKnowledge, Snippet};
pub use llm::{CallMode, LlmGateway, LlmProvider, MockProvider, OpenAiProvider, build_provider};
pub use orchestrator::{AnswerBatch, Orchestrator};
pub use roles::{RoleRegistry, SPEC_ARTIFACT_NAME};
pub use scope::CancelScope;
pub use session::{
    AgentState, Artifact, ClarificationRound, CollaborationState, Dimension, Message,
    QualitySnapshot, Question, QuestionPriority, Session, SessionMode, SessionPhase,
    SessionSnapshot,
};
pub use store::SessionStore;
pub use task::{Task, TaskResult, TaskTree};
