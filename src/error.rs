use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unknown session: {0}")]
    UnknownSession(String),

    #[error("Session is terminal: {0}")]
    SessionTerminal(String),

    #[error("Session {0} is not in the clarifying phase")]
    NotClarifying(String),

    #[error("Session limit reached ({limit} active)")]
    Busy { limit: usize },

    #[error("Cancelled")]
    Cancelled,

    #[error("Timeout after {budget_secs}s: {operation}")]
    Timeout {
        operation: String,
        budget_secs: u64,
    },

    #[error("Transient error: {0}")]
    Transient(String),

    #[error("LLM unavailable: {0}")]
    LlmUnavailable(String),

    #[error("Clarification exhausted after {rounds} rounds (overall quality {overall:.2})")]
    ClarificationExhausted { rounds: u32, overall: f64 },

    #[error("Stale session: {0}")]
    StaleSession(String),

    #[error("Idle timeout waiting for user input")]
    IdleTimeout,

    #[error("Replay unavailable: requested seq {requested}, oldest retained {oldest}")]
    ReplayUnavailable { requested: u64, oldest: u64 },

    #[error("Invalid task graph: {0}")]
    InvalidTaskGraph(String),

    #[error("Fatal agent error: {0}")]
    Fatal(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml_bw::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Recoverable within a task: retried in place by the scheduler.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout { .. })
    }

    /// Caller errors are surfaced as-is and never retried.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidInput(_)
                | Self::UnknownSession(_)
                | Self::SessionTerminal(_)
                | Self::NotClarifying(_)
                | Self::Busy { .. }
        )
    }

    /// Stable wire identifier for the error taxonomy.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::UnknownSession(_) => "unknown_session",
            Self::SessionTerminal(_) => "session_terminal",
            Self::NotClarifying(_) => "not_clarifying",
            Self::Busy { .. } => "busy",
            Self::Cancelled => "cancelled",
            Self::Timeout { .. } => "timeout",
            Self::Transient(_) => "transient",
            Self::LlmUnavailable(_) => "llm_unavailable",
            Self::ClarificationExhausted { .. } => "clarification_exhausted",
            Self::StaleSession(_) => "stale_session",
            Self::IdleTimeout => "idle_timeout",
            Self::ReplayUnavailable { .. } => "replay_unavailable",
            Self::InvalidTaskGraph(_) => "invalid_task_graph",
            Self::Fatal(_) => "fatal",
            Self::Config(_) => "config",
            Self::Store(_) => "store",
            Self::Parse(_) => "parse",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
            Self::Yaml(_) => "yaml",
            Self::Toml(_) => "toml",
            Self::Internal(_) => "internal",
        }
    }

    /// Process exit code: 0 normal, 64 configuration, 69 unavailable, 70 internal.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) | Self::Toml(_) | Self::InvalidInput(_) => 64,
            Self::LlmUnavailable(_) => 69,
            _ => 70,
        }
    }
}

/// Serializable error carried inside terminal events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl From<&EngineError> for ErrorInfo {
    fn from(err: &EngineError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

pub(crate) fn store_err(msg: impl Into<String>) -> EngineError {
    EngineError::Store(msg.into())
}

pub(crate) fn store_err_with(msg: &str, err: impl std::fmt::Display) -> EngineError {
    EngineError::Store(format!("{}: {}", msg, err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(EngineError::Cancelled.kind(), "cancelled");
        assert_eq!(EngineError::Busy { limit: 100 }.kind(), "busy");
        assert_eq!(EngineError::IdleTimeout.kind(), "idle_timeout");
    }

    #[test]
    fn test_transient_classification() {
        assert!(EngineError::Transient("think_parse".into()).is_transient());
        assert!(
            EngineError::Timeout {
                operation: "llm".into(),
                budget_secs: 20
            }
            .is_transient()
        );
        assert!(!EngineError::Fatal("bug".into()).is_transient());
        assert!(!EngineError::Cancelled.is_transient());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(EngineError::Config("bad".into()).exit_code(), 64);
        assert_eq!(EngineError::LlmUnavailable("down".into()).exit_code(), 69);
        assert_eq!(EngineError::Internal("bug".into()).exit_code(), 70);
    }

    #[test]
    fn test_error_info_roundtrip() {
        let info = ErrorInfo::from(&EngineError::IdleTimeout);
        assert_eq!(info.kind, "idle_timeout");
        let json = serde_json::to_string(&info).unwrap();
        let back: ErrorInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back, info);
    }
}
