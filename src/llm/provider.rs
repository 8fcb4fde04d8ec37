//! Provider abstraction: the engine consumes `generate(prompt) -> text`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{LlmConfig, ModeParams};
use crate::error::Result;
use crate::session::SessionMode;

/// Call modes map to timeout, token and temperature budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallMode {
    Quick,
    Standard,
    Deep,
}

impl CallMode {
    pub fn params<'a>(&self, config: &'a LlmConfig) -> &'a ModeParams {
        match self {
            Self::Quick => &config.quick,
            Self::Standard => &config.standard,
            Self::Deep => &config.deep,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Quick => "quick",
            Self::Standard => "standard",
            Self::Deep => "deep",
        }
    }
}

impl From<SessionMode> for CallMode {
    fn from(mode: SessionMode) -> Self {
        match mode {
            SessionMode::Quick => Self::Quick,
            SessionMode::Standard | SessionMode::Workflow => Self::Standard,
            SessionMode::Deep => Self::Deep,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub prompt: String,
    pub system: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl GenerateRequest {
    pub fn new(prompt: impl Into<String>, params: &ModeParams) -> Self {
        Self {
            prompt: prompt.into(),
            system: None,
            max_tokens: params.max_tokens,
            temperature: params.temperature,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }
}

/// Implementations classify failures into the engine taxonomy:
/// network and 5xx failures as `Transient` (retryable), everything else as
/// `LlmUnavailable`.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn generate(&self, request: &GenerateRequest) -> Result<String>;

    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_params_mapping() {
        let config = LlmConfig::default();
        assert_eq!(CallMode::Quick.params(&config).timeout_secs, 20);
        assert_eq!(CallMode::Standard.params(&config).max_tokens, 4096);
        assert!((CallMode::Deep.params(&config).temperature - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_session_mode_conversion() {
        assert_eq!(CallMode::from(SessionMode::Quick), CallMode::Quick);
        assert_eq!(CallMode::from(SessionMode::Workflow), CallMode::Standard);
        assert_eq!(CallMode::from(SessionMode::Deep), CallMode::Deep);
    }
}
