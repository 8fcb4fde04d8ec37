//! LLM gateway: provider abstraction, circuit breaker, global concurrency
//! limit and per-call timeouts.

mod breaker;
mod gateway;
mod mock;
mod openai;
mod provider;

pub use breaker::{BreakerState, CircuitBreaker};
pub use gateway::LlmGateway;
pub use mock::MockProvider;
pub use openai::OpenAiProvider;
pub use provider::{CallMode, GenerateRequest, LlmProvider};

use std::sync::Arc;

use crate::config::LlmConfig;
use crate::error::{EngineError, Result};

/// Builds the provider named in the configuration.
pub fn build_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>> {
    match config.provider.as_str() {
        "openai" => {
            let endpoint = config
                .endpoint
                .clone()
                .ok_or_else(|| EngineError::Config("LLM_ENDPOINT is required".into()))?;
            Ok(Arc::new(OpenAiProvider::new(
                endpoint,
                config.model.clone(),
                config.api_key.clone(),
            )))
        }
        "mock" => Ok(Arc::new(MockProvider::new())),
        other => Err(EngineError::Config(format!(
            "unknown LLM provider: {}",
            other
        ))),
    }
}
