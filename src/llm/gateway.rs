//! Concurrency-limited, timeout-bounded, circuit-broken provider wrapper.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::config::LlmConfig;
use crate::error::{EngineError, Result};
use crate::scope::CancelScope;

use super::breaker::CircuitBreaker;
use super::provider::{CallMode, GenerateRequest, LlmProvider};

pub struct LlmGateway {
    provider: Arc<dyn LlmProvider>,
    /// Process-global in-flight cap; waiters queue FIFO and abandon the
    /// queue on caller cancellation.
    semaphore: Arc<Semaphore>,
    breaker: CircuitBreaker,
    config: LlmConfig,
    jitter_seed: AtomicU64,
}

impl LlmGateway {
    pub fn new(provider: Arc<dyn LlmProvider>, config: LlmConfig) -> Self {
        Self {
            provider,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent)),
            breaker: CircuitBreaker::new(config.breaker.clone()),
            config,
            jitter_seed: AtomicU64::new(1),
        }
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Single entry point for all provider calls.
    pub async fn generate(
        &self,
        prompt: &str,
        mode: CallMode,
        scope: &CancelScope,
    ) -> Result<String> {
        let params = mode.params(&self.config).clone();
        let request = GenerateRequest::new(prompt, &params);
        let timeout = Duration::from_secs(params.timeout_secs);

        let permit = scope
            .run(self.semaphore.acquire())
            .await?
            .map_err(|_| EngineError::Internal("llm semaphore closed".into()))?;

        let mut attempt: u32 = 0;
        let result = loop {
            scope.check()?;
            self.breaker.try_acquire()?;

            let outcome = scope
                .run_with_deadline("llm_generate", timeout, self.provider.generate(&request))
                .await;

            match outcome {
                Ok(Ok(text)) => {
                    self.breaker.record_success();
                    break Ok(text);
                }
                Ok(Err(err)) => {
                    self.breaker.record_failure();
                    if err.is_transient() && attempt < self.config.retry.max_retries {
                        let delay = self.backoff_delay(attempt);
                        warn!(
                            provider = self.provider.name(),
                            attempt = attempt + 1,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "Retrying provider call"
                        );
                        scope.sleep(delay).await?;
                        attempt += 1;
                        continue;
                    }
                    break Err(err);
                }
                // Caller cancelled while the call was in flight; the
                // provider future is dropped, which aborts the request.
                Err(EngineError::Cancelled) => break Err(EngineError::Cancelled),
                Err(timeout_err) => {
                    // Timeouts count against the breaker but only network
                    // and 5xx failures are retried.
                    self.breaker.record_failure();
                    break Err(timeout_err);
                }
            }
        };
        drop(permit);

        if let Ok(text) = &result {
            debug!(
                provider = self.provider.name(),
                mode = mode.as_str(),
                chars = text.len(),
                "Provider call completed"
            );
        }
        result
    }

    /// Exponential backoff with deterministic ±jitter.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base_ms = self
            .config
            .retry
            .backoff_ms
            .get(attempt as usize)
            .copied()
            .or_else(|| self.config.retry.backoff_ms.last().copied())
            .unwrap_or(250);

        let seed = self.jitter_seed.fetch_add(1, Ordering::Relaxed);
        let hashed = seed.wrapping_mul(2654435761);
        // Spread over [-1.0, 1.0].
        let spread = ((hashed % 2001) as f64 - 1000.0) / 1000.0;
        let jitter = base_ms as f64 * (self.config.retry.jitter_pct as f64 / 100.0) * spread;
        Duration::from_millis((base_ms as f64 + jitter).max(0.0) as u64)
    }
}
