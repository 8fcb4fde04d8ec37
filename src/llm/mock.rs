//! Scripted provider for tests: a response queue, an optional fallback
//! handler, and an optional artificial latency.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{EngineError, Result};

use super::provider::{GenerateRequest, LlmProvider};

type Handler = dyn Fn(&GenerateRequest) -> Result<String> + Send + Sync;

#[derive(Default)]
pub struct MockProvider {
    queue: Mutex<VecDeque<Result<String>>>,
    handler: Option<Box<Handler>>,
    delay: Option<Duration>,
    calls: AtomicU64,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fallback used when the scripted queue is empty.
    pub fn with_handler(
        mut self,
        handler: impl Fn(&GenerateRequest) -> Result<String> + Send + Sync + 'static,
    ) -> Self {
        self.handler = Some(Box::new(handler));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push_ok(&self, text: impl Into<String>) {
        self.queue.lock().push_back(Ok(text.into()));
    }

    pub fn push_err(&self, err: EngineError) {
        self.queue.lock().push_back(Err(err));
    }

    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    async fn generate(&self, request: &GenerateRequest) -> Result<String> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(scripted) = self.queue.lock().pop_front() {
            return scripted;
        }
        if let Some(handler) = &self.handler {
            return handler(request);
        }
        Err(EngineError::Internal(format!(
            "mock provider has no response for prompt: {:.60}",
            request.prompt
        )))
    }

    fn name(&self) -> &str {
        "mock"
    }
}
