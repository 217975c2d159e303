//! Retry with exponential backoff for retryable completion errors.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{instrument, warn};

use crate::io::config::RetryConfig;
use crate::llm::{Completion, CompletionPort, CompletionRequest, LlmError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }

    pub fn none() -> Self {
        Self {
            max_retries: 0,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (1-based): `initial * 2^(attempt-1)`, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Call `op` until it succeeds, fails with a non-retryable code, or retries run out.
    pub fn run<T>(&self, mut op: impl FnMut() -> Result<T, LlmError>) -> Result<T, LlmError> {
        let mut attempt = 0;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if err.code.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    let delay = self.backoff(attempt);
                    warn!(code = %err.code, attempt, delay_ms = delay.as_millis() as u64, "retrying completion");
                    thread::sleep(delay);
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Completion port decorator applying a [`RetryPolicy`].
pub struct Retrying {
    inner: Arc<dyn CompletionPort>,
    policy: RetryPolicy,
}

impl Retrying {
    pub fn new(inner: Arc<dyn CompletionPort>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

impl CompletionPort for Retrying {
    #[instrument(skip_all, fields(max_retries = self.policy.max_retries))]
    fn create_completion(&self, request: &CompletionRequest) -> Result<Completion, LlmError> {
        self.policy.run(|| self.inner.create_completion(request))
    }
}
