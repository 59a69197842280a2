//! LLM provider implementations and the shared retry policy.
//!
//! Use `create_provider()` to instantiate a provider based on config. The
//! result is wrapped in a `RetryingProvider` so transient upstream failures
//! are retried with exponential backoff before a stage ever sees them.

pub mod openai_compat;

use crate::brain::LlmProvider;
use crate::config::LlmConfig;
use crate::error::{LlmError, TransientError};
use crate::types::{Completion, Prompt};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub use crate::config::RetryConfig;
pub use openai_compat::OpenAiCompatibleProvider;

/// Execute an async operation with exponential backoff retry on transient errors.
///
/// Permanent errors return immediately. A server-provided retry-after is
/// honoured when it is longer than the computed backoff.
pub async fn with_retry<F, Fut, T, E>(config: &RetryConfig, operation: F) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: TransientError + std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(val) => return Ok(val),
            Err(e) => {
                if !e.is_transient() || attempt >= config.max_retries {
                    return Err(e);
                }

                let backoff_ms = compute_backoff(config, attempt, &e);
                tracing::warn!(
                    attempt = attempt + 1,
                    max = config.max_retries,
                    backoff_ms = backoff_ms,
                    error = %e,
                    "Retrying after transient error"
                );
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                attempt += 1;
            }
        }
    }
}

/// Compute backoff delay, respecting retry-after hints.
fn compute_backoff<E: TransientError>(config: &RetryConfig, attempt: u32, err: &E) -> u64 {
    let computed = compute_exponential_backoff(config, attempt);
    match err.retry_after() {
        Some(server) => (server.as_millis() as u64).max(computed),
        None => computed,
    }
}

/// Pure exponential backoff with optional jitter.
fn compute_exponential_backoff(config: &RetryConfig, attempt: u32) -> u64 {
    let base = config.initial_backoff_ms as f64 * config.backoff_multiplier.powi(attempt as i32);
    let capped = base.min(config.max_backoff_ms as f64) as u64;
    if config.jitter {
        // Add up to 25% jitter
        let jitter = (capped as f64 * 0.25 * rand_simple()) as u64;
        capped + jitter
    } else {
        capped
    }
}

/// Cheap pseudo-random value in [0, 1) for jitter.
fn rand_simple() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos % 1000) as f64 / 1000.0
}

/// Decorator that retries transient failures of the wrapped provider.
pub struct RetryingProvider<P> {
    inner: P,
    retry: RetryConfig,
}

impl<P: LlmProvider> RetryingProvider<P> {
    pub fn new(inner: P, retry: RetryConfig) -> Self {
        Self { inner, retry }
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }
}

#[async_trait]
impl<P: LlmProvider> LlmProvider for RetryingProvider<P> {
    async fn complete(&self, prompt: &Prompt) -> Result<Completion, LlmError> {
        with_retry(&self.retry, || self.inner.complete(prompt)).await
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }
}

/// Create an LLM provider based on the configuration.
///
/// Every supported provider speaks the OpenAI chat completions format; the
/// provider name only selects defaults. Unknown names are logged and treated
/// as OpenAI-compatible.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    match config.provider.as_str() {
        "openai" | "azure" | "ollama" | "vllm" | "lmstudio" | "local" => {}
        other => {
            tracing::warn!(
                provider = %other,
                "Unknown provider; treating it as OpenAI-compatible"
            );
        }
    }
    let provider = OpenAiCompatibleProvider::new(config)?;
    tracing::info!(
        provider = %config.provider,
        model = %config.model,
        max_retries = config.retry.max_retries,
        "LLM provider initialized"
    );
    Ok(Arc::new(RetryingProvider::new(provider, config.retry.clone())))
}
