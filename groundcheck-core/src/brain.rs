//! Language-model abstraction.
//!
//! Every stage talks to the model through `LlmProvider`, so the pipeline is
//! testable with `MockLlmProvider` and provider-agnostic in production.

use crate::error::{LlmError, Stage};
use crate::types::{Completion, Prompt, TokenUsage};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

/// Trait for language-model providers.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Send a rendered prompt and return the raw completion.
    async fn complete(&self, prompt: &Prompt) -> Result<Completion, LlmError>;

    /// Return the model name.
    fn model_name(&self) -> &str;
}

#[async_trait]
impl<P: LlmProvider + ?Sized> LlmProvider for Arc<P> {
    async fn complete(&self, prompt: &Prompt) -> Result<Completion, LlmError> {
        (**self).complete(prompt).await
    }

    fn model_name(&self) -> &str {
        (**self).model_name()
    }
}

/// A provider bound to the per-call policy a pipeline stage runs under.
#[derive(Clone)]
pub struct ModelCall {
    llm: Arc<dyn LlmProvider>,
    timeout: Duration,
    log_payloads: bool,
}

impl ModelCall {
    pub fn new(llm: Arc<dyn LlmProvider>, timeout: Duration) -> Self {
        Self {
            llm,
            timeout,
            log_payloads: false,
        }
    }

    /// Log full prompts and completions at debug level.
    pub fn with_payload_logging(mut self, enabled: bool) -> Self {
        self.log_payloads = enabled;
        self
    }

    pub fn model_name(&self) -> &str {
        self.llm.model_name()
    }

    /// Complete a prompt, failing with `UpstreamTimeout` once the call
    /// (retries included) outlives the configured timeout.
    pub async fn complete(&self, stage: Stage, prompt: &Prompt) -> Result<Completion, LlmError> {
        if self.log_payloads {
            debug!(stage = %stage, system = %prompt.system, user = %prompt.user, "Model prompt");
        }
        let started = Instant::now();
        let completion = tokio::time::timeout(self.timeout, self.llm.complete(prompt))
            .await
            .map_err(|_| LlmError::UpstreamTimeout {
                timeout_secs: self.timeout.as_secs(),
            })??;
        debug!(
            stage = %stage,
            model = %completion.model,
            input_tokens = completion.usage.input_tokens,
            output_tokens = completion.usage.output_tokens,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Model call completed"
        );
        if self.log_payloads {
            debug!(stage = %stage, completion = %completion.text, "Model completion");
        }
        Ok(completion)
    }
}

type Responder = dyn Fn(&Prompt) -> Result<Completion, LlmError> + Send + Sync;

/// A mock LLM provider for testing and development.
///
/// Answers from a FIFO queue, or from a responder closure that inspects the
/// prompt. Closures keep concurrent tests deterministic, since the answer
/// depends on what was asked rather than on call order.
pub struct MockLlmProvider {
    model: String,
    responses: Mutex<VecDeque<Result<Completion, LlmError>>>,
    responder: Option<Arc<Responder>>,
    calls: AtomicUsize,
    prompts: Mutex<Vec<Prompt>>,
}

impl MockLlmProvider {
    pub fn new() -> Self {
        Self {
            model: "mock-model".to_string(),
            responses: Mutex::new(VecDeque::new()),
            responder: None,
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Create a MockLlmProvider that always returns the given text.
    pub fn with_response(text: &str) -> Self {
        let text = text.to_string();
        Self::with_responder(move |_| Ok(Self::text_response(&text)))
    }

    /// Create a MockLlmProvider that computes each answer from the prompt.
    pub fn with_responder<F>(responder: F) -> Self
    where
        F: Fn(&Prompt) -> Result<Completion, LlmError> + Send + Sync + 'static,
    {
        Self {
            responder: Some(Arc::new(responder)),
            ..Self::new()
        }
    }

    /// Queue a response to be returned by the next `complete` call.
    pub fn queue_response(&self, response: Completion) {
        self.lock_responses().push_back(Ok(response));
    }

    /// Queue an error to be returned by the next `complete` call.
    pub fn queue_error(&self, error: LlmError) {
        self.lock_responses().push_back(Err(error));
    }

    /// Queue a text response.
    pub fn queue_text(&self, text: &str) {
        self.queue_response(Self::text_response(text));
    }

    /// Create a simple text response for testing.
    pub fn text_response(text: &str) -> Completion {
        Completion {
            text: text.to_string(),
            model: "mock-model".to_string(),
            usage: TokenUsage {
                input_tokens: 100,
                output_tokens: 50,
            },
            finish_reason: Some("stop".to_string()),
        }
    }

    /// Create a response carrying serialized JSON.
    pub fn json_response(value: serde_json::Value) -> Completion {
        Self::text_response(&value.to_string())
    }

    /// Number of `complete` calls made so far.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every prompt received, in call order.
    pub fn prompts(&self) -> Vec<Prompt> {
        match self.prompts.lock() {
            Ok(prompts) => prompts.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn lock_responses(&self) -> std::sync::MutexGuard<'_, VecDeque<Result<Completion, LlmError>>> {
        match self.responses.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for MockLlmProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmProvider for MockLlmProvider {
    async fn complete(&self, prompt: &Prompt) -> Result<Completion, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.prompts.lock() {
            Ok(mut prompts) => prompts.push(prompt.clone()),
            Err(poisoned) => poisoned.into_inner().push(prompt.clone()),
        }

        if let Some(queued) = self.lock_responses().pop_front() {
            return queued;
        }
        if let Some(responder) = &self.responder {
            return responder(prompt);
        }
        Ok(MockLlmProvider::text_response(
            "I'm a mock LLM. No queued responses available.",
        ))
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
