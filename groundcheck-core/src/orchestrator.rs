//! Runs the three stages for one request and aggregates the ratings.
//!
//! Segmentation runs once. Each thread then gets its own drafting/scoring
//! pipeline on the Tokio runtime, gated by a semaphore and bounded by the
//! request deadline and a cancellation token. Results are collected by thread
//! index, so output order never depends on completion order.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, info, info_span, warn};
use uuid::Uuid;

use crate::brain::{LlmProvider, ModelCall};
use crate::config::{GroundcheckConfig, PipelineConfig};
use crate::draft::AnswerDrafter;
use crate::error::{AnalysisError, GroundcheckError, StageError};
use crate::providers::create_provider;
use crate::retriever::{KnowledgeRetriever, create_retriever};
use crate::score::AgentScorer;
use crate::segment::ConversationSegmenter;
use crate::types::{AnalysisRequest, AnalysisResult, AnalysisWarning, QuestionRating, Thread};

/// Lifecycle of one analysis request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisState {
    Start,
    Segmented,
    Drafting,
    Scoring,
    Aggregated,
    Completed,
    Failed,
}

impl std::fmt::Display for AnalysisState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AnalysisState::Start => write!(f, "start"),
            AnalysisState::Segmented => write!(f, "segmented"),
            AnalysisState::Drafting => write!(f, "drafting"),
            AnalysisState::Scoring => write!(f, "scoring"),
            AnalysisState::Aggregated => write!(f, "aggregated"),
            AnalysisState::Completed => write!(f, "completed"),
            AnalysisState::Failed => write!(f, "failed"),
        }
    }
}

/// Mean of the in-scope scores, or `None` when nothing is in scope.
pub fn overall_accuracy(ratings: &[QuestionRating]) -> Option<f64> {
    let in_scope: Vec<f64> = ratings
        .iter()
        .filter(|r| r.is_in_scope())
        .map(|r| r.score)
        .collect();
    if in_scope.is_empty() {
        None
    } else {
        Some(in_scope.iter().sum::<f64>() / in_scope.len() as f64)
    }
}

/// Reject requests the pipeline cannot say anything about.
pub fn validate_request(request: &AnalysisRequest) -> Result<(), AnalysisError> {
    if request.kb_id.trim().is_empty() {
        return Err(AnalysisError::InvalidInput {
            reason: "integratedKbId is empty".to_string(),
        });
    }
    if request.conversation.messages.is_empty() {
        return Err(AnalysisError::InvalidInput {
            reason: "conversation has no messages".to_string(),
        });
    }
    if request.conversation.readable_messages().next().is_none() {
        return Err(AnalysisError::InvalidInput {
            reason: "conversation has only blank messages".to_string(),
        });
    }
    Ok(())
}

/// The drafting and scoring components shared by every thread pipeline.
#[derive(Clone)]
struct ThreadPipeline {
    drafter: AnswerDrafter,
    scorer: AgentScorer,
}

impl ThreadPipeline {
    async fn run(
        &self,
        conversation_id: &str,
        index: usize,
        thread: &Thread,
        kb_id: &str,
    ) -> Result<QuestionRating, StageError> {
        let started = std::time::Instant::now();
        debug!(conversation_id = %conversation_id, thread = index, state = %AnalysisState::Drafting, "Thread state");
        let draft = self.drafter.draft(thread, kb_id).await?;

        debug!(conversation_id = %conversation_id, thread = index, state = %AnalysisState::Scoring, "Thread state");
        let passages = draft.source_passages.clone();
        let rating = self.scorer.score(thread, &draft, &passages).await?;

        debug!(
            conversation_id = %conversation_id,
            thread = index,
            score = rating.score,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Thread scored"
        );
        Ok(rating)
    }
}

/// Sequences segmentation, drafting, scoring, and aggregation.
pub struct AnalysisOrchestrator {
    segmenter: ConversationSegmenter,
    pipeline: ThreadPipeline,
    retriever: Arc<dyn KnowledgeRetriever>,
    model_name: String,
    max_concurrency: usize,
    request_timeout: Duration,
    debug_payloads: bool,
}

impl AnalysisOrchestrator {
    pub fn new(
        llm: Arc<dyn LlmProvider>,
        retriever: Arc<dyn KnowledgeRetriever>,
        config: &PipelineConfig,
    ) -> Self {
        let model_name = llm.model_name().to_string();
        let call_timeout = Duration::from_secs(config.call_timeout_secs);
        let model = ModelCall::new(llm, call_timeout).with_payload_logging(config.debug_payloads);
        Self {
            segmenter: ConversationSegmenter::new(model.clone()),
            pipeline: ThreadPipeline {
                drafter: AnswerDrafter::new(
                    retriever.clone(),
                    model.clone(),
                    config.top_k,
                    call_timeout,
                ),
                scorer: AgentScorer::new(model),
            },
            retriever,
            model_name,
            max_concurrency: config.max_concurrency.max(1),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            debug_payloads: config.debug_payloads,
        }
    }

    /// Build the provider and retriever named by configuration.
    pub fn from_config(config: &GroundcheckConfig) -> Result<Self, GroundcheckError> {
        let llm = create_provider(&config.llm)?;
        let retriever = create_retriever(&config.retriever)?;
        Ok(Self::new(llm, retriever, &config.pipeline))
    }

    pub fn retriever(&self) -> &Arc<dyn KnowledgeRetriever> {
        &self.retriever
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    /// Analyze a conversation. Dropping the returned future cancels any
    /// in-flight thread pipelines.
    pub async fn analyze(&self, request: &AnalysisRequest) -> Result<AnalysisResult, AnalysisError> {
        self.analyze_with_cancellation(request, CancellationToken::new())
            .await
    }

    /// Analyze a conversation, stopping early when `cancel` fires. Threads that
    /// already finished are kept.
    pub async fn analyze_with_cancellation(
        &self,
        request: &AnalysisRequest,
        cancel: CancellationToken,
    ) -> Result<AnalysisResult, AnalysisError> {
        let span = info_span!("analysis", run_id = %Uuid::new_v4());
        self.run(request, cancel).instrument(span).await
    }

    async fn run(
        &self,
        request: &AnalysisRequest,
        cancel: CancellationToken,
    ) -> Result<AnalysisResult, AnalysisError> {
        let conversation = &request.conversation;
        let conversation_id = conversation.id.to_string();
        let started = Instant::now();
        let deadline = started + self.request_timeout;
        let budget_secs = self.request_timeout.as_secs();

        info!(
            conversation_id = %conversation_id,
            kb_id = %request.kb_id,
            messages = conversation.messages.len(),
            state = %AnalysisState::Start,
            "Analysis started"
        );
        if self.debug_payloads {
            debug!(
                conversation_id = %conversation_id,
                request = %serde_json::to_string(request).unwrap_or_default(),
                "Analysis request payload"
            );
        }

        if let Err(e) = validate_request(request) {
            self.fail(&conversation_id, &e);
            return Err(e);
        }

        // Cancelled when this future completes or is dropped.
        let run = cancel.child_token();
        let _run_guard = run.clone().drop_guard();

        let segmentation = tokio::select! {
            biased;
            _ = run.cancelled() => Err(AnalysisError::Cancelled),
            outcome = tokio::time::timeout_at(deadline, self.segmenter.segment(conversation)) => {
                outcome.unwrap_or(Err(AnalysisError::DeadlineExceeded { budget_secs }))
            }
        };
        let threads = match segmentation {
            Ok(segmentation) => segmentation.threads,
            Err(e) => {
                self.fail(&conversation_id, &e);
                return Err(e);
            }
        };
        debug!(
            conversation_id = %conversation_id,
            threads = threads.len(),
            state = %AnalysisState::Segmented,
            "Analysis state"
        );

        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let mut handles = Vec::with_capacity(threads.len());
        for (index, thread) in threads.iter().enumerate() {
            let pipeline = self.pipeline.clone();
            let thread = thread.clone();
            let kb_id = request.kb_id.clone();
            let conversation_id = conversation_id.clone();
            let semaphore = semaphore.clone();
            let token = run.clone();

            handles.push(tokio::spawn(async move {
                let work = async {
                    let _permit = match semaphore.acquire_owned().await {
                        Ok(permit) => permit,
                        Err(e) => {
                            return Err(StageError::Aborted {
                                message: e.to_string(),
                            });
                        }
                    };
                    pipeline.run(&conversation_id, index, &thread, &kb_id).await
                };
                tokio::select! {
                    biased;
                    _ = token.cancelled() => Err(StageError::Cancelled),
                    outcome = tokio::time::timeout_at(deadline, work) => {
                        outcome.unwrap_or(Err(StageError::DeadlineExceeded))
                    }
                }
            }
            .instrument(Span::current())));
        }

        let outcomes = futures::future::join_all(handles).await;

        let mut ratings = Vec::with_capacity(threads.len());
        let mut warnings = Vec::new();
        let mut deadline_hit = false;
        let mut cancelled = false;
        for (index, (thread, joined)) in threads.iter().zip(outcomes).enumerate() {
            let outcome = joined.unwrap_or_else(|e| {
                Err(StageError::Aborted {
                    message: e.to_string(),
                })
            });
            match outcome {
                Ok(rating) => ratings.push(rating),
                Err(e) => {
                    deadline_hit |= matches!(e, StageError::DeadlineExceeded);
                    cancelled |= matches!(e, StageError::Cancelled);
                    warn!(
                        conversation_id = %conversation_id,
                        thread = index,
                        stage = ?e.stage(),
                        error = %e,
                        "Thread omitted from analysis"
                    );
                    warnings.push(AnalysisWarning {
                        thread_index: index,
                        question: thread.question.clone(),
                        stage: e.stage(),
                        message: e.to_string(),
                    });
                }
            }
        }

        if ratings.is_empty() && (deadline_hit || cancelled) {
            let e = if deadline_hit {
                AnalysisError::DeadlineExceeded { budget_secs }
            } else {
                AnalysisError::Cancelled
            };
            self.fail(&conversation_id, &e);
            return Err(e);
        }

        let overall_accuracy = overall_accuracy(&ratings);
        debug!(
            conversation_id = %conversation_id,
            state = %AnalysisState::Aggregated,
            overall_accuracy = ?overall_accuracy,
            "Ratings aggregated"
        );

        let result = AnalysisResult {
            conversation_id: conversation.id.clone(),
            conversation_type: conversation.kind.clone(),
            overall_accuracy,
            question_ratings: ratings,
            warnings,
        };
        info!(
            conversation_id = %conversation_id,
            rated = result.question_ratings.len(),
            omitted = result.warnings.len(),
            overall_accuracy = ?result.overall_accuracy,
            elapsed_ms = started.elapsed().as_millis() as u64,
            state = %AnalysisState::Completed,
            "Analysis completed"
        );
        if self.debug_payloads {
            debug!(
                conversation_id = %conversation_id,
                response = %serde_json::to_string(&result).unwrap_or_default(),
                "Analysis response payload"
            );
        }
        Ok(result)
    }

    fn fail(&self, conversation_id: &str, error: &AnalysisError) {
        warn!(
            conversation_id = %conversation_id,
            state = %AnalysisState::Failed,
            error = %error,
            "Analysis failed"
        );
    }
}
