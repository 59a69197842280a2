//! Error types for the Groundcheck core library.
//!
//! Uses `thiserror` for public API error types. Errors are split by blast
//! radius: upstream errors (`LlmError`, `RetrieverError`) describe a single
//! outbound call, `StageError` describes the loss of one thread, and
//! `AnalysisError` is the only kind that fails a whole request.

use std::path::PathBuf;
use std::time::Duration;

/// Top-level error type for the Groundcheck core library.
#[derive(Debug, thiserror::Error)]
pub enum GroundcheckError {
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Retriever error: {0}")]
    Retriever(#[from] RetrieverError),

    #[error("Analysis error: {0}")]
    Analysis(#[from] AnalysisError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from language-model provider interactions.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LlmError {
    #[error("Upstream model unavailable: {message}")]
    UpstreamUnavailable { message: String },

    #[error("Upstream model timed out after {timeout_secs}s")]
    UpstreamTimeout { timeout_secs: u64 },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("API request failed: {message}")]
    ApiRequest { message: String },

    #[error("API response parse error: {message}")]
    ResponseParse { message: String },
}

/// Errors from knowledge-base retrieval.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RetrieverError {
    #[error("Retriever unavailable: {message}")]
    Unavailable { message: String },

    #[error("Retriever timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Retriever returned an invalid response: {message}")]
    InvalidResponse { message: String },
}

/// The pipeline stage a per-thread failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Segmentation,
    Drafting,
    Scoring,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Segmentation => write!(f, "segmentation"),
            Stage::Drafting => write!(f, "drafting"),
            Stage::Scoring => write!(f, "scoring"),
        }
    }
}

/// A failure confined to one thread's drafting/scoring pipeline.
///
/// These never abort sibling threads; the orchestrator turns them into
/// warnings on the response.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StageError {
    #[error("drafting call failed: {0}")]
    Draft(LlmError),

    #[error("scoring call failed: {0}")]
    Score(LlmError),

    #[error("malformed {stage} output: {reason}")]
    MalformedOutput { stage: Stage, reason: String },

    #[error("request deadline exceeded before the thread completed")]
    DeadlineExceeded,

    #[error("analysis was cancelled before the thread completed")]
    Cancelled,

    #[error("thread pipeline aborted: {message}")]
    Aborted { message: String },
}

impl StageError {
    /// The stage the failure is attributed to, when known.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            StageError::Draft(_) => Some(Stage::Drafting),
            StageError::Score(_) => Some(Stage::Scoring),
            StageError::MalformedOutput { stage, .. } => Some(*stage),
            StageError::DeadlineExceeded | StageError::Cancelled | StageError::Aborted { .. } => {
                None
            }
        }
    }
}

/// Request-fatal errors surfaced to the caller instead of an `AnalysisResult`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AnalysisError {
    #[error("Invalid input: {reason}")]
    InvalidInput { reason: String },

    #[error("Segmentation failed and no fallback thread could be produced: {source}")]
    SegmentationFailed {
        #[source]
        source: LlmError,
    },

    #[error("Analysis exceeded its {budget_secs}s budget with no completed threads")]
    DeadlineExceeded { budget_secs: u64 },

    #[error("Analysis was cancelled with no completed threads")]
    Cancelled,
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Environment variable not set: {var}")]
    EnvVarMissing { var: String },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },
}

/// Errors that a retry policy can classify as transient.
pub trait TransientError {
    /// Whether retrying the same call may succeed.
    fn is_transient(&self) -> bool;

    /// Minimum delay requested by the server before the next attempt.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

impl TransientError for LlmError {
    fn is_transient(&self) -> bool {
        matches!(
            self,
            LlmError::UpstreamUnavailable { .. }
                | LlmError::UpstreamTimeout { .. }
                | LlmError::RateLimited { .. }
        )
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            LlmError::RateLimited { retry_after_secs } => {
                Some(Duration::from_secs(*retry_after_secs))
            }
            _ => None,
        }
    }
}

impl TransientError for RetrieverError {
    fn is_transient(&self) -> bool {
        matches!(
            self,
            RetrieverError::Unavailable { .. } | RetrieverError::Timeout { .. }
        )
    }
}

/// A type alias for results using the top-level `GroundcheckError`.
pub type Result<T> = std::result::Result<T, GroundcheckError>;
