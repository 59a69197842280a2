//! # Groundcheck Core
//!
//! Core library for Groundcheck, which grades support agents against a
//! knowledge base. A conversation is split into question/answer threads, each
//! question gets KB-grounded reference answers, and each agent answer is
//! scored from -1 (out of KB scope) to 5.

pub mod brain;
pub mod completion;
pub mod config;
pub mod draft;
pub mod error;
pub mod gateway;
pub mod orchestrator;
pub mod prompt;
pub mod providers;
pub mod retriever;
pub mod score;
pub mod segment;
pub mod types;

// Re-export commonly used types at the crate root.
pub use brain::{LlmProvider, MockLlmProvider, ModelCall};
pub use config::{GroundcheckConfig, load_config};
pub use error::{AnalysisError, GroundcheckError, LlmError, Result, RetrieverError, StageError};
pub use orchestrator::{AnalysisOrchestrator, AnalysisState, overall_accuracy};
pub use retriever::{HttpRetriever, KnowledgeRetriever, StaticRetriever};
pub use types::{
    AnalysisRequest, AnalysisResult, AnalysisWarning, Conversation, ConversationMessage,
    DraftAnswer, ExternalId, KbPassage, ParticipantRole, QuestionRating, Thread,
};
