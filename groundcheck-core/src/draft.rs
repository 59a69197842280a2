//! Stage 2: draft KB-grounded reference answers for one thread.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use crate::brain::ModelCall;
use crate::completion::{ParsedCompletion, extract_json_object};
use crate::error::{RetrieverError, Stage, StageError};
use crate::prompt::build_draft_prompt;
use crate::retriever::KnowledgeRetriever;
use crate::types::{DraftAnswer, KbPassage, Thread};

const SHORT_KEYS: &[&str] = &["ai_suggested_answer", "short", "suggested_answer"];
const LONG_KEYS: &[&str] = &["ai_detailed_answer", "long", "detailed_answer"];

/// Order retrieved passages by descending confidence and keep the best `k`
/// that carry any content. Ties keep retriever order.
pub fn prepare_passages(mut passages: Vec<KbPassage>, k: usize) -> Vec<KbPassage> {
    passages.retain(|p| !p.content.trim().is_empty());
    passages.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    passages.truncate(k);
    passages
}

/// An answer field is either a bare string or `{"answer": ..., "context": ...}`.
fn answer_field(map: &serde_json::Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| {
        let text = match map.get(*key)? {
            Value::String(s) => s.as_str(),
            Value::Object(obj) => obj.get("answer")?.as_str()?,
            _ => return None,
        };
        let text = text.trim();
        (!text.is_empty()).then(|| text.to_string())
    })
}

/// Interpret a drafting completion as `(short, long)` answers.
///
/// A lone answer fills both slots. Prose without any JSON object is taken
/// as both answers. Empty completions and JSON without answer fields are
/// unusable.
pub fn parse_draft(text: &str) -> ParsedCompletion<(String, String)> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return ParsedCompletion::unparseable(text, "empty completion");
    }
    match extract_json_object(trimmed) {
        ParsedCompletion::Parsed(map) => {
            match (answer_field(&map, SHORT_KEYS), answer_field(&map, LONG_KEYS)) {
                (Some(short), Some(long)) => ParsedCompletion::Parsed((short, long)),
                (Some(one), None) | (None, Some(one)) => ParsedCompletion::Parsed((one.clone(), one)),
                (None, None) => ParsedCompletion::unparseable(text, "no answer fields in JSON"),
            }
        }
        ParsedCompletion::Unparseable { .. } if !trimmed.contains('{') => {
            ParsedCompletion::Parsed((trimmed.to_string(), trimmed.to_string()))
        }
        ParsedCompletion::Unparseable { raw, reason } => ParsedCompletion::Unparseable { raw, reason },
    }
}

/// Stage 2 component.
#[derive(Clone)]
pub struct AnswerDrafter {
    retriever: Arc<dyn KnowledgeRetriever>,
    model: ModelCall,
    top_k: usize,
    retrieval_timeout: Duration,
}

impl AnswerDrafter {
    pub fn new(
        retriever: Arc<dyn KnowledgeRetriever>,
        model: ModelCall,
        top_k: usize,
        retrieval_timeout: Duration,
    ) -> Self {
        Self {
            retriever,
            model,
            top_k,
            retrieval_timeout,
        }
    }

    /// Retrieve passages for a question. Retrieval failures, including a
    /// retriever that outlives the call timeout, degrade to an empty list.
    pub async fn retrieve(&self, question: &str, kb_id: &str) -> Vec<KbPassage> {
        let outcome = tokio::time::timeout(
            self.retrieval_timeout,
            self.retriever.retrieve(question, kb_id, self.top_k),
        )
        .await
        .unwrap_or_else(|_| {
            Err(RetrieverError::Timeout {
                timeout_secs: self.retrieval_timeout.as_secs(),
            })
        });

        match outcome {
            Ok(passages) => {
                let passages = prepare_passages(passages, self.top_k);
                debug!(kb_id = %kb_id, passages = passages.len(), "Retrieved KB passages");
                passages
            }
            Err(e) => {
                warn!(
                    kb_id = %kb_id,
                    retriever = %self.retriever.name(),
                    error = %e,
                    "Retrieval failed; drafting without KB evidence"
                );
                Vec::new()
            }
        }
    }

    /// Draft short and long reference answers for a thread.
    pub async fn draft(&self, thread: &Thread, kb_id: &str) -> Result<DraftAnswer, StageError> {
        let passages = self.retrieve(&thread.question, kb_id).await;
        let prompt = build_draft_prompt(&thread.question, &passages);

        let completion = self
            .model
            .complete(Stage::Drafting, &prompt)
            .await
            .map_err(StageError::Draft)?;

        match parse_draft(&completion.text) {
            ParsedCompletion::Parsed((short_answer, long_answer)) => Ok(DraftAnswer {
                short_answer,
                long_answer,
                source_passages: passages,
            }),
            ParsedCompletion::Unparseable { reason, .. } => Err(StageError::MalformedOutput {
                stage: Stage::Drafting,
                reason,
            }),
        }
    }
}
