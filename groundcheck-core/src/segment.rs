//! Stage 1: split a conversation into question/answer threads.
//!
//! One model call per conversation. When the completion is unusable or the
//! call fails, a heuristic pairs customer turns with the agent replies that
//! follow them, so a single bad completion never sinks the request.

use serde_json::Value;
use tracing::{info, warn};

use crate::brain::ModelCall;
use crate::completion::{ParsedCompletion, extract_json_object, string_field};
use crate::error::{AnalysisError, Stage};
use crate::prompt::build_segmentation_prompt;
use crate::types::{Conversation, ParticipantRole, Thread};

/// Where a segmentation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentationSource {
    Model,
    Heuristic,
}

/// Ordered threads of one conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct Segmentation {
    pub threads: Vec<Thread>,
    pub source: SegmentationSource,
}

/// Interpret a segmentation completion.
///
/// Threads missing a question or an answer are dropped. The completion is
/// unusable when no valid thread remains or when it claims more threads than
/// the conversation has customer messages.
pub fn parse_threads(text: &str, max_threads: usize) -> ParsedCompletion<Vec<Thread>> {
    let map = match extract_json_object(text) {
        ParsedCompletion::Parsed(map) => map,
        ParsedCompletion::Unparseable { raw, reason } => {
            return ParsedCompletion::Unparseable { raw, reason };
        }
    };
    let Some(Value::Array(items)) = map.get("threads") else {
        return ParsedCompletion::unparseable(text, "missing `threads` array");
    };

    let threads: Vec<Thread> = items
        .iter()
        .filter_map(|item| {
            let obj = item.as_object()?;
            let question = string_field(obj, &["question"])?;
            let answer = string_field(obj, &["answer", "agentAnswer", "agent_answer"])?;
            Some(Thread::new(question, answer))
        })
        .collect();

    if threads.is_empty() {
        return ParsedCompletion::unparseable(text, "no thread has both a question and an answer");
    }
    if threads.len() > max_threads {
        return ParsedCompletion::unparseable(
            text,
            format!(
                "{} threads for {} customer messages",
                threads.len(),
                max_threads
            ),
        );
    }
    ParsedCompletion::Parsed(threads)
}

/// Pair customer turns with the agent replies that follow them.
///
/// Consecutive customer messages form one question and the consecutive agent
/// messages after them form its answer. Agent messages before the first
/// customer message are skipped, and a final question nobody answered is
/// dropped.
pub fn heuristic_threads(conversation: &Conversation) -> Vec<Thread> {
    let mut threads = Vec::new();
    let mut question: Vec<&str> = Vec::new();
    let mut answer: Vec<&str> = Vec::new();

    for message in conversation.readable_messages() {
        let content = message.content.trim();
        match message.role {
            ParticipantRole::Customer => {
                if !answer.is_empty() {
                    threads.push(Thread::new(question.join(" "), answer.join("\n")));
                    question.clear();
                    answer.clear();
                }
                question.push(content);
            }
            ParticipantRole::Agent => {
                if !question.is_empty() {
                    answer.push(content);
                }
            }
        }
    }
    if !question.is_empty() && !answer.is_empty() {
        threads.push(Thread::new(question.join(" "), answer.join("\n")));
    }
    threads
}

/// Stage 1 component.
#[derive(Clone)]
pub struct ConversationSegmenter {
    model: ModelCall,
}

impl ConversationSegmenter {
    pub fn new(model: ModelCall) -> Self {
        Self { model }
    }

    /// Segment a conversation.
    ///
    /// Fails only when the model call fails and the heuristic finds no
    /// customer/agent pair either.
    pub async fn segment(&self, conversation: &Conversation) -> Result<Segmentation, AnalysisError> {
        let prompt = build_segmentation_prompt(&conversation.transcript());
        let max_threads = conversation.customer_message_count();

        let upstream_error = match self.model.complete(Stage::Segmentation, &prompt).await {
            Ok(completion) => match parse_threads(&completion.text, max_threads) {
                ParsedCompletion::Parsed(threads) => {
                    info!(
                        conversation_id = %conversation.id,
                        threads = threads.len(),
                        "Conversation segmented"
                    );
                    return Ok(Segmentation {
                        threads,
                        source: SegmentationSource::Model,
                    });
                }
                ParsedCompletion::Unparseable { reason, .. } => {
                    warn!(
                        conversation_id = %conversation.id,
                        reason = %reason,
                        "Unusable segmentation output; falling back to heuristic pairing"
                    );
                    None
                }
            },
            Err(e) => {
                warn!(
                    conversation_id = %conversation.id,
                    error = %e,
                    "Segmentation call failed; falling back to heuristic pairing"
                );
                Some(e)
            }
        };

        let threads = heuristic_threads(conversation);
        if let Some(source) = upstream_error
            && threads.is_empty()
        {
            return Err(AnalysisError::SegmentationFailed { source });
        }
        info!(
            conversation_id = %conversation.id,
            threads = threads.len(),
            "Conversation segmented heuristically"
        );
        Ok(Segmentation {
            threads,
            source: SegmentationSource::Heuristic,
        })
    }
}
