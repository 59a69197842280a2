//! Core types for Groundcheck: conversations, threads, KB passages, ratings,
//! the public request/response contract, and language-model prompt types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Stage;

/// Lowest score on the rating scale; marks a question the KB cannot answer.
pub const OUT_OF_SCOPE_SCORE: f64 = -1.0;

/// Highest score on the rating scale.
pub const MAX_SCORE: f64 = 5.0;

/// Identifier supplied by the caller. Upstream systems send either numbers or
/// strings, and the value is echoed back verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExternalId {
    Numeric(i64),
    Text(String),
}

impl std::fmt::Display for ExternalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExternalId::Numeric(n) => write!(f, "{}", n),
            ExternalId::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for ExternalId {
    fn from(value: i64) -> Self {
        ExternalId::Numeric(value)
    }
}

impl From<&str> for ExternalId {
    fn from(value: &str) -> Self {
        ExternalId::Text(value.to_string())
    }
}

impl From<String> for ExternalId {
    fn from(value: String) -> Self {
        ExternalId::Text(value)
    }
}

/// Who wrote a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    Customer,
    Agent,
}

impl ParticipantRole {
    /// Prefix used when rendering a transcript line.
    pub fn transcript_label(&self) -> &'static str {
        match self {
            ParticipantRole::Customer => "Customer",
            ParticipantRole::Agent => "Agent",
        }
    }
}

impl std::fmt::Display for ParticipantRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParticipantRole::Customer => write!(f, "customer"),
            ParticipantRole::Agent => write!(f, "agent"),
        }
    }
}

/// A single message of a support conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub id: ExternalId,
    pub role: ParticipantRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl ConversationMessage {
    pub fn new(id: impl Into<ExternalId>, role: ParticipantRole, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role,
            content: content.into(),
            timestamp: None,
        }
    }

    pub fn customer(id: impl Into<ExternalId>, content: impl Into<String>) -> Self {
        Self::new(id, ParticipantRole::Customer, content)
    }

    pub fn agent(id: impl Into<ExternalId>, content: impl Into<String>) -> Self {
        Self::new(id, ParticipantRole::Agent, content)
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Whether the message carries any text worth reading.
    pub fn is_blank(&self) -> bool {
        self.content.trim().is_empty()
    }
}

/// A support conversation. Message order is the canonical reading order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ExternalId,
    #[serde(rename = "type", default = "default_conversation_type")]
    pub kind: String,
    #[serde(default)]
    pub messages: Vec<ConversationMessage>,
}

fn default_conversation_type() -> String {
    "chat".to_string()
}

impl Conversation {
    pub fn new(id: impl Into<ExternalId>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            messages: Vec::new(),
        }
    }

    pub fn with_message(mut self, message: ConversationMessage) -> Self {
        self.messages.push(message);
        self
    }

    /// Non-blank messages in reading order.
    pub fn readable_messages(&self) -> impl Iterator<Item = &ConversationMessage> {
        self.messages.iter().filter(|m| !m.is_blank())
    }

    /// Number of non-blank customer messages; an upper bound on thread count.
    pub fn customer_message_count(&self) -> usize {
        self.readable_messages()
            .filter(|m| m.role == ParticipantRole::Customer)
            .count()
    }

    /// Render the conversation as role-prefixed transcript lines.
    pub fn transcript(&self) -> String {
        self.readable_messages()
            .map(|m| format!("{}: {}", m.role.transcript_label(), m.content.trim()))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Public request contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub conversation: Conversation,
    #[serde(rename = "integratedKbId")]
    pub kb_id: String,
}

impl AnalysisRequest {
    pub fn new(conversation: Conversation, kb_id: impl Into<String>) -> Self {
        Self {
            conversation,
            kb_id: kb_id.into(),
        }
    }
}

/// One customer intent paired with the agent's reply to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thread {
    pub question: String,
    pub agent_answer: String,
}

impl Thread {
    pub fn new(question: impl Into<String>, agent_answer: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            agent_answer: agent_answer.into(),
        }
    }
}

/// A retrieved knowledge-base snippet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KbPassage {
    pub content: String,
    pub source: String,
    #[serde(default)]
    pub confidence: f64,
}

impl KbPassage {
    pub fn new(content: impl Into<String>, source: impl Into<String>, confidence: f64) -> Self {
        Self {
            content: content.into(),
            source: source.into(),
            confidence,
        }
    }

    /// The passage as quoted in prompts and `kbVerify` citations.
    pub fn citation(&self) -> String {
        let content = self.content.trim();
        if self.source.is_empty() || content.contains("(source:") {
            content.to_string()
        } else {
            format!("{} (source: {})", content, self.source)
        }
    }
}

/// Grounded reference answers for one thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftAnswer {
    pub short_answer: String,
    pub long_answer: String,
    pub source_passages: Vec<KbPassage>,
}

/// The scored outcome for one thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionRating {
    #[serde(rename = "aiRewrittenQuestion")]
    pub question: String,
    #[serde(rename = "agentAnswer")]
    pub agent_answer: String,
    #[serde(rename = "aiShortAnswer")]
    pub short_answer: String,
    #[serde(rename = "aiLongAnswer")]
    pub long_answer: String,
    #[serde(rename = "aiScore")]
    pub score: f64,
    #[serde(rename = "aiRationale")]
    pub rationale: String,
    #[serde(rename = "kbVerify")]
    pub kb_verify: Vec<String>,
}

impl QuestionRating {
    /// Whether the rating counts toward overall accuracy.
    pub fn is_in_scope(&self) -> bool {
        self.score != OUT_OF_SCOPE_SCORE
    }
}

/// A thread that was dropped from the result, and why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisWarning {
    pub thread_index: usize,
    pub question: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    pub message: String,
}

/// Public response contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    pub conversation_id: ExternalId,
    pub conversation_type: String,
    pub overall_accuracy: Option<f64>,
    pub question_ratings: Vec<QuestionRating>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<AnalysisWarning>,
}

// --- Language-model prompt types ---

/// Message role in a chat-completion exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl std::fmt::Display for ChatRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChatRole::System => write!(f, "system"),
            ChatRole::User => write!(f, "user"),
            ChatRole::Assistant => write!(f, "assistant"),
        }
    }
}

/// A worked example shown to the model before the real input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FewShotExample {
    pub user: String,
    pub assistant: String,
}

impl FewShotExample {
    pub fn new(user: impl Into<String>, assistant: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            assistant: assistant.into(),
        }
    }
}

/// Output format requested from the model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseFormat {
    #[default]
    Text,
    Json,
}

/// A fully rendered prompt: system instruction, worked examples, user content,
/// and the response-format hint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prompt {
    pub system: String,
    pub examples: Vec<FewShotExample>,
    pub user: String,
    pub response_format: ResponseFormat,
}

impl Prompt {
    /// Flatten into ordered `(role, content)` turns.
    pub fn turns(&self) -> Vec<(ChatRole, &str)> {
        let mut turns = Vec::with_capacity(2 + self.examples.len() * 2);
        turns.push((ChatRole::System, self.system.as_str()));
        for example in &self.examples {
            turns.push((ChatRole::User, example.user.as_str()));
            turns.push((ChatRole::Assistant, example.assistant.as_str()));
        }
        turns.push((ChatRole::User, self.user.as_str()));
        turns
    }
}

/// Token usage statistics for a completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: usize,
    pub output_tokens: usize,
}

/// Raw completion returned by a language model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub text: String,
    pub model: String,
    pub usage: TokenUsage,
    pub finish_reason: Option<String>,
}

impl Completion {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            model: String::new(),
            usage: TokenUsage::default(),
            finish_reason: None,
        }
    }
}
