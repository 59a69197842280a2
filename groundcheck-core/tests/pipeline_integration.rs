//! Integration tests for the full analysis pipeline.
//!
//! These tests drive segmentation, drafting, scoring, and aggregation
//! end-to-end through `AnalysisOrchestrator`, with the language model
//! replaced by prompt-keyed mocks and the KB by an in-memory retriever.

use async_trait::async_trait;
use groundcheck_core::brain::{LlmProvider, MockLlmProvider};
use groundcheck_core::config::PipelineConfig;
use groundcheck_core::error::{AnalysisError, LlmError, RetrieverError, Stage};
use groundcheck_core::prompt::{DRAFT_SYSTEM, NO_KB_ANSWER, SCORING_SYSTEM, SEGMENTATION_SYSTEM};
use groundcheck_core::retriever::{KnowledgeRetriever, StaticRetriever};
use groundcheck_core::types::{
    AnalysisRequest, Completion, Conversation, ConversationMessage, KbPassage, Prompt,
};
use groundcheck_core::AnalysisOrchestrator;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const INVOICE_PASSAGE: &str = "On the Invoices page, use the Status dropdown to choose Unpaid.";

fn stage_of(prompt: &Prompt) -> Stage {
    if prompt.system == SEGMENTATION_SYSTEM {
        Stage::Segmentation
    } else if prompt.system == DRAFT_SYSTEM {
        Stage::Drafting
    } else {
        assert_eq!(prompt.system, SCORING_SYSTEM);
        Stage::Scoring
    }
}

fn reply(value: serde_json::Value) -> Result<Completion, LlmError> {
    Ok(MockLlmProvider::json_response(value))
}

fn draft_reply(short: &str, long: &str) -> Result<Completion, LlmError> {
    reply(json!({
        "ai_suggested_answer": {"answer": short, "context": "[1]"},
        "ai_detailed_answer": {"answer": long, "context": "[1]"},
    }))
}

fn billing_kb() -> Arc<dyn KnowledgeRetriever> {
    Arc::new(
        StaticRetriever::new()
            .with_document("kb_001", "billing/invoices.md", INVOICE_PASSAGE)
            .with_document(
                "kb_001",
                "billing/export.md",
                "Export invoices as CSV from the Invoices page.",
            )
            .with_document(
                "kb_001",
                "account/password.md",
                "Reset your password from Settings > Security.",
            ),
    )
}

fn items_kb() -> Arc<dyn KnowledgeRetriever> {
    Arc::new(StaticRetriever::new().with_document(
        "kb_001",
        "faq.md",
        "Every item has its question answered here.",
    ))
}

fn invoice_request() -> AnalysisRequest {
    let conversation = Conversation::new(1001, "chat")
        .with_message(ConversationMessage::customer(
            "1",
            "Hi, how do I filter invoices to show only unpaid ones?",
        ))
        .with_message(ConversationMessage::agent(
            "2",
            "Go to Billing > Invoices and pick Unpaid in the Status dropdown.",
        ));
    AnalysisRequest::new(conversation, "kb_001")
}

fn two_question_request() -> AnalysisRequest {
    let conversation = Conversation::new("conv-7", "email")
        .with_message(ConversationMessage::customer("1", "How do I filter unpaid invoices?"))
        .with_message(ConversationMessage::agent("2", "Use the Status dropdown."))
        .with_message(ConversationMessage::customer("3", "How do I export invoices?"))
        .with_message(ConversationMessage::agent("4", "Click Export on the Invoices page."));
    AnalysisRequest::new(conversation, "kb_001")
}

/// A conversation of `n` customer/agent pairs about numbered items.
fn items_request(n: usize) -> AnalysisRequest {
    let mut conversation = Conversation::new(77, "chat");
    for i in 1..=n {
        conversation = conversation
            .with_message(ConversationMessage::customer(
                format!("c{}", i),
                format!("Question about item {}", i),
            ))
            .with_message(ConversationMessage::agent(
                format!("a{}", i),
                format!("Answer about item {}", i),
            ));
    }
    AnalysisRequest::new(conversation, "kb_001")
}

fn items_segmentation(n: usize) -> serde_json::Value {
    let threads: Vec<_> = (1..=n)
        .map(|i| {
            json!({
                "qid": format!("T{}", i),
                "question": format!("Question about item {}", i),
                "answer": format!("Answer about item {}", i),
            })
        })
        .collect();
    json!({ "threads": threads })
}

/// Which numbered item a prompt is about.
fn item_of(prompt: &Prompt) -> usize {
    (1..=9)
        .find(|i| prompt.user.contains(&format!("item {}", i)))
        .unwrap_or(0)
}

fn pipeline(max_concurrency: usize, call_timeout_secs: u64, request_timeout_secs: u64) -> PipelineConfig {
    PipelineConfig {
        max_concurrency,
        call_timeout_secs,
        request_timeout_secs,
        ..PipelineConfig::default()
    }
}

/// Sleeps before answering, tracking how many calls overlap.
struct DelayedProvider {
    mock: MockLlmProvider,
    delay: Box<dyn Fn(&Prompt) -> Duration + Send + Sync>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    finished: AtomicUsize,
}

impl DelayedProvider {
    fn new(
        mock: MockLlmProvider,
        delay: impl Fn(&Prompt) -> Duration + Send + Sync + 'static,
    ) -> Self {
        Self {
            mock,
            delay: Box::new(delay),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            finished: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl LlmProvider for DelayedProvider {
    async fn complete(&self, prompt: &Prompt) -> Result<Completion, LlmError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep((self.delay)(prompt)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.finished.fetch_add(1, Ordering::SeqCst);
        self.mock.complete(prompt).await
    }

    fn model_name(&self) -> &str {
        "delayed-mock"
    }
}

/// A retriever that never answers in any reasonable time.
struct StalledRetriever;

#[async_trait]
impl KnowledgeRetriever for StalledRetriever {
    async fn retrieve(
        &self,
        _question: &str,
        _kb_id: &str,
        _k: usize,
    ) -> Result<Vec<KbPassage>, RetrieverError> {
        tokio::time::sleep(Duration::from_secs(100_000)).await;
        Ok(Vec::new())
    }

    fn name(&self) -> &str {
        "stalled"
    }
}

/// Mock answering each stage for the numbered-items conversations.
fn items_mock(n: usize) -> MockLlmProvider {
    MockLlmProvider::with_responder(move |p| match stage_of(p) {
        Stage::Segmentation => reply(items_segmentation(n)),
        Stage::Drafting => {
            let i = item_of(p);
            draft_reply(&format!("Short {}", i), &format!("Long {}", i))
        }
        Stage::Scoring => reply(json!({
            "ai_score": item_of(p) as f64 - 1.0,
            "ai_rational": format!("Rated item {}", item_of(p)),
            "kb_verify": [],
        })),
    })
}

// --- End-to-end ---

#[tokio::test]
async fn test_invoice_conversation_end_to_end() {
    let mock = MockLlmProvider::with_responder(|p| match stage_of(p) {
        Stage::Segmentation => reply(json!({"threads": [{
            "qid": "T1",
            "question": "How do I filter invoices to show only unpaid ones?",
            "answer": "Go to Billing > Invoices and pick Unpaid in the Status dropdown.",
        }]})),
        Stage::Drafting => draft_reply(
            "Choose Unpaid in the Status dropdown.",
            "On the Invoices page, open the Status dropdown and choose Unpaid.",
        ),
        Stage::Scoring => reply(json!({
            "ai_score": 4.5,
            "ai_rational": "The agent names the Status dropdown and the Unpaid option, matching the KB.",
            "kb_verify": [format!("{} (source: billing/invoices.md)", INVOICE_PASSAGE)],
        })),
    });
    let orchestrator =
        AnalysisOrchestrator::new(Arc::new(mock), billing_kb(), &PipelineConfig::default());

    let result = orchestrator.analyze(&invoice_request()).await.unwrap();

    assert_eq!(result.conversation_id.to_string(), "1001");
    assert_eq!(result.conversation_type, "chat");
    assert_eq!(result.question_ratings.len(), 1);
    let rating = &result.question_ratings[0];
    assert!((3.0..=5.0).contains(&rating.score));
    assert_eq!(rating.short_answer, "Choose Unpaid in the Status dropdown.");
    assert_eq!(rating.kb_verify.len(), 1);
    assert!(rating.kb_verify[0].contains("billing/invoices.md"));
    assert_eq!(result.overall_accuracy, Some(rating.score));
    assert!(result.warnings.is_empty());

    let body = serde_json::to_value(&result).unwrap();
    assert_eq!(body["conversationId"], 1001);
    assert!(body.get("warnings").is_none());
    assert_eq!(body["questionRatings"][0]["aiScore"], 4.5);
}

#[tokio::test]
async fn test_out_of_range_scores_are_clamped() {
    let mock = MockLlmProvider::with_responder(|p| match stage_of(p) {
        Stage::Segmentation => reply(json!({"threads": [
            {"qid": "T1", "question": "How do I filter unpaid invoices?", "answer": "Use the Status dropdown."},
            {"qid": "T2", "question": "How do I export invoices?", "answer": "Click Export on the Invoices page."},
        ]})),
        Stage::Drafting => draft_reply("S", "L"),
        Stage::Scoring => {
            let score = if p.user.contains("filter unpaid") { 99 } else { -50 };
            reply(json!({"ai_score": score, "ai_rational": "r", "kb_verify": []}))
        }
    });
    let orchestrator =
        AnalysisOrchestrator::new(Arc::new(mock), billing_kb(), &PipelineConfig::default());

    let result = orchestrator.analyze(&two_question_request()).await.unwrap();
    let scores: Vec<f64> = result.question_ratings.iter().map(|r| r.score).collect();
    assert_eq!(scores, vec![5.0, -1.0]);
    assert_eq!(result.overall_accuracy, Some(5.0));
}

#[tokio::test]
async fn test_empty_kb_rates_everything_out_of_scope() {
    let mock = MockLlmProvider::with_responder(|p| match stage_of(p) {
        Stage::Segmentation => reply(json!({"threads": [
            {"qid": "T1", "question": "How do I filter unpaid invoices?", "answer": "Use the Status dropdown."},
            {"qid": "T2", "question": "How do I export invoices?", "answer": "Click Export."},
        ]})),
        Stage::Drafting => draft_reply(NO_KB_ANSWER, NO_KB_ANSWER),
        Stage::Scoring => reply(json!({"ai_score": 4, "ai_rational": "Looks right.", "kb_verify": ["made up"]})),
    });
    let orchestrator = AnalysisOrchestrator::new(
        Arc::new(mock),
        Arc::new(StaticRetriever::new()),
        &PipelineConfig::default(),
    );

    let result = orchestrator.analyze(&two_question_request()).await.unwrap();
    assert_eq!(result.question_ratings.len(), 2);
    for rating in &result.question_ratings {
        assert_eq!(rating.score, -1.0);
        assert!(rating.kb_verify.is_empty());
        assert_eq!(rating.short_answer, NO_KB_ANSWER);
    }
    assert_eq!(result.overall_accuracy, None);
    assert_eq!(serde_json::to_value(&result).unwrap()["overallAccuracy"], serde_json::Value::Null);
}

#[tokio::test]
async fn test_repeated_runs_are_byte_identical() {
    let orchestrator =
        AnalysisOrchestrator::new(Arc::new(items_mock(3)), items_kb(), &PipelineConfig::default());
    let request = items_request(3);

    let first = serde_json::to_string(&orchestrator.analyze(&request).await.unwrap()).unwrap();
    let second = serde_json::to_string(&orchestrator.analyze(&request).await.unwrap()).unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_malformed_segmentation_falls_back_to_heuristic() {
    let mock = MockLlmProvider::with_responder(|p| match stage_of(p) {
        Stage::Segmentation => Ok(MockLlmProvider::text_response(
            "There are two questions in this chat.",
        )),
        Stage::Drafting => draft_reply("S", "L"),
        Stage::Scoring => reply(json!({"ai_score": 3, "ai_rational": "ok", "kb_verify": []})),
    });
    let orchestrator =
        AnalysisOrchestrator::new(Arc::new(mock), billing_kb(), &PipelineConfig::default());

    let result = orchestrator.analyze(&two_question_request()).await.unwrap();
    let questions: Vec<&str> = result
        .question_ratings
        .iter()
        .map(|r| r.question.as_str())
        .collect();
    assert_eq!(
        questions,
        vec!["How do I filter unpaid invoices?", "How do I export invoices?"]
    );
    assert_eq!(result.overall_accuracy, Some(3.0));
}

#[tokio::test]
async fn test_upstream_failures_become_warnings() {
    let mock = MockLlmProvider::with_responder(|p| match stage_of(p) {
        Stage::Segmentation => reply(json!({"threads": [
            {"qid": "T1", "question": "How do I filter unpaid invoices?", "answer": "Use the Status dropdown."},
            {"qid": "T2", "question": "How do I export invoices?", "answer": "Click Export."},
        ]})),
        _ => Err(LlmError::UpstreamUnavailable {
            message: "502 Bad Gateway".into(),
        }),
    });
    let orchestrator =
        AnalysisOrchestrator::new(Arc::new(mock), billing_kb(), &PipelineConfig::default());

    let result = orchestrator.analyze(&two_question_request()).await.unwrap();
    assert!(result.question_ratings.is_empty());
    assert_eq!(result.overall_accuracy, None);
    assert_eq!(result.warnings.len(), 2);
    assert_eq!(result.warnings[0].thread_index, 0);
    assert_eq!(result.warnings[0].stage, Some(Stage::Drafting));
    assert_eq!(result.warnings[1].question, "How do I export invoices?");
}

#[tokio::test]
async fn test_model_failures_without_kb_evidence_become_warnings() {
    let mock = MockLlmProvider::with_responder(|p| match stage_of(p) {
        Stage::Segmentation => reply(json!({"threads": [
            {"qid": "T1", "question": "How do I filter unpaid invoices?", "answer": "Use the Status dropdown."},
            {"qid": "T2", "question": "How do I export invoices?", "answer": "Click Export."},
        ]})),
        Stage::Drafting if p.user.contains("How do I export invoices?") => {
            draft_reply(NO_KB_ANSWER, NO_KB_ANSWER)
        }
        _ => Err(LlmError::UpstreamTimeout { timeout_secs: 60 }),
    });
    let orchestrator = AnalysisOrchestrator::new(
        Arc::new(mock),
        Arc::new(StaticRetriever::new()),
        &PipelineConfig::default(),
    );

    let result = orchestrator.analyze(&two_question_request()).await.unwrap();
    assert!(result.question_ratings.is_empty());
    assert_eq!(result.overall_accuracy, None);
    let stages: Vec<_> = result.warnings.iter().map(|w| w.stage).collect();
    assert_eq!(stages, vec![Some(Stage::Drafting), Some(Stage::Scoring)]);
}

#[tokio::test]
async fn test_scoring_failure_omits_only_that_thread() {
    let mock = MockLlmProvider::with_responder(|p| match stage_of(p) {
        Stage::Segmentation => reply(json!({"threads": [
            {"qid": "T1", "question": "How do I filter unpaid invoices?", "answer": "Use the Status dropdown."},
            {"qid": "T2", "question": "How do I export invoices?", "answer": "Click Export."},
        ]})),
        Stage::Drafting => draft_reply("S", "L"),
        Stage::Scoring if p.user.contains("How do I export invoices?") => {
            Ok(MockLlmProvider::text_response("Pretty good answer overall."))
        }
        Stage::Scoring => reply(json!({"ai_score": 4, "ai_rational": "ok", "kb_verify": []})),
    });
    let orchestrator =
        AnalysisOrchestrator::new(Arc::new(mock), billing_kb(), &PipelineConfig::default());

    let result = orchestrator.analyze(&two_question_request()).await.unwrap();
    assert_eq!(result.question_ratings.len(), 1);
    assert_eq!(result.overall_accuracy, Some(4.0));
    assert_eq!(result.warnings.len(), 1);
    assert_eq!(result.warnings[0].thread_index, 1);
    assert_eq!(result.warnings[0].stage, Some(Stage::Scoring));
}

#[tokio::test]
async fn test_blank_conversation_is_invalid_input() {
    let mock = Arc::new(MockLlmProvider::new());
    let orchestrator =
        AnalysisOrchestrator::new(mock.clone(), billing_kb(), &PipelineConfig::default());
    let conversation = Conversation::new(5, "chat")
        .with_message(ConversationMessage::customer("1", "  "))
        .with_message(ConversationMessage::agent("2", ""));

    let err = orchestrator
        .analyze(&AnalysisRequest::new(conversation, "kb_001"))
        .await
        .unwrap_err();
    assert!(matches!(err, AnalysisError::InvalidInput { .. }));
    assert_eq!(mock.call_count(), 0);
}

#[tokio::test]
async fn test_segmentation_failure_is_fatal_without_pairs() {
    let mock = MockLlmProvider::new();
    mock.queue_error(LlmError::UpstreamUnavailable {
        message: "connection refused".into(),
    });
    let orchestrator =
        AnalysisOrchestrator::new(Arc::new(mock), billing_kb(), &PipelineConfig::default());
    let conversation = Conversation::new(6, "chat")
        .with_message(ConversationMessage::customer("1", "How do I export invoices?"));

    let err = orchestrator
        .analyze(&AnalysisRequest::new(conversation, "kb_001"))
        .await
        .unwrap_err();
    assert!(matches!(err, AnalysisError::SegmentationFailed { .. }));
}

// --- Concurrency, deadlines, cancellation ---

#[tokio::test(start_paused = true)]
async fn test_results_follow_segmentation_order() {
    // Earlier threads finish last.
    let provider = Arc::new(DelayedProvider::new(items_mock(5), |p| match stage_of(p) {
        Stage::Drafting => Duration::from_secs(10 - item_of(p) as u64),
        _ => Duration::from_millis(10),
    }));
    let orchestrator =
        AnalysisOrchestrator::new(provider.clone(), items_kb(), &pipeline(2, 60, 180));

    let result = orchestrator.analyze(&items_request(5)).await.unwrap();
    let scores: Vec<f64> = result.question_ratings.iter().map(|r| r.score).collect();
    assert_eq!(scores, vec![0.0, 1.0, 2.0, 3.0, 4.0]);
    let shorts: Vec<&str> = result
        .question_ratings
        .iter()
        .map(|r| r.short_answer.as_str())
        .collect();
    assert_eq!(shorts, vec!["Short 1", "Short 2", "Short 3", "Short 4", "Short 5"]);
    assert_eq!(result.overall_accuracy, Some(2.0));
    assert_eq!(provider.peak.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_with_no_completed_threads_fails_request() {
    let provider = Arc::new(DelayedProvider::new(items_mock(2), |p| match stage_of(p) {
        Stage::Drafting => Duration::from_secs(1000),
        _ => Duration::ZERO,
    }));
    let orchestrator = AnalysisOrchestrator::new(provider, items_kb(), &pipeline(4, 600, 10));

    let err = orchestrator.analyze(&items_request(2)).await.unwrap_err();
    assert!(matches!(err, AnalysisError::DeadlineExceeded { budget_secs: 10 }));
}

#[tokio::test(start_paused = true)]
async fn test_deadline_keeps_completed_threads() {
    let provider = Arc::new(DelayedProvider::new(items_mock(2), |p| {
        if stage_of(p) == Stage::Drafting && item_of(p) == 2 {
            Duration::from_secs(1000)
        } else {
            Duration::from_secs(1)
        }
    }));
    let orchestrator = AnalysisOrchestrator::new(provider, items_kb(), &pipeline(4, 600, 10));

    let result = orchestrator.analyze(&items_request(2)).await.unwrap();
    assert_eq!(result.question_ratings.len(), 1);
    assert_eq!(result.question_ratings[0].question, "Question about item 1");
    assert_eq!(result.warnings.len(), 1);
    assert_eq!(result.warnings[0].thread_index, 1);
    assert_eq!(result.warnings[0].stage, None);
    assert!(result.warnings[0].message.contains("deadline"));
}

#[tokio::test(start_paused = true)]
async fn test_per_call_timeout_is_a_thread_failure() {
    let provider = Arc::new(DelayedProvider::new(items_mock(2), |p| {
        if stage_of(p) == Stage::Scoring && item_of(p) == 1 {
            Duration::from_secs(120)
        } else {
            Duration::ZERO
        }
    }));
    let orchestrator = AnalysisOrchestrator::new(provider, items_kb(), &pipeline(4, 30, 180));

    let result = orchestrator.analyze(&items_request(2)).await.unwrap();
    assert_eq!(result.question_ratings.len(), 1);
    assert_eq!(result.warnings[0].thread_index, 0);
    assert_eq!(result.warnings[0].stage, Some(Stage::Scoring));
}

#[tokio::test(start_paused = true)]
async fn test_stalled_retriever_is_bounded_by_call_timeout() {
    let orchestrator = AnalysisOrchestrator::new(
        Arc::new(items_mock(1)),
        Arc::new(StalledRetriever),
        &pipeline(4, 30, 180),
    );

    let started = tokio::time::Instant::now();
    let result = orchestrator.analyze(&items_request(1)).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(180));
    assert_eq!(result.question_ratings.len(), 1);
    assert_eq!(result.question_ratings[0].score, -1.0);
    assert!(result.question_ratings[0].kb_verify.is_empty());
    assert_eq!(result.overall_accuracy, None);
    assert!(result.warnings.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_stops_the_request() {
    let provider = Arc::new(DelayedProvider::new(items_mock(3), |p| match stage_of(p) {
        Stage::Drafting => Duration::from_secs(1000),
        _ => Duration::ZERO,
    }));
    let orchestrator = AnalysisOrchestrator::new(provider, items_kb(), &pipeline(4, 600, 1800));
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        trigger.cancel();
    });

    let err = orchestrator
        .analyze_with_cancellation(&items_request(3), token)
        .await
        .unwrap_err();
    assert!(matches!(err, AnalysisError::Cancelled));
}

#[tokio::test(start_paused = true)]
async fn test_dropping_the_request_cancels_thread_work() {
    let provider = Arc::new(DelayedProvider::new(items_mock(3), |p| match stage_of(p) {
        Stage::Drafting => Duration::from_secs(100),
        _ => Duration::ZERO,
    }));
    let orchestrator =
        AnalysisOrchestrator::new(provider.clone(), items_kb(), &pipeline(4, 600, 1800));

    let outcome = tokio::time::timeout(
        Duration::from_secs(5),
        orchestrator.analyze(&items_request(3)),
    )
    .await;
    assert!(outcome.is_err());

    tokio::time::sleep(Duration::from_secs(500)).await;
    // Only the segmentation call ever finished.
    assert_eq!(provider.finished.load(Ordering::SeqCst), 1);
}
