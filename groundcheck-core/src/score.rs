//! Stage 3: score an agent answer against the drafted references and the KB.

use tracing::warn;

use crate::brain::ModelCall;
use crate::completion::{
    ParsedCompletion, extract_json_object, number_value, string_field, string_list,
};
use crate::error::{Stage, StageError};
use crate::prompt::build_scoring_prompt;
use crate::types::{DraftAnswer, KbPassage, MAX_SCORE, OUT_OF_SCOPE_SCORE, QuestionRating, Thread};

/// Rationale used when the model gives none.
pub const PLACEHOLDER_RATIONALE: &str = "The scoring model did not provide a rationale.";

/// Rationale used for questions with no KB evidence when the model gives none.
pub const OUT_OF_SCOPE_RATIONALE: &str =
    "No knowledge-base passage addresses this question, so it is out of KB scope.";

/// Citations shorter than this must match a passage exactly or contain it.
const MIN_FRAGMENT_CHARS: usize = 12;

/// Fields read from a scoring completion.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoringVerdict {
    pub score: f64,
    pub rationale: Option<String>,
    pub kb_verify: Vec<String>,
}

/// Clamp a model score into the rating scale.
pub fn clamp_score(score: f64) -> f64 {
    score.clamp(OUT_OF_SCOPE_SCORE, MAX_SCORE)
}

/// Interpret a scoring completion. A missing or non-numeric score is unusable.
pub fn parse_verdict(text: &str) -> ParsedCompletion<ScoringVerdict> {
    let map = match extract_json_object(text) {
        ParsedCompletion::Parsed(map) => map,
        ParsedCompletion::Unparseable { raw, reason } => {
            return ParsedCompletion::Unparseable { raw, reason };
        }
    };
    let Some(score) = ["ai_score", "score"]
        .iter()
        .find_map(|key| map.get(*key).and_then(number_value))
    else {
        return ParsedCompletion::unparseable(text, "missing numeric ai_score");
    };
    ParsedCompletion::Parsed(ScoringVerdict {
        score,
        rationale: string_field(&map, &["ai_rational", "ai_rationale", "rationale"]),
        kb_verify: string_list(map.get("kb_verify").or_else(|| map.get("kbVerify"))),
    })
}

fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Whether a model citation refers to the given passage.
fn cites(entry: &str, passage: &KbPassage) -> bool {
    let entry = normalize(entry);
    let content = normalize(&passage.content);
    if entry.is_empty() || content.is_empty() {
        return false;
    }
    entry.contains(&content)
        || (entry.chars().count() >= MIN_FRAGMENT_CHARS && content.contains(&entry))
        || (!passage.source.is_empty() && entry == normalize(&passage.source))
}

/// Keep only citations that trace to a supplied passage, rewritten to that
/// passage's canonical citation and de-duplicated in first-seen order.
pub fn verified_citations(kb_verify: &[String], passages: &[KbPassage]) -> Vec<String> {
    let mut kept: Vec<String> = Vec::new();
    for entry in kb_verify {
        match passages.iter().find(|p| cites(entry, p)) {
            Some(passage) => {
                let citation = passage.citation();
                if !kept.contains(&citation) {
                    kept.push(citation);
                }
            }
            None => warn!(citation = %entry, "Dropping citation that matches no retrieved passage"),
        }
    }
    kept
}

/// Stage 3 component.
#[derive(Clone)]
pub struct AgentScorer {
    model: ModelCall,
}

impl AgentScorer {
    pub fn new(model: ModelCall) -> Self {
        Self { model }
    }

    /// Score one thread.
    ///
    /// With no passages a successful call always rates the question out of
    /// scope, whatever score the model gives.
    pub async fn score(
        &self,
        thread: &Thread,
        draft: &DraftAnswer,
        passages: &[KbPassage],
    ) -> Result<QuestionRating, StageError> {
        let prompt = build_scoring_prompt(&thread.question, &thread.agent_answer, draft, passages);
        let completion = self
            .model
            .complete(Stage::Scoring, &prompt)
            .await
            .map_err(StageError::Score)?;

        if passages.is_empty() {
            let rationale = parse_verdict(&completion.text)
                .into_option()
                .and_then(|v| v.rationale);
            return Ok(self.rating(
                thread,
                draft,
                OUT_OF_SCOPE_SCORE,
                rationale.unwrap_or_else(|| OUT_OF_SCOPE_RATIONALE.to_string()),
                Vec::new(),
            ));
        }

        match parse_verdict(&completion.text) {
            ParsedCompletion::Parsed(verdict) => {
                let score = clamp_score(verdict.score);
                if score != verdict.score {
                    warn!(raw = verdict.score, clamped = score, "Clamped out-of-range score");
                }
                Ok(self.rating(
                    thread,
                    draft,
                    score,
                    verdict
                        .rationale
                        .unwrap_or_else(|| PLACEHOLDER_RATIONALE.to_string()),
                    verified_citations(&verdict.kb_verify, passages),
                ))
            }
            ParsedCompletion::Unparseable { reason, .. } => Err(StageError::MalformedOutput {
                stage: Stage::Scoring,
                reason,
            }),
        }
    }

    fn rating(
        &self,
        thread: &Thread,
        draft: &DraftAnswer,
        score: f64,
        rationale: String,
        kb_verify: Vec<String>,
    ) -> QuestionRating {
        QuestionRating {
            question: thread.question.clone(),
            agent_answer: thread.agent_answer.clone(),
            short_answer: draft.short_answer.clone(),
            long_answer: draft.long_answer.clone(),
            score,
            rationale,
            kb_verify,
        }
    }
}
