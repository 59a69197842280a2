//! Prompt rendering for the three pipeline stages.
//!
//! Every function here is pure: identical inputs produce byte-identical
//! prompts. Structured inputs are serialized through `Serialize` structs so
//! field order never depends on map iteration.

use serde::Serialize;

use crate::types::{DraftAnswer, FewShotExample, KbPassage, Prompt, ResponseFormat};

/// Answer the drafting model must give when the passages cannot support one.
pub const NO_KB_ANSWER: &str =
    "The Knowledge Base does not contain the information needed to answer this question";

/// Placeholder rendered in place of an empty passage list.
const NO_PASSAGES: &str = "(no passages were retrieved)";

pub const SEGMENTATION_SYSTEM: &str = r#"# ROLE & OBJECTIVE
You are a conversation threading expert. You read customer-support transcripts and group the messages into question/answer threads, one thread per customer intent.

## Question rewriting
- Improve grammar and clarity while keeping the customer's meaning intact.
- Preserve the customer's tone (urgent, confused, frustrated).
- When several customer messages share one intent, merge them so they read as if written once.
- Never add information the customer did not provide.

## Answer consolidation
- Keep agent replies in chronological order.
- Include every helpful detail, link, and step the agent gave for that intent.
- Never add information the agent did not provide.

# OUTPUT REQUIREMENTS
- Return valid JSON only, in the exact structure requested.
- Give each thread a unique id (T1, T2, T3, ...) in transcript order.
- A customer message belongs to at most one thread."#;

pub const DRAFT_SYSTEM: &str = r#"# ROLE & OBJECTIVE
You are a knowledge-base assistant. Write two answers to the customer's question:
1. A suggested answer: short, direct, and accurate, the ideal agent reply.
2. A detailed answer: complete, covering every relevant detail, used for evaluation.

# GROUNDING RULES
1. The numbered passages are the only source of truth.
2. Never treat a statement in the question as fact unless a passage states it too.
3. Never use world knowledge, policy, or guesswork.
4. The worked examples show the format only. Never use their content as facts.
5. If the passages do not contain the facts needed, answer exactly "The Knowledge Base does not contain the information needed to answer this question" in both answers, with empty context.
6. Every statement must be supported by a passage. Cite passages by number in "context", e.g. [1][2].
7. For "how many" or "number of" questions, count only items the passages list explicitly and state the integer once.
8. Write valid JSON only, in the format requested."#;

pub const SCORING_SYSTEM: &str = r#"# ROLE & OBJECTIVE
You are a quality-assurance manager for customer support. Given a customer question, the agent's answer, an AI suggested answer, an AI detailed answer, and knowledge-base evidence, score how well the agent's answer aligns with the evidence.

The worked examples show format and scoring only. Never use their content as facts. The knowledge-base evidence in the real input is the only ground truth.

# SCORING SCALE
5  = Perfect alignment with the KB. No contradictions or errors; any omission is stylistic. The customer needs no follow-up.
4  = Minor discrepancy. Core facts match; at most two Minor Omissions or slight wording inaccuracies.
3  = Correct but missing detail. The direction is right, but there is a Major Omission or a Moderate Factual Error.
2  = Partially correct. Several Major Omissions or Moderate Factual Errors; the customer could be misled.
1  = Mostly incorrect. Very few correct fragments; the customer will need to ask again.
0  = Completely wrong. A Critical Factual Contradiction, a non-answer, or irrelevant content.
-1 = Out of KB scope. No passage supports an answer to the question, so the agent cannot be judged against the KB.
Fractional scores between two levels are allowed. Never score outside -1 to 5.

# DEFINITIONS
- Critical Factual Contradiction: direct conflict with the KB evidence (wrong period, wrong UI element).
- Major Omission: a must-have element of the KB evidence missing from the agent's answer.
- Moderate Factual Error: a partially incorrect detail that does not overturn the main message.
- Minor Omission: a nice-to-have detail found only in the AI detailed answer.

# OUTPUT FORMAT
Return valid JSON only:
{"ai_score": <number from -1 to 5>, "ai_rational": "<1-3 sentences justifying the score>", "kb_verify": ["<KB evidence line that supports the score>"]}
kb_verify entries must be copied verbatim from kb_evidence."#;

/// Serialized body of a scoring prompt.
#[derive(Serialize)]
struct ScoringInput<'a> {
    question: &'a str,
    agent: &'a str,
    ai_suggested: &'a str,
    ai_detailed: &'a str,
    kb_evidence: Vec<String>,
}

/// Serialized scoring verdict used by the worked examples.
#[derive(Serialize)]
struct ScoringVerdict<'a> {
    ai_score: f64,
    ai_rational: &'a str,
    kb_verify: Vec<&'a str>,
}

/// Render KB passages as numbered citation lines.
pub fn format_passages(passages: &[KbPassage]) -> String {
    if passages.is_empty() {
        return NO_PASSAGES.to_string();
    }
    passages
        .iter()
        .enumerate()
        .map(|(i, p)| format!("[{}] {}", i + 1, p.citation()))
        .collect::<Vec<_>>()
        .join("\n")
}

fn segmentation_user_content(transcript: &str) -> String {
    format!(
        "### Plan\n\
         - Read the transcript.\n\
         - Group consecutive customer turns pursuing the SAME intent into one `question`.\n\
         - Merge the agent replies to that intent into one `answer`.\n\
         - A thread should read naturally: never split one context across threads, never mix topics.\n\
         - Rewrite each question clearly without changing its intent.\n\
         - Skip greetings and small talk that carry no question.\n\n\
         ### Transcript\n\
         {}\n\n\
         ### Output\n\
         Return JSON: {{\"threads\":[{{\"qid\":\"T1\",\"question\":\"...\",\"answer\":\"...\"}}]}}",
        transcript.trim()
    )
}

fn segmentation_examples() -> Vec<FewShotExample> {
    vec![
        // Two customer turns with one intent become one thread.
        FewShotExample::new(
            segmentation_user_content(
                "Customer: I can't log in\n\
                 Customer: it says my password is wrong but I just changed it\n\
                 Agent: Password changes can take a few minutes to sync. Please wait 5 minutes and try again.\n\
                 Agent: If it still fails, use 'Forgot Password' on the login page.",
            ),
            r#"{"threads":[{"qid":"T1","question":"I can't log in: it says my password is wrong, but I just changed it. What should I do?","answer":"Password changes can take a few minutes to sync. Please wait 5 minutes and try again. If it still fails, use 'Forgot Password' on the login page."}]}"#,
        ),
        // Greetings carry no question; a new topic starts a new thread.
        FewShotExample::new(
            segmentation_user_content(
                "Customer: Hi there!\n\
                 Agent: Hello, how can I help?\n\
                 Customer: How do I add a teammate?\n\
                 Agent: Go to Settings > Team and click Invite.\n\
                 Customer: Also, where do I download invoices?\n\
                 Agent: Invoices are under Billing > Invoices, with a Download button on each row.",
            ),
            r#"{"threads":[{"qid":"T1","question":"How do I add a teammate?","answer":"Go to Settings > Team and click Invite."},{"qid":"T2","question":"Where do I download invoices?","answer":"Invoices are under Billing > Invoices, with a Download button on each row."}]}"#,
        ),
    ]
}

/// Stage 1 prompt: split a transcript into threads.
pub fn build_segmentation_prompt(transcript: &str) -> Prompt {
    Prompt {
        system: SEGMENTATION_SYSTEM.to_string(),
        examples: segmentation_examples(),
        user: segmentation_user_content(transcript),
        response_format: ResponseFormat::Json,
    }
}

fn draft_user_content(question: &str, passages: &str) -> String {
    format!(
        "### Plan\n\
         - Draft a concise, verified suggested answer from the passages.\n\
         - Draft a detailed answer covering every aspect the passages support.\n\n\
         ### Passages\n\
         {}\n\n\
         ### Question\n\
         {}\n\n\
         ### Output Format\n\
         Return valid JSON with this exact structure:\n\
         {{\"ai_suggested_answer\": {{\"answer\": \"...\", \"context\": \"[1]\"}}, \
         \"ai_detailed_answer\": {{\"answer\": \"...\", \"context\": \"[1][2]\"}}}}",
        passages,
        question.trim()
    )
}

fn draft_examples() -> Vec<FewShotExample> {
    vec![
        FewShotExample::new(
            draft_user_content(
                "Why don't I see Rule-Based Chat Routing on the Business plan?",
                "[1] Rule-Based Chat Routing is only available with the Live Chat Enterprise plan. (source: plans.md)",
            ),
            r#"{"ai_suggested_answer": {"answer": "Rule-Based Chat Routing is only available on the Enterprise plan.", "context": "[1]"}, "ai_detailed_answer": {"answer": "Rule-Based Chat Routing is exclusive to the Live Chat Enterprise plan, so it does not appear on the Business plan. Upgrading to Enterprise makes it available.", "context": "[1]"}}"#,
        ),
        FewShotExample::new(
            draft_user_content(
                "How many visitor status codes exist?",
                "[1] Visitor Status codes range 0-11. (source: visitors.md)",
            ),
            r#"{"ai_suggested_answer": {"answer": "There are 12 visitor status codes.", "context": "[1]"}, "ai_detailed_answer": {"answer": "There are 12 visitor status codes in total, numbered 0 through 11.", "context": "[1]"}}"#,
        ),
        FewShotExample::new(
            draft_user_content("Can I pay my invoice with cryptocurrency?", NO_PASSAGES),
            format!(
                r#"{{"ai_suggested_answer": {{"answer": "{no}", "context": ""}}, "ai_detailed_answer": {{"answer": "{no}", "context": ""}}}}"#,
                no = NO_KB_ANSWER
            ),
        ),
    ]
}

/// Stage 2 prompt: draft grounded short and long answers.
pub fn build_draft_prompt(question: &str, passages: &[KbPassage]) -> Prompt {
    Prompt {
        system: DRAFT_SYSTEM.to_string(),
        examples: draft_examples(),
        user: draft_user_content(question, &format_passages(passages)),
        response_format: ResponseFormat::Json,
    }
}

fn scoring_user_content(input: &ScoringInput<'_>) -> String {
    // Serializing a struct of strings cannot fail.
    let body = serde_json::to_string_pretty(input).unwrap_or_default();
    format!(
        "### Plan\n\
         - Compare the agent answer with ai_suggested and ai_detailed, using kb_evidence as ground truth.\n\
         - Decide ai_score on the scale. Use -1 only when kb_evidence cannot answer the question.\n\n\
         ### Input\n\
         {}",
        body
    )
}

#[allow(clippy::too_many_arguments)]
fn scoring_example(
    question: &str,
    agent: &str,
    ai_suggested: &str,
    ai_detailed: &str,
    kb_evidence: &[&str],
    ai_score: f64,
    ai_rational: &str,
    kb_verify: &[&str],
) -> FewShotExample {
    let input = ScoringInput {
        question,
        agent,
        ai_suggested,
        ai_detailed,
        kb_evidence: kb_evidence.iter().map(|s| s.to_string()).collect(),
    };
    let verdict = ScoringVerdict {
        ai_score,
        ai_rational,
        kb_verify: kb_verify.to_vec(),
    };
    FewShotExample::new(
        scoring_user_content(&input),
        serde_json::to_string(&verdict).unwrap_or_default(),
    )
}

fn scoring_examples() -> Vec<FewShotExample> {
    const INVOICES: &str =
        "On the Invoices page, use the Status dropdown to choose Unpaid. (source: invoices.md)";
    const PASSWORD: &str = "Password reset: click 'Forgot Password' on the login page, enter your email, and receive a reset link within 5 minutes. (source: auth.md)";
    const UPLOADS: &str =
        "Upload limits: Standard 10MB, Pro 25MB, Enterprise 100MB per file. (source: features.md)";
    const TWO_FA: &str = "Enable 2FA in Security Settings > Two-Factor Authentication. Requires an authenticator app and a verification code. (source: security.md)";
    const REFUND: &str = "Annual plans: 30-day money-back guarantee, then prorated refunds minus a 10% fee. (source: billing.md)";
    const EXPORT: &str = "Export transcripts from Chat History using the Export button. Formats: CSV, PDF. (source: reporting.md)";

    vec![
        scoring_example(
            "How do I filter unpaid invoices?",
            "Go to the Invoices page and use the Status dropdown to select 'Unpaid'.",
            "Select 'Unpaid' from the Status dropdown on the Invoices page.",
            "Open the Invoices page, click the Status dropdown, and choose 'Unpaid' to list only unpaid invoices.",
            &[INVOICES],
            5.0,
            "The agent gives the exact navigation and dropdown instruction from the KB. Complete and actionable.",
            &[INVOICES],
        ),
        scoring_example(
            "How do I reset my password?",
            "Click 'Forgot Password' on the login page and follow the email instructions.",
            "Click 'Forgot Password' on the login page; a reset email arrives within 5 minutes.",
            "On the login page click 'Forgot Password', enter your email, and use the reset link that arrives within 5 minutes.",
            &[PASSWORD],
            4.5,
            "Core steps are correct. Omits the 5-minute delivery time, a minor omission.",
            &[PASSWORD],
        ),
        scoring_example(
            "What are the file size limits for uploads?",
            "You can upload files up to 25MB.",
            "Standard 10MB, Pro 25MB, Enterprise 100MB per file.",
            "Limits depend on the plan: Standard accounts 10MB per file, Pro 25MB, Enterprise 100MB.",
            &[UPLOADS],
            3.2,
            "25MB is right for Pro only. Omitting the per-plan limits is a major omission that may mislead other plans.",
            &[UPLOADS],
        ),
        scoring_example(
            "How do I enable two-factor authentication?",
            "Go to Settings and turn on 2FA.",
            "Go to Security Settings > Two-Factor Authentication, enable it, and confirm with an authenticator app code.",
            "Open Security Settings > Two-Factor Authentication, click Enable, scan the QR code with an authenticator app, and enter the verification code.",
            &[TWO_FA],
            2.0,
            "Vague location and missing the authenticator app and verification steps. Multiple major omissions.",
            &[TWO_FA],
        ),
        scoring_example(
            "What's the refund policy for annual subscriptions?",
            "We offer full refunds anytime.",
            "30-day money-back guarantee, then prorated refunds minus a 10% fee.",
            "Annual plans get a full refund within 30 days; after that refunds are prorated for unused months minus a 10% fee.",
            &[REFUND],
            1.5,
            "'Full refunds anytime' contradicts the 30-day window and the fee. Mostly incorrect.",
            &[REFUND],
        ),
        scoring_example(
            "How do I export chat transcripts?",
            "Sorry, I don't know about that feature.",
            "Use the Export button in Chat History and pick CSV or PDF.",
            "Open Chat History, select the conversations, click Export, and choose CSV or PDF.",
            &[EXPORT],
            0.0,
            "Non-answer despite clear KB documentation. No usable information.",
            &[EXPORT],
        ),
        scoring_example(
            "Can I change the chat widget font on mobile?",
            "Yes, go to Appearance and pick a font.",
            NO_KB_ANSWER,
            NO_KB_ANSWER,
            &[],
            -1.0,
            "No KB evidence covers widget fonts, so the answer cannot be judged against the KB.",
            &[],
        ),
    ]
}

/// Stage 3 prompt: score the agent answer against the drafts and evidence.
pub fn build_scoring_prompt(
    question: &str,
    agent_answer: &str,
    draft: &DraftAnswer,
    passages: &[KbPassage],
) -> Prompt {
    let input = ScoringInput {
        question: question.trim(),
        agent: agent_answer.trim(),
        ai_suggested: draft.short_answer.trim(),
        ai_detailed: draft.long_answer.trim(),
        kb_evidence: passages.iter().map(KbPassage::citation).collect(),
    };
    Prompt {
        system: SCORING_SYSTEM.to_string(),
        examples: scoring_examples(),
        user: scoring_user_content(&input),
        response_format: ResponseFormat::Json,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn invoice_passage() -> KbPassage {
        KbPassage::new(
            "On the Invoices page, use the Status dropdown to choose Unpaid.",
            "billing/invoices.md",
            0.92,
        )
    }

    fn draft() -> DraftAnswer {
        DraftAnswer {
            short_answer: "Choose Unpaid in the Status dropdown.".into(),
            long_answer: "On the Invoices page open the Status dropdown and pick Unpaid.".into(),
            source_passages: vec![invoice_passage()],
        }
    }

    #[test]
    fn test_segmentation_prompt_golden() {
        let prompt = build_segmentation_prompt("Customer: Hi\nAgent: Hello");
        assert_eq!(prompt.system, SEGMENTATION_SYSTEM);
        assert_eq!(prompt.examples.len(), 2);
        assert!(prompt.examples[0].user.contains("Customer: I can't log in\n"));
        assert_eq!(prompt.response_format, ResponseFormat::Json);
        assert!(prompt.user.starts_with("### Plan\n- Read the transcript.\n"));
        assert!(prompt.user.contains("### Transcript\nCustomer: Hi\nAgent: Hello\n\n### Output\n"));
        assert!(prompt.user.ends_with(
            r#"Return JSON: {"threads":[{"qid":"T1","question":"...","answer":"..."}]}"#
        ));
    }

    #[test]
    fn test_segmentation_examples_parse_as_threads() {
        let counts: Vec<usize> = segmentation_examples()
            .iter()
            .map(|example| {
                let value: serde_json::Value = serde_json::from_str(&example.assistant).unwrap();
                let threads = value["threads"].as_array().unwrap();
                for thread in threads {
                    assert!(!thread["question"].as_str().unwrap().is_empty());
                    assert!(!thread["answer"].as_str().unwrap().is_empty());
                }
                threads.len()
            })
            .collect();
        assert_eq!(counts, vec![1, 2]);
    }

    #[test]
    fn test_format_passages() {
        let passages = vec![
            invoice_passage(),
            KbPassage::new("Statuses: Paid, Unpaid, Overdue.", "billing/status.md", 0.5),
        ];
        assert_eq!(
            format_passages(&passages),
            "[1] On the Invoices page, use the Status dropdown to choose Unpaid. (source: billing/invoices.md)\n\
             [2] Statuses: Paid, Unpaid, Overdue. (source: billing/status.md)"
        );
        assert_eq!(format_passages(&[]), NO_PASSAGES);
    }

    #[test]
    fn test_draft_prompt_golden() {
        let prompt = build_draft_prompt("  How do I filter unpaid invoices? ", &[invoice_passage()]);
        assert_eq!(prompt.system, DRAFT_SYSTEM);
        assert_eq!(prompt.examples.len(), 3);
        assert_eq!(
            prompt.user,
            "### Plan\n\
             - Draft a concise, verified suggested answer from the passages.\n\
             - Draft a detailed answer covering every aspect the passages support.\n\n\
             ### Passages\n\
             [1] On the Invoices page, use the Status dropdown to choose Unpaid. (source: billing/invoices.md)\n\n\
             ### Question\n\
             How do I filter unpaid invoices?\n\n\
             ### Output Format\n\
             Return valid JSON with this exact structure:\n\
             {\"ai_suggested_answer\": {\"answer\": \"...\", \"context\": \"[1]\"}, \
             \"ai_detailed_answer\": {\"answer\": \"...\", \"context\": \"[1][2]\"}}"
        );
    }

    #[test]
    fn test_draft_examples_are_valid_json() {
        for example in draft_examples() {
            let value: serde_json::Value = serde_json::from_str(&example.assistant).unwrap();
            assert!(value["ai_suggested_answer"]["answer"].is_string());
            assert!(value["ai_detailed_answer"]["answer"].is_string());
        }
    }

    #[test]
    fn test_draft_prompt_without_passages() {
        let prompt = build_draft_prompt("Do you support SSO?", &[]);
        assert!(prompt.user.contains("### Passages\n(no passages were retrieved)\n\n"));
    }

    #[test]
    fn test_scoring_prompt_serializes_input_in_order() {
        let prompt = build_scoring_prompt(
            "How do I filter unpaid invoices?",
            "Use the Status dropdown.",
            &draft(),
            &[invoice_passage()],
        );
        assert_eq!(prompt.system, SCORING_SYSTEM);
        let body = prompt.user.split("### Input\n").nth(1).unwrap();
        assert_eq!(
            body,
            r#"{
  "question": "How do I filter unpaid invoices?",
  "agent": "Use the Status dropdown.",
  "ai_suggested": "Choose Unpaid in the Status dropdown.",
  "ai_detailed": "On the Invoices page open the Status dropdown and pick Unpaid.",
  "kb_evidence": [
    "On the Invoices page, use the Status dropdown to choose Unpaid. (source: billing/invoices.md)"
  ]
}"#
        );
    }

    #[test]
    fn test_scoring_examples_cover_scale() {
        let scores: Vec<f64> = scoring_examples()
            .iter()
            .map(|e| {
                let v: serde_json::Value = serde_json::from_str(&e.assistant).unwrap();
                v["ai_score"].as_f64().unwrap()
            })
            .collect();
        assert_eq!(scores, vec![5.0, 4.5, 3.2, 2.0, 1.5, 0.0, -1.0]);
    }

    #[test]
    fn test_scoring_rubric_mentions_every_level() {
        for level in ["5  =", "4  =", "3  =", "2  =", "1  =", "0  =", "-1 ="] {
            assert!(SCORING_SYSTEM.contains(level), "missing level {}", level);
        }
    }

    #[test]
    fn test_prompts_are_deterministic() {
        let passages = vec![invoice_passage()];
        assert_eq!(
            build_draft_prompt("q", &passages),
            build_draft_prompt("q", &passages)
        );
        assert_eq!(
            build_scoring_prompt("q", "a", &draft(), &passages),
            build_scoring_prompt("q", "a", &draft(), &passages)
        );
        assert_eq!(
            build_segmentation_prompt("Customer: x"),
            build_segmentation_prompt("Customer: x")
        );
    }
}
