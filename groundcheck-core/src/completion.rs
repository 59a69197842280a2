//! Parsing of raw model completions.
//!
//! Models are asked for JSON but routinely wrap it in Markdown fences, add a
//! sentence of preamble, or return prose. Malformed output is a value here,
//! not an error: each stage decides its own fallback.

use serde_json::Value;

/// Outcome of interpreting a completion.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedCompletion<T> {
    Parsed(T),
    Unparseable { raw: String, reason: String },
}

impl<T> ParsedCompletion<T> {
    pub fn unparseable(raw: &str, reason: impl Into<String>) -> Self {
        ParsedCompletion::Unparseable {
            raw: raw.to_string(),
            reason: reason.into(),
        }
    }

    pub fn is_parsed(&self) -> bool {
        matches!(self, ParsedCompletion::Parsed(_))
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> ParsedCompletion<U> {
        match self {
            ParsedCompletion::Parsed(value) => ParsedCompletion::Parsed(f(value)),
            ParsedCompletion::Unparseable { raw, reason } => {
                ParsedCompletion::Unparseable { raw, reason }
            }
        }
    }

    pub fn into_option(self) -> Option<T> {
        match self {
            ParsedCompletion::Parsed(value) => Some(value),
            ParsedCompletion::Unparseable { .. } => None,
        }
    }
}

/// Remove surrounding Markdown code fences, if any.
fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string ("json") on the opening fence line.
    let body = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

/// Extract the first JSON object from a completion.
///
/// Strips code fences, then parses the span from the first `{` to the last
/// `}`. Anything that is not a JSON object is `Unparseable`.
pub fn extract_json_object(text: &str) -> ParsedCompletion<serde_json::Map<String, Value>> {
    let body = strip_code_fences(text);
    if body.is_empty() {
        return ParsedCompletion::unparseable(text, "empty completion");
    }
    let (Some(start), Some(end)) = (body.find('{'), body.rfind('}')) else {
        return ParsedCompletion::unparseable(text, "no JSON object in completion");
    };
    if end < start {
        return ParsedCompletion::unparseable(text, "no JSON object in completion");
    }
    match serde_json::from_str::<Value>(&body[start..=end]) {
        Ok(Value::Object(map)) => ParsedCompletion::Parsed(map),
        Ok(_) => ParsedCompletion::unparseable(text, "completion JSON is not an object"),
        Err(e) => ParsedCompletion::unparseable(text, format!("invalid JSON: {}", e)),
    }
}

/// First non-blank string found under any of `keys`.
pub fn string_field(map: &serde_json::Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match map.get(*key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    })
}

/// Interpret a JSON value as a number, accepting numeric strings.
pub fn number_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|n| n.is_finite())
}

/// Collect the non-blank strings of a JSON array (or a lone string).
pub fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| item.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect(),
        Some(Value::String(s)) if !s.trim().is_empty() => vec![s.trim().to_string()],
        _ => Vec::new(),
    }
}
