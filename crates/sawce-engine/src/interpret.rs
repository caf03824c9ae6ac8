use sawce_contracts::envelope::Interpretation;
use sawce_contracts::error::AnalyzeError;
use sawce_contracts::modes::SchemaKind;
use serde_json::{Map, Value};
use tracing::warn;

use crate::truncate_text;

const PREVIEW_CHARS: usize = 160;

/// Turns raw model text into the payload the mode promised.
///
/// Free text is trimmed and passed through; blank text is rejected.
/// Structured output is unwrapped from code fences and language tags and must
/// decode to a JSON object. Anything else is `MalformedModelOutput`. The
/// object's fields are not checked against the mode schema.
pub fn interpret(raw: &str, expected: &SchemaKind) -> Result<Interpretation, AnalyzeError> {
    match expected {
        SchemaKind::FreeText { .. } => {
            let text = raw.trim();
            if text.is_empty() {
                return Err(malformed("model returned an empty response", raw));
            }
            Ok(Interpretation::Text(text.to_string()))
        }
        SchemaKind::StructuredJson { .. } => decode_object(raw).map(Interpretation::Structured),
    }
}

/// Strips a leading and/or trailing ```` ``` ```` fence and a language tag
/// (`json`, `JSON`, ...) in front of the payload.
pub fn unwrap_fenced(raw: &str) -> &str {
    let mut body = raw.trim();
    if let Some(rest) = body.strip_prefix("```") {
        body = rest;
    }
    if let Some(rest) = body.trim_end().strip_suffix("```") {
        body = rest;
    }
    strip_language_tag(body.trim())
}

fn strip_language_tag(body: &str) -> &str {
    let tag_end = body.find(char::is_whitespace).unwrap_or(body.len());
    let (tag, rest) = body.split_at(tag_end);
    let is_tag = !tag.is_empty()
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '+' | '.'));
    let rest = rest.trim_start();
    if is_tag && (rest.starts_with('{') || rest.starts_with('[')) {
        rest
    } else {
        body
    }
}

fn decode_object(raw: &str) -> Result<Map<String, Value>, AnalyzeError> {
    let body = unwrap_fenced(raw);
    if body.is_empty() {
        return Err(malformed("model returned an empty response", raw));
    }

    let reason = match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(object)) => return Ok(object),
        Ok(other) => return Err(malformed(
            &format!("expected a JSON object, got {}", json_type_name(&other)),
            body,
        )),
        Err(err) => err.to_string(),
    };

    // Prose around the object: retry on the outermost braces.
    if let Some(candidate) = braced_slice(body).filter(|slice| slice.len() < body.len()) {
        if let Ok(Value::Object(object)) = serde_json::from_str::<Value>(candidate) {
            return Ok(object);
        }
    }
    Err(malformed(&reason, body))
}

fn braced_slice(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn malformed(reason: &str, text: &str) -> AnalyzeError {
    let preview = truncate_text(text.trim(), PREVIEW_CHARS);
    warn!(reason, preview = %preview, "model output is unusable");
    AnalyzeError::MalformedModelOutput(format!("{reason}; output began: {preview}"))
}
