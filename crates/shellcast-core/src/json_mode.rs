// ABOUTME: JSON-mode post-processor turning captured stdout into a structured value
// ABOUTME: Best effort: falls back to wrapping the raw text when nothing parses

use serde::Serialize;
use serde_json::{json, Value};

/// Structured form of a command's output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StructuredOutput {
    /// True when `value` came from parsing, false when it wraps raw text.
    pub parsed: bool,
    pub value: Value,
}

impl StructuredOutput {
    pub fn fallback(raw: &str) -> Self {
        Self {
            parsed: false,
            value: json!({ "result": raw }),
        }
    }
}

/// Converts raw output text into a structured value. Must not fail.
pub trait OutputPostProcessor: Send + Sync {
    fn process(&self, raw: &str) -> StructuredOutput;
}

/// Accepts the whole text as JSON, else a fenced ```json block, else the
/// outermost `{...}` span.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonModeProcessor;

impl OutputPostProcessor for JsonModeProcessor {
    fn process(&self, raw: &str) -> StructuredOutput {
        let candidates = [
            Some(raw.trim()),
            fenced_block(raw),
            outer_object(raw),
        ];

        for candidate in candidates.into_iter().flatten() {
            if candidate.is_empty() {
                continue;
            }
            if let Ok(value) = serde_json::from_str::<Value>(candidate) {
                return StructuredOutput { parsed: true, value };
            }
        }
        StructuredOutput::fallback(raw)
    }
}

fn fenced_block(raw: &str) -> Option<&str> {
    let start = raw.find("```json")? + "```json".len();
    let rest = &raw[start..];
    let end = rest.find("```")?;
    Some(rest[..end].trim())
}

fn outer_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (end > start).then(|| &raw[start..=end])
}
