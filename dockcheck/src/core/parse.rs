//! Tolerant parsing of agent CLI stdout into [`AgentResult`].
//!
//! Agent output is produced by an LLM and is frequently wrapped, fenced or
//! plain prose. Each stage below either yields a result or falls through to
//! the next one; the cascade always ends in a result, never an error.
//!
//! Stages, in order:
//! 1. blank output: incomplete result carrying a stderr excerpt
//! 2. raw text is a result object (has `completed` and matches the schema)
//! 3. inner text: the `result` (else `content`) field of a JSON envelope, else the raw text
//! 4. one leading Markdown code fence is stripped from the inner text
//! 5. inner text is a result object
//! 6. plain-text fallback with [`FALLBACK_CONFIDENCE`]

use std::sync::LazyLock;

use jsonschema::{Draft, Validator};
use serde_json::Value;

use crate::core::types::{ActionNeeded, AgentResult};

const AGENT_RESULT_SCHEMA: &str = include_str!("../../schemas/agent_result.schema.json");

/// Confidence assigned when the agent answered but not in the result schema.
pub const FALLBACK_CONFIDENCE: f64 = 0.5;

const SUMMARY_LIMIT_CHARS: usize = 500;
const EMPTY_STDERR_LIMIT_CHARS: usize = 200;

static AGENT_RESULT_VALIDATOR: LazyLock<Validator> = LazyLock::new(|| {
    let schema: Value =
        serde_json::from_str(AGENT_RESULT_SCHEMA).expect("agent result schema should be json");
    jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .expect("agent result schema should compile")
});

/// Parse `claude --print --output-format json` output.
///
/// Claude wraps the model reply in an envelope such as
/// `{"type": "result", "result": "<model text>"}`, so every stage applies.
pub fn parse_claude_output(stdout: &str, stderr: &str) -> AgentResult {
    let raw = stdout.trim();
    empty_output(raw, stderr, "agent")
        .or_else(|| result_from_json(raw))
        .unwrap_or_else(|| {
            let inner = strip_code_fence(&envelope_text(raw));
            result_from_json(&inner).unwrap_or_else(|| plain_text(&inner, raw))
        })
}

/// Parse `codex --quiet` output: the reply is printed as-is, without an envelope.
pub fn parse_codex_output(stdout: &str, stderr: &str) -> AgentResult {
    let raw = stdout.trim();
    empty_output(raw, stderr, "codex")
        .or_else(|| result_from_json(raw))
        .unwrap_or_else(|| plain_text(raw, raw))
}

fn empty_output(raw: &str, stderr: &str, source: &str) -> Option<AgentResult> {
    if !raw.is_empty() {
        return None;
    }
    Some(AgentResult {
        completed: false,
        confidence: 0.0,
        turns_used: 0,
        summary: format!(
            "Empty response from {source}. stderr={}",
            truncate_chars(stderr, EMPTY_STDERR_LIMIT_CHARS)
        ),
        findings: Vec::new(),
        action_needed: ActionNeeded::None,
    })
}

/// Accept `text` only if it is a JSON object with a `completed` key that
/// satisfies the result schema.
fn result_from_json(text: &str) -> Option<AgentResult> {
    let value: Value = serde_json::from_str(text).ok()?;
    if !value.as_object()?.contains_key("completed") {
        return None;
    }
    if !AGENT_RESULT_VALIDATOR.is_valid(&value) {
        return None;
    }
    serde_json::from_value(value).ok()
}

/// Text the model produced: envelope `result`/`content` field, or the raw
/// output when it is not a JSON object.
fn envelope_text(raw: &str) -> String {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => ["result", "content"]
            .iter()
            .find_map(|key| map.get(*key).filter(|v| !v.is_null()))
            .map(|value| match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .unwrap_or_default(),
        _ => raw.to_string(),
    }
}

/// Remove one leading ```` ``` ```` fence (with optional language tag) and
/// everything from the closing fence on.
fn strip_code_fence(text: &str) -> String {
    let text = text.trim();
    if !text.starts_with("```") {
        return text.to_string();
    }
    text.lines()
        .skip(1)
        .take_while(|line| !line.starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

fn plain_text(inner: &str, raw: &str) -> AgentResult {
    let source = if inner.is_empty() { raw } else { inner };
    AgentResult {
        completed: true,
        confidence: FALLBACK_CONFIDENCE,
        turns_used: 0,
        summary: truncate_chars(source, SUMMARY_LIMIT_CHARS).to_string(),
        findings: Vec::new(),
        action_needed: ActionNeeded::None,
    }
}

/// First `max` characters of `s`, respecting char boundaries.
pub(crate) fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Finding, Severity};

    #[test]
    fn blank_output_is_incomplete_with_stderr_excerpt() {
        let stderr = "x".repeat(300);
        let result = parse_claude_output("  \n ", &stderr);
        assert!(!result.completed);
        assert_eq!(result.confidence, 0.0);
        assert!(result.summary.starts_with("Empty response from agent. stderr="));
        assert!(result.summary.ends_with(&"x".repeat(200)));
        assert!(!result.summary.contains(&"x".repeat(201)));
    }

    #[test]
    fn direct_result_object_is_returned() {
        let raw = r#"{"completed": true, "confidence": 0.85, "turns_used": 4, "summary": "ok", "findings": [{"severity": "warning", "message": "slow test"}], "action_needed": "retry"}"#;
        let result = parse_claude_output(raw, "");
        assert!(result.completed);
        assert_eq!(result.confidence, 0.85);
        assert_eq!(result.turns_used, 4);
        assert_eq!(result.action_needed, ActionNeeded::Retry);
        assert_eq!(result.findings[0].severity, Severity::Warning);
    }

    #[test]
    fn envelope_with_fenced_json_is_unwrapped() {
        let raw = r#"{"type":"result","result":"```json\n{\"completed\":true,\"confidence\":0.7,\"summary\":\"fenced\"}\n```"}"#;
        let result = parse_claude_output(raw, "");
        assert!(result.completed);
        assert_eq!(result.confidence, 0.7);
        assert_eq!(result.summary, "fenced");
    }

    #[test]
    fn content_field_is_used_when_result_missing() {
        let raw = r#"{"type":"message","content":"{\"completed\":false,\"confidence\":0.2}"}"#;
        let result = parse_claude_output(raw, "");
        assert!(!result.completed);
        assert_eq!(result.confidence, 0.2);
    }

    #[test]
    fn fenced_plain_text_without_envelope_is_parsed() {
        let raw = "```\n{\"completed\":true,\"confidence\":0.9}\n```\ntrailing chatter";
        let result = parse_claude_output(raw, "");
        assert_eq!(result.confidence, 0.9);
    }

    #[test]
    fn prose_falls_back_to_default_confidence() {
        let raw = "All tests passed. ".repeat(50);
        let result = parse_claude_output(&raw, "");
        assert!(result.completed);
        assert_eq!(result.confidence, FALLBACK_CONFIDENCE);
        assert_eq!(result.summary.chars().count(), 500);
    }

    #[test]
    fn envelope_with_prose_uses_inner_text_as_summary() {
        let raw = r#"{"type":"result","result":"Looks good to me."}"#;
        let result = parse_claude_output(raw, "");
        assert_eq!(result.confidence, FALLBACK_CONFIDENCE);
        assert_eq!(result.summary, "Looks good to me.");
    }

    #[test]
    fn envelope_without_text_uses_raw_output_as_summary() {
        let raw = r#"{"type":"result","is_error":true}"#;
        let result = parse_claude_output(raw, "");
        assert_eq!(result.summary, raw);
    }

    #[test]
    fn out_of_range_confidence_is_not_trusted() {
        let raw = r#"{"completed": true, "confidence": 1.5}"#;
        let result = parse_claude_output(raw, "");
        assert_eq!(result.confidence, FALLBACK_CONFIDENCE);
        assert_eq!(result.summary, raw);
    }

    #[test]
    fn serialized_result_round_trips_through_direct_match() {
        let original = AgentResult {
            completed: true,
            confidence: 0.42,
            turns_used: 3,
            summary: "round trip".to_string(),
            findings: vec![Finding {
                severity: Severity::Error,
                message: "bad".to_string(),
                file_path: Some("src/lib.rs".to_string()),
                line: Some(12),
            }],
            action_needed: ActionNeeded::Escalate,
        };
        let raw = serde_json::to_string(&original).expect("serialize");
        assert_eq!(parse_claude_output(&raw, ""), original);
        assert_eq!(parse_codex_output(&raw, ""), original);
    }

    #[test]
    fn codex_does_not_unwrap_envelopes() {
        let raw = r#"{"type":"result","result":"{\"completed\":true,\"confidence\":0.9}"}"#;
        let result = parse_codex_output(raw, "");
        assert_eq!(result.confidence, FALLBACK_CONFIDENCE);
        assert_eq!(result.summary, raw);
    }

    #[test]
    fn codex_blank_output_names_codex() {
        let result = parse_codex_output("", "boom");
        assert_eq!(result.summary, "Empty response from codex. stderr=boom");
    }

    #[test]
    fn truncate_chars_respects_multibyte_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("hi", 10), "hi");
    }
}
