//! Tolerant stream-JSON consumer.
//!
//! The Agent CLI emits one JSON object per stdout line, but the schema is
//! not contractually stable. Rather than typed deserialization, this module
//! probes each line for the shapes that have been observed in the wild and
//! folds whatever it finds into a progressively updated record:
//! `next = consume(prev, line)`.

use serde_json::Value;

use crate::db::approvals::ActionClass;
use crate::redact::truncate_chars;

const TOOL_SUMMARY_MAX_CHARS: usize = 160;
const FAILED_LINE_RING: usize = 20;
const FAILED_LINE_MAX_CHARS: usize = 300;

/// A permission-denial event extracted from the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionDenial {
    pub action_class: ActionClass,
    /// Trimmed description shown to the operator (redacted downstream).
    pub description: String,
}

/// Progressively updated parse state for one run.
#[derive(Debug, Clone, Default)]
pub struct StreamUpdate {
    pub assistant_text: String,
    pub tool_summaries: Vec<String>,
    pub session_ref: Option<String>,
    pub tokens_used: Option<u64>,
    pub permission_denial: Option<PermissionDenial>,
    /// Tool activity recorded while replaying an approved action.
    pub replay_actions: Vec<String>,
    pub parse_failures: u32,
    /// Capped ring of unparseable lines for the debug sink.
    pub failed_lines: Vec<String>,
}

impl StreamUpdate {
    /// True when the run produced nothing human-readable despite emitting
    /// lines that failed to parse. This is the schema-drift condition.
    pub fn looks_like_schema_drift(&self) -> bool {
        self.assistant_text.is_empty() && self.tool_summaries.is_empty() && self.parse_failures > 0
    }
}

/// Fold one stdout line into the record. `replay_mode` additionally copies
/// tool activity into the replay-actions list.
pub fn consume(mut state: StreamUpdate, line: &str, replay_mode: bool) -> StreamUpdate {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return state;
    }
    let value: Value = match serde_json::from_str(trimmed) {
        Ok(v) => v,
        Err(_) => {
            state.parse_failures += 1;
            if state.failed_lines.len() < FAILED_LINE_RING {
                state
                    .failed_lines
                    .push(truncate_chars(trimmed, FAILED_LINE_MAX_CHARS));
            }
            return state;
        }
    };

    if let Some(text) = extract_assistant_text(&value) {
        if !state.assistant_text.is_empty() {
            state.assistant_text.push('\n');
        }
        state.assistant_text.push_str(&text);
    }

    if let Some(summary) = extract_tool_summary(&value) {
        if replay_mode {
            state.replay_actions.push(summary.clone());
        }
        state.tool_summaries.push(summary);
    }

    if state.session_ref.is_none() {
        state.session_ref = extract_session_ref(&value);
    }

    if let Some(tokens) = extract_total_tokens(&value) {
        state.tokens_used = Some(tokens);
    }

    if state.permission_denial.is_none() {
        state.permission_denial = extract_permission_denial(&value);
    }

    state
}

/// Pull human-readable assistant text out of the likely shapes.
fn extract_assistant_text(v: &Value) -> Option<String> {
    let role = v.get("role").and_then(Value::as_str);
    let typ = v.get("type").and_then(Value::as_str);

    let is_assistant = role == Some("assistant")
        || typ.map(|t| t.starts_with("assistant")).unwrap_or(false)
        || typ == Some("result");

    if let Some(result) = v.get("result").and_then(Value::as_str) {
        let trimmed = result.trim();
        if !trimmed.is_empty() {
            return Some(trimmed.to_string());
        }
    }

    if !is_assistant && role.is_some() {
        // explicit non-assistant role (user/system echoes)
        return None;
    }

    let content = v
        .get("content")
        .or_else(|| v.get("message").and_then(|m| m.get("content")))
        .or_else(|| v.get("text"));
    let text = flatten_text(content?)?;
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Flatten a content value: a plain string, or an array of text blocks.
fn flatten_text(content: &Value) -> Option<String> {
    match content {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => {
            let mut acc = String::new();
            for item in items {
                let piece = match item {
                    Value::String(s) => Some(s.clone()),
                    Value::Object(_) => item.get("text").and_then(Value::as_str).map(String::from),
                    _ => None,
                };
                if let Some(p) = piece {
                    if !acc.is_empty() {
                        acc.push('\n');
                    }
                    acc.push_str(&p);
                }
            }
            if acc.is_empty() {
                None
            } else {
                Some(acc)
            }
        }
        _ => None,
    }
}

/// `"{tool}: {one-line summary}"`, truncated.
fn extract_tool_summary(v: &Value) -> Option<String> {
    let tool = v
        .get("tool_name")
        .or_else(|| v.get("toolName"))
        .or_else(|| {
            // bare `name` only counts on tool-ish objects
            match v.get("type").and_then(Value::as_str) {
                Some(t) if t.contains("tool") => v.get("name"),
                _ => None,
            }
        })
        .and_then(Value::as_str)?;

    let detail = v
        .get("input")
        .or_else(|| v.get("arguments"))
        .or_else(|| v.get("summary"))
        .or_else(|| v.get("text"))
        .map(compact_one_line)
        .unwrap_or_default();

    let summary = if detail.is_empty() {
        tool.to_string()
    } else {
        format!("{tool}: {detail}")
    };
    Some(truncate_chars(&summary, TOOL_SUMMARY_MAX_CHARS))
}

fn compact_one_line(v: &Value) -> String {
    let raw = match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn extract_session_ref(v: &Value) -> Option<String> {
    v.get("session_id")
        .or_else(|| v.get("conversation_id"))
        .and_then(Value::as_str)
        .map(String::from)
}

fn extract_total_tokens(v: &Value) -> Option<u64> {
    let usage = v
        .get("usage")
        .or_else(|| v.get("message").and_then(|m| m.get("usage")))?;
    usage.get("total_tokens").and_then(Value::as_u64)
}

/// Detect a permission denial. A structured `permission_denial` object wins
/// over keyword sniffing when the CLI provides one.
fn extract_permission_denial(v: &Value) -> Option<PermissionDenial> {
    if v.get("type").and_then(Value::as_str) == Some("permission_denial") {
        let description = v
            .get("description")
            .or_else(|| v.get("text"))
            .and_then(Value::as_str)
            .unwrap_or("permission denied")
            .trim()
            .to_string();
        return Some(PermissionDenial {
            action_class: classify_action(&description),
            description,
        });
    }

    let typ = v.get("type").and_then(Value::as_str).unwrap_or_default();
    let text = v
        .get("text")
        .or_else(|| v.get("message"))
        .or_else(|| v.get("error"))
        .or_else(|| v.get("content"))
        .map(compact_one_line)
        .unwrap_or_default();
    let haystack = format!("{typ} {text}").to_lowercase();
    if haystack.contains("permission") && (haystack.contains("denied") || haystack.contains("denial"))
    {
        let description = if text.trim().is_empty() {
            typ.to_string()
        } else {
            text.trim().to_string()
        };
        return Some(PermissionDenial {
            action_class: classify_action(&description),
            description,
        });
    }
    None
}

/// Keyword classification, most specific patterns first so "rm -rf" lands on
/// destructive_cmd rather than file_delete, and "git push --force" on
/// git_force rather than git_push.
pub fn classify_action(description: &str) -> ActionClass {
    let d = description.to_lowercase();
    if d.contains("rm -rf") || d.contains("drop table") {
        ActionClass::DestructiveCmd
    } else if d.contains("force") || d.contains("reset") {
        ActionClass::GitForce
    } else if d.contains("git push") {
        ActionClass::GitPush
    } else if d.contains("pip install") || d.contains("npm install") {
        ActionClass::InstallPackage
    } else if d.contains("delete") || d.contains("rm ") || d.ends_with("rm") {
        ActionClass::FileDelete
    } else if d.contains("http") || d.contains("api") {
        ActionClass::ExternalRequest
    } else {
        ActionClass::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(lines: &[&str]) -> StreamUpdate {
        let mut state = StreamUpdate::default();
        for line in lines {
            state = consume(state, line, false);
        }
        state
    }

    #[test]
    fn accumulates_assistant_text_from_role_shape() {
        let state = feed(&[
            r#"{"role":"assistant","content":"first part"}"#,
            r#"{"role":"assistant","content":[{"type":"text","text":"second part"}]}"#,
        ]);
        assert_eq!(state.assistant_text, "first part\nsecond part");
    }

    #[test]
    fn reads_result_and_type_shapes() {
        let state = feed(&[
            r#"{"type":"assistant_message","text":"from type"}"#,
            r#"{"type":"result","result":"final words"}"#,
        ]);
        assert!(state.assistant_text.contains("from type"));
        assert!(state.assistant_text.contains("final words"));
    }

    #[test]
    fn ignores_non_assistant_roles() {
        let state = feed(&[r#"{"role":"user","content":"echoed prompt"}"#]);
        assert!(state.assistant_text.is_empty());
    }

    #[test]
    fn collects_tool_summaries() {
        let state = feed(&[
            r#"{"type":"tool_use","tool_name":"shell","input":{"command":"ls -la"}}"#,
            r#"{"type":"tool_use","name":"edit","input":{"path":"src/main.rs"}}"#,
        ]);
        assert_eq!(state.tool_summaries.len(), 2);
        assert!(state.tool_summaries[0].starts_with("shell: "));
        assert!(state.tool_summaries[1].starts_with("edit: "));
    }

    #[test]
    fn first_session_ref_wins() {
        let state = feed(&[
            r#"{"session_id":"sess-1"}"#,
            r#"{"conversation_id":"sess-2"}"#,
        ]);
        assert_eq!(state.session_ref.as_deref(), Some("sess-1"));
    }

    #[test]
    fn latest_usage_wins() {
        let state = feed(&[
            r#"{"usage":{"total_tokens":100}}"#,
            r#"{"usage":{"total_tokens":250}}"#,
        ]);
        assert_eq!(state.tokens_used, Some(250));
    }

    #[test]
    fn malformed_lines_count_but_do_not_stop_parsing() {
        let state = feed(&[
            "\u{1b}[31mANSI garbage\u{1b}[0m",
            r#"{"truncated": "#,
            r#"{"role":"assistant","content":"still here"}"#,
        ]);
        assert_eq!(state.parse_failures, 2);
        assert_eq!(state.failed_lines.len(), 2);
        assert_eq!(state.assistant_text, "still here");
        assert!(!state.looks_like_schema_drift());
    }

    #[test]
    fn schema_drift_needs_failures_and_no_content() {
        let state = feed(&["not json at all"]);
        assert!(state.looks_like_schema_drift());
        let ok = feed(&[r#"{"role":"assistant","content":"hi"}"#]);
        assert!(!ok.looks_like_schema_drift());
    }

    #[test]
    fn keyword_denial_is_detected_and_classified() {
        let state = feed(&[
            r#"{"type":"error","text":"Permission denied: git push origin main"}"#,
        ]);
        let denial = state.permission_denial.unwrap();
        assert_eq!(denial.action_class, ActionClass::GitPush);
        assert!(denial.description.contains("git push"));
    }

    #[test]
    fn structured_denial_wins_over_keywords() {
        let state = feed(&[
            r#"{"type":"permission_denial","description":"npm install left-pad"}"#,
        ]);
        let denial = state.permission_denial.unwrap();
        assert_eq!(denial.action_class, ActionClass::InstallPackage);
    }

    #[test]
    fn classification_prefers_specific_patterns() {
        assert_eq!(classify_action("run rm -rf /tmp/x"), ActionClass::DestructiveCmd);
        assert_eq!(classify_action("git push --force"), ActionClass::GitForce);
        assert_eq!(classify_action("git push origin"), ActionClass::GitPush);
        assert_eq!(classify_action("delete old logs"), ActionClass::FileDelete);
        assert_eq!(classify_action("pip install requests"), ActionClass::InstallPackage);
        assert_eq!(classify_action("call external api"), ActionClass::ExternalRequest);
        assert_eq!(classify_action("something odd"), ActionClass::Unknown);
    }

    #[test]
    fn replay_mode_records_tool_activity() {
        let mut state = StreamUpdate::default();
        state = consume(
            state,
            r#"{"type":"tool_use","tool_name":"shell","input":{"command":"git push"}}"#,
            true,
        );
        assert_eq!(state.replay_actions.len(), 1);
        assert!(state.replay_actions[0].starts_with("shell: "));
    }

    #[test]
    fn failed_line_ring_is_capped() {
        let mut state = StreamUpdate::default();
        for i in 0..30 {
            state = consume(state, &format!("garbage line {i}"), false);
        }
        assert_eq!(state.parse_failures, 30);
        assert_eq!(state.failed_lines.len(), 20);
    }

    #[test]
    fn twenty_percent_noise_fixture_still_yields_text() {
        let mut lines: Vec<String> = Vec::new();
        for i in 0..40 {
            lines.push(format!(
                r#"{{"role":"assistant","content":"chunk {i}"}}"#
            ));
            if i % 5 == 0 {
                lines.push("\u{0000}\u{00ff} binary noise".to_string());
            }
        }
        let mut state = StreamUpdate::default();
        for line in &lines {
            state = consume(state, line, false);
        }
        assert!(state.parse_failures >= 8);
        assert!(state.assistant_text.contains("chunk 0"));
        assert!(state.assistant_text.contains("chunk 39"));
    }
}
