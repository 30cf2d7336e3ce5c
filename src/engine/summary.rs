//! Summarizer seam.
//!
//! The actual summarizer is an external collaborator; the engine only
//! depends on this trait. Input is already redacted by the caller. A failing
//! or slow summarizer degrades to a redacted excerpt of the raw text; a
//! worse summary must never fail the task.

use std::time::Duration;

use async_trait::async_trait;

use crate::redact::truncate_chars;

const SUMMARIZER_TIMEOUT: Duration = Duration::from_secs(10);
const FALLBACK_EXCERPT_CHARS: usize = 1500;

/// Everything a summarizer gets to see. All strings are post-redaction.
#[derive(Debug, Clone)]
pub struct SummaryInput {
    pub raw_text: String,
    pub tool_summaries: Vec<String>,
    pub tokens_used: i64,
    pub token_budget: i64,
    pub replay_actions: Vec<String>,
}

#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, input: &SummaryInput) -> Result<String, String>;
}

/// Pass-through digest used when no external summarizer is wired up.
pub struct ExcerptSummarizer;

#[async_trait]
impl Summarizer for ExcerptSummarizer {
    async fn summarize(&self, input: &SummaryInput) -> Result<String, String> {
        Ok(fallback_summary(input))
    }
}

/// Deterministic digest: excerpt of the assistant text plus the tool trail.
pub fn fallback_summary(input: &SummaryInput) -> String {
    let mut out = if input.raw_text.trim().is_empty() {
        "(no assistant output captured)".to_string()
    } else {
        truncate_chars(input.raw_text.trim(), FALLBACK_EXCERPT_CHARS)
    };
    if !input.tool_summaries.is_empty() {
        out.push_str("\n\nTools used:\n");
        for line in &input.tool_summaries {
            out.push_str("- ");
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

/// Run the summarizer with a timeout; on any failure fall back to the
/// excerpt. When replay actions exist the result must carry an explicit
/// replay section so the operator sees what ran under elevated permissions.
pub async fn summarize_or_fallback(
    summarizer: Option<&dyn Summarizer>,
    input: &SummaryInput,
) -> String {
    let mut summary = match summarizer {
        Some(s) => match tokio::time::timeout(SUMMARIZER_TIMEOUT, s.summarize(input)).await {
            Ok(Ok(text)) if !text.trim().is_empty() => text,
            Ok(Ok(_)) => fallback_summary(input),
            Ok(Err(e)) => {
                tracing::warn!("summarizer failed, using excerpt fallback: {e}");
                fallback_summary(input)
            }
            Err(_) => {
                tracing::warn!("summarizer timed out, using excerpt fallback");
                fallback_summary(input)
            }
        },
        None => fallback_summary(input),
    };
    if !input.replay_actions.is_empty() && !summary.contains("Replay") {
        summary.push_str("\n\nReplay (actions performed under approval):\n");
        for action in &input.replay_actions {
            summary.push_str("- ");
            summary.push_str(action);
            summary.push('\n');
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingSummarizer;

    #[async_trait]
    impl Summarizer for FailingSummarizer {
        async fn summarize(&self, _input: &SummaryInput) -> Result<String, String> {
            Err("model unavailable".to_string())
        }
    }

    struct SlowSummarizer;

    #[async_trait]
    impl Summarizer for SlowSummarizer {
        async fn summarize(&self, _input: &SummaryInput) -> Result<String, String> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok("too late".to_string())
        }
    }

    fn input() -> SummaryInput {
        SummaryInput {
            raw_text: "refactored the widget module".to_string(),
            tool_summaries: vec!["shell: cargo fmt".to_string()],
            tokens_used: 500,
            token_budget: 100_000,
            replay_actions: Vec::new(),
        }
    }

    #[tokio::test]
    async fn failure_falls_back_to_excerpt() {
        let out = summarize_or_fallback(Some(&FailingSummarizer), &input()).await;
        assert!(out.contains("refactored the widget module"));
        assert!(out.contains("shell: cargo fmt"));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_falls_back_to_excerpt() {
        let out = summarize_or_fallback(Some(&SlowSummarizer), &input()).await;
        assert!(out.contains("refactored the widget module"));
        assert!(!out.contains("too late"));
    }

    #[tokio::test]
    async fn replay_actions_force_a_replay_section() {
        let mut i = input();
        i.replay_actions = vec!["shell: git push origin main".to_string()];
        let out = summarize_or_fallback(None, &i).await;
        assert!(out.contains("Replay"));
        assert!(out.contains("git push origin main"));
    }

    #[tokio::test]
    async fn empty_output_still_produces_a_summary() {
        let mut i = input();
        i.raw_text = String::new();
        i.tool_summaries.clear();
        let out = summarize_or_fallback(None, &i).await;
        assert!(!out.trim().is_empty());
    }
}
