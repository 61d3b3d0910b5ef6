//! Core data model: prompts, replies, and per-tool detection patterns.
//!
//! A `PromptEvent` is a moment where the supervised child program has paused
//! and is waiting on a human. `PatternSet` holds the ordered, pre-compiled
//! regular expressions an `Adapter` uses to recognize its tool's prompts in
//! ANSI-stripped PTY output (the detector's "pattern signal", spec §4.3).

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state_machine::PromptState;

/// What kind of answer a prompt is asking for (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptType {
    YesNo,
    ConfirmEnter,
    MultipleChoice,
    FreeText,
}

/// How sure the detector is that this is really a prompt (spec §3, §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

/// Which detector signal produced this `PromptEvent` (spec §3, §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    Pattern,
    BlockedRead,
    Silence,
}

/// A detected request for human input (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptEvent {
    pub prompt_id: Uuid,
    pub session_id: String,
    pub prompt_type: PromptType,
    /// ANSI-stripped text, length bounded by the detector's 4096-byte buffer.
    pub excerpt: String,
    pub confidence: Confidence,
    pub signal: Signal,
    pub created_at: DateTime<Utc>,
    pub ttl_seconds: u64,
    pub state: PromptState,
    /// Unique token embedded in channel-side callbacks (spec §3, Glossary).
    pub nonce: Uuid,
}

impl PromptEvent {
    /// Build a freshly detected prompt in state `CREATED`.
    pub fn new(
        session_id: impl Into<String>,
        prompt_type: PromptType,
        excerpt: impl Into<String>,
        confidence: Confidence,
        signal: Signal,
        ttl_seconds: u64,
    ) -> Self {
        Self {
            prompt_id: Uuid::new_v4(),
            session_id: session_id.into(),
            prompt_type,
            excerpt: excerpt.into(),
            confidence,
            signal,
            created_at: Utc::now(),
            ttl_seconds,
            state: PromptState::Created,
            nonce: Uuid::new_v4(),
        }
    }

    /// Whether this prompt's TTL has elapsed as of `now` (spec §4.1).
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let deadline = self.created_at + chrono::Duration::seconds(self.ttl_seconds as i64);
        deadline <= now
    }
}

/// Who produced a `Reply` (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplySource {
    Human,
    Autopilot,
    Synthetic,
}

/// A response intended for a specific prompt (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    pub prompt_id: Uuid,
    pub session_id: String,
    /// `"y"`/`"n"` for yes_no, empty for confirm_enter, free text or a choice
    /// index otherwise.
    pub value: String,
    pub source: ReplySource,
    /// Channel-side sender identifier, checked against an allowlist.
    pub identity: String,
    pub received_at: DateTime<Utc>,
}

/// Strip ANSI escape sequences from PTY output (CSI, OSC, and simple
/// two-byte escapes), normalizing to plain text for pattern matching.
pub fn strip_ansi(input: &str) -> String {
    static ANSI_RE: std::sync::LazyLock<Regex> = std::sync::LazyLock::new(|| {
        Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[^\[\]]").unwrap()
    });
    ANSI_RE.replace_all(input, "").to_string()
}

/// Normalize CRLF line endings to LF, as required before pattern matching
/// (spec §4.3, "Pattern signal").
pub fn normalize_crlf(input: &str) -> String {
    input.replace("\r\n", "\n")
}

type PromptClassifier = fn(&str) -> String;

/// An ordered, pre-compiled set of prompt-recognition patterns for one
/// adapter. Regexes are compiled once at construction (spec §4.3: "every
/// regex is pre-compiled") and applied in order — first match wins.
pub struct PatternSet {
    patterns: Vec<(PromptType, Regex, PromptClassifier)>,
}

/// A match against a `PatternSet`.
#[derive(Debug, Clone, PartialEq)]
pub struct PatternMatch {
    pub prompt_type: PromptType,
    pub excerpt: String,
}

fn identity_excerpt(s: &str) -> String {
    s.to_string()
}

impl PatternSet {
    pub fn new(patterns: Vec<(PromptType, Regex)>) -> Self {
        Self {
            patterns: patterns
                .into_iter()
                .map(|(t, r)| (t, r, identity_excerpt as PromptClassifier))
                .collect(),
        }
    }

    /// Scan `text` (already ANSI-stripped, CRLF-normalized) for the first
    /// matching pattern. Applies to the whole string; callers that need the
    /// "tail of the buffer" restriction (spec §4.3) pass an already-truncated
    /// slice.
    pub fn detect(&self, text: &str) -> Option<PatternMatch> {
        for (prompt_type, regex, classify) in &self.patterns {
            if let Some(m) = regex.find(text) {
                return Some(PatternMatch {
                    prompt_type: *prompt_type,
                    excerpt: classify(m.as_str()),
                });
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_ansi_removes_csi() {
        let input = "\x1b[31mERROR\x1b[0m: something broke";
        assert_eq!(strip_ansi(input), "ERROR: something broke");
    }

    #[test]
    fn strip_ansi_removes_osc() {
        let input = "\x1b]0;title\x07some text";
        assert_eq!(strip_ansi(input), "some text");
    }

    #[test]
    fn strip_ansi_passthrough_clean_text() {
        assert_eq!(strip_ansi("just normal text"), "just normal text");
    }

    #[test]
    fn normalize_crlf_to_lf() {
        assert_eq!(normalize_crlf("a\r\nb\r\n"), "a\nb\n");
    }

    #[test]
    fn prompt_event_not_expired_within_ttl() {
        let p = PromptEvent::new(
            "sess-1",
            PromptType::YesNo,
            "Continue? [y/N]",
            Confidence::High,
            Signal::Pattern,
            30,
        );
        assert!(!p.is_expired(Utc::now()));
    }

    #[test]
    fn prompt_event_expired_after_ttl() {
        let mut p = PromptEvent::new(
            "sess-1",
            PromptType::YesNo,
            "Continue? [y/N]",
            Confidence::High,
            Signal::Pattern,
            30,
        );
        p.created_at = Utc::now() - chrono::Duration::seconds(31);
        assert!(p.is_expired(Utc::now()));
    }

    #[test]
    fn pattern_set_first_match_wins() {
        let set = PatternSet::new(vec![
            (PromptType::YesNo, Regex::new(r"\[y/n\]").unwrap()),
            (PromptType::FreeText, Regex::new(r".*").unwrap()),
        ]);
        let m = set.detect("Continue? [y/n]").unwrap();
        assert_eq!(m.prompt_type, PromptType::YesNo);
    }

    #[test]
    fn pattern_set_no_match() {
        let set = PatternSet::new(vec![(PromptType::YesNo, Regex::new(r"\[y/n\]").unwrap())]);
        assert!(set.detect("Writing function to parse YAML...").is_none());
    }

    #[test]
    fn confidence_orders_low_below_high() {
        assert!(Confidence::Low < Confidence::High);
    }
}
