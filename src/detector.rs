//! The tri-signal prompt detector (spec §4.3).
//!
//! Three independent signals feed a single decision: pattern (high
//! confidence, adapter-supplied regex), blocked-read (medium confidence,
//! OS-level inference via the `Pty` contract), and silence (low
//! confidence, timing-based). Grounded on the teacher's
//! `SupervisorState`/`PromptDetector` state machine, extended with the
//! blocked-read signal, an explicit bounded buffer, and a regex time
//! budget.

use std::time::{Duration, Instant};

use crate::prompt::{normalize_crlf, strip_ansi, Confidence, PatternSet, Signal};

/// Bound on the tail of the output buffer the pattern signal scans
/// (spec §4.3: "apply only to the tail of the buffer (last N bytes ...)").
pub const PATTERN_TAIL_BYTES: usize = 4096;

/// Per-analysis time budget for the pattern layer; exceeding it skips the
/// layer for that call and falls through to the silence layer (spec §4.3
/// Safety).
pub const PATTERN_TIME_BUDGET: Duration = Duration::from_millis(5);

/// Configuration for detector timing (spec §4.3).
#[derive(Debug, Clone, Copy)]
pub struct DetectorConfig {
    /// No output for this long (after at least one byte this turn) with no
    /// other signal firing emits the silence signal. Default 2000ms.
    pub silence_ms: u64,
    /// After any injection, the detector returns "none" unconditionally for
    /// this long, to prevent echo-loop re-detection. Default 500ms.
    pub post_inject_suppress_ms: u64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            silence_ms: 2000,
            post_inject_suppress_ms: 500,
        }
    }
}

/// A detected prompt, prior to being wrapped into a full `PromptEvent` (the
/// detector doesn't know `session_id`/`ttl_seconds`, which are supplied by
/// its caller).
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorHit {
    pub prompt_type: crate::prompt::PromptType,
    pub excerpt: String,
    pub confidence: Confidence,
    pub signal: Signal,
}

/// Output of a single detector tick.
#[derive(Debug, Clone, PartialEq)]
pub enum DetectorEvent {
    /// Nothing to report — either no signal fired, or the suppression
    /// window is active.
    Working,
    PromptDetected(DetectorHit),
}

/// Tri-signal prompt detector (spec §4.3).
pub struct PromptDetector {
    patterns: PatternSet,
    config: DetectorConfig,
    buffer: String,
    turn_started_at: Option<Instant>,
    last_output_at: Option<Instant>,
    suppress_until: Option<Instant>,
}

impl PromptDetector {
    pub fn new(patterns: PatternSet, config: DetectorConfig) -> Self {
        Self {
            patterns,
            config,
            buffer: String::new(),
            turn_started_at: None,
            last_output_at: None,
            suppress_until: None,
        }
    }

    fn in_suppression_window(&self, now: Instant) -> bool {
        self.suppress_until.map(|until| now < until).unwrap_or(false)
    }

    /// Feed newly read output to the detector. Returns a `PromptDetected`
    /// event if the pattern signal or (when the caller reports the child is
    /// blocked) the blocked-read signal fires.
    pub fn on_output(&mut self, chunk: &str, child_blocked_on_read: bool) -> DetectorEvent {
        let now = Instant::now();
        self.last_output_at = Some(now);
        if self.turn_started_at.is_none() {
            self.turn_started_at = Some(now);
        }

        let normalized = normalize_crlf(&strip_ansi(chunk));
        self.buffer.push_str(&normalized);
        if self.buffer.len() > PATTERN_TAIL_BYTES * 4 {
            let excess = self.buffer.len() - PATTERN_TAIL_BYTES * 4;
            self.buffer.drain(..excess);
        }

        if self.in_suppression_window(now) {
            return DetectorEvent::Working;
        }

        if let Some(hit) = self.try_pattern_signal() {
            return DetectorEvent::PromptDetected(hit);
        }

        if child_blocked_on_read && !self.buffer.ends_with('\n') {
            if let Some(trailing) = self.trailing_line() {
                return DetectorEvent::PromptDetected(DetectorHit {
                    prompt_type: crate::prompt::PromptType::FreeText,
                    excerpt: trailing,
                    confidence: Confidence::Medium,
                    signal: Signal::BlockedRead,
                });
            }
        }

        DetectorEvent::Working
    }

    fn try_pattern_signal(&mut self) -> Option<DetectorHit> {
        let tail_start = self.buffer.len().saturating_sub(PATTERN_TAIL_BYTES);
        // Respect a char boundary so we never panic slicing a multi-byte
        // UTF-8 sequence in half.
        let tail_start = (tail_start..=self.buffer.len())
            .find(|&i| self.buffer.is_char_boundary(i))
            .unwrap_or(self.buffer.len());
        let tail = &self.buffer[tail_start..];

        let start = Instant::now();
        let result = self.patterns.detect(tail);
        if start.elapsed() > PATTERN_TIME_BUDGET {
            tracing::warn!(
                elapsed_ms = start.elapsed().as_millis() as u64,
                "pattern signal exceeded its time budget; falling through to silence layer"
            );
            return None;
        }

        result.map(|m| DetectorHit {
            prompt_type: m.prompt_type,
            excerpt: m.excerpt,
            confidence: Confidence::High,
            signal: Signal::Pattern,
        })
    }

    fn trailing_line(&self) -> Option<String> {
        let line = self.buffer.lines().next_back()?;
        if line.is_empty() {
            None
        } else {
            Some(line.to_string())
        }
    }

    /// Called by the stall watchdog every `silence_ms / 4`. Emits the
    /// silence signal if no output has arrived for `silence_ms` since the
    /// current turn started, and no other signal already fired.
    pub fn tick(&mut self) -> DetectorEvent {
        let now = Instant::now();
        if self.in_suppression_window(now) {
            return DetectorEvent::Working;
        }
        let Some(last) = self.last_output_at else {
            return DetectorEvent::Working;
        };
        if self.turn_started_at.is_none() {
            return DetectorEvent::Working;
        }
        if now.duration_since(last) < Duration::from_millis(self.config.silence_ms) {
            return DetectorEvent::Working;
        }
        let Some(trailing) = self.trailing_line() else {
            return DetectorEvent::Working;
        };
        DetectorEvent::PromptDetected(DetectorHit {
            prompt_type: crate::prompt::PromptType::FreeText,
            excerpt: trailing,
            confidence: Confidence::Low,
            signal: Signal::Silence,
        })
    }

    /// Called by the reply injector immediately after a successful write,
    /// starting the echo-loop suppression window and resetting the turn.
    pub fn answer_injected(&mut self) {
        self.suppress_until =
            Some(Instant::now() + Duration::from_millis(self.config.post_inject_suppress_ms));
        self.turn_started_at = None;
        self.buffer.clear();
    }
}
