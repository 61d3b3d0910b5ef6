//! Adapter layer: translates between the core and a specific agent CLI's
//! conventions (spec §4.6).
//!
//! An adapter supplies the pattern signal's regex table and knows how to
//! turn a committed `Reply` into the exact bytes the child program expects
//! on its stdin. It does not own the PTY or process — the supervisor does.

pub mod aider;
pub mod claude;
pub mod codex;

use crate::prompt::{PatternSet, PromptType};
use crate::pty::SpawnConfig;

/// Trait every agent adapter implements (spec §4.6).
pub trait Adapter: Send + Sync {
    /// Human-readable name (e.g., "claude-code", "codex-cli", "aider").
    fn name(&self) -> &str;

    /// Build the spawn configuration for this agent.
    fn spawn_config(&self, task_description: &str, work_dir: &std::path::Path) -> SpawnConfig;

    /// The ordered, pre-compiled pattern set this adapter recognizes
    /// (spec §4.3 pattern signal).
    fn prompt_patterns(&self) -> PatternSet;

    /// Turn a committed reply value into the exact bytes to write to the
    /// child's stdin — e.g. `y\r` for yes_no `"y"`, `\r` for confirm_enter,
    /// `"<text>\r"` for free_text (spec §4.6).
    ///
    /// Rejects unsafe defaults: a `yes_no` auto-default of `"y"` is only
    /// permitted when `allow_unsafe_default` is set, which the policy layer
    /// sets only when an explicit rule authorized it (spec §4.6).
    fn encode(&self, prompt_type: PromptType, reply_value: &str, allow_unsafe_default: bool) -> Result<Vec<u8>, EncodeError>;

    /// Recognize a tool-specific session-lifecycle signal (completion or
    /// error) in a line of output. Default: no adapter recognizes any.
    fn session_signal(&self, line: &str) -> Option<SessionSignal> {
        let _ = line;
        None
    }
}

/// A session-lifecycle signal an adapter can recognize in its tool's
/// output that is not itself a human prompt (e.g. Claude Code's
/// `stream-json` completion/error envelopes). Distinct from `PromptEvent`,
/// which only ever carries the four human-facing prompt types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionSignal {
    Completion,
    Error { detail: String },
}

/// Failure to encode a reply into child-process input.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EncodeError {
    #[error("yes_no auto-default 'y' requires an explicit policy rule authorizing it")]
    UnsafeDefaultNotPermitted,
    #[error("reply value '{0}' is not valid for prompt type {1:?}")]
    InvalidValue(String, PromptType),
}

/// Encode helper shared by every adapter: validates the reply value against
/// the prompt type before handing off to the adapter's own line-ending
/// convention.
pub fn encode_default(prompt_type: PromptType, reply_value: &str, allow_unsafe_default: bool, newline: &str) -> Result<Vec<u8>, EncodeError> {
    match prompt_type {
        PromptType::YesNo => {
            if !matches!(reply_value, "y" | "n" | "yes" | "no") {
                return Err(EncodeError::InvalidValue(reply_value.to_string(), prompt_type));
            }
            if reply_value == "y" && !allow_unsafe_default {
                return Err(EncodeError::UnsafeDefaultNotPermitted);
            }
            let short = if reply_value.starts_with('y') { "y" } else { "n" };
            Ok(format!("{short}{newline}").into_bytes())
        }
        PromptType::ConfirmEnter => Ok(newline.as_bytes().to_vec()),
        PromptType::MultipleChoice | PromptType::FreeText => {
            Ok(format!("{reply_value}{newline}").into_bytes())
        }
    }
}

/// Look up a reference adapter by name. New adapters are registered here
/// as they're implemented.
pub fn adapter_from_name(name: &str) -> Option<Box<dyn Adapter>> {
    match name {
        "claude" | "claude-code" => Some(Box::new(claude::ClaudeCodeAdapter::new(None))),
        "codex" | "codex-cli" => Some(Box::new(codex::CodexCliAdapter::new(None))),
        "aider" => Some(Box::new(aider::AiderAdapter::new(None))),
        _ => None,
    }
}
