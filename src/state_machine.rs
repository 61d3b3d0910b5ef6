//! The prompt lifecycle state machine (spec §4.2, §4.4).
//!
//! Pure and in-memory: this module holds no state of its own. `Store` is the
//! only component allowed to persist a transition; everyone else asks
//! `is_legal` before attempting one.

use serde::{Deserialize, Serialize};

/// A prompt's position in its lifecycle (spec §3, §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PromptState {
    Created,
    Routed,
    AwaitingReply,
    ReplyReceived,
    Injected,
    Resolved,
    Expired,
    Canceled,
    Failed,
}

impl PromptState {
    /// Terminal states never transition again (spec §4.2).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PromptState::Resolved | PromptState::Expired | PromptState::Canceled | PromptState::Failed
        )
    }
}

impl std::fmt::Display for PromptState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PromptState::Created => "CREATED",
            PromptState::Routed => "ROUTED",
            PromptState::AwaitingReply => "AWAITING_REPLY",
            PromptState::ReplyReceived => "REPLY_RECEIVED",
            PromptState::Injected => "INJECTED",
            PromptState::Resolved => "RESOLVED",
            PromptState::Expired => "EXPIRED",
            PromptState::Canceled => "CANCELED",
            PromptState::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Whether a transition from `from` to `to` is legal (spec §4.2).
///
/// The happy path is linear: CREATED -> ROUTED -> AWAITING_REPLY ->
/// REPLY_RECEIVED -> INJECTED -> RESOLVED. Any non-terminal state may also
/// fall through to EXPIRED, CANCELED, or FAILED. Terminal states accept no
/// further transitions, including to themselves.
pub fn is_legal(from: PromptState, to: PromptState) -> bool {
    use PromptState::*;

    if from.is_terminal() {
        return false;
    }
    if matches!(to, Expired | Canceled | Failed) {
        return true;
    }
    matches!(
        (from, to),
        (Created, Routed)
            | (Routed, AwaitingReply)
            | (AwaitingReply, ReplyReceived)
            | (ReplyReceived, Injected)
            | (Injected, Resolved)
    )
}
