//! The `Channel` contract: carries a `PromptEvent` to a human and a `Reply`
//! back, over whatever transport the implementation chooses (spec §4.7).
//!
//! Two reference implementations ship here: `LoopbackChannel`, an
//! in-process mpsc test double used by `lab run` and the integration
//! tests, and `MaildirChannel`, a filesystem-mailbox implementation built
//! on the teacher's already-declared `maildir` dependency. Neither is a
//! hosted messaging transport (Slack, Telegram, etc.) — those are
//! explicitly out of scope (spec §1).

pub mod loopback;
pub mod maildir_channel;

use uuid::Uuid;

use crate::errors::ChannelError;
use crate::prompt::PromptEvent;

pub use loopback::LoopbackChannel;
pub use maildir_channel::MaildirChannel;

/// Opaque token a channel returns from `deliver`, letting the router (or a
/// restarted daemon) correlate a later reply back to the delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliverToken(pub String);

/// An inbound reply as the channel received it, before nonce/allowlist
/// verification (spec §4.7, §4.8 return path).
#[derive(Debug, Clone)]
pub struct InboundReply {
    pub prompt_id: Uuid,
    pub nonce: Uuid,
    pub identity: String,
    pub value: String,
}

/// Callback a channel invokes for each inbound reply it receives.
pub type ReplyCallback = Box<dyn Fn(InboundReply) + Send + Sync>;

/// Transport for prompts to a human and replies back (spec §4.7).
///
/// Implementations own their own retry and rate-limiting; permanent
/// failures surface through the `Result` return of `deliver`, not through
/// `on_reply`.
pub trait Channel: Send + Sync {
    /// Deliver `prompt` to every identity in `allowlist`. Returns a token
    /// the router can use to reconstruct delivery context after a restart.
    fn deliver(&self, prompt: &PromptEvent, allowlist: &[String]) -> Result<DeliverToken, ChannelError>;

    /// Register the callback invoked for every reply this channel
    /// receives, asynchronously, for the lifetime of the channel.
    fn on_reply(&self, callback: ReplyCallback);

    /// Best-effort delivery of a user-visible notice unrelated to a
    /// specific prompt (e.g. "prompt expired") — spec §4.8 return path.
    fn notify(&self, identity: &str, message: &str) -> Result<(), ChannelError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deliver_token_equality() {
        assert_eq!(DeliverToken("a".into()), DeliverToken("a".into()));
        assert_ne!(DeliverToken("a".into()), DeliverToken("b".into()));
    }
}
