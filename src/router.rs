//! Router: couples detector output to the channel, and channel replies back
//! to the reply injector, without ever bypassing the store's decision
//! guard (spec §4.8).
//!
//! Grounded on the fan-in/identity-resolve/fail-secure-drop shape in the
//! pack's inbound-router example (`inbound_router.rs`): unknown or
//! off-allowlist senders are dropped with an audit entry rather than acted
//! on.

use std::collections::HashMap;
use std::sync::mpsc::SyncSender;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::audit::HashChainLog;
use crate::autopilot::{AutopilotEngine, Verdict};
use crate::channel::{Channel, InboundReply};
use crate::errors::{CommitResult, RelayError};
use crate::prompt::{PromptEvent, Reply, ReplySource};
use crate::state_machine::PromptState;
use crate::store::Store;

/// An Assist-mode suggestion awaiting either a human reply or its override
/// window expiring (spec §4.10).
struct PendingSuggestion {
    prompt: PromptEvent,
    reply_value: String,
    deadline: DateTime<Utc>,
}

/// Everything the router needs to couple one session's detector output to
/// its configured channel and autopilot engine.
pub struct Router {
    store: Arc<Store>,
    channel: Arc<dyn Channel>,
    audit: Arc<HashChainLog>,
    autopilot: Option<Arc<AutopilotEngine>>,
    allowlist: Vec<String>,
    /// Where accepted replies are handed to the reply injector.
    reply_tx: SyncSender<Reply>,
    /// Outstanding Assist-mode suggestions, keyed by prompt, consulted by
    /// `check_suggestion_timeouts`.
    suggestions: Mutex<HashMap<Uuid, PendingSuggestion>>,
}

impl Router {
    pub fn new(
        store: Arc<Store>,
        channel: Arc<dyn Channel>,
        audit: Arc<HashChainLog>,
        autopilot: Option<Arc<AutopilotEngine>>,
        allowlist: Vec<String>,
        reply_tx: SyncSender<Reply>,
    ) -> Self {
        Self {
            store,
            channel,
            audit,
            autopilot,
            allowlist,
            reply_tx,
            suggestions: Mutex::new(HashMap::new()),
        }
    }

    fn audit_event(&self, kind: &str, payload: serde_json::Value) {
        if let Err(err) = self.audit.append(kind, payload) {
            tracing::error!(?err, kind, "failed to append audit event");
        }
    }

    /// Forward path: a freshly inserted `CREATED` prompt (spec §4.8).
    pub fn route(&self, prompt: &PromptEvent) -> Result<(), RelayError> {
        self.store.transition(prompt.prompt_id, PromptState::Routed)?;
        self.audit_event(
            "PROMPT_ROUTED",
            serde_json::json!({ "prompt_id": prompt.prompt_id.to_string() }),
        );

        if let Some(autopilot) = &self.autopilot {
            match autopilot.consult(prompt) {
                Verdict::InjectImmediately { reply_value } => {
                    return self.commit_autopilot_reply(prompt, &reply_value);
                }
                Verdict::SuggestWithWindow { reply_value, window } => {
                    self.channel
                        .notify(
                            &self.allowlist.first().cloned().unwrap_or_default(),
                            &format!(
                                "suggested reply \"{reply_value}\" for prompt {} (auto-injecting in {}s unless you respond)",
                                prompt.prompt_id,
                                window.as_secs()
                            ),
                        )
                        .ok();
                    // The suggestion still goes out as a normal delivery so
                    // the human can confirm or override through the usual
                    // reply path. The deadline is tracked here;
                    // `check_suggestion_timeouts` (driven by the
                    // supervisor's stall watchdog) commits the suggested
                    // reply if it's still pending once the window expires,
                    // and `on_inbound_reply` clears it the moment any human
                    // reply lands first.
                    let deadline = Utc::now()
                        + chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::seconds(10));
                    self.suggestions.lock().unwrap().insert(
                        prompt.prompt_id,
                        PendingSuggestion {
                            prompt: prompt.clone(),
                            reply_value,
                            deadline,
                        },
                    );
                }
                Verdict::RouteToHuman => {}
            }
        }

        match self.channel.deliver(prompt, &self.allowlist) {
            Ok(_token) => {
                self.store.transition(prompt.prompt_id, PromptState::AwaitingReply)?;
                self.audit_event(
                    "PROMPT_AWAITING_REPLY",
                    serde_json::json!({ "prompt_id": prompt.prompt_id.to_string() }),
                );
                Ok(())
            }
            Err(err) => {
                self.store.transition(prompt.prompt_id, PromptState::Failed)?;
                self.audit_event(
                    "PROMPT_DELIVERY_FAILED",
                    serde_json::json!({ "prompt_id": prompt.prompt_id.to_string(), "error": err.to_string() }),
                );
                Err(err.into())
            }
        }
    }

    /// Commits an autopilot-originated reply. Reached two ways: immediately
    /// from `route` (prompt still `ROUTED`, never delivered to the human
    /// channel at all), or from a timed-out suggestion window (prompt
    /// already `AWAITING_REPLY`, having gone out as a normal delivery
    /// alongside the suggestion) — so the `AWAITING_REPLY` transition only
    /// fires when the prompt isn't there yet.
    fn commit_autopilot_reply(&self, prompt: &PromptEvent, reply_value: &str) -> Result<(), RelayError> {
        let already_awaiting = matches!(
            self.store.get(prompt.prompt_id),
            Ok(Some(current)) if current.state == PromptState::AwaitingReply
        );
        if !already_awaiting {
            self.store.transition(prompt.prompt_id, PromptState::AwaitingReply)?;
        }
        let result = self.store.decide_prompt(
            prompt.prompt_id,
            &prompt.session_id,
            reply_value,
            ReplySource::Autopilot,
            Utc::now(),
        )?;
        if result == CommitResult::Accepted {
            self.enqueue_reply(Reply {
                prompt_id: prompt.prompt_id,
                session_id: prompt.session_id.clone(),
                value: reply_value.to_string(),
                source: ReplySource::Autopilot,
                identity: "autopilot".to_string(),
                received_at: Utc::now(),
            });
        }
        Ok(())
    }

    /// Commit any suggested reply whose override window has expired without
    /// a human acting on it (spec §4.10 "if the window expires with no
    /// action, inject the suggested reply"). Called periodically by the
    /// supervisor's stall watchdog.
    pub fn check_suggestion_timeouts(&self) {
        let now = Utc::now();
        let expired: Vec<(PromptEvent, String)> = {
            let mut pending = self.suggestions.lock().unwrap();
            let expired_ids: Vec<Uuid> = pending
                .iter()
                .filter(|(_, suggestion)| now >= suggestion.deadline)
                .map(|(prompt_id, _)| *prompt_id)
                .collect();
            expired_ids
                .into_iter()
                .filter_map(|prompt_id| pending.remove(&prompt_id))
                .map(|suggestion| (suggestion.prompt, suggestion.reply_value))
                .collect()
        };

        for (prompt, reply_value) in expired {
            if let Err(err) = self.commit_autopilot_reply(&prompt, &reply_value) {
                tracing::error!(?err, prompt_id = %prompt.prompt_id, "failed to commit timed-out autopilot suggestion");
            }
        }
    }

    fn enqueue_reply(&self, reply: Reply) {
        if self.reply_tx.try_send(reply).is_err() {
            tracing::warn!("reply queue full; dropping accepted reply, store state remains authoritative");
        }
    }

    /// Test-only: back-date a pending suggestion's deadline so
    /// `check_suggestion_timeouts` fires it without a real wall-clock wait.
    #[cfg(test)]
    fn force_suggestion_expiry(&self, prompt_id: Uuid) {
        if let Some(suggestion) = self.suggestions.lock().unwrap().get_mut(&prompt_id) {
            suggestion.deadline = Utc::now() - chrono::Duration::seconds(1);
        }
    }

    /// Return path: a reply arrived from the channel (spec §4.8).
    pub fn on_inbound_reply(&self, inbound: InboundReply) {
        let Ok(Some(prompt)) = self.store.get(inbound.prompt_id) else {
            self.audit_event(
                "REPLY_UNKNOWN_PROMPT",
                serde_json::json!({ "prompt_id": inbound.prompt_id.to_string() }),
            );
            return;
        };

        if prompt.nonce != inbound.nonce {
            self.audit_event(
                "REPLY_NONCE_MISMATCH",
                serde_json::json!({ "prompt_id": inbound.prompt_id.to_string() }),
            );
            return;
        }

        if !self.allowlist.contains(&inbound.identity) {
            self.audit_event(
                "REPLY_OFF_ALLOWLIST",
                serde_json::json!({ "prompt_id": inbound.prompt_id.to_string(), "identity": inbound.identity }),
            );
            return;
        }

        let result = match self.store.decide_prompt(
            inbound.prompt_id,
            &prompt.session_id,
            &inbound.value,
            ReplySource::Human,
            Utc::now(),
        ) {
            Ok(r) => r,
            Err(err) => {
                tracing::error!(?err, "decide_prompt failed");
                return;
            }
        };

        // The prompt has now been decided one way or another (accepted,
        // already decided, expired, or rejected); a pending suggestion
        // window no longer has anything to race against.
        self.suggestions.lock().unwrap().remove(&inbound.prompt_id);

        match result {
            CommitResult::Accepted => {
                self.enqueue_reply(Reply {
                    prompt_id: inbound.prompt_id,
                    session_id: prompt.session_id,
                    value: inbound.value,
                    source: ReplySource::Human,
                    identity: inbound.identity,
                    received_at: Utc::now(),
                });
            }
            CommitResult::AlreadyDecided => {
                // Idempotent no-op: a duplicate channel callback for a
                // prompt already committed.
            }
            CommitResult::Expired => {
                self.channel
                    .notify(&inbound.identity, &format!("prompt {} has expired", inbound.prompt_id))
                    .ok();
            }
            CommitResult::WrongSession | CommitResult::Unknown => {
                self.audit_event(
                    "REPLY_REJECTED",
                    serde_json::json!({ "prompt_id": inbound.prompt_id.to_string(), "result": format!("{result:?}") }),
                );
            }
        }
    }

    /// Restart recovery: re-attach every non-terminal prompt to its
    /// outgoing-channel context (spec §4.8). Since `MaildirChannel` and
    /// `LoopbackChannel` reconstruct delivery tokens from `prompt_id` +
    /// `nonce` alone, the router simply re-delivers; `decide_prompt`
    /// tolerates the resulting duplicate.
    pub fn recover_pending(&self) -> Result<usize, RelayError> {
        let pending = self.store.load_pending(Utc::now())?;
        let mut recovered = 0;
        for prompt in pending {
            match prompt.state {
                PromptState::Created => {
                    self.route(&prompt)?;
                    recovered += 1;
                }
                PromptState::Routed | PromptState::AwaitingReply => {
                    if self.channel.deliver(&prompt, &self.allowlist).is_ok() {
                        recovered += 1;
                    }
                }
                _ => {}
            }
        }
        Ok(recovered)
    }
}

#[allow(dead_code)]
fn new_prompt_id() -> Uuid {
    Uuid::new_v4()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::LoopbackChannel;
    use crate::prompt::{Confidence, PromptType, Signal};
    use std::sync::mpsc::sync_channel;
    use std::time::Duration;
    use tempfile::tempdir;

    fn make_router(dir: &std::path::Path) -> (Router, Arc<Store>, Arc<LoopbackChannel>, std::sync::mpsc::Receiver<Reply>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let channel = LoopbackChannel::new();
        let audit = Arc::new(HashChainLog::open(&dir.join("audit.log")).unwrap());
        let (tx, rx) = sync_channel(16);
        let router = Router::new(store.clone(), channel.clone(), audit, None, vec!["alice".into()], tx);
        (router, store, channel, rx)
    }

    fn sample_prompt(store: &Store) -> PromptEvent {
        let p = PromptEvent::new("s1", PromptType::YesNo, "Continue?", Confidence::High, Signal::Pattern, 30);
        store.insert_prompt(&p).unwrap();
        p
    }

    #[test]
    fn forward_path_routes_and_delivers() {
        let dir = tempdir().unwrap();
        let (router, store, channel, _rx) = make_router(dir.path());
        let p = sample_prompt(&store);
        router.route(&p).unwrap();
        assert_eq!(store.get(p.prompt_id).unwrap().unwrap().state, PromptState::AwaitingReply);
        assert!(channel.recv_delivered(Duration::from_millis(100)).is_some());
    }

    #[test]
    fn return_path_accepts_valid_reply_and_enqueues() {
        let dir = tempdir().unwrap();
        let (router, store, _channel, rx) = make_router(dir.path());
        let p = sample_prompt(&store);
        router.route(&p).unwrap();

        router.on_inbound_reply(InboundReply {
            prompt_id: p.prompt_id,
            nonce: p.nonce,
            identity: "alice".into(),
            value: "y".into(),
        });

        let reply = rx.recv_timeout(Duration::from_millis(100)).unwrap();
        assert_eq!(reply.prompt_id, p.prompt_id);
    }

    #[test]
    fn return_path_drops_off_allowlist_identity() {
        let dir = tempdir().unwrap();
        let (router, store, _channel, rx) = make_router(dir.path());
        let p = sample_prompt(&store);
        router.route(&p).unwrap();

        router.on_inbound_reply(InboundReply {
            prompt_id: p.prompt_id,
            nonce: p.nonce,
            identity: "mallory".into(),
            value: "y".into(),
        });

        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn return_path_rejects_nonce_mismatch() {
        let dir = tempdir().unwrap();
        let (router, store, _channel, rx) = make_router(dir.path());
        let p = sample_prompt(&store);
        router.route(&p).unwrap();

        router.on_inbound_reply(InboundReply {
            prompt_id: p.prompt_id,
            nonce: Uuid::new_v4(),
            identity: "alice".into(),
            value: "y".into(),
        });

        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn duplicate_reply_is_idempotent() {
        let dir = tempdir().unwrap();
        let (router, store, _channel, rx) = make_router(dir.path());
        let p = sample_prompt(&store);
        router.route(&p).unwrap();

        let inbound = InboundReply {
            prompt_id: p.prompt_id,
            nonce: p.nonce,
            identity: "alice".into(),
            value: "y".into(),
        };
        router.on_inbound_reply(inbound.clone());
        router.on_inbound_reply(inbound);

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_ok());
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn expired_suggestion_window_injects_the_suggested_reply() {
        use crate::autopilot::{AutopilotEngine, Mode as AutopilotMode};
        use crate::policy::{Action, Defaults, MatchPredicate, Policy, PolicyEngine, Rule};

        let dir = tempdir().unwrap();
        let policy = Policy {
            rules: vec![Rule {
                id: "r1".to_string(),
                match_predicate: MatchPredicate {
                    prompt_type: Some(PromptType::YesNo),
                    ..Default::default()
                },
                action: Action::AutoReply,
                reply_value: Some("y".to_string()),
                risk_level: None,
                allow_low_confidence: false,
            }],
            defaults: Defaults::default(),
        };
        let engine = PolicyEngine::new(policy, "codex-cli", None);
        let trace = HashChainLog::open(&dir.path().join("autopilot_decisions.jsonl")).unwrap();
        let autopilot = Arc::new(AutopilotEngine::new(engine, AutopilotMode::Assist, false, trace, "v1".to_string()));

        let store = Arc::new(Store::open_in_memory().unwrap());
        let channel = LoopbackChannel::new();
        let audit = Arc::new(HashChainLog::open(&dir.path().join("audit.log")).unwrap());
        let (tx, rx) = sync_channel(16);
        let router = Router::new(store.clone(), channel, audit, Some(autopilot), vec!["alice".into()], tx);

        let p = sample_prompt(&store);
        router.route(&p).unwrap();

        // The window hasn't expired yet: nothing should have been injected.
        router.check_suggestion_timeouts();
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

        router.force_suggestion_expiry(p.prompt_id);
        router.check_suggestion_timeouts();

        let reply = rx.recv_timeout(Duration::from_millis(100)).unwrap();
        assert_eq!(reply.value, "y");
        assert_eq!(reply.source, ReplySource::Autopilot);
        assert_eq!(store.get(p.prompt_id).unwrap().unwrap().state, PromptState::AwaitingReply);
    }

    #[test]
    fn human_reply_before_window_expiry_cancels_the_pending_suggestion() {
        use crate::autopilot::{AutopilotEngine, Mode as AutopilotMode};
        use crate::policy::{Action, Defaults, MatchPredicate, Policy, PolicyEngine, Rule};

        let dir = tempdir().unwrap();
        let policy = Policy {
            rules: vec![Rule {
                id: "r1".to_string(),
                match_predicate: MatchPredicate {
                    prompt_type: Some(PromptType::YesNo),
                    ..Default::default()
                },
                action: Action::AutoReply,
                reply_value: Some("y".to_string()),
                risk_level: None,
                allow_low_confidence: false,
            }],
            defaults: Defaults::default(),
        };
        let engine = PolicyEngine::new(policy, "codex-cli", None);
        let trace = HashChainLog::open(&dir.path().join("autopilot_decisions.jsonl")).unwrap();
        let autopilot = Arc::new(AutopilotEngine::new(engine, AutopilotMode::Assist, false, trace, "v1".to_string()));

        let store = Arc::new(Store::open_in_memory().unwrap());
        let channel = LoopbackChannel::new();
        let audit = Arc::new(HashChainLog::open(&dir.path().join("audit.log")).unwrap());
        let (tx, rx) = sync_channel(16);
        let router = Router::new(store.clone(), channel, audit, Some(autopilot), vec!["alice".into()], tx);

        let p = sample_prompt(&store);
        router.route(&p).unwrap();

        router.on_inbound_reply(InboundReply {
            prompt_id: p.prompt_id,
            nonce: p.nonce,
            identity: "alice".into(),
            value: "n".into(),
        });

        router.force_suggestion_expiry(p.prompt_id);
        router.check_suggestion_timeouts();

        let first = rx.recv_timeout(Duration::from_millis(100)).unwrap();
        assert_eq!(first.value, "n");
        assert_eq!(first.source, ReplySource::Human);
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn recover_pending_redelivers_awaiting_prompts() {
        let dir = tempdir().unwrap();
        let (router, store, channel, _rx) = make_router(dir.path());
        let p = sample_prompt(&store);
        router.route(&p).unwrap();
        channel.recv_delivered(Duration::from_millis(100));

        let recovered = router.recover_pending().unwrap();
        assert_eq!(recovered, 1);
        assert!(channel.recv_delivered(Duration::from_millis(100)).is_some());
    }
}
