//! Deterministic regression scenarios (`lab run`, spec §6, §8 "End-to-end
//! scenarios (literal)").
//!
//! Each scenario exercises the core components directly — no real PTY, no
//! wall-clock sleeping — so `lab run --all` finishes in milliseconds and
//! never flakes on timing. Gated behind the `scenario-test` feature,
//! mirroring the teacher's own scenario-harness convention.

use std::path::Path;
use std::sync::mpsc::sync_channel;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};

use crate::adapter::{adapter_from_name, Adapter};
use crate::audit::HashChainLog;
use crate::autopilot::{AutopilotEngine, Mode as AutopilotMode};
use crate::channel::{Channel, InboundReply, LoopbackChannel};
use crate::detector::{DetectorConfig, DetectorEvent, PromptDetector};
use crate::errors::CommitResult;
use crate::policy::{Action, Defaults, MatchPredicate, Policy, PolicyEngine, Rule};
use crate::prompt::{Confidence, PromptEvent, PromptType, ReplySource, Signal};
use crate::router::Router;
use crate::state_machine::PromptState;
use crate::store::Store;

/// The outcome of one scenario run.
#[derive(Debug)]
pub enum ScenarioOutcome {
    Passed,
    Failed { reason: String },
}

#[derive(Debug)]
pub struct ScenarioReport {
    pub name: String,
    pub outcome: ScenarioOutcome,
}

impl ScenarioReport {
    pub fn passed(&self) -> bool {
        matches!(self.outcome, ScenarioOutcome::Passed)
    }
}

/// Every scenario name `lab run <scenario>` accepts.
pub const SCENARIOS: &[&str] = &[
    "partial-line",
    "echo-loop",
    "duplicate-callback",
    "ttl-expiry",
    "restart-crash-consistency",
    "autopilot-deny",
];

/// Run one scenario by name. `scratch_dir` holds its audit log; callers
/// typically pass a fresh temp directory per invocation.
pub fn run_scenario(name: &str, scratch_dir: &Path) -> ScenarioReport {
    let outcome = match name {
        "partial-line" => partial_line(),
        "echo-loop" => echo_loop(),
        "duplicate-callback" => duplicate_callback(scratch_dir),
        "ttl-expiry" => ttl_expiry(),
        "restart-crash-consistency" => restart_crash_consistency(scratch_dir),
        "autopilot-deny" => autopilot_deny(scratch_dir),
        other => ScenarioOutcome::Failed {
            reason: format!("unknown scenario '{other}'"),
        },
    };
    ScenarioReport {
        name: name.to_string(),
        outcome,
    }
}

/// Run every scenario in `SCENARIOS`, each under its own subdirectory of
/// `scratch_dir`.
pub fn run_all(scratch_dir: &Path) -> Vec<ScenarioReport> {
    SCENARIOS
        .iter()
        .map(|name| {
            let dir = scratch_dir.join(name);
            let _ = std::fs::create_dir_all(&dir);
            run_scenario(name, &dir)
        })
        .collect()
}

fn fail(reason: impl Into<String>) -> ScenarioOutcome {
    ScenarioOutcome::Failed { reason: reason.into() }
}

fn claude_adapter() -> Arc<dyn Adapter> {
    let boxed: Box<dyn Adapter> =
        adapter_from_name("claude-code").expect("claude-code adapter is always registered");
    Arc::from(boxed)
}

/// Scenario 1: a partial line with no trailing newline still fires the
/// pattern signal, and an injected reply resolves the prompt.
fn partial_line() -> ScenarioOutcome {
    let adapter = claude_adapter();
    let mut detector = PromptDetector::new(adapter.prompt_patterns(), DetectorConfig::default());

    let event = detector.on_output("Continue? [y/N] ", false);
    let hit = match event {
        DetectorEvent::PromptDetected(hit) => hit,
        DetectorEvent::Working => return fail("expected a pattern hit on the partial line, got none"),
    };
    if hit.confidence != Confidence::High {
        return fail(format!("expected high confidence, got {:?}", hit.confidence));
    }

    let store = Store::open_in_memory().expect("in-memory store");
    let prompt = PromptEvent::new("s1", hit.prompt_type, &hit.excerpt, hit.confidence, hit.signal, 30);
    if store.insert_prompt(&prompt).is_err() {
        return fail("failed to insert prompt");
    }
    store.transition(prompt.prompt_id, PromptState::Routed).unwrap();
    store.transition(prompt.prompt_id, PromptState::AwaitingReply).unwrap();

    let result = store
        .decide_prompt(prompt.prompt_id, "s1", "y", ReplySource::Human, Utc::now())
        .unwrap();
    if result != CommitResult::Accepted {
        return fail(format!("expected Accepted, got {result:?}"));
    }

    let encoded = match adapter.encode(prompt.prompt_type, "y", true) {
        Ok(bytes) => bytes,
        Err(err) => return fail(format!("encode failed: {err}")),
    };
    if encoded != b"y\r" {
        return fail(format!("expected 'y\\r', got {encoded:?}"));
    }

    detector.answer_injected();
    store.transition(prompt.prompt_id, PromptState::Injected).unwrap();
    store.transition(prompt.prompt_id, PromptState::Resolved).unwrap();

    let final_state = store.get(prompt.prompt_id).unwrap().unwrap().state;
    if final_state != PromptState::Resolved {
        return fail(format!("expected RESOLVED, got {final_state:?}"));
    }
    ScenarioOutcome::Passed
}

/// Scenario 2: the child's echo of an injected reply, arriving inside the
/// suppression window, creates no new prompt.
fn echo_loop() -> ScenarioOutcome {
    let adapter = claude_adapter();
    let mut detector = PromptDetector::new(
        adapter.prompt_patterns(),
        DetectorConfig {
            silence_ms: 2000,
            post_inject_suppress_ms: 500,
        },
    );

    detector.on_output("Continue? [y/N] ", false);
    detector.answer_injected();

    // The child echoes the injected "y" back near-instantly.
    let event = detector.on_output("y", true);
    if !matches!(event, DetectorEvent::Working) {
        return fail(format!("expected the echo to be suppressed, got {event:?}"));
    }
    ScenarioOutcome::Passed
}

/// Scenario 3: the same channel callback delivered twice yields exactly one
/// acceptance.
fn duplicate_callback(scratch_dir: &Path) -> ScenarioOutcome {
    let store = Arc::new(Store::open_in_memory().expect("in-memory store"));
    let channel = LoopbackChannel::new();
    let audit = match HashChainLog::open(&scratch_dir.join("audit.log")) {
        Ok(log) => Arc::new(log),
        Err(err) => return fail(format!("failed to open audit log: {err}")),
    };
    let (reply_tx, reply_rx) = sync_channel(4);
    let router = Router::new(store.clone(), channel, audit, None, vec!["alice".into()], reply_tx);

    let prompt = PromptEvent::new("s1", PromptType::YesNo, "Force push? [y/N]", Confidence::High, Signal::Pattern, 30);
    store.insert_prompt(&prompt).unwrap();
    if router.route(&prompt).is_err() {
        return fail("route failed");
    }

    let inbound = InboundReply {
        prompt_id: prompt.prompt_id,
        nonce: prompt.nonce,
        identity: "alice".to_string(),
        value: "n".to_string(),
    };
    router.on_inbound_reply(inbound.clone());
    router.on_inbound_reply(inbound);

    let mut accepted = 0;
    while reply_rx.try_recv().is_ok() {
        accepted += 1;
    }
    if accepted != 1 {
        return fail(format!("expected exactly one accepted reply, got {accepted}"));
    }
    ScenarioOutcome::Passed
}

/// Scenario 4: once the TTL has elapsed, `decide_prompt` reports `Expired`.
fn ttl_expiry() -> ScenarioOutcome {
    let store = Store::open_in_memory().expect("in-memory store");
    let created_at = Utc::now();
    let prompt = PromptEvent::new("s1", PromptType::YesNo, "Continue? [y/N]", Confidence::High, Signal::Pattern, 30);
    store.insert_prompt(&prompt).unwrap();
    store.transition(prompt.prompt_id, PromptState::Routed).unwrap();
    store.transition(prompt.prompt_id, PromptState::AwaitingReply).unwrap();

    let after_ttl = created_at + ChronoDuration::seconds(31);
    let result = store
        .decide_prompt(prompt.prompt_id, "s1", "y", ReplySource::Human, after_ttl)
        .unwrap();
    if result != CommitResult::Expired {
        return fail(format!("expected Expired, got {result:?}"));
    }
    ScenarioOutcome::Passed
}

/// Scenario 5: a daemon killed between `ROUTED` and `AWAITING_REPLY`
/// recovers the prompt on restart, and the (possibly duplicated) channel
/// copy's reply still arbitrates through `decide_prompt`.
fn restart_crash_consistency(scratch_dir: &Path) -> ScenarioOutcome {
    let store = Arc::new(Store::open_in_memory().expect("in-memory store"));
    let channel = LoopbackChannel::new();
    let audit = match HashChainLog::open(&scratch_dir.join("audit.log")) {
        Ok(log) => Arc::new(log),
        Err(err) => return fail(format!("failed to open audit log: {err}")),
    };
    let (reply_tx, reply_rx) = sync_channel(4);
    let router = Router::new(
        store.clone(),
        channel.clone(),
        audit,
        None,
        vec!["alice".into()],
        reply_tx,
    );

    let prompt = PromptEvent::new("s1", PromptType::YesNo, "Continue? [y/N]", Confidence::High, Signal::Pattern, 30);
    store.insert_prompt(&prompt).unwrap();
    // Simulate the crash: transitioned to ROUTED, then the process dies
    // before AWAITING_REPLY is reached (and before any channel delivery).
    store.transition(prompt.prompt_id, PromptState::Routed).unwrap();

    // Restart: load_pending should surface it for redelivery.
    let pending = store.load_pending(Utc::now()).unwrap();
    if !pending.iter().any(|p| p.prompt_id == prompt.prompt_id) {
        return fail("load_pending did not return the crashed prompt");
    }

    if channel.deliver(&prompt, &["alice".to_string()]).is_err() {
        return fail("redelivery failed");
    }
    store.transition(prompt.prompt_id, PromptState::AwaitingReply).unwrap();

    // Two "copies" of the channel each deliver a reply for the same
    // (prompt_id, nonce); only the first should be accepted.
    let inbound = InboundReply {
        prompt_id: prompt.prompt_id,
        nonce: prompt.nonce,
        identity: "alice".to_string(),
        value: "y".to_string(),
    };
    router.on_inbound_reply(inbound.clone());
    router.on_inbound_reply(inbound);

    let mut accepted = 0;
    while reply_rx.try_recv().is_ok() {
        accepted += 1;
    }
    if accepted != 1 {
        return fail(format!("expected exactly one accepted reply after restart, got {accepted}"));
    }
    ScenarioOutcome::Passed
}

/// Scenario 6: a `deny` policy rule matching "force push" injects a
/// synthetic `n` immediately, with the autopilot decision trace and channel
/// notice both recorded.
fn autopilot_deny(scratch_dir: &Path) -> ScenarioOutcome {
    let policy = Policy {
        rules: vec![Rule {
            id: "deny-force-push".to_string(),
            match_predicate: MatchPredicate {
                text_regex: Some("(?i)force.push".to_string()),
                ..Default::default()
            },
            action: Action::Deny,
            reply_value: Some("n".to_string()),
            risk_level: None,
            allow_low_confidence: false,
        }],
        defaults: Defaults::default(),
    };
    let engine = PolicyEngine::new(policy, "codex-cli", None);
    let trace = match HashChainLog::open(&scratch_dir.join("autopilot_decisions.jsonl")) {
        Ok(log) => log,
        Err(err) => return fail(format!("failed to open decision trace: {err}")),
    };
    let autopilot = Arc::new(AutopilotEngine::new(engine, AutopilotMode::Assist, false, trace, "v1".to_string()));

    let store = Arc::new(Store::open_in_memory().expect("in-memory store"));
    let channel = LoopbackChannel::new();
    let audit = match HashChainLog::open(&scratch_dir.join("audit.log")) {
        Ok(log) => Arc::new(log),
        Err(err) => return fail(format!("failed to open audit log: {err}")),
    };
    let (reply_tx, reply_rx) = sync_channel(4);
    let router = Router::new(
        store.clone(),
        channel,
        audit,
        Some(autopilot.clone()),
        vec!["alice".into()],
        reply_tx,
    );

    let prompt = PromptEvent::new("s1", PromptType::YesNo, "Force push to main? [y/N]", Confidence::High, Signal::Pattern, 30);
    store.insert_prompt(&prompt).unwrap();

    if router.route(&prompt).is_err() {
        return fail("route failed");
    }

    let reply = match reply_rx.recv_timeout(Duration::from_millis(200)) {
        Ok(r) => r,
        Err(_) => return fail("expected an enqueued synthetic reply, got none"),
    };
    if reply.value != "n" || reply.source != ReplySource::Autopilot {
        return fail(format!("expected autopilot reply 'n', got {reply:?}"));
    }

    if autopilot.verify_trace().is_err() {
        return fail("autopilot decision trace failed verification");
    }
    ScenarioOutcome::Passed
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn every_named_scenario_passes() {
        let dir = tempdir().unwrap();
        for report in run_all(dir.path()) {
            assert!(report.passed(), "{} failed: {:?}", report.name, report.outcome);
        }
    }

    #[test]
    fn unknown_scenario_name_fails_cleanly() {
        let dir = tempdir().unwrap();
        let report = run_scenario("does-not-exist", dir.path());
        assert!(!report.passed());
    }
}
