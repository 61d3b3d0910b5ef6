//! Autopilot Engine: Off/Assist/Full modes plus a persistent kill switch
//! (spec §4.10).
//!
//! Grounded on the teacher's `tier2.rs` Tier 1 (deterministic
//! auto-answer)/Tier 2 (escalate-when-unmatched) split, generalized into
//! the three spec modes. Every decision is written to a separate
//! hash-chained decision trace (`autopilot_decisions.jsonl`), using the
//! same `audit::HashChainLog` mechanism as the audit log.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::json;

use crate::audit::HashChainLog;
use crate::policy::{Action, PolicyDecision, PolicyEngine};
use crate::prompt::{Confidence, PromptEvent};

/// Autopilot operating mode (spec §4.10).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Off,
    Assist,
    Full,
}

/// Default override window for Assist mode's suggestions (spec §4.10).
pub const DEFAULT_OVERRIDE_WINDOW: Duration = Duration::from_secs(10);

/// What the router should do next, per the autopilot's verdict on a prompt.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Route to the human channel as normal (Off, no-match, require_human,
    /// unpermitted low confidence, or the engine is paused).
    RouteToHuman,
    /// Inject this reply immediately, no human round-trip (Full mode
    /// auto_reply, or Assist/Full deny).
    InjectImmediately { reply_value: String },
    /// Send a suggestion with an override window; inject on timeout unless
    /// the human confirms or overrides first (Assist mode auto_reply).
    SuggestWithWindow {
        reply_value: String,
        window: Duration,
    },
}

/// The Autopilot Engine (spec §4.10). Holds the policy evaluator, the
/// current mode, the persistent pause flag, and the decision trace.
pub struct AutopilotEngine {
    policy: PolicyEngine,
    mode: Mode,
    paused: AtomicBool,
    trace: HashChainLog,
    policy_version_hash: String,
}

impl AutopilotEngine {
    pub fn new(policy: PolicyEngine, mode: Mode, paused: bool, trace: HashChainLog, policy_version_hash: String) -> Self {
        Self {
            policy,
            mode,
            paused: AtomicBool::new(paused),
            trace,
            policy_version_hash,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// `pause` persists across daemon restarts; callers are responsible for
    /// durably recording the new value (e.g. in `config.toml`) alongside
    /// calling this.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    fn record_decision(&self, prompt: &PromptEvent, decision: &PolicyDecision, verdict: &Verdict) {
        let verdict_label = match verdict {
            Verdict::RouteToHuman => "route_to_human",
            Verdict::InjectImmediately { .. } => "inject_immediately",
            Verdict::SuggestWithWindow { .. } => "suggest_with_window",
        };
        let payload = json!({
            "prompt_id": prompt.prompt_id.to_string(),
            "excerpt": prompt.excerpt,
            "matched_rule_id": decision.matched_rule_id,
            "action": format!("{:?}", decision.action),
            "risk_level": decision.risk_level.map(|r| format!("{r:?}")),
            "policy_version_hash": self.policy_version_hash,
            "verdict": verdict_label,
        });
        if let Err(err) = self.trace.append("AUTOPILOT_DECISION", payload) {
            tracing::error!(?err, "failed to append autopilot decision trace entry");
        }
    }

    /// Consult the engine about `prompt`. Mirrors spec §4.10's mode table
    /// exactly; the router acts on the returned `Verdict` without any of
    /// its own mode-specific branching.
    pub fn consult(&self, prompt: &PromptEvent) -> Verdict {
        if self.is_paused() {
            let decision = PolicyDecision {
                matched_rule_id: None,
                action: Action::RequireHuman,
                reply_value: None,
                risk_level: None,
                allow_low_confidence: false,
            };
            let verdict = Verdict::RouteToHuman;
            self.record_decision(prompt, &decision, &verdict);
            return verdict;
        }

        let decision = self.policy.evaluate(prompt);

        let verdict = match self.mode {
            Mode::Off => Verdict::RouteToHuman,
            Mode::Assist => match decision.action {
                Action::AutoReply => {
                    if prompt.confidence == Confidence::Low && !self.rule_allows_low_confidence(&decision) {
                        Verdict::RouteToHuman
                    } else {
                        Verdict::SuggestWithWindow {
                            reply_value: decision.reply_value.clone().unwrap_or_default(),
                            window: DEFAULT_OVERRIDE_WINDOW,
                        }
                    }
                }
                Action::Deny => Verdict::InjectImmediately {
                    reply_value: decision.reply_value.clone().unwrap_or_else(|| "n".to_string()),
                },
                Action::RequireHuman => Verdict::RouteToHuman,
            },
            Mode::Full => match decision.action {
                Action::AutoReply => {
                    if prompt.confidence == Confidence::Low && !self.rule_allows_low_confidence(&decision) {
                        Verdict::RouteToHuman
                    } else {
                        Verdict::InjectImmediately {
                            reply_value: decision.reply_value.clone().unwrap_or_default(),
                        }
                    }
                }
                Action::Deny => Verdict::InjectImmediately {
                    reply_value: decision.reply_value.clone().unwrap_or_else(|| "n".to_string()),
                },
                Action::RequireHuman => Verdict::RouteToHuman,
            },
        };

        self.record_decision(prompt, &decision, &verdict);
        verdict
    }

    fn rule_allows_low_confidence(&self, decision: &PolicyDecision) -> bool {
        decision.allow_low_confidence
    }

    pub fn verify_trace(&self) -> Result<(), crate::errors::AuditError> {
        self.trace.verify()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{Defaults, MatchPredicate, Policy, Rule};
    use crate::prompt::{PromptType, Signal};
    use tempfile::tempdir;

    fn engine_with_rules(mode: Mode, rules: Vec<Rule>, dir: &std::path::Path) -> AutopilotEngine {
        let policy = Policy {
            rules,
            defaults: Defaults::default(),
        };
        let engine = PolicyEngine::new(policy, "codex-cli", None);
        let trace = HashChainLog::open(&dir.join("autopilot_decisions.jsonl")).unwrap();
        AutopilotEngine::new(engine, mode, false, trace, "v1".to_string())
    }

    fn auto_reply_rule() -> Rule {
        Rule {
            id: "r1".to_string(),
            match_predicate: MatchPredicate {
                prompt_type: Some(PromptType::YesNo),
                ..Default::default()
            },
            action: Action::AutoReply,
            reply_value: Some("y".to_string()),
            risk_level: None,
            allow_low_confidence: false,
        }
    }

    fn sample_prompt(confidence: Confidence) -> PromptEvent {
        PromptEvent::new("s1", PromptType::YesNo, "Continue?", confidence, Signal::Pattern, 30)
    }

    #[test]
    fn off_mode_always_routes_to_human() {
        let dir = tempdir().unwrap();
        let engine = engine_with_rules(Mode::Off, vec![auto_reply_rule()], dir.path());
        assert_eq!(engine.consult(&sample_prompt(Confidence::High)), Verdict::RouteToHuman);
    }

    #[test]
    fn assist_mode_suggests_with_window_on_auto_reply() {
        let dir = tempdir().unwrap();
        let engine = engine_with_rules(Mode::Assist, vec![auto_reply_rule()], dir.path());
        let verdict = engine.consult(&sample_prompt(Confidence::High));
        assert_eq!(
            verdict,
            Verdict::SuggestWithWindow {
                reply_value: "y".to_string(),
                window: DEFAULT_OVERRIDE_WINDOW,
            }
        );
    }

    #[test]
    fn full_mode_injects_immediately_on_auto_reply() {
        let dir = tempdir().unwrap();
        let engine = engine_with_rules(Mode::Full, vec![auto_reply_rule()], dir.path());
        let verdict = engine.consult(&sample_prompt(Confidence::High));
        assert_eq!(
            verdict,
            Verdict::InjectImmediately {
                reply_value: "y".to_string(),
            }
        );
    }

    #[test]
    fn assist_mode_routes_low_confidence_to_human_without_explicit_permit() {
        let dir = tempdir().unwrap();
        let engine = engine_with_rules(Mode::Assist, vec![auto_reply_rule()], dir.path());
        let verdict = engine.consult(&sample_prompt(Confidence::Low));
        assert_eq!(verdict, Verdict::RouteToHuman);
    }

    #[test]
    fn full_mode_routes_low_confidence_to_human_without_explicit_permit() {
        let dir = tempdir().unwrap();
        let engine = engine_with_rules(Mode::Full, vec![auto_reply_rule()], dir.path());
        let verdict = engine.consult(&sample_prompt(Confidence::Low));
        assert_eq!(verdict, Verdict::RouteToHuman);
    }

    #[test]
    fn full_mode_injects_low_confidence_when_rule_permits_it() {
        let dir = tempdir().unwrap();
        let mut rule = auto_reply_rule();
        rule.allow_low_confidence = true;
        let engine = engine_with_rules(Mode::Full, vec![rule], dir.path());
        let verdict = engine.consult(&sample_prompt(Confidence::Low));
        assert_eq!(
            verdict,
            Verdict::InjectImmediately {
                reply_value: "y".to_string(),
            }
        );
    }

    #[test]
    fn pause_forces_human_routing_regardless_of_mode() {
        let dir = tempdir().unwrap();
        let engine = engine_with_rules(Mode::Full, vec![auto_reply_rule()], dir.path());
        engine.pause();
        assert_eq!(engine.consult(&sample_prompt(Confidence::High)), Verdict::RouteToHuman);
        engine.resume();
        assert_ne!(engine.consult(&sample_prompt(Confidence::High)), Verdict::RouteToHuman);
    }

    #[test]
    fn every_consult_call_appends_a_verifiable_trace_entry() {
        let dir = tempdir().unwrap();
        let engine = engine_with_rules(Mode::Full, vec![auto_reply_rule()], dir.path());
        engine.consult(&sample_prompt(Confidence::High));
        engine.consult(&sample_prompt(Confidence::High));
        engine.verify_trace().unwrap();
    }

    #[test]
    fn no_match_routes_to_human_in_every_mode() {
        let dir = tempdir().unwrap();
        for mode in [Mode::Off, Mode::Assist, Mode::Full] {
            let dir = tempdir().unwrap();
            let engine = engine_with_rules(mode, vec![], dir.path());
            assert_eq!(engine.consult(&sample_prompt(Confidence::High)), Verdict::RouteToHuman);
        }
        let _ = dir;
    }
}
