//! Property-based tests for the invariants in spec §8: the decision guard's
//! at-most-once acceptance, TTL expiry, detector purity, and policy
//! determinism.

use std::sync::{Arc, Barrier};
use std::thread;

use chrono::{Duration as ChronoDuration, Utc};
use proptest::prelude::*;

use promptrelay::detector::{DetectorConfig, DetectorEvent, PromptDetector};
use promptrelay::errors::CommitResult;
use promptrelay::policy::{Action, Defaults, MatchPredicate, Policy, PolicyEngine, PolicyV0, Rule, RuleV0};
use promptrelay::prompt::{Confidence, PatternSet, PromptEvent, PromptType, ReplySource, Signal};
use promptrelay::state_machine::PromptState;
use promptrelay::store::Store;

fn sample_prompt(ttl_seconds: u64) -> PromptEvent {
    PromptEvent::new(
        "s1",
        PromptType::YesNo,
        "Continue? [y/N]",
        Confidence::High,
        Signal::Pattern,
        ttl_seconds,
    )
}

// For all prompt streams and arbitrary interleavings of `decide_prompt`
// calls from multiple tasks, at most one call returns `Accepted` for a
// given `prompt_id`.
proptest! {
    #[test]
    fn decide_prompt_accepts_at_most_once_under_interleaving(
        thread_count in 2usize..8,
        values in prop::collection::vec("[yn]", 2..8),
    ) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let prompt = sample_prompt(3600);
        store.insert_prompt(&prompt).unwrap();
        store.transition(prompt.prompt_id, PromptState::Routed).unwrap();
        store.transition(prompt.prompt_id, PromptState::AwaitingReply).unwrap();

        let barrier = Arc::new(Barrier::new(thread_count));
        let handles: Vec<_> = (0..thread_count)
            .map(|i| {
                let store = store.clone();
                let barrier = barrier.clone();
                let value = values[i % values.len()].clone();
                let prompt_id = prompt.prompt_id;
                thread::spawn(move || {
                    barrier.wait();
                    store
                        .decide_prompt(prompt_id, "s1", &value, ReplySource::Human, Utc::now())
                        .unwrap()
                })
            })
            .collect();

        let results: Vec<CommitResult> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let accepted = results.iter().filter(|r| **r == CommitResult::Accepted).count();
        prop_assert_eq!(accepted, 1);
    }
}

// For all prompts with created_at + ttl_seconds * 1000 <= now, decide_prompt
// returns Expired.
proptest! {
    #[test]
    fn decide_prompt_reports_expired_past_ttl(
        ttl_seconds in 1u64..600,
        overshoot_seconds in 1i64..600,
    ) {
        let store = Store::open_in_memory().unwrap();
        let prompt = sample_prompt(ttl_seconds);
        store.insert_prompt(&prompt).unwrap();
        store.transition(prompt.prompt_id, PromptState::Routed).unwrap();
        store.transition(prompt.prompt_id, PromptState::AwaitingReply).unwrap();

        let past_deadline = prompt.created_at
            + ChronoDuration::seconds(ttl_seconds as i64)
            + ChronoDuration::seconds(overshoot_seconds);
        let result = store
            .decide_prompt(prompt.prompt_id, "s1", "y", ReplySource::Human, past_deadline)
            .unwrap();
        prop_assert_eq!(result, CommitResult::Expired);
    }
}

// Detector output is a pure function of the buffered bytes and suppression
// state: feeding the same chunk sequence into two fresh detectors produces
// identical events.
proptest! {
    #[test]
    fn detector_is_pure_over_identical_input_sequences(
        chunks in prop::collection::vec("[a-zA-Z0-9 ?:./]{0,40}", 1..10),
    ) {
        let patterns = || PatternSet::new(vec![(
            PromptType::YesNo,
            regex::Regex::new(r"\[y/n\]").unwrap(),
        )]);
        let mut left = PromptDetector::new(patterns(), DetectorConfig::default());
        let mut right = PromptDetector::new(patterns(), DetectorConfig::default());

        for chunk in &chunks {
            let left_event = left.on_output(chunk, false);
            let right_event = right.on_output(chunk, false);
            prop_assert_eq!(left_event, right_event);
        }
    }
}

// Policy evaluator is deterministic: identical (rules, event) -> identical
// PolicyDecision.
proptest! {
    #[test]
    fn policy_evaluation_is_deterministic(
        needle in "[a-z]{3,10}",
        excerpt in "[a-zA-Z ]{0,30}",
        confidence_idx in 0u8..3,
    ) {
        let confidence = match confidence_idx {
            0 => Confidence::Low,
            1 => Confidence::Medium,
            _ => Confidence::High,
        };
        let policy = Policy {
            rules: vec![Rule {
                id: "r1".to_string(),
                match_predicate: MatchPredicate {
                    text_contains: Some(needle.clone()),
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
        let prompt = PromptEvent::new("s1", PromptType::YesNo, &excerpt, confidence, Signal::Pattern, 30);

        let first = engine.evaluate(&prompt);
        let second = engine.evaluate(&prompt);
        prop_assert_eq!(first, second);
    }
}

// For all v0 policy documents (a single substring-pattern rule) and all
// excerpts, migrating to v1 (match.text_contains) yields the same decision
// the v0 rule's plain substring check would have.
proptest! {
    #[test]
    fn migrating_v0_to_v1_yields_identical_decisions(
        needle in "[a-z]{3,10}",
        excerpt in "[a-zA-Z ]{0,30}",
        confidence_idx in 0u8..3,
    ) {
        let confidence = match confidence_idx {
            0 => Confidence::Low,
            1 => Confidence::Medium,
            _ => Confidence::High,
        };
        let v0 = PolicyV0 {
            rules: vec![RuleV0 {
                id: "r1".to_string(),
                pattern: needle.clone(),
                action: Action::AutoReply,
                reply_value: Some("y".to_string()),
            }],
            defaults: Defaults::default(),
        };
        let migrated: Policy = v0.into();
        let engine = PolicyEngine::new(migrated, "codex-cli", None);
        let prompt = PromptEvent::new("s1", PromptType::YesNo, &excerpt, confidence, Signal::Pattern, 30);
        let decision = engine.evaluate(&prompt);

        let expected_action = if excerpt.contains(needle.as_str()) {
            Action::AutoReply
        } else {
            Action::RequireHuman
        };
        prop_assert_eq!(decision.action, expected_action);
        if expected_action == Action::AutoReply {
            prop_assert_eq!(decision.reply_value.as_deref(), Some("y"));
        }
    }
}

// Crash-consistency: after a simulated restart (a fresh Store handle opened
// on the same backing file), load_pending plus the remaining operations
// produce the same final state as running them without interruption.
#[test]
fn restart_recovery_reaches_the_same_final_state_as_uninterrupted_run() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("prompts.db");

    let prompt = sample_prompt(3600);
    {
        let store = Store::open(&db_path).unwrap();
        store.insert_prompt(&prompt).unwrap();
        store.transition(prompt.prompt_id, PromptState::Routed).unwrap();
        // Simulated crash: the process dies here, before AWAITING_REPLY.
    }

    // Restart: re-open the same backing file.
    let store = Store::open(&db_path).unwrap();
    let pending = store.load_pending(Utc::now()).unwrap();
    assert!(pending.iter().any(|p| p.prompt_id == prompt.prompt_id));

    store.transition(prompt.prompt_id, PromptState::AwaitingReply).unwrap();
    let result = store
        .decide_prompt(prompt.prompt_id, "s1", "y", ReplySource::Human, Utc::now())
        .unwrap();
    assert_eq!(result, CommitResult::Accepted);
    store.transition(prompt.prompt_id, PromptState::Injected).unwrap();
    store.transition(prompt.prompt_id, PromptState::Resolved).unwrap();

    assert_eq!(
        store.get(prompt.prompt_id).unwrap().unwrap().state,
        PromptState::Resolved
    );
}
