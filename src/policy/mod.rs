//! Policy evaluator: a deterministic, first-match-wins rule engine over
//! detected prompts (spec §4.10).
//!
//! Generalized from the teacher's `PolicyEngine`/`Decision`
//! substring-match-first-wins evaluator into the full rule predicate
//! (`tool_id`, `session_label`, `prompt_type`, `confidence` range,
//! `text_contains`, `text_regex`, `any_of`, `none_of`) loaded from a
//! `serde_yaml` rule file.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::PolicyError;
use crate::prompt::{Confidence, PromptEvent, PromptType};

/// What a matched rule tells the router/autopilot to do (spec §4.10).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    AutoReply,
    Deny,
    RequireHuman,
}

/// Risk classification attached to a matched rule, surfaced in the
/// autopilot decision trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

fn default_min_confidence() -> Confidence {
    Confidence::Low
}

fn default_max_confidence() -> Confidence {
    Confidence::High
}

/// One rule's match predicate (spec §4.10). All present fields must match
/// (AND); absent fields are wildcards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchPredicate {
    pub tool_id: Option<String>,
    pub session_label: Option<String>,
    pub prompt_type: Option<PromptType>,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: Confidence,
    #[serde(default = "default_max_confidence")]
    pub max_confidence: Confidence,
    pub text_contains: Option<String>,
    pub text_regex: Option<String>,
    #[serde(default)]
    pub any_of: Vec<String>,
    #[serde(default)]
    pub none_of: Vec<String>,
}

impl Default for MatchPredicate {
    fn default() -> Self {
        Self {
            tool_id: None,
            session_label: None,
            prompt_type: None,
            min_confidence: Confidence::Low,
            max_confidence: Confidence::High,
            text_contains: None,
            text_regex: None,
            any_of: Vec::new(),
            none_of: Vec::new(),
        }
    }
}

/// One ordered policy rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    #[serde(rename = "match")]
    pub match_predicate: MatchPredicate,
    pub action: Action,
    /// Value to reply with when `action` is `auto_reply`.
    pub reply_value: Option<String>,
    pub risk_level: Option<RiskLevel>,
    /// Explicitly permits this rule to match `low`-confidence prompts in
    /// Full autopilot mode (spec §4.10: "unless the matched rule explicitly
    /// permits low").
    #[serde(default)]
    pub allow_low_confidence: bool,
}

fn default_no_match_action() -> Action {
    Action::RequireHuman
}

/// Fallback behavior when no rule matches (spec §4.10).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Defaults {
    #[serde(default = "default_no_match_action")]
    pub no_match: Action,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            no_match: Action::RequireHuman,
        }
    }
}

/// A loaded, ordered policy document (spec §4.10).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub defaults: Defaults,
}

/// The outcome of evaluating a prompt against a policy (spec §4.10).
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyDecision {
    pub matched_rule_id: Option<String>,
    pub action: Action,
    pub reply_value: Option<String>,
    pub risk_level: Option<RiskLevel>,
    /// Carried from the matched rule's own `allow_low_confidence` flag;
    /// `false` when no rule matched.
    pub allow_low_confidence: bool,
}

/// Pre-generalization rule schema (`v0`): a single substring `pattern`
/// instead of the full `match` predicate object, and no `risk_level` or
/// `allow_low_confidence` — the shape `battysh-batty`'s original
/// substring-match-first-wins `PolicyEngine` used before this crate
/// generalized it. `policy migrate` bridges documents written against this
/// schema forward to the current one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleV0 {
    pub id: String,
    pub pattern: String,
    pub action: Action,
    pub reply_value: Option<String>,
}

/// A `v0` policy document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyV0 {
    #[serde(default)]
    pub rules: Vec<RuleV0>,
    #[serde(default)]
    pub defaults: Defaults,
}

impl From<PolicyV0> for Policy {
    fn from(v0: PolicyV0) -> Self {
        Policy {
            rules: v0
                .rules
                .into_iter()
                .map(|r| Rule {
                    id: r.id,
                    match_predicate: MatchPredicate {
                        text_contains: Some(r.pattern),
                        ..Default::default()
                    },
                    action: r.action,
                    reply_value: r.reply_value,
                    risk_level: None,
                    allow_low_confidence: false,
                })
                .collect(),
            defaults: v0.defaults,
        }
    }
}

/// Stateless evaluator over a loaded `Policy` (spec §4.10).
pub struct PolicyEngine {
    policy: Policy,
    tool_id: String,
    session_label: Option<String>,
}

impl PolicyEngine {
    pub fn new(policy: Policy, tool_id: impl Into<String>, session_label: Option<String>) -> Self {
        Self {
            policy,
            tool_id: tool_id.into(),
            session_label,
        }
    }

    /// Load a policy document from YAML text (spec §4.10).
    pub fn load_yaml(path: &str, text: &str) -> Result<Policy, PolicyError> {
        serde_yaml::from_str(text).map_err(|source| PolicyError::Parse {
            path: path.to_string(),
            source,
        })
    }

    /// Load a policy document of either schema version, migrating a `v0`
    /// document's flat `pattern` rules into `v1`'s `match` predicate object
    /// (spec §8 "migrating v0→v1 yields identical decisions"). The current
    /// schema is tried first since it's now the common case; a `v0`
    /// document fails that parse (it has no `match` key) and is retried
    /// against `PolicyV0`. Returns whether the document needed migrating.
    pub fn load_yaml_any_version(path: &str, text: &str) -> Result<(Policy, bool), PolicyError> {
        if let Ok(policy) = serde_yaml::from_str::<Policy>(text) {
            return Ok((policy, false));
        }
        let v0: PolicyV0 = serde_yaml::from_str(text).map_err(|source| PolicyError::Parse {
            path: path.to_string(),
            source,
        })?;
        Ok((v0.into(), true))
    }

    fn predicate_matches(&self, pred: &MatchPredicate, prompt: &PromptEvent) -> bool {
        if let Some(tool_id) = &pred.tool_id {
            if tool_id != &self.tool_id {
                return false;
            }
        }
        if let Some(label) = &pred.session_label {
            if self.session_label.as_deref() != Some(label.as_str()) {
                return false;
            }
        }
        if let Some(pt) = pred.prompt_type {
            if pt != prompt.prompt_type {
                return false;
            }
        }
        if prompt.confidence < pred.min_confidence || prompt.confidence > pred.max_confidence {
            return false;
        }
        if let Some(needle) = &pred.text_contains {
            if !prompt.excerpt.contains(needle.as_str()) {
                return false;
            }
        }
        if let Some(pattern) = &pred.text_regex {
            match Regex::new(pattern) {
                Ok(re) => {
                    if !re.is_match(&prompt.excerpt) {
                        return false;
                    }
                }
                Err(_) => return false,
            }
        }
        if !pred.any_of.is_empty() && !pred.any_of.iter().any(|s| prompt.excerpt.contains(s.as_str())) {
            return false;
        }
        if pred.none_of.iter().any(|s| prompt.excerpt.contains(s.as_str())) {
            return false;
        }
        true
    }

    /// Evaluate `prompt`, returning the first matching rule's decision, or
    /// `defaults.no_match` if none match (spec §4.10).
    pub fn evaluate(&self, prompt: &PromptEvent) -> PolicyDecision {
        for rule in &self.policy.rules {
            if self.predicate_matches(&rule.match_predicate, prompt) {
                return PolicyDecision {
                    matched_rule_id: Some(rule.id.clone()),
                    action: rule.action,
                    reply_value: rule.reply_value.clone(),
                    risk_level: rule.risk_level,
                    allow_low_confidence: rule.allow_low_confidence,
                };
            }
        }
        PolicyDecision {
            matched_rule_id: None,
            action: self.policy.defaults.no_match,
            reply_value: None,
            risk_level: None,
            allow_low_confidence: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::Signal;

    fn prompt(prompt_type: PromptType, excerpt: &str, confidence: Confidence) -> PromptEvent {
        PromptEvent::new("s1", prompt_type, excerpt, confidence, Signal::Pattern, 30)
    }

    fn rule(id: &str, pred: MatchPredicate, action: Action) -> Rule {
        Rule {
            id: id.to_string(),
            match_predicate: pred,
            action,
            reply_value: None,
            risk_level: None,
            allow_low_confidence: false,
        }
    }

    #[test]
    fn first_matching_rule_wins() {
        let policy = Policy {
            rules: vec![
                rule(
                    "r1",
                    MatchPredicate {
                        text_contains: Some("rm -rf".into()),
                        ..Default::default()
                    },
                    Action::Deny,
                ),
                rule(
                    "r2",
                    MatchPredicate {
                        prompt_type: Some(PromptType::YesNo),
                        ..Default::default()
                    },
                    Action::AutoReply,
                ),
            ],
            defaults: Defaults::default(),
        };
        let engine = PolicyEngine::new(policy, "codex-cli", None);
        let decision = engine.evaluate(&prompt(
            PromptType::YesNo,
            "Run `rm -rf /tmp/build`?",
            Confidence::High,
        ));
        assert_eq!(decision.matched_rule_id, Some("r1".to_string()));
        assert_eq!(decision.action, Action::Deny);
    }

    #[test]
    fn no_match_falls_back_to_require_human() {
        let policy = Policy {
            rules: vec![rule(
                "r1",
                MatchPredicate {
                    text_contains: Some("never-appears".into()),
                    ..Default::default()
                },
                Action::AutoReply,
            )],
            defaults: Defaults::default(),
        };
        let engine = PolicyEngine::new(policy, "codex-cli", None);
        let decision = engine.evaluate(&prompt(PromptType::YesNo, "Continue?", Confidence::High));
        assert_eq!(decision.matched_rule_id, None);
        assert_eq!(decision.action, Action::RequireHuman);
    }

    #[test]
    fn confidence_range_excludes_out_of_band_prompts() {
        let policy = Policy {
            rules: vec![rule(
                "r1",
                MatchPredicate {
                    min_confidence: Confidence::Medium,
                    max_confidence: Confidence::High,
                    ..Default::default()
                },
                Action::AutoReply,
            )],
            defaults: Defaults::default(),
        };
        let engine = PolicyEngine::new(policy, "codex-cli", None);
        let decision = engine.evaluate(&prompt(PromptType::YesNo, "Continue?", Confidence::Low));
        assert_eq!(decision.action, Action::RequireHuman);
    }

    #[test]
    fn tool_id_scopes_a_rule() {
        let policy = Policy {
            rules: vec![rule(
                "r1",
                MatchPredicate {
                    tool_id: Some("aider".into()),
                    ..Default::default()
                },
                Action::AutoReply,
            )],
            defaults: Defaults::default(),
        };
        let engine = PolicyEngine::new(policy, "codex-cli", None);
        let decision = engine.evaluate(&prompt(PromptType::YesNo, "Continue?", Confidence::High));
        assert_eq!(decision.action, Action::RequireHuman);
    }

    #[test]
    fn none_of_excludes_matching_text() {
        let policy = Policy {
            rules: vec![rule(
                "r1",
                MatchPredicate {
                    none_of: vec!["production".into()],
                    ..Default::default()
                },
                Action::AutoReply,
            )],
            defaults: Defaults::default(),
        };
        let engine = PolicyEngine::new(policy, "codex-cli", None);
        let decision = engine.evaluate(&prompt(
            PromptType::YesNo,
            "Deploy to production?",
            Confidence::High,
        ));
        assert_eq!(decision.action, Action::RequireHuman);
    }

    #[test]
    fn load_yaml_parses_a_rule_file() {
        let yaml = r#"
rules:
  - id: allow-read
    match:
      prompt_type: yes_no
      text_contains: "Allow tool Read"
    action: auto_reply
    reply_value: "y"
defaults:
  no_match: require_human
"#;
        let policy = PolicyEngine::load_yaml("policy.yaml", yaml).unwrap();
        assert_eq!(policy.rules.len(), 1);
        assert_eq!(policy.rules[0].id, "allow-read");
    }

    #[test]
    fn load_yaml_rejects_malformed_document() {
        let err = PolicyEngine::load_yaml("policy.yaml", "rules: [this is not a rule").unwrap_err();
        assert!(matches!(err, PolicyError::Parse { .. }));
    }

    #[test]
    fn load_yaml_any_version_migrates_a_v0_document() {
        let v0_yaml = r#"
rules:
  - id: allow-read
    pattern: "Allow tool Read"
    action: auto_reply
    reply_value: "y"
defaults:
  no_match: require_human
"#;
        let (policy, migrated) = PolicyEngine::load_yaml_any_version("policy.yaml", v0_yaml).unwrap();
        assert!(migrated);
        assert_eq!(policy.rules.len(), 1);
        assert_eq!(policy.rules[0].match_predicate.text_contains.as_deref(), Some("Allow tool Read"));
        assert!(!policy.rules[0].allow_low_confidence);
        assert_eq!(policy.rules[0].risk_level, None);
    }

    #[test]
    fn load_yaml_any_version_leaves_a_v1_document_unmigrated() {
        let v1_yaml = r#"
rules:
  - id: allow-read
    match:
      text_contains: "Allow tool Read"
    action: auto_reply
    reply_value: "y"
defaults:
  no_match: require_human
"#;
        let (policy, migrated) = PolicyEngine::load_yaml_any_version("policy.yaml", v1_yaml).unwrap();
        assert!(!migrated);
        assert_eq!(policy.rules.len(), 1);
    }

    #[test]
    fn migrated_v0_policy_evaluates_identically_to_a_hand_written_v1_equivalent() {
        let v0 = PolicyV0 {
            rules: vec![RuleV0 {
                id: "r1".to_string(),
                pattern: "force push".to_string(),
                action: Action::Deny,
                reply_value: Some("n".to_string()),
            }],
            defaults: Defaults::default(),
        };
        let migrated: Policy = v0.into();
        let hand_written = Policy {
            rules: vec![rule(
                "r1",
                MatchPredicate {
                    text_contains: Some("force push".to_string()),
                    ..Default::default()
                },
                Action::Deny,
            )],
            defaults: Defaults::default(),
        };

        let migrated_engine = PolicyEngine::new(migrated, "codex-cli", None);
        let hand_written_engine = PolicyEngine::new(hand_written, "codex-cli", None);

        for (excerpt, confidence) in [
            ("please force push to main", Confidence::High),
            ("please force push to main", Confidence::Low),
            ("run the tests", Confidence::High),
        ] {
            let p = prompt(PromptType::YesNo, excerpt, confidence);
            assert_eq!(migrated_engine.evaluate(&p).action, hand_written_engine.evaluate(&p).action);
        }
    }
}
