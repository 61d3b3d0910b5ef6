//! Aider adapter.
//!
//! Aider's prompts are closer to a traditional REPL: a `Y/N` confirmation
//! footer, a bare `> ` input prompt once a commit is ready, and occasional
//! free-text error states (token limit exceeded, empty LLM response).
//! Patterns here are carried over from the detector's original
//! already-written-but-unused `aider()` pattern set.

use std::path::Path;

use regex::Regex;

use crate::adapter::{encode_default, Adapter, EncodeError};
use crate::prompt::{PatternSet, PromptType};
use crate::pty::SpawnConfig;

/// Adapter for the Aider CLI.
pub struct AiderAdapter {
    program: String,
}

impl AiderAdapter {
    pub fn new(program: Option<String>) -> Self {
        Self {
            program: program.unwrap_or_else(|| "aider".to_string()),
        }
    }
}

impl Adapter for AiderAdapter {
    fn name(&self) -> &str {
        "aider"
    }

    fn spawn_config(&self, task_description: &str, work_dir: &Path) -> SpawnConfig {
        SpawnConfig {
            program: self.program.clone(),
            args: vec!["--message".to_string(), task_description.to_string()],
            cwd: Some(work_dir.to_path_buf()),
            env: vec![],
            ..Default::default()
        }
    }

    fn prompt_patterns(&self) -> PatternSet {
        PatternSet::new(vec![
            (PromptType::YesNo, Regex::new(r"\(Y\)es/\(N\)o").unwrap()),
            (
                PromptType::FreeText,
                Regex::new(r"(?i)token limit exceeded").unwrap(),
            ),
            (
                PromptType::FreeText,
                Regex::new(r"(?i)empty response from (the )?llm").unwrap(),
            ),
            (PromptType::FreeText, Regex::new(r"(?m)^> $").unwrap()),
        ])
    }

    fn encode(&self, prompt_type: PromptType, reply_value: &str, allow_unsafe_default: bool) -> Result<Vec<u8>, EncodeError> {
        encode_default(prompt_type, reply_value, allow_unsafe_default, "\n")
    }
}
