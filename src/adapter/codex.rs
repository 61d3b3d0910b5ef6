//! Codex CLI adapter.
//!
//! Runs Codex in interactive mode by default, passing the composed task
//! prompt as the initial user prompt argument. Covers run/edit/network/MCP
//! approval prompts, all of which are `yes_no` or `multiple_choice` in the
//! core's vocabulary.

use std::path::Path;

use regex::Regex;

use crate::adapter::{encode_default, Adapter, EncodeError};
use crate::prompt::{PatternSet, PromptType};
use crate::pty::SpawnConfig;

/// Adapter for Codex CLI.
pub struct CodexCliAdapter {
    program: String,
}

impl CodexCliAdapter {
    pub fn new(program: Option<String>) -> Self {
        Self {
            program: program.unwrap_or_else(|| "codex".to_string()),
        }
    }
}

impl Adapter for CodexCliAdapter {
    fn name(&self) -> &str {
        "codex-cli"
    }

    fn spawn_config(&self, task_description: &str, work_dir: &Path) -> SpawnConfig {
        SpawnConfig {
            program: self.program.clone(),
            args: vec![task_description.to_string()],
            cwd: Some(work_dir.to_path_buf()),
            env: vec![],
            ..Default::default()
        }
    }

    fn prompt_patterns(&self) -> PatternSet {
        PatternSet::new(vec![
            (
                PromptType::YesNo,
                Regex::new(r"(?i)would you like to (run|apply) the following").unwrap(),
            ),
            (
                PromptType::YesNo,
                Regex::new(r"(?i)allow network access\?").unwrap(),
            ),
            (
                PromptType::MultipleChoice,
                Regex::new(r"(?i)select an option \[\d+(-\d+)?\]").unwrap(),
            ),
            (
                PromptType::ConfirmEnter,
                Regex::new(r"(?i)press enter to confirm, esc to cancel").unwrap(),
            ),
        ])
    }

    fn encode(&self, prompt_type: PromptType, reply_value: &str, allow_unsafe_default: bool) -> Result<Vec<u8>, EncodeError> {
        encode_default(prompt_type, reply_value, allow_unsafe_default, "\r")
    }
}
