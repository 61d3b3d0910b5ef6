//! Claude Code adapter.
//!
//! Supports two modes:
//! - **Print mode** (`-p --output-format stream-json`): for automated runs
//!   where structured JSON output enables reliable completion/error
//!   detection.
//! - **Interactive mode** (no `-p`): for supervised runs where the user can
//!   see and type into Claude's native TUI. The supervisor watches on top
//!   without breaking the interactive experience.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

use crate::adapter::{encode_default, Adapter, EncodeError, SessionSignal};
use crate::prompt::{PatternSet, PromptType};
use crate::pty::SpawnConfig;

/// How to run Claude Code.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub enum ClaudeMode {
    /// Print mode: `-p --output-format stream-json`. Best for fully
    /// automated runs; structured JSON output.
    Print,
    /// Interactive mode: user sees the full TUI, supervised via PTY
    /// pattern matching on ANSI-stripped output.
    #[default]
    Interactive,
}

/// Adapter for Claude Code CLI.
pub struct ClaudeCodeAdapter {
    program: String,
    mode: ClaudeMode,
}

impl ClaudeCodeAdapter {
    pub fn new(program: Option<String>) -> Self {
        Self {
            program: program.unwrap_or_else(|| "claude".to_string()),
            mode: ClaudeMode::default(),
        }
    }

    pub fn with_mode(mut self, mode: ClaudeMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn mode(&self) -> ClaudeMode {
        self.mode
    }
}

impl Adapter for ClaudeCodeAdapter {
    fn name(&self) -> &str {
        "claude-code"
    }

    fn spawn_config(&self, task_description: &str, work_dir: &Path) -> SpawnConfig {
        let mut args = Vec::new();
        match self.mode {
            ClaudeMode::Print => {
                args.push("-p".to_string());
                args.push("--output-format".to_string());
                args.push("stream-json".to_string());
                args.push(task_description.to_string());
            }
            ClaudeMode::Interactive => {
                args.push("--prompt".to_string());
                args.push(task_description.to_string());
            }
        }

        SpawnConfig {
            program: self.program.clone(),
            args,
            cwd: Some(work_dir.to_path_buf()),
            env: vec![],
            ..Default::default()
        }
    }

    fn prompt_patterns(&self) -> PatternSet {
        PatternSet::new(vec![
            (
                PromptType::YesNo,
                Regex::new(r"(?i)allow (tool|command) .+\?").unwrap(),
            ),
            (
                PromptType::YesNo,
                Regex::new(r"(?i)continue\?\s*\[y/n\]").unwrap(),
            ),
            (
                PromptType::ConfirmEnter,
                Regex::new(r"(?i)press enter to continue").unwrap(),
            ),
        ])
    }

    fn encode(&self, prompt_type: PromptType, reply_value: &str, allow_unsafe_default: bool) -> Result<Vec<u8>, EncodeError> {
        encode_default(prompt_type, reply_value, allow_unsafe_default, "\r")
    }

    fn session_signal(&self, line: &str) -> Option<SessionSignal> {
        static RESULT_JSON: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#""type"\s*:\s*"result""#).unwrap());
        static IS_ERROR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#""is_error"\s*:\s*true"#).unwrap());

        if !RESULT_JSON.is_match(line) {
            return None;
        }
        if IS_ERROR.is_match(line) {
            Some(SessionSignal::Error {
                detail: line.to_string(),
            })
        } else {
            Some(SessionSignal::Completion)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_program_is_claude() {
        let adapter = ClaudeCodeAdapter::new(None);
        let config = adapter.spawn_config("test", Path::new("/tmp"));
        assert_eq!(config.program, "claude");
    }

    #[test]
    fn custom_program_path() {
        let adapter = ClaudeCodeAdapter::new(Some("/usr/local/bin/claude".to_string()));
        let config = adapter.spawn_config("test", Path::new("/tmp"));
        assert_eq!(config.program, "/usr/local/bin/claude");
    }

    #[test]
    fn default_mode_is_interactive() {
        let adapter = ClaudeCodeAdapter::new(None);
        assert_eq!(adapter.mode(), ClaudeMode::Interactive);
    }

    #[test]
    fn print_mode_uses_p_flag_and_stream_json() {
        let adapter = ClaudeCodeAdapter::new(None).with_mode(ClaudeMode::Print);
        let config = adapter.spawn_config("Fix the auth bug", Path::new("/work"));
        assert!(config.args.contains(&"-p".to_string()));
        assert!(config.args.contains(&"stream-json".to_string()));
        assert!(config.args.contains(&"Fix the auth bug".to_string()));
    }

    #[test]
    fn interactive_mode_uses_prompt_flag() {
        let adapter = ClaudeCodeAdapter::new(None).with_mode(ClaudeMode::Interactive);
        let config = adapter.spawn_config("Fix the auth bug", Path::new("/work"));
        assert!(!config.args.contains(&"-p".to_string()));
        assert!(config.args.contains(&"--prompt".to_string()));
    }

    #[test]
    fn spawn_sets_cwd() {
        let adapter = ClaudeCodeAdapter::new(None);
        let config = adapter.spawn_config("task", Path::new("/my/worktree"));
        assert_eq!(config.cwd, Some(Path::new("/my/worktree").to_path_buf()));
    }

    #[test]
    fn prompt_patterns_detect_permission_as_yes_no() {
        let adapter = ClaudeCodeAdapter::new(None);
        let patterns = adapter.prompt_patterns();
        let m = patterns.detect("Allow tool Read on /home/user/file.rs?").unwrap();
        assert_eq!(m.prompt_type, PromptType::YesNo);
    }

    #[test]
    fn prompt_patterns_detect_continuation() {
        let adapter = ClaudeCodeAdapter::new(None);
        let patterns = adapter.prompt_patterns();
        let m = patterns.detect("Continue? [y/n]").unwrap();
        assert_eq!(m.prompt_type, PromptType::YesNo);
    }

    #[test]
    fn prompt_patterns_no_match_on_normal_output() {
        let adapter = ClaudeCodeAdapter::new(None);
        let patterns = adapter.prompt_patterns();
        assert!(patterns.detect("Writing function to parse YAML...").is_none());
    }

    #[test]
    fn session_signal_detects_completion_in_json() {
        let adapter = ClaudeCodeAdapter::new(None);
        let sig = adapter.session_signal(r#"{"type": "result", "subtype": "success"}"#);
        assert_eq!(sig, Some(SessionSignal::Completion));
    }

    #[test]
    fn session_signal_detects_error_in_json() {
        let adapter = ClaudeCodeAdapter::new(None);
        let sig = adapter.session_signal(r#"{"type": "result", "is_error": true}"#);
        assert!(matches!(sig, Some(SessionSignal::Error { .. })));
    }

    #[test]
    fn encode_yes_no_requires_policy_authorization() {
        let adapter = ClaudeCodeAdapter::new(None);
        assert!(adapter.encode(PromptType::YesNo, "y", false).is_err());
        assert_eq!(adapter.encode(PromptType::YesNo, "y", true).unwrap(), b"y\r");
    }

    #[test]
    fn name_is_claude_code() {
        assert_eq!(ClaudeCodeAdapter::new(None).name(), "claude-code");
    }
}
