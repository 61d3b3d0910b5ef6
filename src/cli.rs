//! Command-line surface (spec §6).

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(
    name = "promptrelay",
    about = "Human-in-the-loop PTY supervisor for interactive CLI agents",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Override the resolved state directory.
    #[arg(long, global = true)]
    pub state_dir: Option<std::path::PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Spawn an agent in a supervised PTY session (spec §6).
    Run {
        /// Adapter name: claude-code, codex-cli, or aider.
        tool: String,

        /// Label this session for policy scoping and `sessions`/`logs`.
        #[arg(long)]
        label: Option<String>,

        /// Arguments passed through to the child program.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Start the background daemon (router, channel poller, recovery).
    Start,

    /// Stop the background daemon, draining in-flight prompts first.
    Stop,

    /// Report daemon and session health.
    Status {
        /// Emit machine-readable JSON output.
        #[arg(long, default_value_t = false)]
        json: bool,

        /// Keep polling and re-rendering status until interrupted.
        #[arg(long, default_value_t = false)]
        watch: bool,
    },

    /// List known sessions.
    Sessions,

    /// Inspect the audit log.
    Logs {
        /// Only show the last N entries.
        #[arg(long)]
        tail: Option<usize>,

        /// Restrict to one session id.
        #[arg(long)]
        session: Option<String>,
    },

    /// Check the environment (state dir permissions, child availability,
    /// audit-log integrity) and optionally repair what it safely can.
    Doctor {
        #[arg(long, default_value_t = false)]
        fix: bool,
    },

    /// Policy document management.
    Policy {
        #[command(subcommand)]
        action: PolicyCommand,
    },

    /// Autopilot Engine controls.
    Autopilot {
        #[command(subcommand)]
        action: AutopilotCommand,
    },

    /// Deterministic regression scenarios (spec §8).
    Lab {
        #[command(subcommand)]
        action: LabCommand,
    },

    /// Emit shell completion scripts.
    Completions { shell: clap_complete::Shell },
}

#[derive(Subcommand, Debug)]
pub enum PolicyCommand {
    /// Parse and validate a policy file without applying it.
    Validate { file: String },
    /// Dry-run every rule against a set of sample prompts.
    Test,
    /// Rewrite an older policy document to the current schema.
    Migrate { file: String },
}

#[derive(Subcommand, Debug)]
pub enum AutopilotCommand {
    /// Set the operating mode.
    Mode { mode: AutopilotModeArg },
    /// Engage the persistent kill switch.
    Pause,
    /// Disengage the persistent kill switch.
    Resume,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "lowercase")]
pub enum AutopilotModeArg {
    Off,
    Assist,
    Full,
}

#[derive(Subcommand, Debug)]
pub enum LabCommand {
    /// Run one named scenario, or every scenario with `--all`.
    Run {
        scenario: Option<String>,
        #[arg(long, default_value_t = false)]
        all: bool,
    },
}
