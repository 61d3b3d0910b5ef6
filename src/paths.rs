//! State directory resolution: where `prompts.db`, `audit.log`,
//! `autopilot_decisions.jsonl`, `policy.yaml`, `daemon.pid`, and
//! `config.toml` live (spec §6 persisted state layout).
//!
//! Generalized from the teacher's `resolve_kanban_root`'s
//! prefer-new-else-legacy pattern: prefers `$XDG_STATE_HOME/promptrelay`
//! (or `~/.local/state/promptrelay` if `XDG_STATE_HOME` is unset), falling
//! back to the legacy `~/.battyrelay` directory when only it exists, with a
//! one-time copy-forward into the new location.

use std::path::{Path, PathBuf};

/// Resolve the state directory, migrating a legacy directory forward on
/// first use if the new one doesn't exist yet.
pub fn resolve_state_dir(home: &Path, xdg_state_home: Option<&Path>) -> PathBuf {
    let preferred = match xdg_state_home {
        Some(dir) => dir.join("promptrelay"),
        None => home.join(".local").join("state").join("promptrelay"),
    };
    if preferred.is_dir() {
        return preferred;
    }

    let legacy = home.join(".battyrelay");
    if legacy.is_dir() {
        if let Err(err) = migrate_legacy(&legacy, &preferred) {
            tracing::warn!(?err, "failed to migrate legacy state directory, using legacy in place");
            return legacy;
        }
        return preferred;
    }

    preferred
}

fn migrate_legacy(legacy: &Path, preferred: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(preferred)?;
    for entry in std::fs::read_dir(legacy)? {
        let entry = entry?;
        let dest = preferred.join(entry.file_name());
        if !dest.exists() {
            std::fs::copy(entry.path(), &dest)?;
        }
    }
    Ok(())
}

/// File paths within a resolved state directory (spec §6).
pub struct StatePaths {
    pub root: PathBuf,
}

impl StatePaths {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn store_db(&self) -> PathBuf {
        self.root.join("prompts.db")
    }

    pub fn audit_log(&self) -> PathBuf {
        self.root.join("audit.log")
    }

    pub fn autopilot_trace(&self) -> PathBuf {
        self.root.join("autopilot_decisions.jsonl")
    }

    pub fn policy_file(&self) -> PathBuf {
        self.root.join("policy.yaml")
    }

    pub fn daemon_pid(&self) -> PathBuf {
        self.root.join("daemon.pid")
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    pub fn ensure_exists(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)
    }
}
