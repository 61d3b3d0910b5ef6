//! Shared error types for component boundaries.
//!
//! Each component that can fail in a way callers need to branch on (not just
//! log and bail) gets a `thiserror` enum here. CLI-facing code collapses
//! these into a one-line cause + remedy + exit code (see `RelayError`).

use thiserror::Error;

/// Failure modes for the prompt store's mutating operations (spec §4.1, §7).
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StoreError {
    #[error("a prompt with nonce {0} already exists")]
    DuplicateNonce(String),

    #[error("prompt {0} not found")]
    NotFound(String),

    #[error("illegal transition for prompt {prompt_id}: {from} -> {to}")]
    IllegalTransition {
        prompt_id: String,
        from: String,
        to: String,
    },

    #[error("store is unrecoverable: {0}")]
    StorageFatal(String),
}

/// Outcome of the atomic decision guard, `Store::decide_prompt` (spec §4.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitResult {
    Accepted,
    AlreadyDecided,
    Expired,
    WrongSession,
    Unknown,
}

/// Failure modes surfaced by a `Channel` implementation (spec §4.7, §7).
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("transient delivery failure: {0}")]
    Transient(String),

    #[error("permanent delivery failure: {0}")]
    Permanent(String),
}

/// Failure modes for the PTY reply injector (spec §4.5, §7).
#[derive(Debug, Error)]
pub enum InjectionError {
    #[error("write to pty timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("write to pty failed: {0}")]
    Io(String),
}

/// Failure modes for policy loading/parsing (spec §7).
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("failed to parse policy file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("policy rule {0} is invalid: {1}")]
    InvalidRule(String, String),
}

/// Failure modes for the hash-chained audit/decision-trace log.
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit log is corrupt or unreadable: {0}")]
    Fatal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Top-level error type returned to the CLI layer. Wraps component errors
/// and carries the process exit code they map to (spec §6, §7).
#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Injection(#[from] InjectionError),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Audit(#[from] AuditError),

    #[error("{cause}")]
    Config { cause: String },

    #[error("{cause}")]
    Environment { cause: String },

    #[error("{cause}")]
    Permission { cause: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Standard exit codes from spec §6.
pub mod exit_code {
    pub const SUCCESS: u8 = 0;
    pub const GENERAL: u8 = 1;
    pub const CONFIG: u8 = 2;
    pub const ENVIRONMENT: u8 = 3;
    pub const NETWORK: u8 = 4;
    pub const PERMISSION: u8 = 5;
    pub const STATE_CORRUPTION: u8 = 8;
    pub const INTERRUPTED: u8 = 130;
}

impl RelayError {
    /// Map this error to one of spec §6's standard exit codes.
    pub fn exit_code(&self) -> u8 {
        match self {
            RelayError::Config { .. } | RelayError::Policy(_) => exit_code::CONFIG,
            RelayError::Environment { .. } => exit_code::ENVIRONMENT,
            RelayError::Permission { .. } => exit_code::PERMISSION,
            RelayError::Audit(AuditError::Fatal(_))
            | RelayError::Store(StoreError::StorageFatal(_)) => exit_code::STATE_CORRUPTION,
            RelayError::Channel(_) | RelayError::Injection(_) | RelayError::Audit(_) => {
                exit_code::GENERAL
            }
            RelayError::Other(_) => exit_code::GENERAL,
        }
    }

    /// A one-sentence, user-facing remedy for this error (spec §7).
    pub fn remedy(&self) -> &'static str {
        match self {
            RelayError::Config { .. } => "check config.toml and policy.yaml for syntax errors.",
            RelayError::Environment { .. } => {
                "verify the child program and PTY are available in this environment."
            }
            RelayError::Permission { .. } => {
                "check file permissions on the state directory and daemon.pid."
            }
            RelayError::Store(StoreError::StorageFatal(_)) => {
                "the prompt store is corrupt; restore from backup or delete prompts.db to reset."
            }
            RelayError::Audit(AuditError::Fatal(_)) => {
                "the audit log is corrupt; truncate it with a new chain-root marker to recover."
            }
            RelayError::Policy(_) => "run `promptrelay policy validate` to locate the error.",
            _ => "see the error above for details.",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_fatal_maps_to_state_corruption() {
        let err = RelayError::Store(StoreError::StorageFatal("disk full".into()));
        assert_eq!(err.exit_code(), exit_code::STATE_CORRUPTION);
    }

    #[test]
    fn config_error_maps_to_config_exit_code() {
        let err = RelayError::Config {
            cause: "bad toml".into(),
        };
        assert_eq!(err.exit_code(), exit_code::CONFIG);
    }

    #[test]
    fn channel_error_maps_to_general() {
        let err = RelayError::Channel(ChannelError::Permanent("boom".into()));
        assert_eq!(err.exit_code(), exit_code::GENERAL);
    }

    #[test]
    fn duplicate_nonce_display() {
        let err = StoreError::DuplicateNonce("abc".into());
        assert_eq!(err.to_string(), "a prompt with nonce abc already exists");
    }
}
