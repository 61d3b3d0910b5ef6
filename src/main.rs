//! `promptrelay` binary entry point: CLI dispatch, component wiring, and the
//! top-level error-to-exit-code mapping (spec §6, §7).

use std::collections::HashMap;
use std::process::ExitCode;
use std::sync::mpsc::sync_channel;
use std::sync::Arc;
use std::time::Duration;

use clap::{CommandFactory, Parser};
use tracing::info;

use promptrelay::adapter::{adapter_from_name, Adapter};
use promptrelay::audit::HashChainLog;
use promptrelay::autopilot::{AutopilotEngine, Mode as AutopilotMode};
use promptrelay::channel::{Channel, LoopbackChannel, MaildirChannel};
use promptrelay::cli::{AutopilotCommand, AutopilotModeArg, Cli, Command, LabCommand, PolicyCommand};
use promptrelay::config::{ChannelKind, CliOverrides, Config, FileConfig};
use promptrelay::daemon::{self, DaemonGuard, ShutdownSignal};
use promptrelay::detector::DetectorConfig;
use promptrelay::errors::RelayError;
use promptrelay::paths::{resolve_state_dir, StatePaths};
use promptrelay::policy::{Defaults, Policy, PolicyEngine};
use promptrelay::router::Router;
use promptrelay::session::SessionManager;
use promptrelay::store::Store;
use promptrelay::supervisor::{self, SupervisorConfig};

/// Default time-to-live for a routed prompt when nothing else bounds it;
/// long enough to cover a human reading a channel notification.
const DEFAULT_PROMPT_TTL_SECS: u64 = 300;

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            eprintln!("remedy: {}", err.remedy());
            ExitCode::from(err.exit_code())
        }
    }
}

fn init_tracing(verbose: u8) {
    let filter = match verbose {
        0 => "promptrelay=info",
        1 => "promptrelay=debug",
        _ => "promptrelay=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn run(cli: Cli) -> Result<(), RelayError> {
    let home = std::env::var_os("HOME")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|| std::path::PathBuf::from("."));
    let xdg_state_home = std::env::var_os("XDG_STATE_HOME").map(std::path::PathBuf::from);
    let state_dir = cli
        .state_dir
        .clone()
        .unwrap_or_else(|| resolve_state_dir(&home, xdg_state_home.as_deref()));
    let paths = StatePaths::new(state_dir);
    paths
        .ensure_exists()
        .map_err(|err| RelayError::Environment { cause: err.to_string() })?;

    let env: HashMap<String, String> = std::env::vars().collect();
    let file_config = FileConfig::load(&paths.config_file()).map_err(|err| RelayError::Config {
        cause: err.to_string(),
    })?;
    let overrides = CliOverrides {
        state_dir: cli.state_dir.clone(),
        ..Default::default()
    };
    let config = Config::resolve(overrides, &env, file_config);

    match cli.command {
        Command::Run { tool, label, args } => cmd_run(&paths, &config, &tool, label.as_deref(), &args),
        Command::Start => cmd_start(&paths, &config),
        Command::Stop => cmd_stop(&paths),
        Command::Status { json, watch } => cmd_status(&paths, json, watch),
        Command::Sessions => cmd_sessions(&paths),
        Command::Logs { tail, session } => cmd_logs(&paths, tail, session.as_deref()),
        Command::Doctor { fix } => cmd_doctor(&paths, fix),
        Command::Policy { action } => cmd_policy(&paths, action),
        Command::Autopilot { action } => cmd_autopilot(&paths, &config, action),
        Command::Lab { action } => cmd_lab(action),
        Command::Completions { shell } => {
            cmd_completions(shell);
            Ok(())
        }
    }
}

fn cmd_run(
    paths: &StatePaths,
    config: &Config,
    tool: &str,
    label: Option<&str>,
    args: &[String],
) -> Result<(), RelayError> {
    let store = Arc::new(Store::open(&paths.store_db())?);
    let audit = Arc::new(HashChainLog::open(&paths.audit_log())?);
    let sessions = SessionManager::new(store.clone());
    let session = sessions.start(tool, label)?;

    let adapter: Arc<dyn Adapter> = {
        let boxed = adapter_from_name(tool).ok_or_else(|| RelayError::Config {
            cause: format!("unknown adapter '{tool}' (expected claude-code, codex-cli, or aider)"),
        })?;
        Arc::from(boxed)
    };

    let channel = build_channel(config, paths)?;
    let autopilot = build_autopilot(config, paths, tool, label)?;

    let (reply_tx, reply_rx) = sync_channel(64);
    let router = Arc::new(Router::new(
        store.clone(),
        channel.clone(),
        audit,
        autopilot,
        config.allowlist.clone(),
        reply_tx,
    ));

    channel.on_reply({
        let router = router.clone();
        Box::new(move |inbound| router.on_inbound_reply(inbound))
    });

    let recovered = router.recover_pending()?;
    if recovered > 0 {
        info!(recovered, "recovered pending prompts from a previous run");
    }

    let task_description = args.join(" ");
    let cwd = std::env::current_dir().map_err(|err| RelayError::Environment { cause: err.to_string() })?;
    let spawn = adapter.spawn_config(&task_description, &cwd);

    let detector_config = DetectorConfig {
        silence_ms: config.detector_silence_ms,
        post_inject_suppress_ms: config.detector_post_inject_suppress_ms,
    };
    let supervisor_config = SupervisorConfig::new(session.session_id.clone(), DEFAULT_PROMPT_TTL_SECS, detector_config);

    let outcome = supervisor::run_session(spawn, adapter, supervisor_config, store, router, reply_rx)?;
    sessions.end(&session.session_id)?;

    match outcome {
        supervisor::SessionOutcome::Completed => info!("session completed"),
        supervisor::SessionOutcome::Error { detail } => {
            tracing::error!(detail, "session reported an error signal")
        }
        supervisor::SessionOutcome::Exited { code } => info!(?code, "child process exited"),
    }
    Ok(())
}

fn cmd_start(paths: &StatePaths, config: &Config) -> Result<(), RelayError> {
    let guard = DaemonGuard::acquire(paths.daemon_pid())?;
    let shutdown = ShutdownSignal::new();
    shutdown.install();

    let store = Arc::new(Store::open(&paths.store_db())?);
    let audit = Arc::new(HashChainLog::open(&paths.audit_log())?);
    let channel = build_channel(config, paths)?;
    let autopilot = build_autopilot(config, paths, "daemon", None)?;
    let (reply_tx, _reply_rx) = sync_channel(64);
    let router = Arc::new(Router::new(
        store.clone(),
        channel.clone(),
        audit,
        autopilot,
        config.allowlist.clone(),
        reply_tx,
    ));

    channel.on_reply({
        let router = router.clone();
        Box::new(move |inbound| router.on_inbound_reply(inbound))
    });

    let recovered = router.recover_pending()?;
    info!(recovered, "daemon recovered pending prompts");

    while !shutdown.is_set() {
        if let Err(err) = store.sweep_expired(chrono::Utc::now()) {
            tracing::error!(?err, "sweep_expired failed");
        }
        daemon::wait_for_shutdown_or_timeout(&shutdown, Duration::from_secs(5));
    }

    info!(grace_period_secs = config.grace_period_secs, "draining in-flight work before exit");
    daemon::wait_for_shutdown_or_timeout(&shutdown, Duration::from_secs(config.grace_period_secs));
    drop(guard);
    Ok(())
}

fn cmd_stop(paths: &StatePaths) -> Result<(), RelayError> {
    let pid = std::fs::read_to_string(paths.daemon_pid())
        .ok()
        .and_then(|s| s.trim().parse::<i32>().ok())
        .ok_or_else(|| RelayError::Environment {
            cause: "no daemon.pid found; is the daemon running?".to_string(),
        })?;

    signal_daemon(pid)?;
    println!("sent shutdown signal to daemon (pid {pid})");
    Ok(())
}

#[cfg(unix)]
fn signal_daemon(pid: i32) -> Result<(), RelayError> {
    if unsafe { libc::kill(pid, libc::SIGTERM) } != 0 {
        return Err(RelayError::Environment {
            cause: format!("failed to signal daemon pid {pid}"),
        });
    }
    Ok(())
}

#[cfg(not(unix))]
fn signal_daemon(_pid: i32) -> Result<(), RelayError> {
    Err(RelayError::Environment {
        cause: "stopping a daemon by pid is only supported on unix".to_string(),
    })
}

#[cfg(unix)]
fn pid_is_alive(pid: i32) -> bool {
    unsafe { libc::kill(pid, 0) == 0 }
}

#[cfg(not(unix))]
fn pid_is_alive(_pid: i32) -> bool {
    false
}

fn cmd_status(paths: &StatePaths, json: bool, watch: bool) -> Result<(), RelayError> {
    loop {
        let daemon_pid = std::fs::read_to_string(paths.daemon_pid())
            .ok()
            .and_then(|s| s.trim().parse::<i32>().ok());
        let running = daemon_pid.map(pid_is_alive).unwrap_or(false);
        let store = Store::open(&paths.store_db())?;
        let pending = store.load_pending(chrono::Utc::now())?;

        if json {
            let body = serde_json::json!({
                "daemon_running": running,
                "daemon_pid": daemon_pid,
                "pending_prompts": pending.len(),
            });
            println!("{body}");
        } else {
            println!("daemon: {}", if running { "running" } else { "stopped" });
            println!("pending prompts: {}", pending.len());
        }

        if !watch {
            break;
        }
        std::thread::sleep(Duration::from_secs(2));
    }
    Ok(())
}

fn cmd_sessions(paths: &StatePaths) -> Result<(), RelayError> {
    let store = Arc::new(Store::open(&paths.store_db())?);
    let manager = SessionManager::new(store);
    for session in manager.list()? {
        println!(
            "{}\t{}\t{}\t{}\t{}",
            session.session_id,
            session.tool,
            session.label.unwrap_or_default(),
            session.state,
            session.started_at,
        );
    }
    Ok(())
}

fn cmd_logs(paths: &StatePaths, tail: Option<usize>, session: Option<&str>) -> Result<(), RelayError> {
    let audit = HashChainLog::open(&paths.audit_log())?;
    let mut entries = audit.read_all()?;
    if let Some(session_id) = session {
        entries.retain(|e| e.payload.get("session_id").and_then(|v| v.as_str()) == Some(session_id));
    }
    if let Some(n) = tail {
        let start = entries.len().saturating_sub(n);
        entries.drain(..start);
    }
    for entry in entries {
        println!("{} seq={} {} {}", entry.timestamp, entry.seq, entry.event_kind, entry.payload);
    }
    Ok(())
}

fn cmd_doctor(paths: &StatePaths, fix: bool) -> Result<(), RelayError> {
    let mut problems = Vec::new();

    if !paths.root.is_dir() {
        problems.push(format!("state directory {} does not exist", paths.root.display()));
        if fix {
            paths
                .ensure_exists()
                .map_err(|err| RelayError::Environment { cause: err.to_string() })?;
        }
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(metadata) = std::fs::metadata(&paths.root) {
            let mode = metadata.permissions().mode() & 0o777;
            if mode & 0o077 != 0 {
                problems.push(format!("state directory permissions are {mode:o}, expected 0700"));
                if fix {
                    let mut perms = metadata.permissions();
                    perms.set_mode(0o700);
                    let _ = std::fs::set_permissions(&paths.root, perms);
                }
            }
        }
    }

    if paths.audit_log().is_file() {
        let audit = HashChainLog::open(&paths.audit_log())?;
        if let Err(err) = audit.verify() {
            problems.push(format!("audit log integrity check failed: {err}"));
            if fix {
                audit.reset_with_marker("doctor --fix: chain failed verification")?;
                problems.push("audit log was truncated with a new chain-root marker".to_string());
            }
        }
    }

    for name in ["claude", "codex", "aider"] {
        if !program_on_path(name) {
            problems.push(format!("'{name}' was not found on PATH"));
        }
    }

    if problems.is_empty() {
        println!("doctor: no problems found");
    } else {
        for p in &problems {
            println!("doctor: {p}");
        }
    }
    Ok(())
}

fn program_on_path(name: &str) -> bool {
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(name).is_file()))
        .unwrap_or(false)
}

fn cmd_policy(paths: &StatePaths, action: PolicyCommand) -> Result<(), RelayError> {
    match action {
        PolicyCommand::Validate { file } => {
            let text = std::fs::read_to_string(&file).map_err(|err| RelayError::Config {
                cause: format!("reading {file}: {err}"),
            })?;
            let policy = PolicyEngine::load_yaml(&file, &text)?;
            println!("{file}: {} rule(s), ok", policy.rules.len());
            Ok(())
        }
        PolicyCommand::Test => {
            let path = paths.policy_file();
            let text = std::fs::read_to_string(&path).map_err(|err| RelayError::Config {
                cause: err.to_string(),
            })?;
            let policy = PolicyEngine::load_yaml(&path.display().to_string(), &text)?;
            let engine = PolicyEngine::new(policy, "sample-tool", None);
            for sample in sample_prompts() {
                let decision = engine.evaluate(&sample);
                println!(
                    "{:?} [{}] -> {:?} (rule {})",
                    sample.prompt_type,
                    sample.excerpt,
                    decision.action,
                    decision.matched_rule_id.as_deref().unwrap_or("<none>"),
                );
            }
            Ok(())
        }
        PolicyCommand::Migrate { file } => {
            let text = std::fs::read_to_string(&file).map_err(|err| RelayError::Config {
                cause: err.to_string(),
            })?;
            let (policy, migrated) = PolicyEngine::load_yaml_any_version(&file, &text)?;
            let rendered = serde_yaml::to_string(&policy).map_err(|err| RelayError::Config {
                cause: err.to_string(),
            })?;
            std::fs::write(&file, rendered).map_err(|err| RelayError::Environment { cause: err.to_string() })?;
            if migrated {
                println!("{file}: migrated v0 -> v1 schema");
            } else {
                println!("{file}: already current schema, rewrote in normalized form");
            }
            Ok(())
        }
    }
}

fn sample_prompts() -> Vec<promptrelay::prompt::PromptEvent> {
    use promptrelay::prompt::{Confidence, PromptEvent, PromptType, Signal};
    vec![
        PromptEvent::new("sample", PromptType::YesNo, "Continue? [y/N]", Confidence::High, Signal::Pattern, 30),
        PromptEvent::new(
            "sample",
            PromptType::ConfirmEnter,
            "Press Enter to continue",
            Confidence::Medium,
            Signal::BlockedRead,
            30,
        ),
        PromptEvent::new(
            "sample",
            PromptType::FreeText,
            "Enter commit message:",
            Confidence::Low,
            Signal::Silence,
            30,
        ),
    ]
}

fn cmd_autopilot(paths: &StatePaths, config: &Config, action: AutopilotCommand) -> Result<(), RelayError> {
    match action {
        AutopilotCommand::Mode { mode } => {
            let mode_str = match mode {
                AutopilotModeArg::Off => "off",
                AutopilotModeArg::Assist => "assist",
                AutopilotModeArg::Full => "full",
            };
            persist_autopilot_setting(&paths.config_file(), "mode", toml::Value::String(mode_str.to_string()))?;
            println!("autopilot mode: {:?} -> {mode_str}", config.autopilot_mode);
            Ok(())
        }
        AutopilotCommand::Pause => {
            persist_autopilot_setting(&paths.config_file(), "paused", toml::Value::Boolean(true))?;
            println!("autopilot paused");
            Ok(())
        }
        AutopilotCommand::Resume => {
            persist_autopilot_setting(&paths.config_file(), "paused", toml::Value::Boolean(false))?;
            println!("autopilot resumed");
            Ok(())
        }
    }
}

/// Rewrite one key under `[autopilot]` in `config.toml`, preserving every
/// other key already present (spec §4.10: the pause flag must survive
/// restarts by round-tripping through the config file, not an in-memory
/// flag).
fn persist_autopilot_setting(path: &std::path::Path, key: &str, value: toml::Value) -> Result<(), RelayError> {
    let existing = if path.is_file() {
        std::fs::read_to_string(path).map_err(|err| RelayError::Environment { cause: err.to_string() })?
    } else {
        String::new()
    };
    let mut doc: toml::Value = if existing.trim().is_empty() {
        toml::Value::Table(Default::default())
    } else {
        toml::from_str(&existing).map_err(|err| RelayError::Config { cause: err.to_string() })?
    };
    let table = doc.as_table_mut().ok_or_else(|| RelayError::Config {
        cause: "config.toml root is not a table".to_string(),
    })?;
    let autopilot = table
        .entry("autopilot".to_string())
        .or_insert_with(|| toml::Value::Table(Default::default()));
    let autopilot_table = autopilot.as_table_mut().ok_or_else(|| RelayError::Config {
        cause: "[autopilot] is not a table".to_string(),
    })?;
    autopilot_table.insert(key.to_string(), value);

    let rendered = toml::to_string_pretty(&doc).map_err(|err| RelayError::Config { cause: err.to_string() })?;
    std::fs::write(path, rendered).map_err(|err| RelayError::Environment { cause: err.to_string() })
}

#[cfg(any(test, feature = "scenario-test"))]
fn cmd_lab(action: LabCommand) -> Result<(), RelayError> {
    let scratch = std::env::temp_dir().join(format!("promptrelay-lab-{}", std::process::id()));

    let reports = match action {
        LabCommand::Run { scenario: Some(name), .. } => {
            let dir = scratch.join(&name);
            std::fs::create_dir_all(&dir).map_err(|err| RelayError::Environment { cause: err.to_string() })?;
            vec![promptrelay::lab::run_scenario(&name, &dir)]
        }
        LabCommand::Run { scenario: None, .. } => {
            std::fs::create_dir_all(&scratch).map_err(|err| RelayError::Environment { cause: err.to_string() })?;
            promptrelay::lab::run_all(&scratch)
        }
    };

    let mut failed = 0;
    for report in &reports {
        match &report.outcome {
            promptrelay::lab::ScenarioOutcome::Passed => println!("PASS {}", report.name),
            promptrelay::lab::ScenarioOutcome::Failed { reason } => {
                println!("FAIL {} - {reason}", report.name);
                failed += 1;
            }
        }
    }
    let _ = std::fs::remove_dir_all(&scratch);

    if failed > 0 {
        return Err(RelayError::Other(anyhow::anyhow!("{failed} scenario(s) failed")));
    }
    Ok(())
}

#[cfg(not(any(test, feature = "scenario-test")))]
fn cmd_lab(_action: LabCommand) -> Result<(), RelayError> {
    Err(RelayError::Config {
        cause: "this build was compiled without the scenario-test feature".to_string(),
    })
}

fn cmd_completions(shell: clap_complete::Shell) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    clap_complete::generate(shell, &mut cmd, name, &mut std::io::stdout());
}

fn build_channel(config: &Config, paths: &StatePaths) -> Result<Arc<dyn Channel>, RelayError> {
    match config.channel_kind {
        ChannelKind::Loopback => Ok(LoopbackChannel::new() as Arc<dyn Channel>),
        ChannelKind::Maildir => {
            let root = config.maildir_root.clone().unwrap_or_else(|| paths.root.join("maildir"));
            MaildirChannel::open(&root)
                .map(|c| c as Arc<dyn Channel>)
                .map_err(|err| RelayError::Environment { cause: err.to_string() })
        }
    }
}

fn build_autopilot(
    config: &Config,
    paths: &StatePaths,
    tool_id: &str,
    session_label: Option<&str>,
) -> Result<Option<Arc<AutopilotEngine>>, RelayError> {
    use promptrelay::config::AutopilotModeConfig;

    if config.autopilot_mode == AutopilotModeConfig::Off {
        return Ok(None);
    }

    let policy_path = paths.policy_file();
    let text = std::fs::read_to_string(&policy_path).unwrap_or_default();
    let policy = if text.trim().is_empty() {
        Policy {
            rules: Vec::new(),
            defaults: Defaults::default(),
        }
    } else {
        PolicyEngine::load_yaml(&policy_path.display().to_string(), &text)?
    };
    let policy_version_hash = hash_policy_text(&text);

    let engine = PolicyEngine::new(policy, tool_id.to_string(), session_label.map(str::to_string));
    let trace = HashChainLog::open(&paths.autopilot_trace())?;
    let mode: AutopilotMode = config.autopilot_mode.into();

    Ok(Some(Arc::new(AutopilotEngine::new(
        engine,
        mode,
        config.autopilot_paused,
        trace,
        policy_version_hash,
    ))))
}

fn hash_policy_text(text: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}
