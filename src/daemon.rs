//! Daemon lifecycle: the `daemon.pid` advisory lock (mode 0600) and
//! signal-driven graceful shutdown with a bounded drain period (spec §5,
//! §6 `start`/`stop`).
//!
//! Grounded on the teacher's process-control conventions (`ctrlc` wired to
//! a shared shutdown flag) extended with a pidfile that detects and clears
//! a stale lock left by a crashed process, via a unix `kill(pid, 0)`
//! liveness probe.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::errors::RelayError;

/// Holds the `daemon.pid` advisory lock for the lifetime of the process;
/// removes it on drop.
pub struct DaemonGuard {
    pid_path: PathBuf,
}

impl DaemonGuard {
    /// Acquire the lock, refusing if another live process already holds
    /// it. A pidfile referring to a dead process is treated as stale and
    /// silently replaced.
    pub fn acquire(pid_path: PathBuf) -> Result<Self, RelayError> {
        if let Some(existing) = read_pid(&pid_path) {
            if is_alive(existing) {
                return Err(RelayError::Environment {
                    cause: format!("daemon already running (pid {existing})"),
                });
            }
            tracing::warn!(pid = existing, "clearing stale daemon.pid from a dead process");
        }

        let pid = std::process::id();
        fs::write(&pid_path, pid.to_string())
            .map_err(|err| RelayError::Environment { cause: err.to_string() })?;
        set_owner_only_permissions(&pid_path);

        Ok(Self { pid_path })
    }
}

impl Drop for DaemonGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.pid_path);
    }
}

fn read_pid(path: &Path) -> Option<i32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

#[cfg(unix)]
fn is_alive(pid: i32) -> bool {
    // kill(pid, 0) performs no signal delivery, only existence/permission
    // checks (spec §5: restart recovery must tell a live daemon from a
    // crashed one before acting on state).
    unsafe { libc::kill(pid, 0) == 0 }
}

#[cfg(not(unix))]
fn is_alive(_pid: i32) -> bool {
    false
}

#[cfg(unix)]
fn set_owner_only_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(metadata) = fs::metadata(path) {
        let mut perms = metadata.permissions();
        perms.set_mode(0o600);
        let _ = fs::set_permissions(path, perms);
    }
}

#[cfg(not(unix))]
fn set_owner_only_permissions(_path: &Path) {}

/// A cooperative shutdown flag, set by the `SIGINT`/`SIGTERM` handler and
/// polled by every long-running task (stall watchdogs, channel pollers).
#[derive(Clone)]
pub struct ShutdownSignal {
    flag: Arc<AtomicBool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn set(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Install a `ctrlc` handler that sets this signal on `SIGINT`/`SIGTERM`.
    /// Safe to call once per process; a second call returns an error from
    /// the underlying crate, which is intentionally ignored (only the
    /// daemon's own `main` should call this).
    pub fn install(&self) {
        let flag = self.clone();
        if let Err(err) = ctrlc::set_handler(move || {
            tracing::info!("shutdown signal received, draining in-flight work");
            flag.set();
        }) {
            tracing::warn!(?err, "failed to install signal handler");
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Block until either `signal` is set or `grace_period` elapses, polling
/// every 50ms. Returns `true` if the shutdown signal fired (a clean
/// request), `false` if the grace period simply ran out (spec §5: "drains
/// in-flight prompts for up to a grace period before a forced exit").
pub fn wait_for_shutdown_or_timeout(signal: &ShutdownSignal, grace_period: Duration) -> bool {
    let start = std::time::Instant::now();
    while !signal.is_set() {
        if start.elapsed() >= grace_period {
            return false;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn acquire_then_drop_creates_and_removes_pidfile() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("daemon.pid");
        {
            let _guard = DaemonGuard::acquire(path.clone()).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[test]
    fn acquire_fails_when_a_live_process_holds_the_lock() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("daemon.pid");
        // Our own pid is always alive.
        fs::write(&path, std::process::id().to_string()).unwrap();
        let err = DaemonGuard::acquire(path).unwrap_err();
        assert!(matches!(err, RelayError::Environment { .. }));
    }

    #[test]
    fn acquire_clears_a_stale_pidfile() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("daemon.pid");
        // A pid unlikely to be alive in any test environment.
        fs::write(&path, "999999").unwrap();
        let guard = DaemonGuard::acquire(path.clone());
        assert!(guard.is_ok());
    }

    #[test]
    fn shutdown_signal_starts_unset() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_set());
        signal.set();
        assert!(signal.is_set());
    }

    #[test]
    fn wait_for_shutdown_returns_false_on_timeout() {
        let signal = ShutdownSignal::new();
        let fired = wait_for_shutdown_or_timeout(&signal, Duration::from_millis(20));
        assert!(!fired);
    }

    #[test]
    fn wait_for_shutdown_returns_true_when_signaled() {
        let signal = ShutdownSignal::new();
        let signal_clone = signal.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            signal_clone.set();
        });
        let fired = wait_for_shutdown_or_timeout(&signal, Duration::from_secs(2));
        assert!(fired);
    }
}
