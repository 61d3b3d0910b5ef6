//! The `Pty` contract: spawns a child in a pseudo-terminal and exposes just
//! enough of the OS primitive for the supervisor's four tasks (spec §4.5,
//! §1 "per-operating-system PTY primitives").
//!
//! `PortablePty` is the real backend, built on `portable_pty` (the
//! teacher's direct dependency in `supervisor/mod.rs`). The blocked-read
//! inference is unix-only; other platforms always report "not blocked" and
//! rely on the pattern and silence signals alone.

use std::io::{Read, Write};
use std::sync::{Arc, Mutex};

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};

/// What to spawn, and in what pseudo-terminal geometry (spec §4.5).
pub struct SpawnConfig {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<std::path::PathBuf>,
    pub env: Vec<(String, String)>,
    pub rows: u16,
    pub cols: u16,
}

impl Default for SpawnConfig {
    fn default() -> Self {
        Self {
            program: String::new(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            rows: 24,
            cols: 80,
        }
    }
}

/// A reader handle for PTY output, reads raising `std::io::Error`.
pub trait PtyReader: Read + Send {}
impl<T: Read + Send> PtyReader for T {}

/// A writer handle for PTY input, writes raising `std::io::Error`.
pub trait PtyWriter: Write + Send {}
impl<T: Write + Send> PtyWriter for T {}

/// The supervisor's view of a spawned pseudo-terminal (spec §4.5).
pub trait Pty: Send {
    /// Take the output-reading half. Callable exactly once.
    fn take_reader(&mut self) -> Box<dyn PtyReader>;

    /// Take the input-writing half. Callable exactly once.
    fn take_writer(&mut self) -> Box<dyn PtyWriter>;

    /// Best-effort inference of whether the child is currently blocked on a
    /// read from its controlling terminal (spec §4.3 blocked-read signal).
    /// Platforms without a usable inference always return `false`.
    fn is_child_blocked_on_read(&self) -> bool;

    /// Whether the child process has exited, and with what, without
    /// blocking.
    fn try_wait(&mut self) -> std::io::Result<Option<i32>>;

    /// Wait for the child to exit, blocking the caller.
    fn wait(&mut self) -> std::io::Result<i32>;

    /// Resize the pseudo-terminal (e.g. on `SIGWINCH`).
    fn resize(&self, rows: u16, cols: u16) -> std::io::Result<()>;
}

/// Real PTY backend built on `portable_pty` (spec §4.5).
pub struct PortablePty {
    master: Box<dyn MasterPty + Send>,
    child: Box<dyn Child + Send + Sync>,
    reader_taken: bool,
    writer_taken: bool,
    #[cfg(unix)]
    child_pid: Option<i32>,
}

impl PortablePty {
    pub fn spawn(config: SpawnConfig) -> std::io::Result<Self> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: config.rows,
                cols: config.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| std::io::Error::other(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&config.program);
        cmd.args(&config.args);
        if let Some(cwd) = &config.cwd {
            cmd.cwd(cwd);
        }
        for (k, v) in &config.env {
            cmd.env(k, v);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        #[cfg(unix)]
        let child_pid = child.process_id().map(|p| p as i32);
        drop(pair.slave);

        Ok(Self {
            master: pair.master,
            child,
            reader_taken: false,
            writer_taken: false,
            #[cfg(unix)]
            child_pid,
        })
    }
}

impl Pty for PortablePty {
    fn take_reader(&mut self) -> Box<dyn PtyReader> {
        assert!(!self.reader_taken, "pty reader already taken");
        self.reader_taken = true;
        let reader = self.master.try_clone_reader().expect("clone pty reader");
        Box::new(reader)
    }

    fn take_writer(&mut self) -> Box<dyn PtyWriter> {
        assert!(!self.writer_taken, "pty writer already taken");
        self.writer_taken = true;
        let writer = self.master.take_writer().expect("take pty writer");
        Box::new(writer)
    }

    fn is_child_blocked_on_read(&self) -> bool {
        #[cfg(unix)]
        {
            blocked_on_read_unix(self.child_pid)
        }
        #[cfg(not(unix))]
        {
            false
        }
    }

    fn try_wait(&mut self) -> std::io::Result<Option<i32>> {
        match self.child.try_wait()? {
            Some(status) => Ok(Some(status.exit_code() as i32)),
            None => Ok(None),
        }
    }

    fn wait(&mut self) -> std::io::Result<i32> {
        let status = self.child.wait()?;
        Ok(status.exit_code() as i32)
    }

    fn resize(&self, rows: u16, cols: u16) -> std::io::Result<()> {
        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| std::io::Error::other(e.to_string()))
    }
}

/// Infer whether `pid`'s main thread is blocked in a `read(2)` syscall, via
/// `/proc/<pid>/wchan` / `/proc/<pid>/stat` on Linux. Best-effort: any I/O
/// failure or unrecognized state reports "not blocked" rather than erroring,
/// since this signal is explicitly medium-confidence (spec §4.3).
#[cfg(unix)]
fn blocked_on_read_unix(pid: Option<i32>) -> bool {
    let Some(pid) = pid else { return false };
    let stat_path = format!("/proc/{pid}/stat");
    let Ok(stat) = std::fs::read_to_string(&stat_path) else {
        return false;
    };
    // Field 3 (after the `(comm)` parenthetical, which may itself contain
    // spaces) is the process state: 'S' (sleeping) covers a blocking read.
    let Some(after_comm) = stat.rsplit_once(')') else {
        return false;
    };
    after_comm
        .1
        .split_whitespace()
        .next()
        .map(|state| state == "S")
        .unwrap_or(false)
}

/// A shared flag a stall-watchdog and output-reader can both poll without
/// owning the `Pty` trait object, used where the supervisor hands out
/// `Arc<Mutex<dyn Pty>>` handles across its four tasks.
pub type SharedPty = Arc<Mutex<dyn Pty>>;
