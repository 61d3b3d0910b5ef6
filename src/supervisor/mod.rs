//! PTY supervision: the four concurrent tasks that own one agent session
//! (spec §4.5, §5 "Shared resources").
//!
//! - an output-reader thread that forwards raw bytes to the user's
//!   terminal, feeds the detector, and watches for adapter-specific
//!   session-lifecycle signals;
//! - a stdin-forwarder thread that relays the user's own keystrokes;
//! - a stall-watchdog thread that ticks the detector's silence signal and
//!   commits any Assist-mode suggestion whose override window has expired;
//! - a reply-injector thread that writes committed replies to the child.
//!
//! The PTY write handle is held by exactly one `Arc<Mutex<Box<dyn
//! PtyWriter>>>`, shared by the stdin-forwarder and the injector, so the
//! two can never interleave a half-written escape sequence into the
//! child's stdin. Grounded on the teacher's `run_session`, which spawned
//! the same four roles but left auto-injection as an open TODO because
//! `portable-pty`'s writer can only be taken once; sharing it behind a
//! mutex here is what finishes that.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::adapter::{Adapter, SessionSignal};
use crate::detector::{DetectorConfig, DetectorEvent, PromptDetector};
use crate::errors::RelayError;
use crate::prompt::{PromptEvent, Reply};
use crate::pty::{PortablePty, Pty, PtyWriter, SpawnConfig};
use crate::router::Router;
use crate::state_machine::PromptState;
use crate::store::Store;

/// How a supervised session ended.
#[derive(Debug)]
pub enum SessionOutcome {
    /// The adapter recognized a tool-specific completion signal.
    Completed,
    /// The adapter recognized a tool-specific error signal.
    Error { detail: String },
    /// The child process exited without a recognized signal.
    Exited { code: Option<i32> },
}

/// Per-session supervision settings.
pub struct SupervisorConfig {
    pub session_id: String,
    pub ttl_seconds: u64,
    pub detector: DetectorConfig,
    /// How often the stall watchdog ticks; defaults to a quarter of the
    /// detector's silence window so the silence signal never fires more
    /// than one tick late.
    pub watchdog_interval: Duration,
}

impl SupervisorConfig {
    pub fn new(session_id: String, ttl_seconds: u64, detector: DetectorConfig) -> Self {
        let watchdog_interval = Duration::from_millis((detector.silence_ms / 4).max(50));
        Self {
            session_id,
            ttl_seconds,
            detector,
            watchdog_interval,
        }
    }
}

/// Spawn the agent in a PTY and run its four supervising tasks until the
/// child exits. Blocks the calling thread until then.
pub fn run_session(
    spawn: SpawnConfig,
    adapter: Arc<dyn Adapter>,
    config: SupervisorConfig,
    store: Arc<Store>,
    router: Arc<Router>,
    reply_rx: Receiver<Reply>,
) -> Result<SessionOutcome, RelayError> {
    let mut backing = PortablePty::spawn(spawn)
        .map_err(|err| RelayError::Environment { cause: err.to_string() })?;
    let reader = backing.take_reader();
    let writer: Arc<Mutex<Box<dyn PtyWriter>>> = Arc::new(Mutex::new(backing.take_writer()));
    let pty: Arc<Mutex<dyn Pty>> = Arc::new(Mutex::new(backing));

    let done = Arc::new(AtomicBool::new(false));
    let detector = Arc::new(Mutex::new(PromptDetector::new(
        adapter.prompt_patterns(),
        config.detector,
    )));

    let output_handle = spawn_output_reader(
        reader,
        pty.clone(),
        detector.clone(),
        adapter.clone(),
        store.clone(),
        router.clone(),
        config.session_id.clone(),
        config.ttl_seconds,
        done.clone(),
    );

    let watchdog_handle = spawn_stall_watchdog(
        detector.clone(),
        store.clone(),
        router.clone(),
        config.session_id.clone(),
        config.ttl_seconds,
        config.watchdog_interval,
        done.clone(),
    );

    let stdin_handle = spawn_stdin_forwarder(writer.clone(), done.clone());

    let injector_handle = spawn_reply_injector(reply_rx, writer, detector, store, adapter);

    let exit_code = pty
        .lock()
        .unwrap()
        .wait()
        .map_err(|err| RelayError::Environment { cause: err.to_string() })?;
    done.store(true, Ordering::SeqCst);

    let outcome = output_handle
        .join()
        .unwrap_or(SessionOutcome::Exited { code: None });

    // The watchdog and stdin threads exit once `done` is observed (or the
    // PTY master drops, for stdin); the injector thread exits once its
    // sender is dropped by the caller. We don't block shutdown on any of
    // them beyond a short grace period — a wedged stdin read on a closed
    // terminal is not worth hanging the whole process over.
    let _ = watchdog_handle.join();
    drop(stdin_handle);
    drop(injector_handle);

    match outcome {
        SessionOutcome::Completed | SessionOutcome::Error { .. } => Ok(outcome),
        SessionOutcome::Exited { .. } => Ok(SessionOutcome::Exited { code: Some(exit_code) }),
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_output_reader(
    mut reader: Box<dyn crate::pty::PtyReader>,
    pty: Arc<Mutex<dyn Pty>>,
    detector: Arc<Mutex<PromptDetector>>,
    adapter: Arc<dyn Adapter>,
    store: Arc<Store>,
    router: Arc<Router>,
    session_id: String,
    ttl_seconds: u64,
    done: Arc<AtomicBool>,
) -> thread::JoinHandle<SessionOutcome> {
    thread::spawn(move || {
        let mut stdout = std::io::stdout();
        let mut buf = [0u8; 4096];
        let mut line_buffer = String::new();
        let mut outcome = SessionOutcome::Exited { code: None };

        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) => {
                    tracing::debug!(?err, "pty read error, assuming child exited");
                    break;
                }
            };
            let chunk = &buf[..n];
            let _ = stdout.write_all(chunk);
            let _ = stdout.flush();

            let Ok(text) = std::str::from_utf8(chunk) else {
                continue;
            };

            line_buffer.push_str(text);
            while let Some(pos) = line_buffer.find('\n') {
                let line = line_buffer[..pos].to_string();
                line_buffer.drain(..=pos);
                if let Some(signal) = adapter.session_signal(&line) {
                    match signal {
                        SessionSignal::Completion => outcome = SessionOutcome::Completed,
                        SessionSignal::Error { detail } => outcome = SessionOutcome::Error { detail },
                    }
                }
            }

            let blocked = pty.lock().unwrap().is_child_blocked_on_read();
            let event = detector.lock().unwrap().on_output(text, blocked);
            handle_detector_event(event, &store, &router, &session_id, ttl_seconds);
        }

        done.store(true, Ordering::SeqCst);
        outcome
    })
}

fn spawn_stall_watchdog(
    detector: Arc<Mutex<PromptDetector>>,
    store: Arc<Store>,
    router: Arc<Router>,
    session_id: String,
    ttl_seconds: u64,
    interval: Duration,
    done: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        while !done.load(Ordering::SeqCst) {
            thread::sleep(interval);
            let event = detector.lock().unwrap().tick();
            handle_detector_event(event, &store, &router, &session_id, ttl_seconds);
            router.check_suggestion_timeouts();
        }
    })
}

fn handle_detector_event(
    event: DetectorEvent,
    store: &Arc<Store>,
    router: &Arc<Router>,
    session_id: &str,
    ttl_seconds: u64,
) {
    let DetectorEvent::PromptDetected(hit) = event else {
        return;
    };
    let prompt = PromptEvent::new(session_id, hit.prompt_type, &hit.excerpt, hit.confidence, hit.signal, ttl_seconds);
    match store.insert_prompt(&prompt) {
        Ok(()) => {
            if let Err(err) = router.route(&prompt) {
                tracing::error!(?err, prompt_id = %prompt.prompt_id, "failed to route detected prompt");
            }
        }
        Err(err) => {
            tracing::error!(?err, prompt_id = %prompt.prompt_id, "failed to persist detected prompt");
        }
    }
}

fn spawn_stdin_forwarder(
    writer: Arc<Mutex<Box<dyn PtyWriter>>>,
    done: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut lock = stdin.lock();
        let mut buf = [0u8; 1024];
        loop {
            if done.load(Ordering::SeqCst) {
                break;
            }
            match lock.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let mut w = writer.lock().unwrap();
                    if w.write_all(&buf[..n]).and_then(|_| w.flush()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    })
}

fn spawn_reply_injector(
    reply_rx: Receiver<Reply>,
    writer: Arc<Mutex<Box<dyn PtyWriter>>>,
    detector: Arc<Mutex<PromptDetector>>,
    store: Arc<Store>,
    adapter: Arc<dyn Adapter>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        for reply in reply_rx {
            let prompt = match store.get(reply.prompt_id) {
                Ok(Some(p)) => p,
                Ok(None) => {
                    tracing::warn!(prompt_id = %reply.prompt_id, "reply injector: prompt vanished from store");
                    continue;
                }
                Err(err) => {
                    tracing::error!(?err, "reply injector: store lookup failed");
                    continue;
                }
            };

            // The reply value was already authorized by the decision guard
            // (a human typed it, or a policy rule explicitly chose
            // auto_reply); the encoder's unsafe-default gate concerns
            // authorization prior to commit, not re-litigated here.
            let encoded = match adapter.encode(prompt.prompt_type, &reply.value, true) {
                Ok(bytes) => bytes,
                Err(err) => {
                    tracing::error!(?err, prompt_id = %reply.prompt_id, "failed to encode reply");
                    let _ = store.transition(reply.prompt_id, PromptState::Failed);
                    continue;
                }
            };

            let write_result = {
                let mut w = writer.lock().unwrap();
                w.write_all(&encoded).and_then(|_| w.flush())
            };

            match write_result {
                Ok(()) => {
                    detector.lock().unwrap().answer_injected();
                    let _ = store.transition(reply.prompt_id, PromptState::Injected);
                    let _ = store.transition(reply.prompt_id, PromptState::Resolved);
                }
                Err(err) => {
                    tracing::error!(?err, prompt_id = %reply.prompt_id, "failed to write reply to pty");
                    let _ = store.transition(reply.prompt_id, PromptState::Failed);
                }
            }
        }
    })
}
