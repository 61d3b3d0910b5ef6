//! In-process test double for `Channel`, backed by a bounded `mpsc` queue
//! (spec §5 "message passing; no callbacks crossing the store boundary").
//! Used by `lab run` fixtures and integration tests that need a
//! deterministic, non-filesystem channel.

use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, Mutex};

use crate::channel::{Channel, DeliverToken, InboundReply, ReplyCallback};
use crate::errors::ChannelError;
use crate::prompt::PromptEvent;

/// A delivered prompt, as observed by a test harness driving the other end
/// of the loopback.
#[derive(Debug, Clone)]
pub struct Delivered {
    pub prompt: PromptEvent,
    pub allowlist: Vec<String>,
}

/// In-process `Channel` implementation: `deliver` pushes onto an outbound
/// queue a test harness drains; injecting a reply calls the registered
/// callback directly.
pub struct LoopbackChannel {
    outbound_tx: SyncSender<Delivered>,
    outbound_rx: Mutex<Receiver<Delivered>>,
    callback: Mutex<Option<ReplyCallback>>,
    notices: Mutex<Vec<(String, String)>>,
}

impl LoopbackChannel {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = sync_channel(64);
        Arc::new(Self {
            outbound_tx: tx,
            outbound_rx: Mutex::new(rx),
            callback: Mutex::new(None),
            notices: Mutex::new(Vec::new()),
        })
    }

    /// Drain the next delivered prompt, blocking up to `timeout`.
    pub fn recv_delivered(&self, timeout: std::time::Duration) -> Option<Delivered> {
        self.outbound_rx.lock().unwrap().recv_timeout(timeout).ok()
    }

    /// Simulate an inbound reply arriving from a human, as if a message had
    /// round-tripped through a real transport.
    pub fn inject_reply(&self, reply: InboundReply) {
        if let Some(cb) = self.callback.lock().unwrap().as_ref() {
            cb(reply);
        }
    }

    /// Notices recorded via `notify`, for test assertions.
    pub fn notices(&self) -> Vec<(String, String)> {
        self.notices.lock().unwrap().clone()
    }
}

impl Channel for LoopbackChannel {
    fn deliver(&self, prompt: &PromptEvent, allowlist: &[String]) -> Result<DeliverToken, ChannelError> {
        self.outbound_tx
            .try_send(Delivered {
                prompt: prompt.clone(),
                allowlist: allowlist.to_vec(),
            })
            .map_err(|e| ChannelError::Transient(e.to_string()))?;
        Ok(DeliverToken(prompt.prompt_id.to_string()))
    }

    fn on_reply(&self, callback: ReplyCallback) {
        *self.callback.lock().unwrap() = Some(callback);
    }

    fn notify(&self, identity: &str, message: &str) -> Result<(), ChannelError> {
        self.notices
            .lock()
            .unwrap()
            .push((identity.to_string(), message.to_string()));
        Ok(())
    }
}
