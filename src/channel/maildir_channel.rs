//! Filesystem-mailbox `Channel` implementation built on the `maildir`
//! crate. One outbound Maildir per allowlisted identity holds delivered
//! prompts as JSON-bodied messages; a single inbound Maildir is polled for
//! replies. This is a reference transport for operators without a hosted
//! messaging integration, not a production notification channel — spec §1
//! explicitly scopes concrete hosted transports out.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use maildir::Maildir;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::channel::{Channel, DeliverToken, InboundReply, ReplyCallback};
use crate::errors::ChannelError;
use crate::prompt::{PromptEvent, PromptType};

#[derive(Debug, Serialize, Deserialize)]
struct OutgoingBody {
    prompt_id: Uuid,
    nonce: Uuid,
    excerpt: String,
    prompt_type: PromptType,
}

#[derive(Debug, Serialize, Deserialize)]
struct IncomingBody {
    prompt_id: Uuid,
    nonce: Uuid,
    value: String,
}

/// Maildir-backed reference `Channel`. Poll interval defaults to 500ms.
pub struct MaildirChannel {
    root: PathBuf,
    inbox: Maildir,
    callback: Arc<Mutex<Option<ReplyCallback>>>,
    poll_handle: Mutex<Option<std::thread::JoinHandle<()>>>,
    stop: Arc<std::sync::atomic::AtomicBool>,
}

impl MaildirChannel {
    /// `root` holds one subdirectory per allowlisted identity (outbound)
    /// plus an `inbox/` subdirectory (inbound replies).
    pub fn open(root: &Path) -> std::io::Result<Arc<Self>> {
        std::fs::create_dir_all(root)?;
        let inbox_path = root.join("inbox");
        let inbox = Maildir::from(inbox_path);
        inbox.create_dirs()?;

        let chan = Arc::new(Self {
            root: root.to_path_buf(),
            inbox,
            callback: Arc::new(Mutex::new(None)),
            poll_handle: Mutex::new(None),
            stop: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        });
        chan.clone().spawn_poller();
        Ok(chan)
    }

    fn identity_maildir(&self, identity: &str) -> std::io::Result<Maildir> {
        let safe = identity.replace(['/', '\\'], "_");
        let md = Maildir::from(self.root.join(safe));
        md.create_dirs()?;
        Ok(md)
    }

    fn spawn_poller(self: Arc<Self>) {
        let inbox = Maildir::from(self.root.join("inbox"));
        let callback = self.callback.clone();
        let stop = self.stop.clone();
        let handle = std::thread::spawn(move || {
            while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                for entry in inbox.list_new() {
                    let Ok(mut entry) = entry else { continue };
                    let id = entry.id().to_string();
                    if let Some(reply) = parse_incoming(&mut entry) {
                        if let Some(cb) = callback.lock().unwrap().as_ref() {
                            cb(reply);
                        }
                    }
                    let _ = inbox.move_new_to_cur(&id);
                }
                std::thread::sleep(Duration::from_millis(500));
            }
        });
        *self.poll_handle.lock().unwrap() = Some(handle);
    }
}

impl Drop for MaildirChannel {
    fn drop(&mut self) {
        self.stop.store(true, std::sync::atomic::Ordering::Relaxed);
    }
}

fn parse_incoming(entry: &mut maildir::MailEntry) -> Option<InboundReply> {
    let identity = entry.headers().ok()?.get_first_value("From")?;
    let body_bytes = entry.parsed().ok()?.get_body_raw().ok()?;
    let body: IncomingBody = serde_json::from_slice(&body_bytes).ok()?;
    Some(InboundReply {
        prompt_id: body.prompt_id,
        nonce: body.nonce,
        identity,
        value: body.value,
    })
}

impl Channel for MaildirChannel {
    fn deliver(&self, prompt: &PromptEvent, allowlist: &[String]) -> Result<DeliverToken, ChannelError> {
        let body = OutgoingBody {
            prompt_id: prompt.prompt_id,
            nonce: prompt.nonce,
            excerpt: prompt.excerpt.clone(),
            prompt_type: prompt.prompt_type,
        };
        let payload = serde_json::to_vec(&body)
            .map_err(|e| ChannelError::Permanent(format!("encode prompt: {e}")))?;

        for identity in allowlist {
            let md = self
                .identity_maildir(identity)
                .map_err(|e| ChannelError::Transient(format!("open mailbox for {identity}: {e}")))?;
            md.store_new(&payload)
                .map_err(|e| ChannelError::Transient(format!("store message for {identity}: {e}")))?;
        }

        Ok(DeliverToken(prompt.nonce.to_string()))
    }

    fn on_reply(&self, callback: ReplyCallback) {
        *self.callback.lock().unwrap() = Some(callback);
    }

    fn notify(&self, identity: &str, message: &str) -> Result<(), ChannelError> {
        let md = self
            .identity_maildir(identity)
            .map_err(|e| ChannelError::Transient(e.to_string()))?;
        md.store_new(message.as_bytes())
            .map_err(|e| ChannelError::Transient(e.to_string()))?;
        Ok(())
    }
}
