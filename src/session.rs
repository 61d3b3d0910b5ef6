//! Session registry: a thin wrapper over the store's `sessions` table
//! handing out fresh session ids and bookkeeping start/end (spec §4.1, §6
//! `sessions` command).

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::errors::RelayError;
use crate::store::{SessionRecord, Store};

/// A started session, ready to be handed to the supervisor.
pub struct Session {
    pub session_id: String,
    pub tool: String,
    pub label: Option<String>,
}

/// Starts and ends sessions against the store; owns no state beyond the
/// `Store` handle.
pub struct SessionManager {
    store: Arc<Store>,
}

impl SessionManager {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Start a new session, generating a fresh session id.
    pub fn start(&self, tool: &str, label: Option<&str>) -> Result<Session, RelayError> {
        let session_id = Uuid::new_v4().to_string();
        self.store
            .insert_session(&session_id, tool, label, Utc::now())?;
        Ok(Session {
            session_id,
            tool: tool.to_string(),
            label: label.map(str::to_string),
        })
    }

    /// Mark a session ended.
    pub fn end(&self, session_id: &str) -> Result<(), RelayError> {
        self.store.end_session(session_id, Utc::now())?;
        Ok(())
    }

    /// List all known sessions, most recent first.
    pub fn list(&self) -> Result<Vec<SessionRecord>, RelayError> {
        Ok(self.store.list_sessions()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_assigns_a_fresh_id_and_persists_it() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let manager = SessionManager::new(store);
        let session = manager.start("claude", Some("frontend")).unwrap();
        let listed = manager.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].session_id, session.session_id);
        assert_eq!(listed[0].state, "active");
    }

    #[test]
    fn end_marks_session_ended() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let manager = SessionManager::new(store);
        let session = manager.start("codex", None).unwrap();
        manager.end(&session.session_id).unwrap();
        let listed = manager.list().unwrap();
        assert_eq!(listed[0].state, "ended");
    }
}
