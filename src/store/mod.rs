//! The prompt store: durable prompt table, session table, and the atomic
//! decision guard that is the sole arbiter of idempotent reply commitment
//! (spec §4.1).
//!
//! Backed by SQLite in WAL mode via `rusqlite`, with a single writer
//! enforced by an in-process `Mutex`. Spec §9 Open Question 1 resolves
//! multi-writer concurrency as out of scope; this store only needs to be
//! correct under concurrent *readers* plus one writer per process.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::errors::{CommitResult, StoreError};
use crate::prompt::{Confidence, PromptEvent, PromptType, ReplySource, Signal};
use crate::state_machine::{is_legal, PromptState};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS prompts (
    prompt_id    TEXT PRIMARY KEY,
    session_id   TEXT NOT NULL,
    type         TEXT NOT NULL,
    excerpt      TEXT NOT NULL,
    confidence   TEXT NOT NULL,
    signal       TEXT NOT NULL,
    created_at   INTEGER NOT NULL,
    ttl_seconds  INTEGER NOT NULL,
    state        TEXT NOT NULL,
    nonce        TEXT NOT NULL UNIQUE,
    decided_at   INTEGER,
    decision     TEXT,
    reply_source TEXT
);
CREATE INDEX IF NOT EXISTS prompts_session_idx ON prompts(session_id);
CREATE INDEX IF NOT EXISTS prompts_state_idx ON prompts(state);

CREATE TABLE IF NOT EXISTS sessions (
    session_id  TEXT PRIMARY KEY,
    tool        TEXT NOT NULL,
    label       TEXT,
    started_at  INTEGER NOT NULL,
    ended_at    INTEGER,
    state       TEXT NOT NULL
);
";

/// Durable prompt + session store (spec §4.1).
pub struct Store {
    conn: Mutex<Connection>,
}

fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

fn state_str(s: PromptState) -> &'static str {
    match s {
        PromptState::Created => "CREATED",
        PromptState::Routed => "ROUTED",
        PromptState::AwaitingReply => "AWAITING_REPLY",
        PromptState::ReplyReceived => "REPLY_RECEIVED",
        PromptState::Injected => "INJECTED",
        PromptState::Resolved => "RESOLVED",
        PromptState::Expired => "EXPIRED",
        PromptState::Canceled => "CANCELED",
        PromptState::Failed => "FAILED",
    }
}

fn parse_state(s: &str) -> PromptState {
    match s {
        "CREATED" => PromptState::Created,
        "ROUTED" => PromptState::Routed,
        "AWAITING_REPLY" => PromptState::AwaitingReply,
        "REPLY_RECEIVED" => PromptState::ReplyReceived,
        "INJECTED" => PromptState::Injected,
        "RESOLVED" => PromptState::Resolved,
        "EXPIRED" => PromptState::Expired,
        "CANCELED" => PromptState::Canceled,
        _ => PromptState::Failed,
    }
}

fn prompt_type_str(t: PromptType) -> &'static str {
    match t {
        PromptType::YesNo => "yes_no",
        PromptType::ConfirmEnter => "confirm_enter",
        PromptType::MultipleChoice => "multiple_choice",
        PromptType::FreeText => "free_text",
    }
}

fn parse_prompt_type(s: &str) -> PromptType {
    match s {
        "confirm_enter" => PromptType::ConfirmEnter,
        "multiple_choice" => PromptType::MultipleChoice,
        "free_text" => PromptType::FreeText,
        _ => PromptType::YesNo,
    }
}

fn confidence_str(c: Confidence) -> &'static str {
    match c {
        Confidence::Low => "low",
        Confidence::Medium => "medium",
        Confidence::High => "high",
    }
}

fn parse_confidence(s: &str) -> Confidence {
    match s {
        "medium" => Confidence::Medium,
        "high" => Confidence::High,
        _ => Confidence::Low,
    }
}

fn signal_str(s: Signal) -> &'static str {
    match s {
        Signal::Pattern => "pattern",
        Signal::BlockedRead => "blocked_read",
        Signal::Silence => "silence",
    }
}

fn parse_signal(s: &str) -> Signal {
    match s {
        "blocked_read" => Signal::BlockedRead,
        "silence" => Signal::Silence,
        _ => Signal::Pattern,
    }
}

fn reply_source_str(s: ReplySource) -> &'static str {
    match s {
        ReplySource::Human => "human",
        ReplySource::Autopilot => "autopilot",
        ReplySource::Synthetic => "synthetic",
    }
}

fn row_to_prompt(row: &rusqlite::Row) -> rusqlite::Result<PromptEvent> {
    let prompt_id: String = row.get("prompt_id")?;
    let nonce: String = row.get("nonce")?;
    Ok(PromptEvent {
        prompt_id: Uuid::parse_str(&prompt_id).unwrap_or_default(),
        session_id: row.get("session_id")?,
        prompt_type: parse_prompt_type(&row.get::<_, String>("type")?),
        excerpt: row.get("excerpt")?,
        confidence: parse_confidence(&row.get::<_, String>("confidence")?),
        signal: parse_signal(&row.get::<_, String>("signal")?),
        created_at: from_millis(row.get("created_at")?),
        ttl_seconds: row.get::<_, i64>("ttl_seconds")? as u64,
        state: parse_state(&row.get::<_, String>("state")?),
        nonce: Uuid::parse_str(&nonce).unwrap_or_default(),
    })
}

impl Store {
    /// Open (creating if absent) the prompt store at `path`, in WAL mode
    /// with a bounded busy-wait matching the spec's 5s write deadline.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)
            .map_err(|e| StoreError::StorageFatal(format!("open {}: {e}", path.display())))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| StoreError::StorageFatal(e.to_string()))?;
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(|e| StoreError::StorageFatal(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| StoreError::StorageFatal(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store, for tests and the `lab run` harness.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn =
            Connection::open_in_memory().map_err(|e| StoreError::StorageFatal(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| StoreError::StorageFatal(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert a freshly detected prompt in state `CREATED` (spec §4.1).
    /// Fails with `DuplicateNonce` if the prompt's nonce already exists.
    pub fn insert_prompt(&self, p: &PromptEvent) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let result = conn.execute(
            "INSERT INTO prompts
                (prompt_id, session_id, type, excerpt, confidence, signal, created_at, ttl_seconds, state, nonce)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                p.prompt_id.to_string(),
                p.session_id,
                prompt_type_str(p.prompt_type),
                p.excerpt,
                confidence_str(p.confidence),
                signal_str(p.signal),
                to_millis(p.created_at),
                p.ttl_seconds as i64,
                state_str(p.state),
                p.nonce.to_string(),
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::DuplicateNonce(p.nonce.to_string()))
            }
            Err(e) => Err(StoreError::StorageFatal(e.to_string())),
        }
    }

    /// Unconditional state transition, used outside the decision-guard path
    /// (e.g. CREATED->ROUTED, INJECTED->RESOLVED). Checked against
    /// `state_machine::is_legal` before issuing the UPDATE.
    pub fn transition(&self, prompt_id: Uuid, to: PromptState) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let current: String = conn
            .query_row(
                "SELECT state FROM prompts WHERE prompt_id = ?1",
                params![prompt_id.to_string()],
                |r| r.get(0),
            )
            .optional()
            .map_err(|e| StoreError::StorageFatal(e.to_string()))?
            .ok_or_else(|| StoreError::NotFound(prompt_id.to_string()))?;
        let from = parse_state(&current);
        if !is_legal(from, to) {
            return Err(StoreError::IllegalTransition {
                prompt_id: prompt_id.to_string(),
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        conn.execute(
            "UPDATE prompts SET state = ?1 WHERE prompt_id = ?2",
            params![state_str(to), prompt_id.to_string()],
        )
        .map_err(|e| StoreError::StorageFatal(e.to_string()))?;
        Ok(())
    }

    /// The atomic decision guard (spec §4.1). A single conditional UPDATE is
    /// the sole arbiter of idempotent reply commitment: exactly one caller
    /// among any concurrent or repeated invocations for a given `prompt_id`
    /// gets `Accepted`.
    pub fn decide_prompt(
        &self,
        prompt_id: Uuid,
        session_id: &str,
        reply_value: &str,
        reply_source: ReplySource,
        now: DateTime<Utc>,
    ) -> Result<CommitResult, StoreError> {
        let conn = self.conn.lock().unwrap();
        let now_ms = to_millis(now);
        let rows = conn
            .execute(
                "UPDATE prompts
                   SET state = 'REPLY_RECEIVED', decision = ?1, decided_at = ?2, reply_source = ?3
                 WHERE prompt_id = ?4
                   AND session_id = ?5
                   AND state IN ('ROUTED', 'AWAITING_REPLY')
                   AND (created_at + ttl_seconds * 1000) > ?6",
                params![
                    reply_value,
                    now_ms,
                    reply_source_str(reply_source),
                    prompt_id.to_string(),
                    session_id,
                    now_ms,
                ],
            )
            .map_err(|e| StoreError::StorageFatal(e.to_string()))?;

        if rows == 1 {
            return Ok(CommitResult::Accepted);
        }

        // No rows affected: inspect the current row to classify why.
        let row: Option<(String, String, i64, i64)> = conn
            .query_row(
                "SELECT state, session_id, created_at, ttl_seconds FROM prompts WHERE prompt_id = ?1",
                params![prompt_id.to_string()],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )
            .optional()
            .map_err(|e| StoreError::StorageFatal(e.to_string()))?;

        let Some((state, row_session_id, created_at, ttl_seconds)) = row else {
            return Ok(CommitResult::Unknown);
        };

        if row_session_id != session_id {
            return Ok(CommitResult::WrongSession);
        }
        if created_at + ttl_seconds * 1000 <= now_ms {
            return Ok(CommitResult::Expired);
        }
        if matches!(
            state.as_str(),
            "REPLY_RECEIVED" | "INJECTED" | "RESOLVED" | "FAILED"
        ) {
            return Ok(CommitResult::AlreadyDecided);
        }
        Ok(CommitResult::Unknown)
    }

    /// All non-terminal prompts, for restart recovery (spec §4.9 Router).
    pub fn load_pending(&self, now: DateTime<Utc>) -> Result<Vec<PromptEvent>, StoreError> {
        let _ = now;
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT * FROM prompts
                 WHERE state NOT IN ('RESOLVED', 'EXPIRED', 'CANCELED', 'FAILED')",
            )
            .map_err(|e| StoreError::StorageFatal(e.to_string()))?;
        let rows = stmt
            .query_map([], row_to_prompt)
            .map_err(|e| StoreError::StorageFatal(e.to_string()))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| StoreError::StorageFatal(e.to_string()))
    }

    /// Transition every non-terminal prompt whose TTL has elapsed to
    /// `EXPIRED`. Returns the number of prompts swept (spec §4.1, §5).
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let conn = self.conn.lock().unwrap();
        let now_ms = to_millis(now);
        let rows = conn
            .execute(
                "UPDATE prompts SET state = 'EXPIRED'
                 WHERE state NOT IN ('RESOLVED', 'EXPIRED', 'CANCELED', 'FAILED')
                   AND (created_at + ttl_seconds * 1000) <= ?1",
                params![now_ms],
            )
            .map_err(|e| StoreError::StorageFatal(e.to_string()))?;
        Ok(rows)
    }

    /// Fetch a single prompt by id.
    pub fn get(&self, prompt_id: Uuid) -> Result<Option<PromptEvent>, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM prompts WHERE prompt_id = ?1",
            params![prompt_id.to_string()],
            row_to_prompt,
        )
        .optional()
        .map_err(|e| StoreError::StorageFatal(e.to_string()))
    }

    /// Record a new session (spec §4.1 session table, §6 `sessions`).
    pub fn insert_session(
        &self,
        session_id: &str,
        tool: &str,
        label: Option<&str>,
        started_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO sessions (session_id, tool, label, started_at, state)
             VALUES (?1, ?2, ?3, ?4, 'active')",
            params![session_id, tool, label, to_millis(started_at)],
        )
        .map_err(|e| StoreError::StorageFatal(e.to_string()))?;
        Ok(())
    }

    /// Mark a session ended.
    pub fn end_session(&self, session_id: &str, ended_at: DateTime<Utc>) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE sessions SET state = 'ended', ended_at = ?1 WHERE session_id = ?2",
            params![to_millis(ended_at), session_id],
        )
        .map_err(|e| StoreError::StorageFatal(e.to_string()))?;
        Ok(())
    }

    /// List every known session, most recently started first (`sessions`
    /// CLI command, spec §6).
    pub fn list_sessions(&self) -> Result<Vec<SessionRecord>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT session_id, tool, label, started_at, ended_at, state FROM sessions ORDER BY started_at DESC")
            .map_err(|e| StoreError::StorageFatal(e.to_string()))?;
        let rows = stmt
            .query_map([], |row| {
                let started_at: i64 = row.get(3)?;
                let ended_at: Option<i64> = row.get(4)?;
                Ok(SessionRecord {
                    session_id: row.get(0)?,
                    tool: row.get(1)?,
                    label: row.get(2)?,
                    started_at: from_millis(started_at),
                    ended_at: ended_at.map(from_millis),
                    state: row.get(5)?,
                })
            })
            .map_err(|e| StoreError::StorageFatal(e.to_string()))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| StoreError::StorageFatal(e.to_string()))
    }
}

/// One row of the `sessions` table (spec §4.1, §6).
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    pub session_id: String,
    pub tool: String,
    pub label: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub state: String,
}
