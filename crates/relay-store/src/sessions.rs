use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use tracing::instrument;

use relay_core::{ChatMessage, ChatSession, SessionId, SessionStatus};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;
use crate::store::SessionStore;

const SESSION_COLUMNS: &str = "id, user_name, user_email, status, created_at, ended_at";

pub struct SessionRepo {
    db: Database,
}

impl SessionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

impl SessionStore for SessionRepo {
    /// Insert a session together with any seed messages.
    #[instrument(skip(self, session), fields(session_id = %session.id))]
    fn insert_session(&self, session: &ChatSession) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "INSERT INTO sessions (id, user_name, user_email, status, created_at, ended_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    session.id.as_str(),
                    session.user_name,
                    session.user_email,
                    session.status.to_string(),
                    row_helpers::format_timestamp(&session.created_at),
                    session.ended_at.as_ref().map(row_helpers::format_timestamp),
                ],
            )?;
            for message in &session.messages {
                insert_message(&tx, &session.id, message)?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    #[instrument(skip(self, message), fields(session_id = %session_id, sender = %message.sender))]
    fn append_message(
        &self,
        session_id: &SessionId,
        message: &ChatMessage,
    ) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            if !session_exists(&tx, session_id)? {
                return Err(StoreError::NotFound(format!("session {session_id}")));
            }
            insert_message(&tx, session_id, message)?;
            tx.commit()?;
            Ok(())
        })
    }

    #[instrument(skip(self), fields(session_id = %session_id, status = %status))]
    fn set_session_status(
        &self,
        session_id: &SessionId,
        status: SessionStatus,
        ended_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let changed = match ended_at {
                Some(ended_at) => conn.execute(
                    "UPDATE sessions SET status = ?1, ended_at = ?2 WHERE id = ?3",
                    rusqlite::params![status.to_string(), row_helpers::format_timestamp(&ended_at), session_id.as_str()],
                )?,
                None => conn.execute(
                    "UPDATE sessions SET status = ?1 WHERE id = ?2",
                    rusqlite::params![status.to_string(), session_id.as_str()],
                )?,
            };
            if changed == 0 {
                return Err(StoreError::NotFound(format!("session {session_id}")));
            }
            Ok(())
        })
    }

    #[instrument(skip(self), fields(session_id = %session_id))]
    fn session_status(&self, session_id: &SessionId) -> Result<Option<SessionStatus>, StoreError> {
        self.db.with_conn(|conn| {
            let raw: Option<String> = conn
                .query_row(
                    "SELECT status FROM sessions WHERE id = ?1",
                    [session_id.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            raw.map(|s| row_helpers::parse_enum(&s, "sessions", "status"))
                .transpose()
        })
    }

    #[instrument(skip(self), fields(session_id = %session_id))]
    fn find_session(&self, session_id: &SessionId) -> Result<Option<ChatSession>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"))?;
            let mut rows = stmt.query([session_id.as_str()])?;
            let Some(row) = rows.next()? else {
                return Ok(None);
            };
            let mut session = row_to_session(row)?;
            session.messages = load_messages(conn, session_id)?;
            Ok(Some(session))
        })
    }

    /// All sessions, newest first, each with its messages in append order.
    #[instrument(skip(self))]
    fn find_all_sessions(&self) -> Result<Vec<ChatSession>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM sessions ORDER BY created_at DESC, id DESC"
            ))?;
            let mut rows = stmt.query([])?;
            let mut sessions = Vec::new();
            while let Some(row) = rows.next()? {
                sessions.push(row_to_session(row)?);
            }

            let mut stmt = conn.prepare(
                "SELECT session_id, sender, content, timestamp FROM messages ORDER BY session_id, seq",
            )?;
            let mut rows = stmt.query([])?;
            let mut by_session: HashMap<String, Vec<ChatMessage>> = HashMap::new();
            while let Some(row) = rows.next()? {
                let session_id: String = row_helpers::get(row, 0, "messages", "session_id")?;
                let message = row_to_message(row, 1)?;
                by_session.entry(session_id).or_default().push(message);
            }

            for session in &mut sessions {
                if let Some(messages) = by_session.remove(session.id.as_str()) {
                    session.messages = messages;
                }
            }
            Ok(sessions)
        })
    }
}

fn session_exists(conn: &Connection, session_id: &SessionId) -> Result<bool, StoreError> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM sessions WHERE id = ?1",
            [session_id.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// The sequence number is computed inside the insert itself, so the caller's
/// transaction is the only writer that can observe the current tail.
fn insert_message(
    conn: &Connection,
    session_id: &SessionId,
    message: &ChatMessage,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO messages (session_id, seq, sender, content, timestamp)
         SELECT ?1, COALESCE(MAX(seq), 0) + 1, ?2, ?3, ?4 FROM messages WHERE session_id = ?1",
        rusqlite::params![
            session_id.as_str(),
            message.sender.as_str(),
            message.content,
            row_helpers::format_timestamp(&message.timestamp),
        ],
    )?;
    Ok(())
}

fn load_messages(conn: &Connection, session_id: &SessionId) -> Result<Vec<ChatMessage>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT sender, content, timestamp FROM messages WHERE session_id = ?1 ORDER BY seq",
    )?;
    let mut rows = stmt.query([session_id.as_str()])?;
    let mut messages = Vec::new();
    while let Some(row) = rows.next()? {
        messages.push(row_to_message(row, 0)?);
    }
    Ok(messages)
}

fn row_to_message(row: &rusqlite::Row<'_>, offset: usize) -> Result<ChatMessage, StoreError> {
    let sender: String = row_helpers::get(row, offset, "messages", "sender")?;
    let timestamp: String = row_helpers::get(row, offset + 2, "messages", "timestamp")?;
    Ok(ChatMessage {
        sender: row_helpers::parse_enum(&sender, "messages", "sender")?,
        content: row_helpers::get(row, offset + 1, "messages", "content")?,
        timestamp: row_helpers::parse_timestamp(&timestamp, "messages", "timestamp")?,
    })
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<ChatSession, StoreError> {
    let status: String = row_helpers::get(row, 3, "sessions", "status")?;
    let created_at: String = row_helpers::get(row, 4, "sessions", "created_at")?;
    let ended_at = row_helpers::get_opt::<String>(row, 5, "sessions", "ended_at")?
        .map(|raw| row_helpers::parse_timestamp(&raw, "sessions", "ended_at"))
        .transpose()?;

    Ok(ChatSession {
        id: SessionId::from_raw(row_helpers::get::<String>(row, 0, "sessions", "id")?),
        user_name: row_helpers::get(row, 1, "sessions", "user_name")?,
        user_email: row_helpers::get(row, 2, "sessions", "user_email")?,
        messages: Vec::new(),
        status: row_helpers::parse_enum(&status, "sessions", "status")?,
        created_at: row_helpers::parse_timestamp(&created_at, "sessions", "created_at")?,
        ended_at,
    })
}
