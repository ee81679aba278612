use chrono::{DateTime, Utc};
use relay_core::{ChatMessage, ChatSession, SessionId, SessionStatus};

use crate::error::StoreError;

/// Persistence interface the chat core depends on.
///
/// Calls are synchronous; async callers run them on the blocking pool.
/// Implementations must keep a session's messages in append order.
pub trait SessionStore: Send + Sync {
    fn insert_session(&self, session: &ChatSession) -> Result<(), StoreError>;

    /// Append at the tail of the session's message sequence.
    /// `NotFound` if the session does not exist.
    fn append_message(&self, session_id: &SessionId, message: &ChatMessage)
        -> Result<(), StoreError>;

    /// Overwrite status and, when given, the end timestamp.
    /// `NotFound` if the session does not exist.
    fn set_session_status(
        &self,
        session_id: &SessionId,
        status: SessionStatus,
        ended_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;

    /// Current status without loading messages.
    fn session_status(&self, session_id: &SessionId) -> Result<Option<SessionStatus>, StoreError>;

    fn find_session(&self, session_id: &SessionId) -> Result<Option<ChatSession>, StoreError>;

    fn find_all_sessions(&self) -> Result<Vec<ChatSession>, StoreError>;
}
