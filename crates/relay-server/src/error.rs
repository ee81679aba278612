use relay_core::SessionId;
use relay_store::StoreError;

/// Why a chat event was rejected or not applied.
///
/// None of these close the connection; the pump logs them and keeps reading.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("session {0} not found")]
    SessionNotFound(SessionId),

    #[error("session {0} has ended")]
    SessionEnded(SessionId),

    #[error("connection has no session")]
    Unbound,

    #[error("connection is bound to {bound}, not {requested}")]
    SessionMismatch {
        bound: SessionId,
        requested: SessionId,
    },

    #[error("connection is already bound to {0}")]
    AlreadyBound(SessionId),

    #[error("message content is empty")]
    EmptyContent,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("persistence task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl ChatError {
    /// Short label for structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SessionNotFound(_) => "session_not_found",
            Self::SessionEnded(_) => "session_ended",
            Self::Unbound => "unbound",
            Self::SessionMismatch { .. } => "session_mismatch",
            Self::AlreadyBound(_) => "already_bound",
            Self::EmptyContent => "empty_content",
            Self::Store(_) => "store",
            Self::Task(_) => "task",
        }
    }

    /// Rejections caused by the client, as opposed to server-side failures.
    pub fn is_rejection(&self) -> bool {
        !matches!(self, Self::Store(_) | Self::Task(_))
    }
}
