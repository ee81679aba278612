//! Chat wire protocol.
//!
//! Every frame, in both directions, is one JSON object with a `type`
//! discriminator and a flat set of optional fields. Inbound frames decode into
//! [`ClientEvent`]; outbound frames are produced from [`ServerEvent`].

use serde::{Deserialize, Serialize};

use crate::chat::Role;
use crate::ids::SessionId;

pub const TYPE_INIT: &str = "init";
pub const TYPE_MESSAGE: &str = "message";
pub const TYPE_JOIN: &str = "join";
pub const TYPE_END: &str = "end";
pub const TYPE_SESSION_CREATED: &str = "session_created";
pub const TYPE_ADMIN_JOINED: &str = "admin_joined";
pub const TYPE_SESSION_ENDED: &str = "session_ended";

/// Raw wire frame, symmetric between client and server.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("frame '{kind}' is missing required field '{field}'")]
    MissingField { kind: &'static str, field: &'static str },

    #[error("unknown sender role: {0}")]
    InvalidRole(String),
}

/// Events a client may send.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientEvent {
    /// Visitor opens a new chat.
    Init {
        user_name: String,
        user_email: String,
        content: Option<String>,
    },
    /// Chat line. `session_id` may be omitted once the connection is bound.
    Message {
        session_id: Option<SessionId>,
        content: String,
        sender: Option<Role>,
    },
    /// Operator takes over a session.
    Join { session_id: SessionId },
    /// Either party closes the session.
    End { session_id: SessionId },
}

impl ClientEvent {
    /// Decode one inbound text frame.
    ///
    /// Returns `Ok(None)` for frame types a client has no business sending,
    /// including unknown ones; those are dropped without error.
    pub fn decode(text: &str) -> Result<Option<Self>, DecodeError> {
        let FrameKind { kind } = serde_json::from_str(text)?;
        if !matches!(kind.as_str(), TYPE_INIT | TYPE_MESSAGE | TYPE_JOIN | TYPE_END) {
            return Ok(None);
        }
        let frame: Frame = serde_json::from_str(text)?;
        Self::from_frame(frame)
    }

    pub fn from_frame(frame: Frame) -> Result<Option<Self>, DecodeError> {
        let session_id = non_empty(frame.session_id).map(SessionId::from_raw);

        let event = match frame.kind.as_str() {
            TYPE_INIT => Self::Init {
                user_name: frame.user_name.unwrap_or_default(),
                user_email: frame.user_email.unwrap_or_default(),
                content: frame.content.and_then(non_empty),
            },
            TYPE_MESSAGE => {
                let content = frame.content.ok_or(DecodeError::MissingField {
                    kind: TYPE_MESSAGE,
                    field: "content",
                })?;
                let sender = match frame.sender.and_then(non_empty) {
                    Some(raw) => Some(raw.parse().map_err(|_| DecodeError::InvalidRole(raw))?),
                    None => None,
                };
                Self::Message {
                    session_id,
                    content,
                    sender,
                }
            }
            TYPE_JOIN => Self::Join {
                session_id: session_id.ok_or(DecodeError::MissingField {
                    kind: TYPE_JOIN,
                    field: "sessionId",
                })?,
            },
            TYPE_END => Self::End {
                session_id: session_id.ok_or(DecodeError::MissingField {
                    kind: TYPE_END,
                    field: "sessionId",
                })?,
            },
            _ => return Ok(None),
        };
        Ok(Some(event))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Init { .. } => TYPE_INIT,
            Self::Message { .. } => TYPE_MESSAGE,
            Self::Join { .. } => TYPE_JOIN,
            Self::End { .. } => TYPE_END,
        }
    }
}

/// Events the server fans out to connections.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServerEvent {
    SessionCreated { session_id: SessionId },
    Message {
        session_id: SessionId,
        content: String,
        sender: Role,
    },
    AdminJoined { session_id: SessionId },
    SessionEnded { session_id: SessionId },
}

impl ServerEvent {
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::SessionCreated { session_id }
            | Self::Message { session_id, .. }
            | Self::AdminJoined { session_id }
            | Self::SessionEnded { session_id } => session_id,
        }
    }

    /// Role of the party that produced this event. `None` for system events.
    pub fn sender_role(&self) -> Option<Role> {
        match self {
            Self::Message { sender, .. } => Some(*sender),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::SessionCreated { .. } => TYPE_SESSION_CREATED,
            Self::Message { .. } => TYPE_MESSAGE,
            Self::AdminJoined { .. } => TYPE_ADMIN_JOINED,
            Self::SessionEnded { .. } => TYPE_SESSION_ENDED,
        }
    }

    pub fn to_frame(&self) -> Frame {
        let mut frame = Frame {
            kind: self.kind().to_string(),
            session_id: self.session_id().to_string(),
            ..Frame::default()
        };
        match self {
            Self::SessionCreated { .. } => frame.role = Some(Role::Visitor.to_string()),
            Self::AdminJoined { .. } => frame.role = Some(Role::Operator.to_string()),
            Self::Message {
                content, sender, ..
            } => {
                frame.content = Some(content.clone());
                frame.sender = Some(sender.to_string());
            }
            Self::SessionEnded { .. } => {}
        }
        frame
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.to_frame())
    }
}

/// Just the discriminator, so frames of foreign types are skipped before
/// their fields are checked.
#[derive(Deserialize)]
struct FrameKind {
    #[serde(rename = "type")]
    kind: String,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
