use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{QueryId, SessionId};

/// Which side of a chat a connection or message belongs to.
///
/// The wire names (`user`, `admin`) are what browser clients already send;
/// `visitor` and `operator` are accepted as aliases.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    #[serde(rename = "user", alias = "visitor")]
    Visitor,
    #[serde(rename = "admin", alias = "operator")]
    Operator,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Visitor => "user",
            Self::Operator => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" | "visitor" => Ok(Self::Visitor),
            "admin" | "operator" => Ok(Self::Operator),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// Lifecycle of a chat session. Transitions only move forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Waiting,
    Active,
    Ended,
}

impl SessionStatus {
    fn rank(self) -> u8 {
        match self {
            Self::Waiting => 0,
            Self::Active => 1,
            Self::Ended => 2,
        }
    }

    /// Whether moving from `self` to `next` is a forward step.
    pub fn can_advance_to(self, next: SessionStatus) -> bool {
        next.rank() > self.rank()
    }

    pub fn is_terminal(self) -> bool {
        self == Self::Ended
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Waiting => write!(f, "waiting"),
            Self::Active => write!(f, "active"),
            Self::Ended => write!(f, "ended"),
        }
    }
}

impl FromStr for SessionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "active" => Ok(Self::Active),
            "ended" => Ok(Self::Ended),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

/// One message inside a session. Immutable once appended.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub sender: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(sender: Role, content: impl Into<String>) -> Self {
        Self {
            sender,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// A visitor-to-operator conversation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSession {
    pub id: SessionId,
    pub user_name: String,
    pub user_email: String,
    pub messages: Vec<ChatMessage>,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl ChatSession {
    /// A fresh `waiting` session, optionally seeded with the visitor's first message.
    pub fn open(user_name: &str, user_email: &str, first_message: Option<&str>) -> Self {
        let messages = first_message
            .filter(|m| !m.is_empty())
            .map(|m| vec![ChatMessage::new(Role::Visitor, m)])
            .unwrap_or_default();

        Self {
            id: SessionId::new(),
            user_name: user_name.to_string(),
            user_email: user_email.to_string(),
            messages,
            status: SessionStatus::Waiting,
            created_at: Utc::now(),
            ended_at: None,
        }
    }
}

/// A contact-form submission.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactQuery {
    pub id: QueryId,
    pub name: String,
    pub email: String,
    pub query: String,
    pub created_at: DateTime<Utc>,
}
