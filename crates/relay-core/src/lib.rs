pub mod chat;
pub mod ids;
pub mod protocol;

pub use chat::{ChatMessage, ChatSession, ContactQuery, Role, SessionStatus};
pub use ids::{ConnectionId, QueryId, SessionId};
pub use protocol::{ClientEvent, DecodeError, Frame, ServerEvent};
