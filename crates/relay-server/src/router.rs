use std::sync::Arc;

use relay_core::{ConnectionId, Role, ServerEvent, SessionId};
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::hub::{Delivery, Hub, SendOutcome};

/// Fans chat events out to the connections bound to a session.
#[derive(Clone)]
pub struct SessionRouter {
    hub: Arc<Hub>,
}

impl SessionRouter {
    pub fn new(hub: Arc<Hub>) -> Self {
        Self { hub }
    }

    /// Broadcast `event` to its session.
    ///
    /// The originating connection and every connection on the same side as
    /// the event's sender are skipped. System events carry no sender role and
    /// reach the whole session, including the connection that caused them.
    pub fn route_to_session(&self, event: &ServerEvent, origin: Option<&ConnectionId>) -> Delivery {
        let Some(payload) = encode(event) else {
            return Delivery::default();
        };
        let session_id = event.session_id();
        let sender_role = event.sender_role();

        let delivery = self.hub.broadcast(payload, |conn| {
            is_recipient(conn, session_id, origin, sender_role)
        });
        debug!(
            session_id = %session_id,
            event = event.kind(),
            delivered = delivery.delivered,
            "routed to session"
        );
        delivery
    }

    /// Send `event` to a single connection regardless of its binding.
    pub fn deliver_to(&self, id: &ConnectionId, event: &ServerEvent) -> SendOutcome {
        match encode(event) {
            Some(payload) => self.hub.send_to(id, payload),
            None => SendOutcome::NotRegistered,
        }
    }
}

pub fn is_recipient(
    conn: &Connection,
    session_id: &SessionId,
    origin: Option<&ConnectionId>,
    sender_role: Option<Role>,
) -> bool {
    let Some(binding) = conn.binding() else {
        return false;
    };
    if binding.session_id != *session_id {
        return false;
    }
    if origin == Some(conn.id()) {
        return false;
    }
    sender_role != Some(binding.role)
}

fn encode(event: &ServerEvent) -> Option<Arc<String>> {
    match event.encode() {
        Ok(json) => Some(Arc::new(json)),
        Err(e) => {
            warn!(event = event.kind(), error = %e, "failed to encode event");
            None
        }
    }
}
