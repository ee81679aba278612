//! Applies decoded client events to the session state and routes the results.
//!
//! An event is only relayed after its effect was persisted. Rejections and
//! store failures come back as [`ChatError`] for the pump to log.

use std::sync::Arc;

use relay_core::{ClientEvent, Role, ServerEvent, SessionId};
use tracing::{debug, info};

use crate::connection::Connection;
use crate::error::ChatError;
use crate::hub::SendOutcome;
use crate::router::SessionRouter;
use crate::sessions::{ChatService, Transition};

pub struct ChatHandler {
    service: Arc<ChatService>,
    router: SessionRouter,
}

impl ChatHandler {
    pub fn new(service: Arc<ChatService>, router: SessionRouter) -> Self {
        Self { service, router }
    }

    pub async fn dispatch(&self, conn: &Connection, event: ClientEvent) -> Result<(), ChatError> {
        match event {
            ClientEvent::Init {
                user_name,
                user_email,
                content,
            } => self.on_init(conn, &user_name, &user_email, content.as_deref()).await,
            ClientEvent::Message {
                session_id,
                content,
                sender,
            } => self.on_message(conn, session_id, content, sender).await,
            ClientEvent::Join { session_id } => self.on_join(conn, session_id).await,
            ClientEvent::End { session_id } => self.on_end(conn, session_id).await,
        }
    }

    async fn on_init(
        &self,
        conn: &Connection,
        user_name: &str,
        user_email: &str,
        content: Option<&str>,
    ) -> Result<(), ChatError> {
        if let Some(bound) = conn.session_id() {
            return Err(ChatError::AlreadyBound(bound.clone()));
        }
        let session = self.service.create(user_name, user_email, content).await?;
        conn.bind(session.id.clone(), Role::Visitor)?;

        let created = ServerEvent::SessionCreated {
            session_id: session.id,
        };
        if self.router.deliver_to(conn.id(), &created) != SendOutcome::Delivered {
            debug!(connection_id = %conn.id(), "visitor gone before session_created");
        }
        Ok(())
    }

    async fn on_message(
        &self,
        conn: &Connection,
        requested: Option<SessionId>,
        content: String,
        claimed_sender: Option<Role>,
    ) -> Result<(), ChatError> {
        let binding = conn.binding().ok_or(ChatError::Unbound)?;
        if let Some(requested) = requested {
            if requested != binding.session_id {
                return Err(ChatError::SessionMismatch {
                    bound: binding.session_id.clone(),
                    requested,
                });
            }
        }
        if content.trim().is_empty() {
            return Err(ChatError::EmptyContent);
        }
        if claimed_sender.is_some_and(|role| role != binding.role) {
            debug!(
                connection_id = %conn.id(),
                bound_role = %binding.role,
                "ignoring sender field that disagrees with connection role"
            );
        }

        self.service
            .append_message(&binding.session_id, binding.role, &content)
            .await?;

        let relayed = ServerEvent::Message {
            session_id: binding.session_id.clone(),
            content,
            sender: binding.role,
        };
        self.router.route_to_session(&relayed, Some(conn.id()));
        Ok(())
    }

    async fn on_join(&self, conn: &Connection, session_id: SessionId) -> Result<(), ChatError> {
        if let Some(binding) = conn.binding() {
            if binding.session_id != session_id || binding.role != Role::Operator {
                return Err(ChatError::AlreadyBound(binding.session_id.clone()));
            }
        }

        let transition = self.service.join(&session_id).await?;
        conn.bind(session_id.clone(), Role::Operator)?;
        info!(
            session_id = %session_id,
            connection_id = %conn.id(),
            status_changed = transition == Transition::Applied,
            "operator joined"
        );

        // No origin: the joining operator gets the confirmation too.
        let joined = ServerEvent::AdminJoined { session_id };
        self.router.route_to_session(&joined, None);
        Ok(())
    }

    async fn on_end(&self, conn: &Connection, session_id: SessionId) -> Result<(), ChatError> {
        let bound = conn.session_id().ok_or(ChatError::Unbound)?;
        if *bound != session_id {
            return Err(ChatError::SessionMismatch {
                bound: bound.clone(),
                requested: session_id,
            });
        }

        match self.service.end(&session_id).await? {
            Transition::Applied => {
                let ended = ServerEvent::SessionEnded { session_id };
                self.router.route_to_session(&ended, None);
            }
            Transition::Unchanged => {
                debug!(session_id = %session_id, "session already ended");
            }
        }
        Ok(())
    }
}
