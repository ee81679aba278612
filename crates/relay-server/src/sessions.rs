//! Chat session lifecycle: `waiting -> active -> ended`.
//!
//! Every mutation of one session runs under that session's lock, and the
//! store call itself runs on the blocking pool. Status is re-read under the
//! lock, so guards and writes never interleave for the same session.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use relay_core::{ChatMessage, ChatSession, Role, SessionId, SessionStatus};
use relay_store::{SessionStore, StoreError};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{info, instrument};

use crate::error::ChatError;
use crate::notify::{ChatNotice, NotifyQueue};

/// Whether a transition changed persisted state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    Applied,
    Unchanged,
}

/// Per-session async mutexes, created on first use and dropped when the
/// last holder or waiter lets go.
#[derive(Default)]
pub struct SessionLocks {
    locks: DashMap<SessionId, Arc<Mutex<()>>>,
}

impl SessionLocks {
    pub async fn acquire(&self, session_id: &SessionId) -> SessionGuard<'_> {
        // Cloned under the shard lock, so `release` sees every waiter.
        let lock = self
            .locks
            .entry(session_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = lock.lock_owned().await;
        SessionGuard {
            locks: self,
            session_id: session_id.clone(),
            guard: Some(guard),
        }
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    fn release(&self, session_id: &SessionId) {
        let _ = self
            .locks
            .remove_if(session_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Holds one session's lock; removes the map entry on drop if nobody else
/// is waiting for it.
pub struct SessionGuard<'a> {
    locks: &'a SessionLocks,
    session_id: SessionId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks.release(&self.session_id);
    }
}

pub struct ChatService {
    store: Arc<dyn SessionStore>,
    locks: SessionLocks,
    notices: NotifyQueue,
}

impl ChatService {
    pub fn new(store: Arc<dyn SessionStore>, notices: NotifyQueue) -> Self {
        Self {
            store,
            locks: SessionLocks::default(),
            notices,
        }
    }

    /// Persist a new `waiting` session and queue the team notice.
    #[instrument(skip_all, fields(visitor = %user_name))]
    pub async fn create(
        &self,
        user_name: &str,
        user_email: &str,
        first_message: Option<&str>,
    ) -> Result<ChatSession, ChatError> {
        let session = ChatSession::open(user_name, user_email, first_message);
        let row = session.clone();
        self.blocking(move |store| store.insert_session(&row)).await?;

        info!(session_id = %session.id, "chat session created");
        self.notices.enqueue(ChatNotice {
            visitor_name: session.user_name.clone(),
            visitor_email: session.user_email.clone(),
            first_message: first_message.unwrap_or_default().to_string(),
            session_id: session.id.clone(),
        });
        Ok(session)
    }

    /// Append at the tail of the session's messages. Rejected once ended.
    #[instrument(skip_all, fields(session_id = %session_id, sender = %sender))]
    pub async fn append_message(
        &self,
        session_id: &SessionId,
        sender: Role,
        content: &str,
    ) -> Result<ChatMessage, ChatError> {
        let _guard = self.locks.acquire(session_id).await;
        if self.status(session_id).await?.is_terminal() {
            return Err(ChatError::SessionEnded(session_id.clone()));
        }

        let message = ChatMessage::new(sender, content);
        let id = session_id.clone();
        let row = message.clone();
        self.blocking(move |store| store.append_message(&id, &row))
            .await
            .map_err(|e| not_found_as(e, session_id))?;
        Ok(message)
    }

    /// Operator takes the session: `waiting -> active`. Joining an active
    /// session is a no-op; joining an ended one is rejected.
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn join(&self, session_id: &SessionId) -> Result<Transition, ChatError> {
        let transition = self.advance(session_id, SessionStatus::Active).await?;
        if transition == Transition::Applied {
            info!("operator joined session");
        }
        Ok(transition)
    }

    /// Terminate the session and stamp `ended_at`. Ending twice keeps the
    /// first timestamp.
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn end(&self, session_id: &SessionId) -> Result<Transition, ChatError> {
        let transition = self.advance(session_id, SessionStatus::Ended).await?;
        if transition == Transition::Applied {
            info!("chat session ended");
        }
        Ok(transition)
    }

    pub async fn find(&self, session_id: &SessionId) -> Result<Option<ChatSession>, ChatError> {
        let id = session_id.clone();
        self.blocking(move |store| store.find_session(&id)).await
    }

    /// All sessions, newest first.
    pub async fn find_all(&self) -> Result<Vec<ChatSession>, ChatError> {
        self.blocking(|store| store.find_all_sessions()).await
    }

    async fn status(&self, session_id: &SessionId) -> Result<SessionStatus, ChatError> {
        let id = session_id.clone();
        self.blocking(move |store| store.session_status(&id))
            .await?
            .ok_or_else(|| ChatError::SessionNotFound(session_id.clone()))
    }

    /// Move forward to `next` if the current status allows it. Asking for
    /// the current status is a no-op; anything else out of a terminal
    /// status is rejected.
    async fn advance(&self, session_id: &SessionId, next: SessionStatus) -> Result<Transition, ChatError> {
        let _guard = self.locks.acquire(session_id).await;
        let current = self.status(session_id).await?;
        if current.can_advance_to(next) {
            self.write_status(session_id, next).await?;
            Ok(Transition::Applied)
        } else if current.is_terminal() && current != next {
            Err(ChatError::SessionEnded(session_id.clone()))
        } else {
            Ok(Transition::Unchanged)
        }
    }

    async fn write_status(&self, session_id: &SessionId, status: SessionStatus) -> Result<(), ChatError> {
        let id = session_id.clone();
        let ended_at = status.is_terminal().then(Utc::now);
        self.blocking(move |store| store.set_session_status(&id, status, ended_at))
            .await
            .map_err(|e| not_found_as(e, session_id))
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, ChatError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn SessionStore) -> Result<T, StoreError> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        let result = tokio::task::spawn_blocking(move || f(store.as_ref())).await?;
        Ok(result?)
    }
}

fn not_found_as(err: ChatError, session_id: &SessionId) -> ChatError {
    match err {
        ChatError::Store(StoreError::NotFound(_)) => ChatError::SessionNotFound(session_id.clone()),
        other => other,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::notify::tests::RecordingNotifier;
    use chrono::DateTime;
    use relay_store::{Database, SessionRepo};
    use tokio_util::sync::CancellationToken;

    pub(crate) fn service_with(store: Arc<dyn SessionStore>) -> (ChatService, Arc<RecordingNotifier>) {
        let recorder = Arc::new(RecordingNotifier::default());
        let (queue, _worker) = NotifyQueue::spawn(recorder.clone(), CancellationToken::new());
        (ChatService::new(store, queue), recorder)
    }

    pub(crate) fn service() -> (ChatService, Arc<RecordingNotifier>) {
        let db = Database::in_memory().unwrap();
        service_with(Arc::new(SessionRepo::new(db)))
    }

    /// A store whose writes always fail.
    pub(crate) struct BrokenStore;

    impl SessionStore for BrokenStore {
        fn insert_session(&self, _: &ChatSession) -> Result<(), StoreError> {
            Err(StoreError::Database("disk full".into()))
        }
        fn append_message(&self, _: &SessionId, _: &ChatMessage) -> Result<(), StoreError> {
            Err(StoreError::Database("disk full".into()))
        }
        fn set_session_status(
            &self,
            _: &SessionId,
            _: SessionStatus,
            _: Option<DateTime<Utc>>,
        ) -> Result<(), StoreError> {
            Err(StoreError::Database("disk full".into()))
        }
        fn session_status(&self, _: &SessionId) -> Result<Option<SessionStatus>, StoreError> {
            Ok(Some(SessionStatus::Waiting))
        }
        fn find_session(&self, _: &SessionId) -> Result<Option<ChatSession>, StoreError> {
            Ok(None)
        }
        fn find_all_sessions(&self) -> Result<Vec<ChatSession>, StoreError> {
            Ok(Vec::new())
        }
    }

    async fn wait_for_notices(recorder: &RecordingNotifier, n: usize) {
        for _ in 0..100 {
            if recorder.seen.lock().len() >= n {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("expected {n} notices");
    }

    #[tokio::test]
    async fn create_persists_waiting_session_and_notifies() {
        let (svc, recorder) = service();
        let session = svc.create("Ana", "ana@x.com", Some("Hi")).await.unwrap();

        let stored = svc.find(&session.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Waiting);
        assert_eq!(stored.messages.len(), 1);
        assert_eq!(stored.messages[0].content, "Hi");
        assert_eq!(stored.messages[0].sender, Role::Visitor);

        wait_for_notices(&recorder, 1).await;
        let notice = recorder.seen.lock()[0].clone();
        assert_eq!(notice.session_id, session.id);
        assert_eq!(notice.first_message, "Hi");
    }

    #[tokio::test]
    async fn create_without_first_message() {
        let (svc, _) = service();
        let session = svc.create("Bo", "bo@x.com", None).await.unwrap();
        let stored = svc.find(&session.id).await.unwrap().unwrap();
        assert!(stored.messages.is_empty());
    }

    #[tokio::test]
    async fn failed_create_sends_no_notice() {
        let (svc, recorder) = service_with(Arc::new(BrokenStore));
        let err = svc.create("Ana", "ana@x.com", Some("Hi")).await.unwrap_err();
        assert!(matches!(err, ChatError::Store(_)));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(recorder.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn lifecycle_is_monotonic() {
        let (svc, _) = service();
        let id = svc.create("Ana", "ana@x.com", None).await.unwrap().id;

        assert_eq!(svc.join(&id).await.unwrap(), Transition::Applied);
        assert_eq!(svc.join(&id).await.unwrap(), Transition::Unchanged);
        assert_eq!(svc.find(&id).await.unwrap().unwrap().status, SessionStatus::Active);

        assert_eq!(svc.end(&id).await.unwrap(), Transition::Applied);
        let ended_at = svc.find(&id).await.unwrap().unwrap().ended_at.unwrap();

        assert_eq!(svc.end(&id).await.unwrap(), Transition::Unchanged);
        assert!(matches!(svc.join(&id).await, Err(ChatError::SessionEnded(_))));

        let stored = svc.find(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Ended);
        assert_eq!(stored.ended_at, Some(ended_at));
    }

    #[tokio::test]
    async fn end_from_waiting() {
        let (svc, _) = service();
        let id = svc.create("Ana", "ana@x.com", None).await.unwrap().id;
        assert_eq!(svc.end(&id).await.unwrap(), Transition::Applied);
        assert_eq!(svc.find(&id).await.unwrap().unwrap().status, SessionStatus::Ended);
    }

    #[tokio::test]
    async fn append_after_end_is_rejected() {
        let (svc, _) = service();
        let id = svc.create("Ana", "ana@x.com", None).await.unwrap().id;
        svc.append_message(&id, Role::Visitor, "one").await.unwrap();
        svc.end(&id).await.unwrap();

        let err = svc.append_message(&id, Role::Visitor, "two").await.unwrap_err();
        assert!(matches!(err, ChatError::SessionEnded(_)));
        assert_eq!(svc.find(&id).await.unwrap().unwrap().messages.len(), 1);
    }

    #[tokio::test]
    async fn unknown_session() {
        let (svc, _) = service();
        let ghost = SessionId::from_raw("sess_ghost");
        assert!(matches!(
            svc.append_message(&ghost, Role::Visitor, "x").await,
            Err(ChatError::SessionNotFound(_))
        ));
        assert!(matches!(svc.join(&ghost).await, Err(ChatError::SessionNotFound(_))));
        assert!(matches!(svc.end(&ghost).await, Err(ChatError::SessionNotFound(_))));
        assert!(svc.find(&ghost).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_senders_keep_per_sender_order() {
        let (svc, _) = service();
        let svc = Arc::new(svc);
        let id = svc.create("Ana", "ana@x.com", None).await.unwrap().id;

        let tasks: Vec<_> = [Role::Visitor, Role::Operator]
            .into_iter()
            .map(|role| {
                let svc = Arc::clone(&svc);
                let id = id.clone();
                tokio::spawn(async move {
                    for i in 0..25 {
                        svc.append_message(&id, role, &format!("{role}-{i}")).await.unwrap();
                    }
                })
            })
            .collect();
        for t in tasks {
            t.await.unwrap();
        }

        let messages = svc.find(&id).await.unwrap().unwrap().messages;
        assert_eq!(messages.len(), 50);
        for role in [Role::Visitor, Role::Operator] {
            let seq: Vec<&str> = messages
                .iter()
                .filter(|m| m.sender == role)
                .map(|m| m.content.as_str())
                .collect();
            let expected: Vec<String> = (0..25).map(|i| format!("{role}-{i}")).collect();
            assert_eq!(seq, expected);
        }
    }

    #[tokio::test]
    async fn lock_entries_do_not_outlive_their_calls() {
        let (svc, _) = service();
        for i in 0..100 {
            let ghost = SessionId::from_raw(format!("sess_ghost_{i}"));
            assert!(matches!(svc.join(&ghost).await, Err(ChatError::SessionNotFound(_))));
        }
        assert!(svc.locks.is_empty());

        let id = svc.create("Ana", "ana@x.com", None).await.unwrap().id;
        svc.append_message(&id, Role::Visitor, "hello").await.unwrap();
        assert!(svc.locks.is_empty());
        svc.join(&id).await.unwrap();
        assert!(svc.locks.is_empty());
        svc.end(&id).await.unwrap();
        assert!(svc.locks.is_empty());
    }

    #[tokio::test]
    async fn lock_entry_survives_while_a_waiter_is_queued() {
        let locks = Arc::new(SessionLocks::default());
        let id = SessionId::from_raw("sess_busy");

        let first = locks.acquire(&id).await;
        let waiter = {
            let locks = Arc::clone(&locks);
            let id = id.clone();
            tokio::spawn(async move {
                let _second = locks.acquire(&id).await;
            })
        };
        // Let the waiter queue up behind the held guard.
        while !locks.locks.get(&id).is_some_and(|l| Arc::strong_count(&*l) == 3) {
            tokio::task::yield_now().await;
        }
        drop(first);
        assert_eq!(locks.len(), 1);

        waiter.await.unwrap();
        assert!(locks.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_appends_leave_no_lock_entries() {
        let (svc, _) = service();
        let svc = Arc::new(svc);
        let id = svc.create("Ana", "ana@x.com", None).await.unwrap().id;

        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let svc = Arc::clone(&svc);
                let id = id.clone();
                tokio::spawn(async move {
                    svc.append_message(&id, Role::Visitor, &format!("m{i}")).await.unwrap();
                })
            })
            .collect();
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(svc.find(&id).await.unwrap().unwrap().messages.len(), 8);
        assert!(svc.locks.is_empty());
    }
}
