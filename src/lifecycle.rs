//! Chat session lifecycle: pending → claimed → closed.

use chrono::Utc;
use std::str::FromStr;
use tracing::{debug, info, warn};

use crate::bus::{Broadcaster, Dispatch};
use crate::chat::{ChatMessage, ChatNotification, ChatSession, Initiator};
use crate::entity::{Caller, Party, RecordId};
use crate::error::{ChatError, ChatResult};
use crate::store::{is_unique_violation, Store};

/// What to do when the initiator already has an active session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicatePolicy {
    /// Hand back the existing session (safe for a guest reloading the page).
    #[default]
    ReturnExisting,
    Reject,
}

impl FromStr for DuplicatePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "return-existing" => Ok(DuplicatePolicy::ReturnExisting),
            "reject" => Ok(DuplicatePolicy::Reject),
            other => Err(format!("unknown duplicate session policy {:?}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    Created(ChatSession),
    Existing(ChatSession),
}

impl CreateOutcome {
    pub fn into_session(self) -> ChatSession {
        match self {
            CreateOutcome::Created(session) | CreateOutcome::Existing(session) => session,
        }
    }
}

#[derive(Clone)]
pub struct SessionManager {
    store: Store,
    broadcaster: Broadcaster,
    policy: DuplicatePolicy,
}

impl SessionManager {
    pub fn new(store: Store, broadcaster: Broadcaster, policy: DuplicatePolicy) -> Self {
        Self {
            store,
            broadcaster,
            policy,
        }
    }

    /// Open a session, honouring the one-active-session-per-party rule.
    ///
    /// The lookup is only advisory when creators race; the store's unique
    /// index catches the loser, which then resolves against the winner.
    pub async fn create_session(&self, initiator: Initiator) -> ChatResult<CreateOutcome> {
        let customer_id = initiator.customer_id();
        let guest_phone = initiator.guest_phone().map(str::to_owned);

        if let Some(existing) = self
            .store
            .find_active_session(customer_id, guest_phone.as_deref())
            .await?
        {
            return self.resolve_duplicate(existing);
        }

        let session = ChatSession::new(initiator);
        match self.store.insert_session(&session).await {
            Ok(()) => {
                info!(chat_id = %session.id, "Chat session created");
                self.broadcaster
                    .publish(Dispatch::Session(session.clone()))
                    .await;
                Ok(CreateOutcome::Created(session))
            }
            Err(e) if is_unique_violation(&e) => {
                warn!("Lost a session creation race, resolving against the winner");
                let existing = self
                    .store
                    .find_active_session(customer_id, guest_phone.as_deref())
                    .await?
                    .ok_or_else(duplicate_conflict)?;
                self.resolve_duplicate(existing)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn resolve_duplicate(&self, existing: ChatSession) -> ChatResult<CreateOutcome> {
        match self.policy {
            DuplicatePolicy::ReturnExisting => {
                info!(chat_id = %existing.id, "Returning existing active chat session");
                Ok(CreateOutcome::Existing(existing))
            }
            DuplicatePolicy::Reject => Err(duplicate_conflict()),
        }
    }

    pub async fn list_pending_sessions(&self) -> ChatResult<Vec<ChatSession>> {
        let sessions = self.store.list_pending_sessions().await?;
        debug_assert!(sessions.iter().all(ChatSession::is_pending));
        Ok(sessions)
    }

    /// Assign the claiming administrator. Reclaiming by the same admin is a
    /// no-op. A claim over another admin's is not fenced: last write wins.
    pub async fn claim_session(&self, id: RecordId, admin: &Caller) -> ChatResult<ChatSession> {
        admin.require_admin()?;
        let mut session = self.require_session(id).await?;

        if !session.is_active {
            return Err(ChatError::Conflict("Chat session is closed".to_string()));
        }
        if session.admin_id == Some(admin.id) {
            return Ok(session);
        }

        let now = Utc::now();
        if !self.store.set_session_admin(id, admin.id, now).await? {
            return Err(ChatError::NotFound("Chat session"));
        }
        if let Some(previous) = session.admin_id {
            warn!(chat_id = %id, previous_admin = %previous, admin = %admin.id, "Chat session reclaimed");
        }
        session.admin_id = Some(admin.id);
        session.updated_at = now;

        info!(chat_id = %id, admin = %admin.id, "Chat session claimed");
        self.broadcaster
            .publish(Dispatch::Session(session.clone()))
            .await;
        Ok(session)
    }

    /// Deactivate a session, freeing its customer or guest to open a new one.
    pub async fn close_session(&self, id: RecordId, admin: &Caller) -> ChatResult<ChatSession> {
        admin.require_admin()?;
        let mut session = self.require_session(id).await?;
        if !session.is_active {
            return Ok(session);
        }

        let now = Utc::now();
        if !self.store.deactivate_session(id, now).await? {
            return Err(ChatError::NotFound("Chat session"));
        }
        session.is_active = false;
        session.updated_at = now;

        info!(chat_id = %id, admin = %admin.id, "Chat session closed");
        self.broadcaster
            .publish(Dispatch::Session(session.clone()))
            .await;
        Ok(session)
    }

    pub async fn list_sessions_for_customer(
        &self,
        customer_id: RecordId,
    ) -> ChatResult<Vec<ChatSession>> {
        Ok(self.store.list_sessions_for_customer(customer_id).await?)
    }

    /// Session together with its full message history.
    pub async fn get_session(&self, id: RecordId) -> ChatResult<ChatSession> {
        let mut session = self.require_session(id).await?;
        session.messages = self.store.get_chat_history(id).await?;
        Ok(session)
    }

    pub async fn get_messages(&self, id: RecordId) -> ChatResult<Vec<ChatMessage>> {
        self.require_session(id).await?;
        Ok(self.store.get_chat_history(id).await?)
    }

    /// Mark the other side's messages as seen by `reader`.
    pub async fn mark_seen(&self, id: RecordId, reader: Option<&Caller>) -> ChatResult<u64> {
        let session = self.require_session(id).await?;
        let party = reader_party(&session, reader)?;
        let marked = self
            .store
            .mark_seen(id, party == Party::Counterparty)
            .await?;
        debug!(chat_id = %id, marked, "Messages marked seen");
        Ok(marked)
    }

    /// Unread count and latest message of a session, from `reader`'s side.
    pub async fn notification(
        &self,
        id: RecordId,
        reader: Option<&Caller>,
    ) -> ChatResult<ChatNotification> {
        let session = self.require_session(id).await?;
        let party = reader_party(&session, reader)?;
        let unread_count = self
            .store
            .count_unseen(id, party == Party::Counterparty)
            .await?;
        let last = self.store.last_message(id).await?;

        Ok(ChatNotification {
            chat_id: id,
            unread_count,
            updated_at: last.as_ref().map(|m| m.timestamp),
            last_message: last.map(|m| m.content),
        })
    }

    pub async fn require_session(&self, id: RecordId) -> ChatResult<ChatSession> {
        self.store
            .get_session(id)
            .await?
            .ok_or(ChatError::NotFound("Chat session"))
    }
}

/// Which side of `session` the caller reads as. Customers only read their
/// own sessions and anonymous callers only guest sessions.
fn reader_party(session: &ChatSession, reader: Option<&Caller>) -> ChatResult<Party> {
    match reader {
        Some(caller) if caller.is_admin() => Ok(Party::Administrator),
        Some(caller) if session.customer_id == Some(caller.id) => Ok(Party::Counterparty),
        None if session.customer_id.is_none() => Ok(Party::Counterparty),
        _ => Err(ChatError::Permission),
    }
}

fn duplicate_conflict() -> ChatError {
    ChatError::Conflict("An active chat already exists for this customer or guest".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::SenderRole;
    use crate::registry::ConnectionRegistry;
    use tokio_util::sync::CancellationToken;

    async fn manager(policy: DuplicatePolicy) -> SessionManager {
        let store = Store::in_memory().await.unwrap();
        let (broadcaster, _handle) =
            Broadcaster::spawn(ConnectionRegistry::new(), 8, CancellationToken::new());
        SessionManager::new(store, broadcaster, policy)
    }

    fn alice() -> Initiator {
        Initiator::Guest {
            name: "Alice".into(),
            phone: "555-0100".into(),
        }
    }

    fn admin() -> Caller {
        Caller::new(RecordId::new(), SenderRole::Admin)
    }

    #[tokio::test]
    async fn guest_retry_returns_the_same_session() {
        let sessions = manager(DuplicatePolicy::ReturnExisting).await;

        let first = sessions.create_session(alice()).await.unwrap();
        assert!(matches!(first, CreateOutcome::Created(_)));
        let second = sessions.create_session(alice()).await.unwrap();
        assert!(matches!(second, CreateOutcome::Existing(_)));

        assert_eq!(first.into_session().id, second.into_session().id);
        assert_eq!(sessions.list_pending_sessions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn reject_policy_refuses_a_second_active_session() {
        let sessions = manager(DuplicatePolicy::Reject).await;
        sessions.create_session(alice()).await.unwrap();

        let err = sessions.create_session(alice()).await.unwrap_err();
        assert!(matches!(err, ChatError::Conflict(_)));
    }

    #[tokio::test]
    async fn sequential_customer_creations_never_duplicate() {
        let sessions = manager(DuplicatePolicy::ReturnExisting).await;
        let customer = RecordId::new();

        let mut ids = Vec::new();
        for _ in 0..5 {
            let outcome = sessions
                .create_session(Initiator::Customer(customer))
                .await
                .unwrap();
            ids.push(outcome.into_session().id);
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);

        let active = sessions
            .list_sessions_for_customer(customer)
            .await
            .unwrap()
            .into_iter()
            .filter(|s| s.is_active)
            .count();
        assert_eq!(active, 1);
    }

    #[tokio::test]
    async fn guest_and_customer_sessions_do_not_collide() {
        let sessions = manager(DuplicatePolicy::Reject).await;
        sessions.create_session(alice()).await.unwrap();
        sessions
            .create_session(Initiator::Customer(RecordId::new()))
            .await
            .unwrap();
        sessions
            .create_session(Initiator::Guest {
                name: "Bob".into(),
                phone: "555-0199".into(),
            })
            .await
            .unwrap();
        assert_eq!(sessions.list_pending_sessions().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn claimed_session_leaves_the_pending_queue() {
        let sessions = manager(DuplicatePolicy::ReturnExisting).await;
        let x = sessions.create_session(alice()).await.unwrap().into_session();
        let a = admin();

        let claimed = sessions.claim_session(x.id, &a).await.unwrap();
        assert_eq!(claimed.admin_id, Some(a.id));
        assert!(sessions
            .list_pending_sessions()
            .await
            .unwrap()
            .iter()
            .all(|s| s.id != x.id));

        let again = sessions.claim_session(x.id, &a).await.unwrap();
        assert_eq!(again.admin_id, Some(a.id));
    }

    #[tokio::test]
    async fn only_admins_claim_or_close() {
        let sessions = manager(DuplicatePolicy::ReturnExisting).await;
        let x = sessions.create_session(alice()).await.unwrap().into_session();
        let customer = Caller::new(RecordId::new(), SenderRole::Customer);

        assert!(matches!(
            sessions.claim_session(x.id, &customer).await,
            Err(ChatError::Permission)
        ));
        assert!(matches!(
            sessions.close_session(x.id, &customer).await,
            Err(ChatError::Permission)
        ));
    }

    #[tokio::test]
    async fn closing_frees_the_guest_and_blocks_claims() {
        let sessions = manager(DuplicatePolicy::Reject).await;
        let a = admin();
        let x = sessions.create_session(alice()).await.unwrap().into_session();

        let closed = sessions.close_session(x.id, &a).await.unwrap();
        assert!(!closed.is_active);
        assert!(sessions.close_session(x.id, &a).await.is_ok());
        assert!(matches!(
            sessions.claim_session(x.id, &a).await,
            Err(ChatError::Conflict(_))
        ));

        let next = sessions.create_session(alice()).await.unwrap().into_session();
        assert_ne!(next.id, x.id);
    }

    #[tokio::test]
    async fn unknown_sessions_are_not_found() {
        let sessions = manager(DuplicatePolicy::ReturnExisting).await;
        assert!(matches!(
            sessions.get_messages(RecordId::new()).await,
            Err(ChatError::NotFound(_))
        ));
        assert!(matches!(
            sessions.claim_session(RecordId::new(), &admin()).await,
            Err(ChatError::NotFound(_))
        ));
    }

    #[test]
    fn policy_names() {
        assert_eq!(
            "return-existing".parse::<DuplicatePolicy>().unwrap(),
            DuplicatePolicy::ReturnExisting
        );
        assert_eq!(
            "reject".parse::<DuplicatePolicy>().unwrap(),
            DuplicatePolicy::Reject
        );
        assert!("merge".parse::<DuplicatePolicy>().is_err());
    }

    async fn manager_with_registry(
        policy: DuplicatePolicy,
    ) -> (SessionManager, ConnectionRegistry) {
        let registry = ConnectionRegistry::new();
        let store = Store::in_memory().await.unwrap();
        let (broadcaster, _handle) =
            Broadcaster::spawn(registry.clone(), 8, CancellationToken::new());
        (SessionManager::new(store, broadcaster, policy), registry)
    }

    async fn race_creates(sessions: &SessionManager, n: usize) -> Vec<ChatResult<CreateOutcome>> {
        let mut handles = Vec::new();
        for _ in 0..n {
            let sessions = sessions.clone();
            handles.push(tokio::spawn(
                async move { sessions.create_session(alice()).await },
            ));
        }

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }
        results
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_creates_resolve_to_one_session() {
        let sessions = manager(DuplicatePolicy::ReturnExisting).await;

        let mut ids: Vec<RecordId> = race_creates(&sessions, 16)
            .await
            .into_iter()
            .map(|result| result.unwrap().into_session().id)
            .collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(sessions.list_pending_sessions().await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_creates_under_reject_have_one_winner() {
        let sessions = manager(DuplicatePolicy::Reject).await;

        let results = race_creates(&sessions, 16).await;
        let created = results
            .iter()
            .filter(|r| matches!(r, Ok(CreateOutcome::Created(_))))
            .count();
        let conflicts = results
            .iter()
            .filter(|r| matches!(r, Err(ChatError::Conflict(_))))
            .count();
        assert_eq!(created, 1);
        assert_eq!(conflicts, 15);
    }

    #[tokio::test]
    async fn admin_dashboard_hears_about_new_and_closed_sessions() {
        use crate::bus::{Event, Outbound};
        use std::time::Duration;
        use tokio::sync::mpsc;

        let (sessions, registry) = manager_with_registry(DuplicatePolicy::ReturnExisting).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry
            .register(SenderRole::Admin, None, None, tx, CancellationToken::new())
            .await;

        let created = sessions.create_session(alice()).await.unwrap().into_session();
        sessions.close_session(created.id, &admin()).await.unwrap();

        let mut seen = Vec::new();
        for _ in 0..2 {
            match tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
                Ok(Some(Outbound::Event(Event::SessionUpdated(s)))) => seen.push(s),
                other => panic!("expected session update, got {:?}", other),
            }
        }
        assert_eq!(seen[0].id, created.id);
        assert!(seen[0].is_active);
        assert!(!seen[1].is_active);
    }

    #[tokio::test]
    async fn unread_counts_follow_the_reader() {
        use crate::chat::MessageDraft;

        let (sessions, _registry) = manager_with_registry(DuplicatePolicy::ReturnExisting).await;
        let x = sessions.create_session(alice()).await.unwrap().into_session();
        let message = ChatMessage::stamp(x.id, SenderRole::Guest, MessageDraft::new(x.id, "hello"));
        sessions.store.save_message(&message).await.unwrap();

        let a = admin();
        let for_admin = sessions.notification(x.id, Some(&a)).await.unwrap();
        assert_eq!(for_admin.unread_count, 1);
        assert_eq!(for_admin.last_message.as_deref(), Some("hello"));

        let for_guest = sessions.notification(x.id, None).await.unwrap();
        assert_eq!(for_guest.unread_count, 0);

        assert_eq!(sessions.mark_seen(x.id, Some(&a)).await.unwrap(), 1);
        let for_admin = sessions.notification(x.id, Some(&a)).await.unwrap();
        assert_eq!(for_admin.unread_count, 0);
    }

    #[tokio::test]
    async fn customers_read_only_their_own_sessions() {
        let sessions = manager(DuplicatePolicy::ReturnExisting).await;
        let owner = Caller::new(RecordId::new(), SenderRole::Customer);
        let stranger = Caller::new(RecordId::new(), SenderRole::Customer);
        let x = sessions
            .create_session(Initiator::Customer(owner.id))
            .await
            .unwrap()
            .into_session();

        assert!(sessions.mark_seen(x.id, Some(&owner)).await.is_ok());
        assert!(matches!(
            sessions.mark_seen(x.id, Some(&stranger)).await,
            Err(ChatError::Permission)
        ));
        assert!(matches!(
            sessions.notification(x.id, None).await,
            Err(ChatError::Permission)
        ));
    }
}
