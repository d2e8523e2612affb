//! Message creation shared by live connections and the admin reply endpoint.
//!
//! Both paths stamp, persist and broadcast through the same code, so the store
//! cannot tell them apart.

use std::time::Duration;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tracing::{debug, info};

use crate::bus::{Broadcaster, Dispatch};
use crate::chat::{ChatMessage, MessageDraft};
use crate::entity::{Caller, RecordId, SenderRole};
use crate::error::{ChatError, ChatResult};
use crate::registry::ConnectionEntry;
use crate::store::{is_constraint_violation, is_unique_violation, Store};

const RETRY_BASE_DELAY_MS: u64 = 50;
const RETRY_MAX_DELAY: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct Relay {
    store: Store,
    broadcaster: Broadcaster,
    retry_attempts: usize,
}

impl Relay {
    pub fn new(store: Store, broadcaster: Broadcaster, retry_attempts: usize) -> Self {
        Self {
            store,
            broadcaster,
            retry_attempts,
        }
    }

    /// A frame read from a live connection. The sender role and sender id
    /// always come from the connection's registration; a scoped connection
    /// may only post to its own session.
    pub async fn post_live(
        &self,
        conn: &ConnectionEntry,
        mut draft: MessageDraft,
    ) -> ChatResult<ChatMessage> {
        if let Some(claimed) = draft.sender_role {
            if claimed.party() != conn.party() {
                return Err(ChatError::Validation(format!(
                    "sender_role {} does not match this connection",
                    claimed
                )));
            }
        }

        let chat_id = match (conn.chat_id, draft.chat_id) {
            (Some(scoped), Some(requested)) if scoped != requested => {
                return Err(ChatError::Validation(
                    "Message targets a different chat session".to_string(),
                ))
            }
            (Some(scoped), _) => scoped,
            (None, Some(requested)) => requested,
            (None, None) => {
                return Err(ChatError::Validation("chat_id is required".to_string()))
            }
        };

        draft.sender_id = conn.user_id;
        self.post(chat_id, conn.role, draft).await
    }

    /// Administrator reply over request/response. Live peers of the session
    /// are notified exactly like a live message.
    pub async fn reply(&self, caller: &Caller, mut draft: MessageDraft) -> ChatResult<ChatMessage> {
        caller.require_admin()?;
        let chat_id = draft
            .chat_id
            .ok_or_else(|| ChatError::Validation("chat_id is required".to_string()))?;
        draft.sender_id = Some(caller.id);
        draft.guest_name = None;

        let message = self.post(chat_id, SenderRole::Admin, draft).await?;
        info!(chat_id = %chat_id, admin = %caller.id, message_id = %message.id, "Admin reply sent");
        Ok(message)
    }

    async fn post(
        &self,
        chat_id: RecordId,
        role: SenderRole,
        draft: MessageDraft,
    ) -> ChatResult<ChatMessage> {
        if draft.content.trim().is_empty() {
            return Err(ChatError::Validation("Message content is empty".to_string()));
        }

        let session = self
            .store
            .get_session(chat_id)
            .await?
            .ok_or(ChatError::NotFound("Chat session"))?;
        if !session.is_active {
            return Err(ChatError::Conflict("Chat session is closed".to_string()));
        }

        let mut message = ChatMessage::stamp(chat_id, role, draft);
        message.guest_name = match role {
            SenderRole::Guest => session.guest_name,
            SenderRole::Admin | SenderRole::Customer => None,
        };
        self.persist(&message).await?;
        debug!(chat_id = %chat_id, message_id = %message.id, role = %role, "Message stored");

        self.broadcaster
            .publish(Dispatch::Message(message.clone()))
            .await;
        Ok(message)
    }

    /// Transient store failures get a bounded exponential backoff, for at
    /// most `retry_attempts` attempts in total. Constraint violations are final.
    async fn persist(&self, message: &ChatMessage) -> ChatResult<()> {
        RetryIf::start(
            retry_delays(self.retry_attempts),
            || self.store.save_message(message),
            |e: &anyhow::Error| !is_constraint_violation(e),
        )
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                ChatError::Conflict(format!("Message {} already exists", message.id))
            } else {
                ChatError::from(e)
            }
        })
    }
}

/// Delays between attempts; the first attempt is not delayed.
fn retry_delays(attempts: usize) -> impl Iterator<Item = Duration> {
    ExponentialBackoff::from_millis(RETRY_BASE_DELAY_MS)
        .max_delay(RETRY_MAX_DELAY)
        .map(jitter)
        .take(attempts.saturating_sub(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Event, Outbound};
    use crate::chat::Initiator;
    use crate::lifecycle::{DuplicatePolicy, SessionManager};
    use crate::registry::ConnectionRegistry;
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    struct Harness {
        relay: Relay,
        sessions: SessionManager,
        registry: ConnectionRegistry,
        store: Store,
    }

    async fn harness() -> Harness {
        let store = Store::in_memory().await.unwrap();
        let registry = ConnectionRegistry::new();
        let (broadcaster, _handle) =
            Broadcaster::spawn(registry.clone(), 16, CancellationToken::new());
        Harness {
            relay: Relay::new(store.clone(), broadcaster.clone(), 2),
            sessions: SessionManager::new(
                store.clone(),
                broadcaster,
                DuplicatePolicy::ReturnExisting,
            ),
            registry,
            store,
        }
    }

    async fn open_guest_session(h: &Harness) -> RecordId {
        h.sessions
            .create_session(Initiator::Guest {
                name: "Alice".into(),
                phone: "555-0100".into(),
            })
            .await
            .unwrap()
            .into_session()
            .id
    }

    async fn connect(
        h: &Harness,
        role: SenderRole,
        chat_id: Option<RecordId>,
    ) -> (Arc<ConnectionEntry>, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let entry = h
            .registry
            .register(role, None, chat_id, tx, CancellationToken::new())
            .await;
        (entry, rx)
    }

    #[tokio::test]
    async fn non_admin_reply_is_forbidden_and_not_persisted() {
        let h = harness().await;
        let chat_id = open_guest_session(&h).await;
        let customer = Caller::new(RecordId::new(), SenderRole::Customer);

        let err = h
            .relay
            .reply(&customer, MessageDraft::new(chat_id, "sneaky"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Permission));
        assert!(h.store.get_chat_history(chat_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn live_and_reply_messages_share_one_history() {
        let h = harness().await;
        let chat_id = open_guest_session(&h).await;
        let (guest, _rx) = connect(&h, SenderRole::Guest, Some(chat_id)).await;
        let admin = Caller::new(RecordId::new(), SenderRole::Admin);

        let hello = h
            .relay
            .post_live(
                &guest,
                MessageDraft {
                    chat_id: None,
                    ..MessageDraft::new(chat_id, "hello")
                },
            )
            .await
            .unwrap();
        let answer = h
            .relay
            .reply(&admin, MessageDraft::new(chat_id, "hi Alice"))
            .await
            .unwrap();

        let history = h.sessions.get_messages(chat_id).await.unwrap();
        assert_eq!(history, vec![hello, answer]);
        assert_eq!(history[0].sender_role, SenderRole::Guest);
        assert_eq!(history[1].sender_role, SenderRole::Admin);
        assert_eq!(history[1].sender_id, Some(admin.id));
    }

    #[tokio::test]
    async fn reply_reaches_the_live_guest() {
        let h = harness().await;
        let chat_id = open_guest_session(&h).await;
        let (_guest, mut rx) = connect(&h, SenderRole::Guest, Some(chat_id)).await;
        let admin = Caller::new(RecordId::new(), SenderRole::Admin);

        h.relay
            .reply(&admin, MessageDraft::new(chat_id, "we shipped it"))
            .await
            .unwrap();

        // the creation notice may still be in flight ahead of the reply
        let msg = loop {
            match tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap()
            {
                Outbound::Event(Event::Message(msg)) => break msg,
                Outbound::Event(Event::SessionUpdated(_)) => continue,
                other => panic!("unexpected outbound {:?}", other),
            }
        };
        assert_eq!(msg.content, "we shipped it");
    }

    #[tokio::test]
    async fn scoped_connection_cannot_post_elsewhere_or_impersonate() {
        let h = harness().await;
        let chat_id = open_guest_session(&h).await;
        let (guest, _rx) = connect(&h, SenderRole::Guest, Some(chat_id)).await;

        let elsewhere = h
            .relay
            .post_live(&guest, MessageDraft::new(RecordId::new(), "hi"))
            .await;
        assert!(matches!(elsewhere, Err(ChatError::Validation(_))));

        let impersonation = h
            .relay
            .post_live(
                &guest,
                MessageDraft {
                    sender_role: Some(SenderRole::Admin),
                    ..MessageDraft::new(chat_id, "I am staff")
                },
            )
            .await;
        assert!(matches!(impersonation, Err(ChatError::Validation(_))));
    }

    #[tokio::test]
    async fn closed_or_unknown_sessions_refuse_messages() {
        let h = harness().await;
        let chat_id = open_guest_session(&h).await;
        let admin = Caller::new(RecordId::new(), SenderRole::Admin);
        h.sessions.close_session(chat_id, &admin).await.unwrap();

        assert!(matches!(
            h.relay.reply(&admin, MessageDraft::new(chat_id, "late")).await,
            Err(ChatError::Conflict(_))
        ));
        assert!(matches!(
            h.relay
                .reply(&admin, MessageDraft::new(RecordId::new(), "void"))
                .await,
            Err(ChatError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn empty_content_and_reused_ids_are_rejected() {
        let h = harness().await;
        let chat_id = open_guest_session(&h).await;
        let admin = Caller::new(RecordId::new(), SenderRole::Admin);

        assert!(matches!(
            h.relay.reply(&admin, MessageDraft::new(chat_id, "   ")).await,
            Err(ChatError::Validation(_))
        ));

        let first = h
            .relay
            .reply(&admin, MessageDraft::new(chat_id, "once"))
            .await
            .unwrap();
        let reused = h
            .relay
            .reply(
                &admin,
                MessageDraft {
                    id: Some(first.id),
                    ..MessageDraft::new(chat_id, "twice")
                },
            )
            .await;
        assert!(matches!(reused, Err(ChatError::Conflict(_))));
    }

    #[test]
    fn attempts_include_the_first_try() {
        assert_eq!(retry_delays(3).count(), 2);
        assert_eq!(retry_delays(1).count(), 0);
        assert_eq!(retry_delays(0).count(), 0);
        assert!(retry_delays(8).all(|delay| delay <= RETRY_MAX_DELAY));
    }

    #[tokio::test]
    async fn live_messages_carry_the_connection_identity() {
        let h = harness().await;
        let chat_id = open_guest_session(&h).await;
        let (guest, _rx) = connect(&h, SenderRole::Guest, Some(chat_id)).await;

        let message = h
            .relay
            .post_live(
                &guest,
                MessageDraft {
                    sender_id: Some(RecordId::new()),
                    guest_name: Some("Mallory".into()),
                    ..MessageDraft::new(chat_id, "hello")
                },
            )
            .await
            .unwrap();
        assert_eq!(message.sender_id, None);
        assert_eq!(message.guest_name.as_deref(), Some("Alice"));
    }
}
