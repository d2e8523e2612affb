//! Live connection registry
//!
//! Sole owner of "who is connected right now". Mutation is serialised behind
//! one lock; fan-out iterates a snapshot so slow deliveries never hold it.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bus::{CloseReason, Event, Outbound};
use crate::entity::{Party, RecordId, SenderRole};

pub type ConnectionId = Uuid;

/// One registered transport connection.
#[derive(Debug)]
pub struct ConnectionEntry {
    pub id: ConnectionId,
    pub role: SenderRole,
    /// Authenticated user behind the connection; guests have none.
    pub user_id: Option<RecordId>,
    /// `None` only for administrator dashboards watching every session.
    pub chat_id: Option<RecordId>,
    pub connected_at: DateTime<Utc>,
    sender: mpsc::UnboundedSender<Outbound>,
    cancel: CancellationToken,
}

impl ConnectionEntry {
    pub fn party(&self) -> Party {
        self.role.party()
    }

    /// Queue an event for the connection's writer.
    ///
    /// Fails once the writer has gone away.
    #[allow(clippy::result_large_err)]
    pub fn send(&self, event: Event) -> Result<(), mpsc::error::SendError<Outbound>> {
        self.sender.send(Outbound::Event(event))
    }

    /// Ask the writer to send a close frame and stop.
    pub fn close(&self, reason: CloseReason) {
        let _ = self.sender.send(Outbound::Close(reason));
    }

    /// Unblocks the read loop.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub administrators: usize,
    pub counterparties: usize,
}

#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    entries: Arc<RwLock<HashMap<ConnectionId, Arc<ConnectionEntry>>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection. Any number of connections may share a role or
    /// session.
    pub async fn register(
        &self,
        role: SenderRole,
        user_id: Option<RecordId>,
        chat_id: Option<RecordId>,
        sender: mpsc::UnboundedSender<Outbound>,
        cancel: CancellationToken,
    ) -> Arc<ConnectionEntry> {
        let entry = Arc::new(ConnectionEntry {
            id: Uuid::new_v4(),
            role,
            user_id,
            chat_id,
            connected_at: Utc::now(),
            sender,
            cancel,
        });

        let mut entries = self.entries.write().await;
        entries.insert(entry.id, Arc::clone(&entry));

        tracing::info!(
            connection_id = %entry.id,
            role = %role,
            chat_id = ?chat_id.map(|id| id.to_string()),
            total_connections = entries.len(),
            "Connection registered"
        );

        entry
    }

    /// Remove a connection. Only the first of any number of racing callers
    /// gets the entry back.
    pub async fn unregister(&self, id: &ConnectionId) -> Option<Arc<ConnectionEntry>> {
        let mut entries = self.entries.write().await;
        let removed = entries.remove(id);

        if let Some(entry) = &removed {
            tracing::info!(
                connection_id = %id,
                role = %entry.role,
                connected_secs = (Utc::now() - entry.connected_at).num_seconds(),
                remaining_connections = entries.len(),
                "Connection unregistered"
            );
        }

        removed
    }

    pub async fn snapshot(&self) -> Vec<Arc<ConnectionEntry>> {
        let entries = self.entries.read().await;
        entries.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn stats(&self) -> RegistryStats {
        let entries = self.entries.read().await;
        entries
            .values()
            .fold(RegistryStats::default(), |mut stats, entry| {
                match entry.party() {
                    Party::Administrator => stats.administrators += 1,
                    Party::Counterparty => stats.counterparties += 1,
                }
                stats
            })
    }
}
