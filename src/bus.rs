use crate::chat::{ChatMessage, ChatSession};
use crate::entity::Party;
use crate::registry::{ConnectionEntry, ConnectionRegistry};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Server-to-client events.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Event {
    /// Sent once right after the upgrade
    Connected { connection_id: Uuid },

    /// A chat message from the other party
    Message(ChatMessage),

    /// Creation, claim or close of a session
    SessionUpdated(ChatSession),

    /// A frame was understood but could not be accepted
    Error { message: String },
}

/// What a connection's writer task consumes.
#[derive(Debug)]
pub enum Outbound {
    Event(Event),
    Close(CloseReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    PeerDisconnect,
    DecodeError,
    SendError,
    ServerShutdown,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::PeerDisconnect => "peer disconnect",
            CloseReason::DecodeError => "undecodable frame",
            CloseReason::SendError => "send error",
            CloseReason::ServerShutdown => "server shutdown",
        }
    }

    /// RFC 6455 close code.
    pub fn close_code(self) -> u16 {
        match self {
            CloseReason::PeerDisconnect => 1000,
            CloseReason::DecodeError => 1007,
            CloseReason::SendError => 1011,
            CloseReason::ServerShutdown => 1001,
        }
    }
}

/// A unit of work for the fan-out task.
#[derive(Debug, Clone)]
pub enum Dispatch {
    /// Routed to the opposite party within the message's session
    Message(ChatMessage),
    /// Routed to every connection bound to the session and to admin
    /// dashboards
    Session(ChatSession),
}

impl Dispatch {
    /// The routing rule. A message never reaches a connection of its
    /// sender's party; scoped connections only see their own session and
    /// only administrators may watch all sessions unscoped.
    pub fn reaches(&self, entry: &ConnectionEntry) -> bool {
        match self {
            Dispatch::Message(msg) => {
                let in_scope = match entry.chat_id {
                    Some(chat_id) => chat_id == msg.chat_id,
                    None => entry.party() == Party::Administrator,
                };
                match (msg.sender_role.party(), entry.party()) {
                    (Party::Administrator, Party::Counterparty)
                    | (Party::Counterparty, Party::Administrator) => in_scope,
                    (Party::Administrator, Party::Administrator)
                    | (Party::Counterparty, Party::Counterparty) => false,
                }
            }
            Dispatch::Session(session) => match entry.chat_id {
                Some(chat_id) => chat_id == session.id,
                None => entry.party() == Party::Administrator,
            },
        }
    }

    fn event(&self) -> Event {
        match self {
            Dispatch::Message(msg) => Event::Message(msg.clone()),
            Dispatch::Session(session) => Event::SessionUpdated(session.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanOutReport {
    pub delivered: usize,
    pub dropped: usize,
}

/// Producer side of the fan-out queue. Cheap to clone; every connection
/// read loop and the reply path hold one.
#[derive(Clone)]
pub struct Broadcaster {
    tx: mpsc::Sender<Dispatch>,
}

impl Broadcaster {
    /// Start the single fan-out task. It stops when `shutdown` fires or every
    /// producer is dropped.
    pub fn spawn(
        registry: ConnectionRegistry,
        capacity: usize,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Dispatch>(capacity.max(1));

        let handle = tokio::spawn(async move {
            info!("Broadcaster started");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    next = rx.recv() => match next {
                        Some(dispatch) => {
                            fan_out(&registry, &dispatch).await;
                        }
                        None => break,
                    }
                }
            }
            info!("Broadcaster stopped");
        });

        (Self { tx }, handle)
    }

    pub async fn publish(&self, dispatch: Dispatch) {
        // Only fails after shutdown, when nobody is listening anyway.
        if self.tx.send(dispatch).await.is_err() {
            warn!("Broadcaster is gone, dropping dispatch");
        }
    }
}

/// Deliver one dispatch to every eligible connection in a registry snapshot.
///
/// A failed delivery closes and unregisters only that connection.
pub async fn fan_out(registry: &ConnectionRegistry, dispatch: &Dispatch) -> FanOutReport {
    let mut report = FanOutReport::default();
    let event = dispatch.event();

    for entry in registry.snapshot().await {
        if !dispatch.reaches(&entry) {
            continue;
        }

        match entry.send(event.clone()) {
            Ok(()) => report.delivered += 1,
            Err(_) => {
                report.dropped += 1;
                warn!(connection_id = %entry.id, "Delivery failed, dropping connection");
                entry.cancel();
                registry.unregister(&entry.id).await;
            }
        }
    }

    debug!(
        delivered = report.delivered,
        dropped = report.dropped,
        "Fan-out complete"
    );

    report
}
