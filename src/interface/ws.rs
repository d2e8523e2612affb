//! Live websocket endpoint
//!
//! One read loop per connection plus a writer task that owns the sink and
//! drains the connection's outbound channel.

use std::borrow::Cow;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::AppState;
use crate::bus::{CloseReason, Event, Outbound};
use crate::chat::MessageDraft;
use crate::entity::{Caller, InvalidRole, Party, RecordId, SenderRole};
use crate::error::{ChatError, ChatResult};
use crate::registry::ConnectionEntry;
use crate::relay::Relay;

#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    pub role: String,
    #[serde(default)]
    pub chat_id: Option<String>,
}

/// What a connection is registered as once its request checks out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Binding {
    role: SenderRole,
    user_id: Option<RecordId>,
    chat_id: Option<RecordId>,
}

/// Upgrade to a live connection. The requested role is checked against the
/// caller identity before the upgrade happens.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    caller: Option<Caller>,
    Query(params): Query<ConnectParams>,
) -> ChatResult<Response> {
    let binding = resolve_binding(&state, caller, params).await?;

    info!(
        role = %binding.role,
        chat_id = ?binding.chat_id.map(|id| id.to_string()),
        "WebSocket upgrade requested"
    );
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, binding)))
}

/// Administrators must be authenticated as such and may watch every session.
/// Customers must be authenticated and bind to one of their own sessions.
/// Guests bind to a guest session.
async fn resolve_binding(
    state: &AppState,
    caller: Option<Caller>,
    params: ConnectParams,
) -> ChatResult<Binding> {
    let role: SenderRole = params
        .role
        .parse()
        .map_err(|e: InvalidRole| ChatError::Validation(e.to_string()))?;

    let chat_id = params
        .chat_id
        .as_deref()
        .map(str::trim)
        .filter(|raw| !raw.is_empty())
        .map(str::parse::<RecordId>)
        .transpose()?;

    let session = match chat_id {
        Some(id) => Some(state.sessions.require_session(id).await?),
        None if role.party() == Party::Counterparty => {
            return Err(ChatError::Validation(
                "chat_id is required for guest and customer connections".to_string(),
            ));
        }
        None => None,
    };
    let session_customer = session.and_then(|s| s.customer_id);

    let user_id = match role {
        SenderRole::Admin => {
            let admin = caller.filter(Caller::is_admin).ok_or(ChatError::Permission)?;
            Some(admin.id)
        }
        SenderRole::Customer => {
            let customer = caller
                .filter(|c| c.role == SenderRole::Customer)
                .ok_or(ChatError::Permission)?;
            if session_customer != Some(customer.id) {
                return Err(ChatError::Permission);
            }
            Some(customer.id)
        }
        SenderRole::Guest => {
            if session_customer.is_some() {
                return Err(ChatError::Permission);
            }
            None
        }
    };

    Ok(Binding {
        role,
        user_id,
        chat_id,
    })
}

async fn handle_socket(socket: WebSocket, state: AppState, binding: Binding) {
    let (sink, mut stream) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel();

    let entry = state
        .registry
        .register(
            binding.role,
            binding.user_id,
            binding.chat_id,
            tx,
            state.shutdown.child_token(),
        )
        .await;
    let _ = entry.send(Event::Connected {
        connection_id: entry.id,
    });

    let writer = tokio::spawn(write_loop(sink, rx, Arc::clone(&entry)));

    let reason = read_loop(&mut stream, &entry, &state).await;

    state.registry.unregister(&entry.id).await;
    entry.close(reason);
    let _ = writer.await;

    info!(connection_id = %entry.id, reason = reason.as_str(), "Connection closed");
}

async fn read_loop(
    stream: &mut SplitStream<WebSocket>,
    entry: &ConnectionEntry,
    state: &AppState,
) -> CloseReason {
    loop {
        tokio::select! {
            _ = entry.cancelled() => {
                return if state.shutdown.is_cancelled() {
                    CloseReason::ServerShutdown
                } else {
                    CloseReason::SendError
                };
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if let Err(reason) = handle_frame(&text, entry, &state.relay).await {
                        return reason;
                    }
                }
                Some(Ok(Message::Close(_))) | None => return CloseReason::PeerDisconnect,
                Some(Ok(Message::Binary(_))) => {
                    debug!(connection_id = %entry.id, "Ignoring binary frame");
                }
                // axum answers pings itself
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(connection_id = %entry.id, error = %e, "WebSocket read failed");
                    return CloseReason::PeerDisconnect;
                }
            }
        }
    }
}

/// Decode one inbound frame and hand it to the relay.
///
/// Undecodable JSON ends the connection. A frame that decodes but is refused
/// is answered with an `error` event and the connection stays open.
async fn handle_frame(
    text: &str,
    entry: &ConnectionEntry,
    relay: &Relay,
) -> Result<(), CloseReason> {
    let draft: MessageDraft = serde_json::from_str(text).map_err(|e| {
        warn!(connection_id = %entry.id, error = %e, "Undecodable frame");
        CloseReason::DecodeError
    })?;

    if let Err(e) = relay.post_live(entry, draft).await {
        warn!(connection_id = %entry.id, error = %e, "Frame rejected");
        entry
            .send(Event::Error {
                message: e.public_message(),
            })
            .map_err(|_| CloseReason::SendError)?;
    }

    Ok(())
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    entry: Arc<ConnectionEntry>,
) {
    if let Err(e) = drain_outbound(&mut sink, &mut rx).await {
        warn!(connection_id = %entry.id, error = %e, "Connection writer failed");
        entry.cancel();
    }
}

async fn drain_outbound(
    sink: &mut SplitSink<WebSocket, Message>,
    rx: &mut mpsc::UnboundedReceiver<Outbound>,
) -> ChatResult<()> {
    while let Some(outbound) = rx.recv().await {
        match outbound {
            Outbound::Event(event) => {
                let text = serde_json::to_string(&event)
                    .map_err(|e| ChatError::Transport(e.to_string()))?;
                sink.send(Message::Text(text))
                    .await
                    .map_err(|e| ChatError::Transport(e.to_string()))?;
            }
            Outbound::Close(reason) => {
                let frame = CloseFrame {
                    code: reason.close_code(),
                    reason: Cow::Borrowed(reason.as_str()),
                };
                // The peer may already be gone.
                let _ = sink.send(Message::Close(Some(frame))).await;
                break;
            }
        }
    }
    Ok(())
}
