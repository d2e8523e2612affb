use axum::{
    async_trait,
    extract::{rejection::JsonRejection, FromRequestParts, Path, State},
    http::request::Parts,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use super::AppState;
use crate::chat::{ChatMessage, ChatNotification, ChatSession, Initiator, MessageDraft};
use crate::entity::{Caller, RecordId, SenderRole};
use crate::error::{ChatError, ChatResult};
use crate::lifecycle::CreateOutcome;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";

/// Identity established upstream by the surrounding backend's auth layer and
/// forwarded as headers. Requests without them are guests.
#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = ChatError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned)
        };

        let (Some(id), Some(role)) = (header(USER_ID_HEADER), header(USER_ROLE_HEADER)) else {
            return Err(ChatError::Permission);
        };

        let id: RecordId = id.parse()?;
        let role = match role.parse::<SenderRole>() {
            Ok(SenderRole::Admin) => SenderRole::Admin,
            Ok(SenderRole::Customer) => SenderRole::Customer,
            _ => return Err(ChatError::Validation(format!("Unsupported caller role {:?}", role))),
        };

        Ok(Caller::new(id, role))
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateChatRequest {
    #[serde(default)]
    pub customer_id: Option<RecordId>,
    #[serde(default)]
    pub guest_name: Option<String>,
    #[serde(default)]
    pub guest_phone: Option<String>,
}

pub async fn create_chat(
    State(state): State<AppState>,
    caller: Option<Caller>,
    payload: Result<Json<CreateChatRequest>, JsonRejection>,
) -> ChatResult<Json<ChatSession>> {
    let Json(request) = payload?;

    // Customers open chats as themselves; only an administrator may open
    // one on behalf of a named customer.
    let customer_id = match caller {
        Some(caller) if caller.role == SenderRole::Customer => Some(caller.id),
        Some(caller) if caller.is_admin() => request.customer_id,
        _ => None,
    };
    let initiator = Initiator::resolve(customer_id, request.guest_name, request.guest_phone)?;

    let outcome = state.sessions.create_session(initiator).await?;
    if let CreateOutcome::Existing(session) = &outcome {
        info!(chat_id = %session.id, "Create request resolved to existing chat");
    }

    Ok(Json(outcome.into_session()))
}

pub async fn list_pending(
    State(state): State<AppState>,
    caller: Caller,
) -> ChatResult<Json<Vec<ChatSession>>> {
    caller.require_admin()?;
    Ok(Json(state.sessions.list_pending_sessions().await?))
}

pub async fn list_mine(
    State(state): State<AppState>,
    caller: Caller,
) -> ChatResult<Json<Vec<ChatSession>>> {
    if caller.role != SenderRole::Customer {
        return Err(ChatError::Permission);
    }
    Ok(Json(state.sessions.list_sessions_for_customer(caller.id).await?))
}

pub async fn get_chat(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ChatResult<Json<ChatSession>> {
    let id: RecordId = id.parse()?;
    Ok(Json(state.sessions.get_session(id).await?))
}

pub async fn get_messages(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ChatResult<Json<Vec<ChatMessage>>> {
    let id: RecordId = id.parse()?;
    Ok(Json(state.sessions.get_messages(id).await?))
}

pub async fn claim_chat(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
) -> ChatResult<Json<ChatSession>> {
    let id: RecordId = id.parse()?;
    Ok(Json(state.sessions.claim_session(id, &caller).await?))
}

pub async fn close_chat(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
) -> ChatResult<Json<ChatSession>> {
    let id: RecordId = id.parse()?;
    Ok(Json(state.sessions.close_session(id, &caller).await?))
}

pub async fn mark_seen(
    State(state): State<AppState>,
    caller: Option<Caller>,
    Path(id): Path<String>,
) -> ChatResult<Json<Value>> {
    let id: RecordId = id.parse()?;
    let marked = state.sessions.mark_seen(id, caller.as_ref()).await?;
    Ok(Json(json!({ "marked": marked })))
}

pub async fn get_notification(
    State(state): State<AppState>,
    caller: Option<Caller>,
    Path(id): Path<String>,
) -> ChatResult<Json<ChatNotification>> {
    let id: RecordId = id.parse()?;
    Ok(Json(state.sessions.notification(id, caller.as_ref()).await?))
}

pub async fn reply(
    State(state): State<AppState>,
    caller: Caller,
    payload: Result<Json<MessageDraft>, JsonRejection>,
) -> ChatResult<Json<ChatMessage>> {
    let Json(draft) = payload?;
    Ok(Json(state.relay.reply(&caller, draft).await?))
}

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let stats = state.registry.stats().await;
    Json(json!({
        "status": "ok",
        "connections": {
            "total": state.registry.len().await,
            "administrators": stats.administrators,
            "counterparties": stats.counterparties,
        }
    }))
}
