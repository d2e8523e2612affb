use crate::entity::{RecordId, SenderRole};
use crate::error::ChatError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: RecordId,
    pub chat_id: RecordId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<RecordId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guest_name: Option<String>,
    pub sender_role: SenderRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub seen: bool,
}

impl ChatMessage {
    /// Turn a draft into a message ready to persist. A client-supplied id is
    /// kept; any client timestamp on the frame is ignored.
    pub fn stamp(chat_id: RecordId, sender_role: SenderRole, draft: MessageDraft) -> Self {
        Self {
            id: draft.id.unwrap_or_default(),
            chat_id,
            sender_id: draft.sender_id,
            guest_name: draft.guest_name,
            sender_role,
            content: draft.content,
            timestamp: Utc::now(),
            seen: false,
        }
    }
}

/// Inbound message payload, shared by the live connection and the reply
/// endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessageDraft {
    #[serde(default)]
    pub id: Option<RecordId>,
    #[serde(default)]
    pub chat_id: Option<RecordId>,
    #[serde(default)]
    pub sender_id: Option<RecordId>,
    #[serde(default)]
    pub guest_name: Option<String>,
    #[serde(default)]
    pub sender_role: Option<SenderRole>,
    pub content: String,
}

impl MessageDraft {
    pub fn new(chat_id: RecordId, content: impl Into<String>) -> Self {
        Self {
            chat_id: Some(chat_id),
            content: content.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: RecordId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<RecordId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guest_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guest_phone: Option<String>,
    pub admin_id: Option<RecordId>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
}

impl ChatSession {
    pub fn new(initiator: Initiator) -> Self {
        let now = Utc::now();
        let (customer_id, guest_name, guest_phone) = match initiator {
            Initiator::Customer(id) => (Some(id), None, None),
            Initiator::Guest { name, phone } => (None, Some(name), Some(phone)),
        };

        Self {
            id: RecordId::new(),
            customer_id,
            guest_name,
            guest_phone,
            admin_id: None,
            is_active: true,
            created_at: now,
            updated_at: now,
            messages: Vec::new(),
        }
    }

    /// Active and not yet claimed by an administrator.
    pub fn is_pending(&self) -> bool {
        self.is_active && self.admin_id.is_none()
    }
}

/// Unread summary of a session from one reader's side.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatNotification {
    pub chat_id: RecordId,
    pub unread_count: i64,
    pub last_message: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// The party opening a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Initiator {
    Customer(RecordId),
    Guest { name: String, phone: String },
}

impl Initiator {
    /// A customer id wins over guest details; without one, both guest name and
    /// phone are required.
    pub fn resolve(
        customer_id: Option<RecordId>,
        guest_name: Option<String>,
        guest_phone: Option<String>,
    ) -> Result<Self, ChatError> {
        if let Some(id) = customer_id {
            return Ok(Initiator::Customer(id));
        }

        let name = guest_name.map(|n| n.trim().to_string()).unwrap_or_default();
        let phone = guest_phone.map(|p| p.trim().to_string()).unwrap_or_default();
        if name.is_empty() || phone.is_empty() {
            return Err(ChatError::Validation(
                "Guest name and phone are required".to_string(),
            ));
        }

        Ok(Initiator::Guest { name, phone })
    }

    pub fn customer_id(&self) -> Option<RecordId> {
        match self {
            Initiator::Customer(id) => Some(*id),
            Initiator::Guest { .. } => None,
        }
    }

    pub fn guest_phone(&self) -> Option<&str> {
        match self {
            Initiator::Customer(_) => None,
            Initiator::Guest { phone, .. } => Some(phone),
        }
    }
}
