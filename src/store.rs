use crate::{
    chat::{ChatMessage, ChatSession},
    entity::{RecordId, SenderRole},
};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    error::ErrorKind,
    sqlite::{SqliteConnectOptions, SqliteRow},
    ConnectOptions, Row, SqlitePool,
};
use std::{path::Path, str::FromStr};

const SESSION_COLUMNS: &str =
    "id, customer_id, guest_name, guest_phone, admin_id, is_active, created_at, updated_at";

const MESSAGE_COLUMNS: &str =
    "id, chat_id, sender_id, guest_name, sender_role, content, timestamp, seen";

#[derive(Clone, Debug)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Create a new Store instance.
    /// This will automatically create the database file if it doesn't exist.
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();

        if let Some(parent) = db_path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).context("Failed to create database directory")?;
            }
        }

        let db_url = format!("sqlite://{}", db_path.to_string_lossy());

        let options = SqliteConnectOptions::from_str(&db_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .log_statements(tracing::log::LevelFilter::Trace);

        let pool = SqlitePool::connect_with(options)
            .await
            .context("Failed to connect to SQLite database")?;

        Ok(Self { pool })
    }

    /// Single-connection in-memory database; every pooled connection would
    /// otherwise see its own empty schema.
    #[cfg(test)]
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .context("Failed to open in-memory database")?;

        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    /// Initialize the database schema.
    ///
    /// The partial unique indexes back the one-active-session-per-party rule
    /// when two creators race past the existence check.
    pub async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chats (
                id TEXT PRIMARY KEY,
                customer_id TEXT,
                guest_name TEXT,
                guest_phone TEXT,
                admin_id TEXT,
                is_active BOOLEAN NOT NULL,
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_chats_active_customer
                ON chats(customer_id) WHERE is_active = 1 AND customer_id IS NOT NULL;
            CREATE UNIQUE INDEX IF NOT EXISTS idx_chats_active_guest
                ON chats(guest_phone) WHERE is_active = 1 AND guest_phone IS NOT NULL;
            CREATE INDEX IF NOT EXISTS idx_chats_created ON chats(created_at DESC);

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                chat_id TEXT NOT NULL REFERENCES chats(id),
                sender_id TEXT,
                guest_name TEXT,
                sender_role TEXT NOT NULL,
                content TEXT NOT NULL,
                timestamp DATETIME NOT NULL,
                seen BOOLEAN NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_messages_chat_timestamp ON messages(chat_id, timestamp);
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to initialize database schema")?;

        Ok(())
    }

    pub async fn insert_session(&self, session: &ChatSession) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO chats (id, customer_id, guest_name, guest_phone, admin_id, is_active, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(session.id.to_string())
        .bind(session.customer_id.map(|id| id.to_string()))
        .bind(&session.guest_name)
        .bind(&session.guest_phone)
        .bind(session.admin_id.map(|id| id.to_string()))
        .bind(session.is_active)
        .bind(session.created_at)
        .bind(session.updated_at)
        .execute(&self.pool)
        .await
        .context("Failed to insert chat session")?;

        Ok(())
    }

    /// Find the active session belonging to either the customer or the guest
    /// phone. A `None` key never matches.
    pub async fn find_active_session(
        &self,
        customer_id: Option<RecordId>,
        guest_phone: Option<&str>,
    ) -> Result<Option<ChatSession>> {
        let customer_id = customer_id.map(|id| id.to_string());
        let row = sqlx::query(&format!(
            r#"
            SELECT {SESSION_COLUMNS}
            FROM chats
            WHERE is_active = 1
              AND ((? IS NOT NULL AND customer_id = ?) OR (? IS NOT NULL AND guest_phone = ?))
            ORDER BY created_at DESC
            LIMIT 1
            "#
        ))
        .bind(&customer_id)
        .bind(&customer_id)
        .bind(guest_phone)
        .bind(guest_phone)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to look up active chat session")?;

        row.as_ref().map(session_from_row).transpose()
    }

    pub async fn get_session(&self, id: RecordId) -> Result<Option<ChatSession>> {
        let row = sqlx::query(&format!("SELECT {SESSION_COLUMNS} FROM chats WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch chat session")?;

        row.as_ref().map(session_from_row).transpose()
    }

    /// Active sessions nobody has claimed yet, newest first.
    pub async fn list_pending_sessions(&self) -> Result<Vec<ChatSession>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {SESSION_COLUMNS}
            FROM chats
            WHERE is_active = 1 AND admin_id IS NULL
            ORDER BY created_at DESC, id DESC
            "#
        ))
        .fetch_all(&self.pool)
        .await
        .context("Failed to list pending chat sessions")?;

        rows.iter().map(session_from_row).collect()
    }

    pub async fn list_sessions_for_customer(&self, customer_id: RecordId) -> Result<Vec<ChatSession>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {SESSION_COLUMNS}
            FROM chats
            WHERE customer_id = ?
            ORDER BY created_at DESC, id DESC
            "#
        ))
        .bind(customer_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context("Failed to list customer chat sessions")?;

        rows.iter().map(session_from_row).collect()
    }

    /// Returns false when no such session exists.
    pub async fn set_session_admin(
        &self,
        id: RecordId,
        admin_id: RecordId,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query("UPDATE chats SET admin_id = ?, updated_at = ? WHERE id = ?")
            .bind(admin_id.to_string())
            .bind(now)
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to claim chat session")?;

        Ok(result.rows_affected() > 0)
    }

    /// Returns false when no such session exists.
    pub async fn deactivate_session(&self, id: RecordId, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query("UPDATE chats SET is_active = 0, updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to close chat session")?;

        Ok(result.rows_affected() > 0)
    }

    /// Save a chat message to the store.
    pub async fn save_message(&self, msg: &ChatMessage) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO messages (id, chat_id, sender_id, guest_name, sender_role, content, timestamp, seen)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(msg.id.to_string())
        .bind(msg.chat_id.to_string())
        .bind(msg.sender_id.map(|id| id.to_string()))
        .bind(&msg.guest_name)
        .bind(msg.sender_role.as_str())
        .bind(&msg.content)
        .bind(msg.timestamp)
        .bind(msg.seen)
        .execute(&self.pool)
        .await
        .context("Failed to save message")?;

        Ok(())
    }

    /// Retrieve the full history of a chat session, oldest first.
    pub async fn get_chat_history(&self, chat_id: RecordId) -> Result<Vec<ChatMessage>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {MESSAGE_COLUMNS}
            FROM messages
            WHERE chat_id = ?
            ORDER BY timestamp ASC, id ASC
            "#
        ))
        .bind(chat_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch chat history")?;

        rows.iter().map(message_from_row).collect()
    }

    /// Mark messages sent by one side of the conversation as seen. Returns
    /// how many changed.
    pub async fn mark_seen(&self, chat_id: RecordId, sent_by_admin: bool) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE messages SET seen = 1
            WHERE chat_id = ? AND seen = 0 AND (sender_role = 'Admin') = ?
            "#,
        )
        .bind(chat_id.to_string())
        .bind(sent_by_admin)
        .execute(&self.pool)
        .await
        .context("Failed to mark messages seen")?;

        Ok(result.rows_affected())
    }

    pub async fn count_unseen(&self, chat_id: RecordId, sent_by_admin: bool) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM messages
            WHERE chat_id = ? AND seen = 0 AND (sender_role = 'Admin') = ?
            "#,
        )
        .bind(chat_id.to_string())
        .bind(sent_by_admin)
        .fetch_one(&self.pool)
        .await
        .context("Failed to count unseen messages")?;

        Ok(count)
    }

    pub async fn last_message(&self, chat_id: RecordId) -> Result<Option<ChatMessage>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {MESSAGE_COLUMNS}
            FROM messages
            WHERE chat_id = ?
            ORDER BY timestamp DESC, id DESC
            LIMIT 1
            "#
        ))
        .bind(chat_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch last message")?;

        row.as_ref().map(message_from_row).transpose()
    }
}

/// True when the error chain bottoms out in a uniqueness violation.
pub fn is_unique_violation(err: &anyhow::Error) -> bool {
    match err.downcast_ref::<sqlx::Error>() {
        Some(sqlx::Error::Database(db_err)) => db_err.is_unique_violation(),
        _ => false,
    }
}

/// Any constraint violation. Retrying the same statement cannot succeed.
pub fn is_constraint_violation(err: &anyhow::Error) -> bool {
    match err.downcast_ref::<sqlx::Error>() {
        Some(sqlx::Error::Database(db_err)) => db_err.kind() != ErrorKind::Other,
        _ => false,
    }
}

fn parse_id(raw: String) -> Result<RecordId> {
    raw.parse().context("Corrupt id in store")
}

fn parse_optional_id(raw: Option<String>) -> Result<Option<RecordId>> {
    raw.map(parse_id).transpose()
}

fn session_from_row(row: &SqliteRow) -> Result<ChatSession> {
    Ok(ChatSession {
        id: parse_id(row.try_get("id")?)?,
        customer_id: parse_optional_id(row.try_get("customer_id")?)?,
        guest_name: row.try_get("guest_name")?,
        guest_phone: row.try_get("guest_phone")?,
        admin_id: parse_optional_id(row.try_get("admin_id")?)?,
        is_active: row.try_get("is_active")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        messages: Vec::new(),
    })
}

fn message_from_row(row: &SqliteRow) -> Result<ChatMessage> {
    let role: String = row.try_get("sender_role")?;

    Ok(ChatMessage {
        id: parse_id(row.try_get("id")?)?,
        chat_id: parse_id(row.try_get("chat_id")?)?,
        sender_id: parse_optional_id(row.try_get("sender_id")?)?,
        guest_name: row.try_get("guest_name")?,
        sender_role: SenderRole::from_str(&role).context("Corrupt sender role in store")?,
        content: row.try_get("content")?,
        timestamp: row.try_get("timestamp")?,
        seen: row.try_get("seen")?,
    })
}
