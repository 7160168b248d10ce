//! Session and message persistence used by the HTTP layer. The pipeline
//! itself never writes here.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::{debug, info};
use postgrest::Postgrest;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::SupabaseSettings;
use crate::types::{ChatRole, ChatTurn, Citation};

const SESSIONS_TABLE: &str = "chat_sessions";
const MESSAGES_TABLE: &str = "chat_messages";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub session_id: String,
    pub role: ChatRole,
    pub content: String,
    #[serde(default)]
    pub citations: Vec<Citation>,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(session_id: &str, role: ChatRole, content: impl Into<String>, citations: Vec<Citation>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            role,
            content: content.into(),
            citations,
            created_at: Utc::now(),
        }
    }

    pub fn to_turn(&self) -> ChatTurn {
        ChatTurn::new(self.role, self.content.clone())
    }
}

pub fn default_title(now: DateTime<Utc>) -> String {
    format!("Chat Session {}", now.format("%Y-%m-%d %H:%M"))
}

#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn create_session(&self, user_id: &str, title: Option<String>) -> Result<ChatSession, StoreError>;

    /// Fails with `SessionNotFound` when the session belongs to someone else.
    async fn get_session(&self, user_id: &str, session_id: &str) -> Result<ChatSession, StoreError>;

    /// Appends the message and bumps the session's `updated_at`.
    async fn add_message(&self, message: ChatMessage) -> Result<ChatMessage, StoreError>;

    /// All messages, oldest first.
    async fn messages(&self, session_id: &str) -> Result<Vec<ChatMessage>, StoreError>;

    /// The last `limit` messages, oldest first.
    async fn recent_messages(&self, session_id: &str, limit: usize) -> Result<Vec<ChatMessage>, StoreError>;
}

struct SessionEntry {
    session: ChatSession,
    messages: Vec<ChatMessage>,
}

/// Process-local store. Appends and the `updated_at` bump happen under the
/// same shard lock, so readers never see one without the other.
#[derive(Default)]
pub struct InMemoryChatStore {
    sessions: DashMap<String, SessionEntry>,
}

impl InMemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChatStore for InMemoryChatStore {
    async fn create_session(&self, user_id: &str, title: Option<String>) -> Result<ChatSession, StoreError> {
        let now = Utc::now();
        let session = ChatSession {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            title: title
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| default_title(now)),
            created_at: now,
            updated_at: now,
        };
        self.sessions.insert(
            session.id.clone(),
            SessionEntry {
                session: session.clone(),
                messages: Vec::new(),
            },
        );
        debug!("Created session {} for {}", session.id, user_id);
        Ok(session)
    }

    async fn get_session(&self, user_id: &str, session_id: &str) -> Result<ChatSession, StoreError> {
        self.sessions
            .get(session_id)
            .filter(|entry| entry.session.user_id == user_id)
            .map(|entry| entry.session.clone())
            .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))
    }

    async fn add_message(&self, message: ChatMessage) -> Result<ChatMessage, StoreError> {
        let mut entry = self
            .sessions
            .get_mut(&message.session_id)
            .ok_or_else(|| StoreError::SessionNotFound(message.session_id.clone()))?;
        entry.session.updated_at = message.created_at;
        entry.messages.push(message.clone());
        Ok(message)
    }

    async fn messages(&self, session_id: &str) -> Result<Vec<ChatMessage>, StoreError> {
        self.sessions
            .get(session_id)
            .map(|entry| entry.messages.clone())
            .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))
    }

    async fn recent_messages(&self, session_id: &str, limit: usize) -> Result<Vec<ChatMessage>, StoreError> {
        let entry = self
            .sessions
            .get(session_id)
            .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))?;
        let start = entry.messages.len().saturating_sub(limit);
        Ok(entry.messages[start..].to_vec())
    }
}

/// Supabase tables `chat_sessions` and `chat_messages` over PostgREST.
pub struct SupabaseChatStore {
    client: Postgrest,
}

#[derive(Serialize)]
struct SessionTouch {
    updated_at: DateTime<Utc>,
}

impl SupabaseChatStore {
    pub fn new(settings: &SupabaseSettings) -> Self {
        info!("Using Supabase chat store at {}", settings.url);
        let client = Postgrest::new(settings.url.clone())
            .insert_header("apikey", settings.key.clone())
            .insert_header("Authorization", format!("Bearer {}", settings.key));
        Self { client }
    }

    async fn fetch<T: for<'de> Deserialize<'de>>(
        request: postgrest::Builder,
    ) -> Result<Vec<T>, StoreError> {
        let response = request
            .execute()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        if !status.is_success() {
            return Err(StoreError::Backend(format!("{}: {}", status.as_u16(), body)));
        }
        Ok(serde_json::from_str(&body)?)
    }
}

#[async_trait]
impl ChatStore for SupabaseChatStore {
    async fn create_session(&self, user_id: &str, title: Option<String>) -> Result<ChatSession, StoreError> {
        let now = Utc::now();
        let session = ChatSession {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            title: title
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| default_title(now)),
            created_at: now,
            updated_at: now,
        };
        let body = serde_json::to_string(&session)?;
        Self::fetch::<ChatSession>(self.client.from(SESSIONS_TABLE).insert(body)).await?;
        Ok(session)
    }

    async fn get_session(&self, user_id: &str, session_id: &str) -> Result<ChatSession, StoreError> {
        let rows: Vec<ChatSession> = Self::fetch(
            self.client
                .from(SESSIONS_TABLE)
                .select("*")
                .eq("id", session_id)
                .eq("user_id", user_id),
        )
        .await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))
    }

    async fn add_message(&self, message: ChatMessage) -> Result<ChatMessage, StoreError> {
        let body = serde_json::to_string(&message)?;
        Self::fetch::<ChatMessage>(self.client.from(MESSAGES_TABLE).insert(body)).await?;

        let touch = serde_json::to_string(&SessionTouch {
            updated_at: message.created_at,
        })?;
        Self::fetch::<ChatSession>(
            self.client
                .from(SESSIONS_TABLE)
                .eq("id", &message.session_id)
                .update(touch),
        )
        .await?;
        Ok(message)
    }

    async fn messages(&self, session_id: &str) -> Result<Vec<ChatMessage>, StoreError> {
        Self::fetch(
            self.client
                .from(MESSAGES_TABLE)
                .select("*")
                .eq("session_id", session_id)
                .order("created_at.asc"),
        )
        .await
    }

    async fn recent_messages(&self, session_id: &str, limit: usize) -> Result<Vec<ChatMessage>, StoreError> {
        let mut rows: Vec<ChatMessage> = Self::fetch(
            self.client
                .from(MESSAGES_TABLE)
                .select("*")
                .eq("session_id", session_id)
                .order("created_at.desc")
                .limit(limit),
        )
        .await?;
        rows.reverse();
        Ok(rows)
    }
}
