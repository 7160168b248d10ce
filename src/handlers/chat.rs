use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use log::info;
use serde::{Deserialize, Serialize};

use crate::auth::AuthUser;
use crate::chat_store::{ChatMessage, ChatSession};
use crate::error::ApiError;
use crate::state::AppState;
use crate::streaming::conversation_history;
use crate::types::{AgentResponse, ChatRole};

#[derive(Debug, Default, Deserialize)]
pub struct CreateSessionRequest {
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MessageRequest {
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct SessionWithMessages {
    #[serde(flatten)]
    pub session: ChatSession,
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Serialize)]
pub struct MessageExchange {
    pub user_message: ChatMessage,
    pub assistant_message: ChatMessage,
    pub response: AgentResponse,
}

pub async fn create_session(
    State(state): State<AppState>,
    user: AuthUser,
    request: Option<Json<CreateSessionRequest>>,
) -> Result<(StatusCode, Json<ChatSession>), ApiError> {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    let session = state.store.create_session(&user.user_id, request.title).await?;
    info!("Created session {} for {}", session.id, user.user_id);
    Ok((StatusCode::CREATED, Json(session)))
}

pub async fn get_session(
    State(state): State<AppState>,
    user: AuthUser,
    Path(session_id): Path<String>,
) -> Result<Json<SessionWithMessages>, ApiError> {
    let session = state.store.get_session(&user.user_id, &session_id).await?;
    let messages = state.store.messages(&session_id).await?;
    Ok(Json(SessionWithMessages { session, messages }))
}

/// Checks ownership and persists the user's message before any pipeline work.
pub(crate) async fn store_user_message(
    state: &AppState,
    user: &AuthUser,
    session_id: &str,
    request: MessageRequest,
) -> Result<ChatMessage, ApiError> {
    let content = request.content.trim();
    if content.is_empty() {
        return Err(ApiError::BadRequest("Message content must not be empty".to_string()));
    }
    state.store.get_session(&user.user_id, session_id).await?;
    let message = ChatMessage::new(session_id, ChatRole::User, content, Vec::new());
    Ok(state.store.add_message(message).await?)
}

pub async fn post_message(
    State(state): State<AppState>,
    user: AuthUser,
    Path(session_id): Path<String>,
    Json(request): Json<MessageRequest>,
) -> Result<Json<MessageExchange>, ApiError> {
    let user_message = store_user_message(&state, &user, &session_id, request).await?;
    let history = conversation_history(
        state.store.as_ref(),
        &session_id,
        &user_message.id,
        state.history_turns,
    )
    .await?;

    let response = state.rag.process_query(&user_message.content, &history).await;

    let assistant_message = state
        .store
        .add_message(ChatMessage::new(
            &session_id,
            ChatRole::Assistant,
            response.response.clone(),
            response.citations.clone(),
        ))
        .await?;

    Ok(Json(MessageExchange {
        user_message,
        assistant_message,
        response,
    }))
}
