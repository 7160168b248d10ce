use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::stream::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc as tokio_mpsc;

use super::chat::{store_user_message, MessageRequest};
use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::state::AppState;
use crate::streaming::StreamEvent;

/// Adapts the streamer's channel to axum's SSE body. Each event is framed as
/// `data: {"type": ..., "data": ...}`.
pub struct SseStream {
    pub receiver: tokio_mpsc::Receiver<StreamEvent>,
}

impl Stream for SseStream {
    type Item = Result<Event, axum::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver
            .poll_recv(cx)
            .map(|event| event.map(|event| Event::default().json_data(event)))
    }
}

pub async fn stream_message(
    State(state): State<AppState>,
    user: AuthUser,
    Path(session_id): Path<String>,
    Json(request): Json<MessageRequest>,
) -> Result<Sse<SseStream>, ApiError> {
    let user_message = store_user_message(&state, &user, &session_id, request).await?;
    let (tx, rx) = tokio_mpsc::channel(100);

    let streamer = state.streamer.clone();
    tokio::spawn(async move {
        streamer.run(user_message, tx).await;
    });

    Ok(Sse::new(SseStream { receiver: rx }).keep_alive(KeepAlive::default()))
}
