mod chat;
mod health;
mod sse;

pub use chat::*;
pub use health::*;
pub use sse::*;

use axum::{
    http::{header, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use log::warn;
use tower_http::cors::CorsLayer;

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/chat/sessions", post(create_session))
        .route("/api/chat/sessions/:id", get(get_session))
        .route("/api/chat/sessions/:id/messages", post(post_message))
        .route("/api/chat/sessions/:id/messages/stream", post(stream_message))
        .with_state(state)
}

pub fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin {}", origin);
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .allow_credentials(true)
}
