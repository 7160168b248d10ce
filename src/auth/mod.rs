mod types;
pub mod jwt;

pub use types::*;

use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts},
    http::{header::AUTHORIZATION, request::Parts},
};
use axum_extra::extract::cookie::CookieJar;
use std::sync::Arc;

use crate::error::ApiError;

/// HS256 secret shared by the token helpers and the extractor.
#[derive(Clone)]
pub struct JwtSecret(pub Arc<String>);

/// The authenticated caller. `user_id` is the token subject and owns sessions.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: String,
}

fn bearer_token(parts: &Parts) -> Option<String> {
    if let Some(value) = parts.headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        if let Some(token) = value.strip_prefix("Bearer ") {
            return Some(token.trim().to_string());
        }
    }
    CookieJar::from_headers(&parts.headers)
        .get(AUTH_COOKIE_NAME)
        .map(|cookie| cookie.value().to_string())
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
    JwtSecret: FromRef<S>,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let secret = JwtSecret::from_ref(state);
        let token = bearer_token(parts).ok_or(AuthError::MissingToken)?;
        let claims = jwt::verify_token(&token, &secret.0)?;
        Ok(AuthUser { user_id: claims.sub })
    }
}
