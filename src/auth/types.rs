use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const AUTH_COOKIE_NAME: &str = "psych_agent_auth";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AuthResponse {
    pub token: String,
    pub expires_in: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
    pub iat: usize,
}

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Failed to create token: {0}")]
    TokenCreation(String),

    #[error("Failed to verify token: {0}")]
    TokenVerification(String),

    #[error("Token has expired")]
    Expired,

    #[error("Missing bearer token")]
    MissingToken,
}
