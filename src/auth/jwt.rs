use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};

use super::types::{AuthError, AuthResponse, Claims};

pub const TOKEN_TTL_SECS: usize = 3600;

pub fn generate_token(subject: &str, secret: &str) -> Result<AuthResponse, AuthError> {
    let now = Utc::now().timestamp().max(0) as usize;

    let claims = Claims {
        sub: subject.to_string(),
        exp: now + TOKEN_TTL_SECS,
        iat: now,
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AuthError::TokenCreation(e.to_string()))?;

    Ok(AuthResponse {
        token,
        expires_in: TOKEN_TTL_SECS,
    })
}

pub fn verify_token(token: &str, secret: &str) -> Result<Claims, AuthError> {
    let validation = Validation::default();

    match decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    ) {
        Ok(data) => Ok(data.claims),
        Err(e) => match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => Err(AuthError::Expired),
            _ => Err(AuthError::TokenVerification(e.to_string())),
        },
    }
}
