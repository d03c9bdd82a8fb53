use anyhow::Result;
use axum::{
    extract::State,
    http::{header, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use parley_core::{ChatError, Identity};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::api::{ApiError, AppState};

/// Claims carried by identity provider tokens. `sub` is the external user id.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
}

/// Issue a JWT for a given subject valid for the provided duration.
pub fn issue_jwt(secret: &[u8], sub: &str, valid_for: Duration) -> Result<String> {
    let exp = (OffsetDateTime::now_utc() + valid_for).unix_timestamp() as usize;
    let claims = Claims {
        sub: sub.into(),
        exp,
    };
    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret),
    )?;
    Ok(token)
}

/// Verify a JWT and return its claims if valid.
pub fn verify_jwt(secret: &[u8], token: &str) -> Result<Claims> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;
    validation.leeway = 0;
    let data = decode::<Claims>(token, &DecodingKey::from_secret(secret), &validation)?;
    if data.claims.sub.is_empty() {
        anyhow::bail!("missing subject");
    }
    Ok(data.claims)
}

/// Bearer token from an `Authorization` header value.
fn bearer(value: &str) -> Option<&str> {
    value.strip_prefix("Bearer ").map(str::trim)
}

/// Reject requests without a valid bearer token; otherwise attach the
/// caller's [`Identity`] for the handlers.
pub async fn require_identity<B>(
    State(state): State<AppState>,
    mut req: Request<B>,
    next: Next<B>,
) -> Response {
    let claims = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer)
        .and_then(|token| verify_jwt(&state.jwt_secret, token).ok());
    match claims {
        Some(claims) => {
            req.extensions_mut().insert(Identity::new(claims.sub));
            next.run(req).await
        }
        None => ApiError::from(ChatError::Unauthorized).into_response(),
    }
}
