//! Access tokens for LiveKit voice rooms. Every server has one room, named
//! after the server id.

use anyhow::Result;
use axum::{
    extract::{Extension, Path, State},
    response::IntoResponse,
    Json,
};
use jsonwebtoken::{encode, EncodingKey, Header};
use parley_core::Identity;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::api::{ApiError, ApiResult, AppState};
use crate::config::VoiceConfig;

const TOKEN_TTL: Duration = Duration::hours(6);

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VideoGrant {
    pub room: String,
    pub room_join: bool,
    pub can_publish: bool,
    pub can_subscribe: bool,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct VoiceClaims {
    pub iss: String,
    pub sub: String,
    pub name: String,
    pub nbf: usize,
    pub exp: usize,
    pub video: VideoGrant,
}

pub fn issue_token(
    cfg: &VoiceConfig,
    room: &str,
    username: &str,
    now: OffsetDateTime,
) -> Result<String> {
    let claims = VoiceClaims {
        iss: cfg.api_key.clone(),
        sub: username.to_string(),
        name: username.to_string(),
        nbf: now.unix_timestamp() as usize,
        exp: (now + TOKEN_TTL).unix_timestamp() as usize,
        video: VideoGrant {
            room: room.to_string(),
            room_join: true,
            can_publish: true,
            can_subscribe: true,
        },
    };
    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(cfg.api_secret.expose().as_bytes()),
    )?;
    Ok(token)
}

#[derive(Serialize)]
struct VoiceTokenResp {
    token: String,
    url: String,
}

pub async fn voice_token(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(server_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let server = state.chat.get_server(&identity, &server_id)?;
    let cfg = state
        .config
        .voice
        .as_ref()
        .ok_or(ApiError::VoiceUnavailable)?;
    let user = state.chat.me(&identity)?;
    let token = issue_token(
        cfg,
        &server.server.id.to_string(),
        &user.username,
        OffsetDateTime::now_utc(),
    )?;
    Ok(Json(VoiceTokenResp {
        token,
        url: cfg.url.clone(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Secret;
    use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};

    #[test]
    fn token_grants_the_server_room() {
        let cfg = VoiceConfig {
            url: "wss://voice.example.org".into(),
            api_key: "APIkey".into(),
            api_secret: Secret::new("topsecret".into()),
        };
        let now = OffsetDateTime::now_utc();
        let token = issue_token(&cfg, "room-1", "alice", now).unwrap();
        let data = decode::<VoiceClaims>(
            &token,
            &DecodingKey::from_secret(b"topsecret"),
            &Validation::new(Algorithm::HS256),
        )
        .unwrap();
        assert_eq!(data.claims.iss, "APIkey");
        assert_eq!(data.claims.sub, "alice");
        assert_eq!(data.claims.video.room, "room-1");
        assert!(data.claims.video.room_join);
        assert_eq!(data.claims.exp - data.claims.nbf, 6 * 60 * 60);
    }
}
