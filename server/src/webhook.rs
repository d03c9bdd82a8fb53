//! Identity provider lifecycle events.
//!
//! Signature verification happens upstream. When a webhook secret is
//! configured, requests must echo it in the `x-webhook-secret` header.

use axum::{extract::State, http::HeaderMap, http::StatusCode, response::IntoResponse, Json};
use parley_core::ChatError;
use serde::Deserialize;
use tracing::info;

use crate::api::{ApiResult, AppState};

pub const SECRET_HEADER: &str = "x-webhook-secret";

#[derive(Debug, Deserialize, PartialEq, Eq)]
pub struct UserData {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub image_url: Option<String>,
}

#[derive(Debug, Deserialize, PartialEq, Eq)]
pub struct DeletedUser {
    pub id: String,
}

#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "data")]
pub enum IdentityEvent {
    #[serde(rename = "user.created")]
    Created(UserData),
    #[serde(rename = "user.updated")]
    Updated(UserData),
    #[serde(rename = "user.deleted")]
    Deleted(DeletedUser),
}

pub async fn identity_events(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(event): Json<IdentityEvent>,
) -> ApiResult<impl IntoResponse> {
    if let Some(secret) = &state.config.webhook_secret {
        let presented = headers.get(SECRET_HEADER).and_then(|v| v.to_str().ok());
        if presented != Some(secret.expose().as_str()) {
            return Err(ChatError::Unauthorized.into());
        }
    }
    match event {
        IdentityEvent::Created(user) | IdentityEvent::Updated(user) => {
            state
                .chat
                .upsert_user(&user.id, &user.username, user.image_url.as_deref())?;
        }
        IdentityEvent::Deleted(user) => {
            if state.chat.remove_user(&user.id)?.is_none() {
                info!(subject = %user.id, "delete event for unknown user");
            }
        }
    }
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_decode_by_type() {
        let created: IdentityEvent = serde_json::from_str(
            r#"{"type":"user.created","data":{"id":"user_1","username":"alice","image_url":null}}"#,
        )
        .unwrap();
        assert_eq!(
            created,
            IdentityEvent::Created(UserData {
                id: "user_1".into(),
                username: "alice".into(),
                image_url: None,
            })
        );
        let deleted: IdentityEvent =
            serde_json::from_str(r#"{"type":"user.deleted","data":{"id":"user_1","deleted":true}}"#)
                .unwrap();
        assert_eq!(
            deleted,
            IdentityEvent::Deleted(DeletedUser {
                id: "user_1".into()
            })
        );
        assert!(serde_json::from_str::<IdentityEvent>(r#"{"type":"session.created","data":{}}"#).is_err());
    }
}
