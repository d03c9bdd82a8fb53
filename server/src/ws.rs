use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::{
    extract::{Extension, State},
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use parley_core::{ChatError, Identity};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::{debug, warn};

use crate::api::AppState;

/// Upgrade to a websocket that streams change notifications as JSON text
/// frames, so clients know when to re-run their queries. Only changes the
/// caller could read through the API are forwarded.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, identity))
}

async fn handle_socket(stream: WebSocket, state: AppState, identity: Identity) {
    let (mut sender, mut receiver) = stream.split();
    let mut changes = BroadcastStream::new(state.chat.subscribe());
    debug!(subject = %identity.as_str(), "change feed opened");
    loop {
        tokio::select! {
            change = changes.next() => match change {
                Some(Ok(change)) => {
                    match state.chat.may_observe(&identity, &change) {
                        Ok(true) => {}
                        Ok(false) => continue,
                        Err(ChatError::Unauthorized) => break,
                        Err(e) => {
                            warn!("change feed visibility check failed: {e}");
                            continue;
                        }
                    }
                    let Ok(text) = serde_json::to_string(&change) else { continue };
                    if sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Some(Err(BroadcastStreamRecvError::Lagged(n))) => {
                    warn!(skipped = n, "change feed lagging");
                }
                None => break,
            },
            msg = receiver.next() => match msg {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }
    debug!(subject = %identity.as_str(), "change feed closed");
}
