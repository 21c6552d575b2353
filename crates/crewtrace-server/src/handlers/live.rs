//! Live update channel over WebSocket.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use serde::Serialize;
use tracing::{debug, error, info};

use crate::dto::LiveParams;
use crate::ServerState;

async fn send_json<T: Serialize>(sender: &mut SplitSink<WebSocket, Message>, data: &T) -> bool {
    let Ok(json) = serde_json::to_string(data) else {
        error!("JSON serialization failed");
        return false;
    };
    sender.send(Message::Text(json.into())).await.is_ok()
}

/// GET /ws?run_id= - Upgrade to a live update stream.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ServerState>>,
    Query(params): Query<LiveParams>,
) -> impl IntoResponse {
    let run_id = params.run_id.filter(|r| !r.is_empty());
    ws.on_upgrade(move |socket| handle_socket(socket, state, run_id))
}

async fn handle_socket(socket: WebSocket, state: Arc<ServerState>, run_id: Option<String>) {
    let (mut sender, mut receiver) = socket.split();
    let subscription = state.broadcaster.subscribe(run_id.clone());
    info!(run_id = ?run_id, "Live connection opened");

    loop {
        tokio::select! {
            message = subscription.next() => {
                if !send_json(&mut sender, &message).await {
                    break;
                }
            }
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(other)) => debug!("Ignoring client message: {:?}", other),
            },
        }
    }

    info!(run_id = ?run_id, "Live connection closed");
}
