//! WebSocket adapter for the relay.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{future, SinkExt, StreamExt};

use super::relay::{relay, RelayError};
use crate::supervisor::SessionManager;

/// Run the relay over an upgraded socket until the client goes away.
pub async fn handle_websocket(
    socket: WebSocket,
    session: Arc<SessionManager>,
    poll_interval: Duration,
) {
    let (ws_sender, ws_receiver) = socket.split();

    let sink = Box::pin(
        ws_sender.with(|text: String| async move { Ok::<_, axum::Error>(Message::Text(text.into())) }),
    );
    let stream = Box::pin(
        ws_receiver
            .take_while(|result| {
                if let Err(e) = result {
                    tracing::debug!(error = %e, "WebSocket error");
                }
                future::ready(matches!(result, Ok(msg) if !matches!(msg, Message::Close(_))))
            })
            .filter_map(|result| async move {
                match result {
                    Ok(Message::Text(text)) => Some(text.as_str().to_owned()),
                    // pings are answered by axum
                    _ => None,
                }
            }),
    );

    tracing::info!("Client connected");
    match relay(session, sink, stream, poll_interval).await {
        Ok(()) => {}
        Err(RelayError::Send(e)) => {
            tracing::info!(error = %e, "Client unreachable, unsent messages kept");
        }
        Err(e) => tracing::error!(error = %e, "Relay failed"),
    }
    tracing::info!("Client disconnected");
}
