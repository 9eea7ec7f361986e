use crate::hub::{ConnectionId, Registry};
use crate::metrics::Metrics;
use crate::state::Subscription;
use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The only inbound message a dashboard client sends.
#[derive(Debug, Deserialize)]
pub struct ClientMessage {
    pub tab: String,
}

pub fn parse_client_message(text: &str) -> Result<Subscription, serde_json::Error> {
    let msg: ClientMessage = serde_json::from_str(text)?;
    Ok(Subscription::from_tab(&msg.tab))
}

/// Serves one WebSocket for its whole life: forwards queued payloads to the
/// client and applies subscription changes. Leaving this function is the only
/// place a connection is unregistered.
pub async fn handle_socket(socket: WebSocket, registry: Arc<Registry>, metrics: Arc<Metrics>) {
    let (conn_id, mut outbound) = registry.register().await;
    metrics.connection_opened();
    info!(connection_id = conn_id, "dashboard client connected");

    let (mut ws_tx, mut ws_rx) = socket.split();

    loop {
        tokio::select! {
            payload = outbound.recv() => {
                let Some(payload) = payload else {
                    break;
                };
                if let Err(err) = ws_tx.send(Message::Text(payload)).await {
                    warn!(connection_id = conn_id, error = %err, "failed to send payload");
                    break;
                }
            }
            inbound = ws_rx.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        apply_client_text(conn_id, &text, &registry, &metrics).await;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        metrics.inc_inbound_ignored();
                        warn!(connection_id = conn_id, "binary message ignored");
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(connection_id = conn_id, "client closed");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        debug!(connection_id = conn_id, error = %err, "websocket read error");
                        break;
                    }
                }
            }
        }
    }

    if registry.unregister(conn_id).await {
        metrics.connection_closed();
    }
    info!(connection_id = conn_id, "dashboard client disconnected");
}

async fn apply_client_text(
    conn_id: ConnectionId,
    text: &str,
    registry: &Registry,
    metrics: &Metrics,
) {
    match parse_client_message(text) {
        Ok(subscription) => {
            registry.set_subscription(conn_id, subscription).await;
        }
        Err(err) => {
            metrics.inc_inbound_ignored();
            warn!(connection_id = conn_id, error = %err, "malformed client message ignored");
        }
    }
}
