//! Dashboard live feed over WebSocket. Emission is fire-and-forget.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};

pub const MESSAGE_NEW: &str = "message:new";
pub const CONVERSATION_UPDATED: &str = "conversation:updated";
pub const LEAD_UPDATED: &str = "lead:updated";
pub const HANDOFF_CHANGED: &str = "handoff:changed";

struct Client {
    tx: mpsc::UnboundedSender<String>,
    conversation_filter: Option<String>,
}

#[derive(Default)]
pub struct Realtime {
    clients: Mutex<HashMap<usize, Client>>,
    next_client_id: AtomicUsize,
}

#[derive(Debug, Deserialize)]
struct EventEnvelopeIn {
    event: String,
    #[serde(default)]
    data: Value,
}

fn event_payload<T: Serialize>(event: &str, data: T) -> Option<String> {
    serde_json::to_string(&json!({ "event": event, "data": data })).ok()
}

impl Realtime {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(
        &self,
        conversation_filter: Option<String>,
    ) -> (usize, mpsc::UnboundedReceiver<String>) {
        let client_id = self.next_client_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::unbounded_channel::<String>();
        self.clients.lock().await.insert(
            client_id,
            Client {
                tx,
                conversation_filter,
            },
        );
        (client_id, rx)
    }

    pub async fn unregister(&self, client_id: usize) {
        self.clients.lock().await.remove(&client_id);
    }

    pub async fn client_count(&self) -> usize {
        self.clients.lock().await.len()
    }

    async fn set_filter(&self, client_id: usize, conversation_filter: Option<String>) {
        if let Some(client) = self.clients.lock().await.get_mut(&client_id) {
            client.conversation_filter = conversation_filter;
        }
    }

    /// Sends to every client watching all conversations or this one. Closed
    /// clients are pruned; nothing here can fail the caller.
    pub async fn emit<T: Serialize>(&self, event: &str, conversation_id: Option<&str>, data: T) {
        let Some(payload) = event_payload(event, data) else {
            return;
        };
        let mut clients = self.clients.lock().await;
        clients.retain(|_, client| {
            let interested = match (&client.conversation_filter, conversation_id) {
                (None, _) => true,
                (Some(filter), Some(id)) => filter == id,
                (Some(_), None) => false,
            };
            !interested || client.tx.send(payload.clone()).is_ok()
        });
    }

    pub async fn serve_socket(&self, socket: WebSocket, conversation_filter: Option<String>) {
        let (client_id, mut rx) = self.register(conversation_filter).await;
        let (mut ws_sender, mut ws_receiver) = socket.split();

        let send_task = tokio::spawn(async move {
            while let Some(payload) = rx.recv().await {
                if ws_sender.send(WsMessage::Text(payload.into())).await.is_err() {
                    break;
                }
            }
        });

        while let Some(Ok(message)) = ws_receiver.next().await {
            let text = match message {
                WsMessage::Text(text) => text.to_string(),
                WsMessage::Close(_) => break,
                _ => continue,
            };
            let Ok(envelope) = serde_json::from_str::<EventEnvelopeIn>(&text) else {
                continue;
            };
            match envelope.event.as_str() {
                "subscribe" => {
                    let filter = envelope
                        .data
                        .get("conversationId")
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    self.set_filter(client_id, filter).await;
                }
                "ping" => {
                    if let Some(client) = self.clients.lock().await.get(&client_id) {
                        if let Some(pong) = event_payload("pong", json!({})) {
                            let _ = client.tx.send(pong);
                        }
                    }
                }
                _ => {}
            }
        }

        self.unregister(client_id).await;
        send_task.abort();
        tracing::debug!(client_id, "realtime client disconnected");
    }
}
