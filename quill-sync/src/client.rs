//! Minimal WebSocket clients for both namespaces.
//!
//! Used by the integration tests and handy for poking a running server.
//! The document client keeps the envelope counters the way an editor
//! would: `c` counts what it sent, `s` tracks the last server counter it
//! has seen.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::error::SyncError;
use crate::protocol::{
    ClientMessage, DiffMessage, Envelope, ProtocolError, ServerMessage, SpaceClientMessage,
    SpaceServerMessage, SpaceSubscribe, SubscribePayload,
};

pub const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// A text socket split into a writer and a reader task.
struct Socket {
    outgoing: mpsc::UnboundedSender<String>,
    incoming: mpsc::UnboundedReceiver<String>,
    tasks: [JoinHandle<()>; 2],
}

impl Socket {
    async fn connect(url: &str) -> Result<Self, SyncError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<String>();
        let (incoming_tx, incoming) = mpsc::unbounded_channel();

        let writer = tokio::spawn(async move {
            while let Some(text) = outgoing_rx.recv().await {
                if ws_sender.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_sender.close().await;
        });
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_receiver.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if incoming_tx.send(text.to_string()).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        });

        Ok(Self {
            outgoing,
            incoming,
            tasks: [writer, reader],
        })
    }

    fn send_text(&self, text: String) -> Result<(), SyncError> {
        self.outgoing
            .send(text)
            .map_err(|_| SyncError::Service("socket closed".to_string()))
    }

    async fn recv_text(&mut self, wait: Duration) -> Option<String> {
        timeout(wait, self.incoming.recv()).await.ok().flatten()
    }

    fn close(self) {
        drop(self.outgoing);
        let [_, reader] = self.tasks;
        reader.abort();
    }
}

fn encode<T: Serialize>(value: &T) -> Result<String, SyncError> {
    Ok(serde_json::to_string(value).map_err(ProtocolError::from)?)
}

fn decode<T: DeserializeOwned>(text: &str) -> Option<T> {
    match serde_json::from_str(text) {
        Ok(value) => Some(value),
        Err(e) => {
            log::warn!("Client could not decode frame: {e}");
            None
        }
    }
}

// ---------------------------------------------------------------
// Document namespace
// ---------------------------------------------------------------

/// A document-namespace client that keeps the envelope counters the way a
/// browser editor does.
pub struct SyncClient {
    socket: Socket,
    c: u64,
    s: u64,
}

impl SyncClient {
    pub async fn connect(url: &str) -> Result<Self, SyncError> {
        Ok(Self {
            socket: Socket::connect(url).await?,
            c: 0,
            s: 0,
        })
    }

    /// `(sent, last seen server counter)`.
    pub fn counters(&self) -> (u64, u64) {
        (self.c, self.s)
    }

    /// Bumps the client counter and sends `message` stamped with it.
    pub fn send(&mut self, message: &ClientMessage) -> Result<(), SyncError> {
        self.c += 1;
        self.send_with_counters(message, self.c, self.s)
    }

    /// Sends with explicit counters, leaving the client's own untouched.
    pub fn send_with_counters(&self, message: &ClientMessage, c: u64, s: u64) -> Result<(), SyncError> {
        self.socket.send_text(encode(&Envelope { message, c, s })?)
    }

    /// Sends a frame verbatim, without counters.
    pub fn send_raw(&self, text: impl Into<String>) -> Result<(), SyncError> {
        self.socket.send_text(text.into())
    }

    pub fn subscribe(&mut self, page_id: Uuid, auth_token: &str, connection: Option<u64>) -> Result<(), SyncError> {
        self.send(&ClientMessage::Subscribe(SubscribePayload {
            room_id: page_id.to_string(),
            auth_token: auth_token.to_string(),
            connection,
        }))
    }

    pub fn send_diff(&mut self, diff: DiffMessage) -> Result<(), SyncError> {
        self.send(&ClientMessage::Diff(diff))
    }

    pub async fn recv(&mut self) -> Option<ServerMessage> {
        self.recv_timeout(DEFAULT_RECV_TIMEOUT).await
    }

    /// Next frame, or `None` after `wait`. Records the server counter it
    /// carries.
    pub async fn recv_timeout(&mut self, wait: Duration) -> Option<ServerMessage> {
        let text = self.socket.recv_text(wait).await?;
        if let Some(s) = serde_json::from_str::<serde_json::Value>(&text)
            .ok()
            .and_then(|value| value.get("s").and_then(serde_json::Value::as_u64))
        {
            self.s = self.s.max(s);
        }
        decode(&text)
    }

    /// Receives until `pred` matches, dropping everything before it.
    pub async fn recv_until<F>(&mut self, mut pred: F) -> Option<ServerMessage>
    where
        F: FnMut(&ServerMessage) -> bool,
    {
        while let Some(message) = self.recv().await {
            if pred(&message) {
                return Some(message);
            }
        }
        None
    }

    pub fn close(self) {
        self.socket.close();
    }
}

// ---------------------------------------------------------------
// Space namespace
// ---------------------------------------------------------------

/// A space-namespace client. Space frames carry no counters.
pub struct SpaceClient {
    socket: Socket,
}

impl SpaceClient {
    pub async fn connect(url: &str) -> Result<Self, SyncError> {
        Ok(Self {
            socket: Socket::connect(url).await?,
        })
    }

    pub fn send(&self, message: &SpaceClientMessage) -> Result<(), SyncError> {
        self.socket.send_text(encode(message)?)
    }

    pub fn subscribe(&self, space_id: Uuid, auth_token: &str) -> Result<(), SyncError> {
        self.send(&SpaceClientMessage::Subscribe {
            payload: SpaceSubscribe {
                auth_token: auth_token.to_string(),
                space_id,
            },
        })
    }

    pub async fn recv(&mut self) -> Option<SpaceServerMessage> {
        self.recv_timeout(DEFAULT_RECV_TIMEOUT).await
    }

    pub async fn recv_timeout(&mut self, wait: Duration) -> Option<SpaceServerMessage> {
        let text = self.socket.recv_text(wait).await?;
        decode(&text)
    }

    pub async fn recv_until<F>(&mut self, mut pred: F) -> Option<SpaceServerMessage>
    where
        F: FnMut(&SpaceServerMessage) -> bool,
    {
        while let Some(message) = self.recv().await {
            if pred(&message) {
                return Some(message);
            }
        }
        None
    }

    pub fn close(self) {
        self.socket.close();
    }
}
