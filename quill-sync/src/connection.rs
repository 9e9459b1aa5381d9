//! Outbound handles for live sockets.
//!
//! The socket task owns the WebSocket; everything else talks to it through
//! an unbounded channel of serialized frames.

use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::envelope::{Admission, MessageCounters, Resend};
use crate::protocol::{Envelope, ServerMessage, SpaceServerMessage};

pub type ConnectionId = Uuid;

/// A document-namespace connection. Every frame is stamped with the
/// connection's message counters.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    counters: Mutex<MessageCounters>,
    outbound: mpsc::UnboundedSender<String>,
}

impl Connection {
    pub fn new(outbound: mpsc::UnboundedSender<String>, replay_capacity: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            counters: Mutex::new(MessageCounters::new(replay_capacity)),
            outbound,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The id clients see in `doc_info.session_id` and participant lists.
    pub fn session_id(&self) -> String {
        self.id.to_string()
    }

    /// Stamps and queues `message`. The counter lock is held until the
    /// frame is queued so frames leave in counter order.
    pub async fn send(&self, message: ServerMessage) {
        let mut counters = self.counters.lock().await;
        let (c, s) = counters.record(message.clone());
        let envelope = Envelope {
            message: &message,
            c,
            s,
        };
        match serde_json::to_string(&envelope) {
            Ok(frame) => {
                if self.outbound.send(frame).is_err() {
                    log::debug!("Dropping message for closed connection {}", self.id);
                }
            }
            Err(e) => log::error!("Failed to encode message for {}: {e}", self.id),
        }
    }

    /// Checks an inbound frame's counters and advances the client counter
    /// when it is the next one expected.
    pub async fn admit(&self, c: u64, s: u64) -> Admission {
        self.counters.lock().await.admit(c, s)
    }

    /// Frames to resend after the client asks for everything from `from`.
    pub async fn rewind(&self, from: u64) -> Resend {
        self.counters.lock().await.rewind(from)
    }

    /// Current `(client, server)` counters.
    pub async fn counters(&self) -> (u64, u64) {
        let counters = self.counters.lock().await;
        (counters.client(), counters.server())
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }
}

/// A space-namespace connection. Frames go out unwrapped.
#[derive(Debug, Clone)]
pub struct SpaceConnection {
    id: ConnectionId,
    outbound: mpsc::UnboundedSender<String>,
}

impl SpaceConnection {
    pub fn new(outbound: mpsc::UnboundedSender<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            outbound,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn send(&self, message: &SpaceServerMessage) {
        match serde_json::to_string(message) {
            Ok(frame) => {
                self.send_raw(frame);
            }
            Err(e) => log::error!("Failed to encode space message for {}: {e}", self.id),
        }
    }

    /// Queues an already encoded frame. Returns false once the socket is gone.
    pub fn send_raw(&self, frame: String) -> bool {
        self.outbound.send(frame).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[tokio::test]
    async fn test_send_stamps_envelope() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = Connection::new(tx, 4);
        assert_eq!(conn.admit(1, 0).await, Admission::Accept);

        conn.send(ServerMessage::Welcome).await;
        conn.send(ServerMessage::ConfirmDiff { rid: 3 }).await;

        let first: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        let second: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(first["type"], "welcome");
        assert_eq!(first["s"], 1);
        assert_eq!(second["rid"], 3);
        assert_eq!(second["c"], 1);
        assert_eq!(second["s"], 2);
        assert_eq!(conn.counters().await, (1, 2));
    }

    #[tokio::test]
    async fn test_send_after_close_is_silent() {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Connection::new(tx, 4);
        drop(rx);
        assert!(conn.is_closed());
        conn.send(ServerMessage::Welcome).await;
    }

    #[test]
    fn test_space_connection_send() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = SpaceConnection::new(tx);
        conn.send(&SpaceServerMessage::Welcome);
        assert_eq!(rx.try_recv().unwrap(), r#"{"type":"welcome"}"#);
    }
}
