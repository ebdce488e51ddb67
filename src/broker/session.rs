use tokio::sync::mpsc::UnboundedSender;
use tungstenite::protocol::Message as WsMessage;
use uuid::Uuid;

use crate::transport::message::{DeliveryTag, ServerFrame};

pub type SessionId = String;

/// A connection attached to the broker.
///
/// Each session is uniquely identified by an `id` and has a channel
/// (`sender`) the broker uses to push frames to the connection. Delivery
/// tags are allocated per session and never reused.
#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub sender: UnboundedSender<WsMessage>,
    next_delivery_tag: DeliveryTag,
}

impl Session {
    pub fn new(sender: UnboundedSender<WsMessage>) -> Self {
        Self {
            id: format!("session-{}", Uuid::new_v4()),
            sender,
            next_delivery_tag: 1,
        }
    }

    pub fn next_delivery_tag(&mut self) -> DeliveryTag {
        let tag = self.next_delivery_tag;
        self.next_delivery_tag += 1;
        tag
    }

    /// Serializes and queues a frame for the connection. Returns `false` if
    /// the connection's send loop is gone.
    pub fn send(&self, frame: &ServerFrame) -> bool {
        match serde_json::to_string(frame) {
            Ok(json) => self.sender.send(WsMessage::text(json)).is_ok(),
            Err(e) => {
                tracing::error!(session = %self.id, "failed to serialize frame: {e}");
                false
            }
        }
    }
}
