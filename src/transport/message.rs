//! Wire frames exchanged between a connection and the broker.
//!
//! Every frame is a JSON object tagged by `"type"`. Requests that expect an
//! answer carry a `request_id` chosen by the client; the broker echoes it in
//! the matching `*_ok` or `error` frame. `ack` and `nack` are fire-and-forget.
//! All frames except `error` name the channel they belong to.

use serde::{Deserialize, Serialize};

pub type ChannelId = u16;
pub type RequestId = u64;
pub type DeliveryTag = u64;

/// Parameters of a queue declaration. Two declarations of the same queue
/// must agree on all three flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl QueueOptions {
    /// Durable, shared, never auto-deleted. The only shape the messaging
    /// layer declares.
    pub const DURABLE: QueueOptions = QueueOptions {
        durable: true,
        exclusive: false,
        auto_delete: false,
    };
}

impl std::fmt::Display for QueueOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "durable={} exclusive={} auto_delete={}",
            self.durable, self.exclusive, self.auto_delete
        )
    }
}

/// Message metadata and body as published and as delivered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageProperties {
    pub message_id: String,
    /// Milliseconds since the UNIX epoch, stamped by the publisher.
    pub timestamp: i64,
    pub content_type: String,
    pub persistent: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotFound,
    PreconditionFailed,
    ResourceLocked,
    UnknownDeliveryTag,
    InvalidFrame,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Declare {
        request_id: RequestId,
        channel: ChannelId,
        queue: String,
        options: QueueOptions,
    },
    Publish {
        request_id: RequestId,
        channel: ChannelId,
        queue: String,
        properties: MessageProperties,
        body: String,
    },
    Consume {
        request_id: RequestId,
        channel: ChannelId,
        queue: String,
        consumer_tag: String,
        prefetch: u16,
    },
    Cancel {
        request_id: RequestId,
        channel: ChannelId,
        consumer_tag: String,
    },
    CloseChannel {
        request_id: RequestId,
        channel: ChannelId,
    },
    Ack {
        channel: ChannelId,
        delivery_tag: DeliveryTag,
    },
    Nack {
        channel: ChannelId,
        delivery_tag: DeliveryTag,
        requeue: bool,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    DeclareOk {
        request_id: RequestId,
        queue: String,
        message_count: usize,
        consumer_count: usize,
    },
    PublishOk {
        request_id: RequestId,
    },
    ConsumeOk {
        request_id: RequestId,
        consumer_tag: String,
    },
    CancelOk {
        request_id: RequestId,
    },
    CloseOk {
        request_id: RequestId,
    },
    Error {
        request_id: Option<RequestId>,
        code: ErrorCode,
        message: String,
    },
    Deliver {
        channel: ChannelId,
        consumer_tag: String,
        delivery_tag: DeliveryTag,
        redelivered: bool,
        queue: String,
        properties: MessageProperties,
        body: String,
    },
}

impl ServerFrame {
    /// The request this frame answers, if it answers one.
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            Self::DeclareOk { request_id, .. }
            | Self::PublishOk { request_id }
            | Self::ConsumeOk { request_id, .. }
            | Self::CancelOk { request_id }
            | Self::CloseOk { request_id } => Some(*request_id),
            Self::Error { request_id, .. } => *request_id,
            Self::Deliver { .. } => None,
        }
    }
}
