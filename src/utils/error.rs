//! The `error` module defines the error types used within `salesbus`.
//!
//! Broker-side failures are `BrokerError`, storage failures are
//! `PersistenceError`, and everything a service sees when it talks to the
//! broker through the messaging layer is a `BusError`.

use std::time::Duration;

use thiserror::Error;

use crate::transport::message::ErrorCode;

/// Failures of the `sled` store behind durable queues.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("corrupt record in tree {tree}: {source}")]
    Corrupt {
        tree: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode record: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Errors raised by the broker engine while serving a session.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("queue '{0}' not found")]
    QueueNotFound(String),

    #[error("queue '{queue}' already declared with {existing}, requested {requested}")]
    PreconditionFailed {
        queue: String,
        existing: String,
        requested: String,
    },

    #[error("queue '{0}' is exclusive to another connection")]
    ResourceLocked(String),

    #[error("consumer tag '{0}' already in use on this connection")]
    DuplicateConsumer(String),

    #[error("consumer '{0}' not found")]
    ConsumerNotFound(String),

    #[error("unknown delivery tag {0}")]
    UnknownDeliveryTag(u64),

    #[error("session '{0}' not registered")]
    UnknownSession(String),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

impl BrokerError {
    /// The code sent back to the client in an `error` frame.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::QueueNotFound(_) | Self::ConsumerNotFound(_) | Self::UnknownSession(_) => {
                ErrorCode::NotFound
            }
            Self::PreconditionFailed { .. } | Self::DuplicateConsumer(_) => {
                ErrorCode::PreconditionFailed
            }
            Self::ResourceLocked(_) => ErrorCode::ResourceLocked,
            Self::UnknownDeliveryTag(_) => ErrorCode::UnknownDeliveryTag,
            Self::Persistence(_) => ErrorCode::Internal,
        }
    }
}

/// Reasons a stock movement is refused.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InventoryError {
    #[error("product {0} is not registered")]
    UnknownProduct(i32),

    #[error("product {produto_id} has {available} units, {requested} requested")]
    InsufficientStock {
        produto_id: i32,
        available: i32,
        requested: i32,
    },

    #[error("invalid quantity {0}")]
    InvalidQuantity(i32),
}

/// Errors surfaced by the messaging layer to the calling service.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("invalid broker uri '{uri}': {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("could not connect to broker at {uri}: {source}")]
    Connect {
        uri: String,
        #[source]
        source: tungstenite::Error,
    },

    #[error("timed out connecting to broker at {uri} after {timeout:?}")]
    ConnectTimeout { uri: String, timeout: Duration },

    #[error("connection to broker is closed")]
    ConnectionClosed,

    #[error("no free channel id on this connection")]
    ChannelsExhausted,

    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("queue '{queue}' declared with conflicting parameters: {message}")]
    DeclareConflict { queue: String, message: String },

    #[error("broker refused request ({code:?}): {message}")]
    Remote { code: ErrorCode, message: String },

    #[error("queue '{0}' has no registered payload type")]
    UnregisteredQueue(String),

    #[error("queue '{queue}' carries {expected}, not {actual}")]
    PayloadTypeMismatch {
        queue: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("queue '{queue}' is already bound to {existing}")]
    RegistryConflict {
        queue: String,
        existing: &'static str,
    },

    #[error("malformed envelope for message '{message_id}': {reason}")]
    InvalidEnvelope { message_id: String, reason: String },

    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("no response for correlation id {correlation_id} within {timeout:?}")]
    RequestTimeout {
        correlation_id: String,
        timeout: Duration,
    },

    #[error("unexpected reply from broker to {operation}")]
    UnexpectedReply { operation: &'static str },
}

impl BusError {
    pub(crate) fn remote(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Remote {
            code,
            message: message.into(),
        }
    }
}
