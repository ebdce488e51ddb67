use crate::persistence::StoredMessage;
use crate::transport::message::MessageProperties;

/// A message as held by the broker.
///
/// The body is kept as the UTF-8 text the publisher sent; the broker never
/// looks inside it. `seq` is the storage key when the message was written
/// through to disk (persistent message on a durable queue), `None` otherwise.
///
/// # Example
///
/// ```rust
/// use salesbus::broker::message::QueuedMessage;
/// use salesbus::transport::message::MessageProperties;
///
/// let msg = QueuedMessage::new(
///     "venda.registrada",
///     MessageProperties {
///         message_id: "5f0c7a52".to_string(),
///         timestamp: 1_725_000_000_000,
///         content_type: "application/json".to_string(),
///         persistent: true,
///     },
///     "{\"VendaId\":1}".to_string(),
/// );
/// assert!(!msg.redelivered);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    pub queue: String,
    pub properties: MessageProperties,
    pub body: String,
    pub seq: Option<u64>,
    pub redelivered: bool,
}

impl QueuedMessage {
    pub fn new(queue: &str, properties: MessageProperties, body: String) -> Self {
        Self {
            queue: queue.to_string(),
            properties,
            body,
            seq: None,
            redelivered: false,
        }
    }

    pub fn restored(seq: u64, stored: StoredMessage) -> Self {
        Self {
            queue: stored.queue,
            properties: stored.properties,
            body: stored.body,
            seq: Some(seq),
            redelivered: false,
        }
    }

    pub fn to_stored(&self) -> StoredMessage {
        StoredMessage {
            queue: self.queue.clone(),
            properties: self.properties.clone(),
            body: self.body.clone(),
        }
    }
}
