use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, mpsc};
use tracing::debug;

use crate::broker::QueueInfo;
use crate::client::connection::Shared;
use crate::transport::message::{
    ChannelId, ClientFrame, DeliveryTag, MessageProperties, QueueOptions, ServerFrame,
};
use crate::utils::error::BusError;

/// A message handed to a consumer, waiting to be acked or nacked.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub channel: ChannelId,
    pub consumer_tag: String,
    pub delivery_tag: DeliveryTag,
    pub redelivered: bool,
    pub queue: String,
    pub properties: MessageProperties,
    pub body: String,
}

/// The receiving end of a consumer registration. Ends when the consumer is
/// cancelled or the connection goes away.
pub type Deliveries = mpsc::UnboundedReceiver<Delivery>;

/// A numbered lane over a [`Connection`](super::Connection).
///
/// Every operation takes the channel's lock for its whole request/answer
/// round trip, so a channel may be shared between tasks (behind an `Arc`)
/// and its operations are applied one at a time, in call order.
pub struct Channel {
    id: ChannelId,
    shared: Arc<Shared>,
    lock: Mutex<()>,
    closed: AtomicBool,
}

impl Channel {
    pub(crate) fn new(id: ChannelId, shared: Arc<Shared>) -> Self {
        Self {
            id,
            shared,
            lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    fn ensure_open(&self) -> Result<(), BusError> {
        if self.closed.load(Ordering::SeqCst) || self.shared.is_closed() {
            return Err(BusError::ConnectionClosed);
        }
        Ok(())
    }

    pub async fn declare_queue(
        &self,
        queue: &str,
        options: QueueOptions,
    ) -> Result<QueueInfo, BusError> {
        let _guard = self.lock.lock().await;
        self.ensure_open()?;
        let channel = self.id;
        let reply = self
            .shared
            .call("queue.declare", |request_id| ClientFrame::Declare {
                request_id,
                channel,
                queue: queue.to_string(),
                options,
            })
            .await?;

        match reply {
            ServerFrame::DeclareOk {
                queue,
                message_count,
                consumer_count,
                ..
            } => Ok(QueueInfo {
                name: queue,
                message_count,
                consumer_count,
            }),
            _ => Err(BusError::UnexpectedReply {
                operation: "queue.declare",
            }),
        }
    }

    /// Hands a message to the broker and waits until the broker has taken it.
    pub async fn publish(
        &self,
        queue: &str,
        properties: MessageProperties,
        body: String,
    ) -> Result<(), BusError> {
        let _guard = self.lock.lock().await;
        self.ensure_open()?;
        let channel = self.id;
        let reply = self
            .shared
            .call("basic.publish", |request_id| ClientFrame::Publish {
                request_id,
                channel,
                queue: queue.to_string(),
                properties,
                body,
            })
            .await?;

        match reply {
            ServerFrame::PublishOk { .. } => Ok(()),
            _ => Err(BusError::UnexpectedReply {
                operation: "basic.publish",
            }),
        }
    }

    /// Starts a consumer on `queue`. At most `prefetch` deliveries are
    /// outstanding at any time; `0` removes the limit.
    pub async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<Deliveries, BusError> {
        let _guard = self.lock.lock().await;
        self.ensure_open()?;

        // registered first: deliveries may overtake consume_ok
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.register_consumer(consumer_tag, self.id, tx);

        let channel = self.id;
        let reply = self
            .shared
            .call("basic.consume", |request_id| ClientFrame::Consume {
                request_id,
                channel,
                queue: queue.to_string(),
                consumer_tag: consumer_tag.to_string(),
                prefetch,
            })
            .await;

        match reply {
            Ok(ServerFrame::ConsumeOk { .. }) => Ok(rx),
            Ok(_) => {
                self.shared.remove_consumer(consumer_tag);
                Err(BusError::UnexpectedReply {
                    operation: "basic.consume",
                })
            }
            Err(e) => {
                self.shared.remove_consumer(consumer_tag);
                Err(e)
            }
        }
    }

    pub async fn ack(&self, delivery_tag: DeliveryTag) -> Result<(), BusError> {
        let _guard = self.lock.lock().await;
        self.ensure_open()?;
        self.shared.send(&ClientFrame::Ack {
            channel: self.id,
            delivery_tag,
        })
    }

    pub async fn nack(&self, delivery_tag: DeliveryTag, requeue: bool) -> Result<(), BusError> {
        let _guard = self.lock.lock().await;
        self.ensure_open()?;
        self.shared.send(&ClientFrame::Nack {
            channel: self.id,
            delivery_tag,
            requeue,
        })
    }

    /// Stops a consumer. Deliveries it has not settled go back to the queue.
    pub async fn cancel(&self, consumer_tag: &str) -> Result<(), BusError> {
        let _guard = self.lock.lock().await;
        self.ensure_open()?;
        let channel = self.id;
        let result = self
            .shared
            .call("basic.cancel", |request_id| ClientFrame::Cancel {
                request_id,
                channel,
                consumer_tag: consumer_tag.to_string(),
            })
            .await;
        self.shared.remove_consumer(consumer_tag);
        result.map(|_| ())
    }

    /// Closes the channel. Consumers on it stop and their unsettled
    /// deliveries go back to their queues.
    pub async fn close(&self) -> Result<(), BusError> {
        let _guard = self.lock.lock().await;
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shared.forget_channel(self.id);
        if self.shared.is_closed() {
            return Ok(());
        }
        let channel = self.id;
        self.shared
            .call("channel.close", |request_id| ClientFrame::CloseChannel {
                request_id,
                channel,
            })
            .await?;
        debug!(channel, "channel closed");
        Ok(())
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.shared.forget_channel(self.id);
            // best effort: the answer is ignored
            let _ = self.shared.send(&ClientFrame::CloseChannel {
                request_id: 0,
                channel: self.id,
            });
        }
    }
}
