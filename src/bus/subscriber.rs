use std::any::type_name;
use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde::de::DeserializeOwned;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bus::declare::ensure_queue;
use crate::bus::envelope::Envelope;
use crate::bus::registry::TypeRegistry;
use crate::client::{Channel, Connection, Deliveries, Delivery};
use crate::utils::error::BusError;

/// Deliveries in flight per subscription. A second message is not handed
/// out before the first is settled.
pub const PREFETCH: u16 = 1;

/// Starts consumers on queues, each on its own channel.
pub struct Subscriber<'a> {
    connection: &'a Connection,
    registry: Arc<TypeRegistry>,
}

impl<'a> Subscriber<'a> {
    pub(crate) fn new(connection: &'a Connection, registry: Arc<TypeRegistry>) -> Self {
        Self {
            connection,
            registry,
        }
    }

    /// Runs `handler` for every message arriving on `queue`.
    ///
    /// Messages are handled one at a time in queue order. A handler that
    /// returns `Ok` gets its message acknowledged; an `Err`, a panic or an
    /// undecodable body drops the message. There is no retry.
    pub async fn subscribe<T, F, Fut, E>(
        &self,
        queue: &str,
        handler: F,
    ) -> Result<Subscription, BusError>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        self.registry.check::<T>(queue)?;

        let channel = self.connection.open_channel()?;
        ensure_queue(&channel, queue).await?;

        let consumer_tag = format!("{queue}.{}", Uuid::new_v4().simple());
        let deliveries = channel.consume(queue, &consumer_tag, PREFETCH).await?;

        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(consume_loop(
            channel,
            queue.to_string(),
            consumer_tag.clone(),
            deliveries,
            stop_rx,
            handler,
        ));

        info!(
            queue,
            consumer = %consumer_tag,
            payload = type_name::<T>(),
            "subscribed"
        );
        Ok(Subscription {
            queue: queue.to_string(),
            consumer_tag,
            stop: Some(stop_tx),
            task: Some(task),
        })
    }
}

/// A running consumer. Dropping it stops the consumer in the background;
/// [`shutdown`](Subscription::shutdown) stops it and waits.
pub struct Subscription {
    queue: String,
    consumer_tag: String,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    /// True once the consumer loop has ended, either after a stop or because
    /// the connection to the broker went away.
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(|task| task.is_finished())
    }

    /// Stops taking deliveries, lets a running handler finish, then cancels
    /// the consumer and closes its channel. Deliveries not yet handled go
    /// back to the queue.
    pub async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!(queue = %self.queue, "consumer task failed: {e}");
            }
        }
    }
}

async fn consume_loop<T, F, Fut, E>(
    channel: Channel,
    queue: String,
    consumer_tag: String,
    mut deliveries: Deliveries,
    mut stop: oneshot::Receiver<()>,
    handler: F,
) where
    T: DeserializeOwned + Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Display + Send + 'static,
{
    loop {
        let delivery = tokio::select! {
            biased;
            _ = &mut stop => break,
            next = deliveries.recv() => match next {
                Some(delivery) => delivery,
                None => {
                    warn!(%queue, consumer = %consumer_tag, "delivery stream closed");
                    return;
                }
            },
        };
        handle_delivery(&channel, &queue, delivery, &handler).await;
    }

    if let Err(e) = channel.cancel(&consumer_tag).await {
        warn!(%queue, consumer = %consumer_tag, "failed to cancel consumer: {e}");
    }
    if let Err(e) = channel.close().await {
        warn!(%queue, "failed to close consumer channel: {e}");
    }
    info!(%queue, consumer = %consumer_tag, "subscription stopped");
}

async fn handle_delivery<T, F, Fut, E>(channel: &Channel, queue: &str, delivery: Delivery, handler: &F)
where
    T: DeserializeOwned,
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: Display,
{
    let delivery_tag = delivery.delivery_tag;
    let message_id = delivery.properties.message_id.clone();

    let payload = match Envelope::from_delivery(&delivery.properties, delivery.body)
        .and_then(|envelope| envelope.open::<T>())
    {
        Ok(payload) => payload,
        Err(e) => {
            warn!(queue, %message_id, "undecodable message discarded: {e}");
            settle(channel, queue, delivery_tag, false).await;
            return;
        }
    };

    if delivery.redelivered {
        debug!(queue, %message_id, "handling redelivered message");
    }

    match AssertUnwindSafe(async { handler(payload).await })
        .catch_unwind()
        .await
    {
        Ok(Ok(())) => settle(channel, queue, delivery_tag, true).await,
        Ok(Err(e)) => {
            error!(queue, %message_id, "handler failed, message discarded: {e}");
            settle(channel, queue, delivery_tag, false).await;
        }
        Err(_) => {
            error!(queue, %message_id, "handler panicked, message discarded");
            settle(channel, queue, delivery_tag, false).await;
        }
    }
}

/// Acks a handled message or drops a failed one. No dead-letter target
/// exists, so a dropped message is gone.
async fn settle(channel: &Channel, queue: &str, delivery_tag: u64, handled: bool) {
    let result = if handled {
        channel.ack(delivery_tag).await
    } else {
        channel.nack(delivery_tag, false).await
    };
    if let Err(e) = result {
        // the broker returns the message to the queue when the channel goes
        warn!(queue, delivery_tag, "failed to settle delivery: {e}");
    }
}
