use std::any::type_name;
use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info};
use uuid::Uuid;

use crate::bus::declare::ensure_queue;
use crate::bus::envelope::Envelope;
use crate::bus::registry::TypeRegistry;
use crate::client::Channel;
use crate::utils::error::BusError;

/// Publishes typed payloads. Cheap to clone; all clones share one channel.
#[derive(Clone)]
pub struct Publisher {
    channel: Arc<Channel>,
    registry: Arc<TypeRegistry>,
}

impl Publisher {
    pub(crate) fn new(channel: Arc<Channel>, registry: Arc<TypeRegistry>) -> Self {
        Self { channel, registry }
    }

    /// Publishes `payload` on `queue` as a persistent JSON message.
    ///
    /// Returns once the broker has taken the message, with the id stamped on
    /// it. That is not a confirmation that anyone processed it.
    pub async fn publish<T>(&self, queue: &str, payload: &T) -> Result<Uuid, BusError>
    where
        T: Serialize + Sync + 'static,
    {
        self.registry.check::<T>(queue)?;
        ensure_queue(&self.channel, queue).await?;

        let envelope = Envelope::seal(payload)?;
        let message_id = envelope.message_id;
        let properties = envelope.properties();

        if let Err(e) = self.channel.publish(queue, properties, envelope.body).await {
            error!(queue, %message_id, "failed to publish message: {e}");
            return Err(e);
        }

        info!(
            queue,
            %message_id,
            payload = type_name::<T>(),
            "message published"
        );
        Ok(message_id)
    }
}
