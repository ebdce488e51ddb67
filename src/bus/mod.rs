//! The `bus` module is the messaging layer services program against.
//!
//! A [`MessageBus`] is built once per process from the messaging settings
//! and a [`TypeRegistry`], and is passed by reference to whatever needs to
//! publish or subscribe. It owns the broker connection, one channel shared
//! by all publishers, and opens a dedicated channel per subscription.
//!
//! Delivery is at-least-once. Handlers see each message one at a time per
//! queue and must tolerate seeing the same message twice.

pub mod declare;
pub mod envelope;
pub mod publisher;
pub mod registry;
pub mod rpc;
pub mod subscriber;

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::info;
use uuid::Uuid;

use crate::client::Connection;
use crate::config::MessagingSettings;
use crate::utils::error::BusError;

pub use declare::ensure_queue;
pub use envelope::Envelope;
pub use publisher::Publisher;
pub use registry::TypeRegistry;
pub use rpc::{Correlated, RpcClient, serve_requests};
pub use subscriber::{Subscriber, Subscription};

pub struct MessageBus {
    connection: Connection,
    publisher: Publisher,
    registry: Arc<TypeRegistry>,
    settings: MessagingSettings,
}

impl MessageBus {
    /// Connects to the broker named in `settings`. Fails if the broker is
    /// unreachable; there is no reconnect.
    pub async fn connect(
        settings: &MessagingSettings,
        registry: TypeRegistry,
    ) -> Result<Self, BusError> {
        let connection = Connection::connect(&settings.uri, settings).await?;
        let registry = Arc::new(registry);
        let channel = Arc::new(connection.open_channel()?);

        Ok(Self {
            publisher: Publisher::new(channel, registry.clone()),
            connection,
            registry,
            settings: settings.clone(),
        })
    }

    pub fn publisher(&self) -> Publisher {
        self.publisher.clone()
    }

    pub fn subscriber(&self) -> Subscriber<'_> {
        Subscriber::new(&self.connection, self.registry.clone())
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &MessagingSettings {
        &self.settings
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_open()
    }

    pub async fn publish<T>(&self, queue: &str, payload: &T) -> Result<Uuid, BusError>
    where
        T: Serialize + Sync + 'static,
    {
        self.publisher.publish(queue, payload).await
    }

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
        self.subscriber().subscribe(queue, handler).await
    }

    /// Closes every channel and the connection. Shut subscriptions down
    /// first to let in-flight handlers finish.
    pub async fn disconnect(self) -> Result<(), BusError> {
        let uri = self.connection.uri().to_string();
        self.connection.close().await?;
        info!(broker = %uri, "message bus disconnected");
        Ok(())
    }
}
