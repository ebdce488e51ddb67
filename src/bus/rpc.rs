//! Request/response over a pair of queues.
//!
//! The requester publishes a command carrying a fresh correlation id and
//! waits for the response carrying the same id on the response queue. All
//! requesters share one response queue, so one requesting process per
//! response queue is assumed: a response consumed by another process is
//! discarded there and the request here times out.

use std::collections::HashMap;
use std::error::Error as StdError;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bus::MessageBus;
use crate::bus::publisher::Publisher;
use crate::bus::subscriber::Subscription;
use crate::events::{EstoqueVerificadoResponse, VerificarEstoqueCommand};
use crate::utils::error::BusError;

/// A message that carries a correlation id.
pub trait Correlated {
    fn correlation_id(&self) -> &str;
    fn set_correlation_id(&mut self, id: String);
}

impl Correlated for VerificarEstoqueCommand {
    fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    fn set_correlation_id(&mut self, id: String) {
        self.correlation_id = id;
    }
}

impl Correlated for EstoqueVerificadoResponse {
    fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    fn set_correlation_id(&mut self, id: String) {
        self.correlation_id = id;
    }
}

type BoxError = Box<dyn StdError + Send + Sync>;

type Outstanding<Resp> = Arc<Mutex<HashMap<String, oneshot::Sender<Resp>>>>;

/// The requesting side. Listens on the response queue for as long as it
/// lives.
pub struct RpcClient<Req, Resp> {
    publisher: Publisher,
    command_queue: String,
    outstanding: Outstanding<Resp>,
    timeout: Duration,
    subscription: Subscription,
    _request: PhantomData<fn(Req)>,
}

impl<Req, Resp> RpcClient<Req, Resp>
where
    Req: Correlated + Serialize + Send + Sync + 'static,
    Resp: Correlated + DeserializeOwned + Send + 'static,
{
    /// Subscribes to `response_queue` and returns a client publishing on
    /// `command_queue`. Requests time out after the configured RPC timeout.
    pub async fn start(
        bus: &MessageBus,
        command_queue: &str,
        response_queue: &str,
    ) -> Result<Self, BusError> {
        bus.registry().check::<Req>(command_queue)?;

        let outstanding: Outstanding<Resp> = Arc::new(Mutex::new(HashMap::new()));
        let routes = outstanding.clone();
        let subscription = bus
            .subscriber()
            .subscribe(response_queue, move |response: Resp| {
                let waiter = lock(&routes).remove(response.correlation_id());
                match waiter {
                    Some(tx) => {
                        if tx.send(response).is_err() {
                            debug!("requester gave up before the response arrived");
                        }
                    }
                    None => warn!(
                        correlation_id = response.correlation_id(),
                        "discarding response with no outstanding request"
                    ),
                }
                async { Ok::<(), BusError>(()) }
            })
            .await?;

        Ok(Self {
            publisher: bus.publisher(),
            command_queue: command_queue.to_string(),
            outstanding,
            timeout: bus.settings().rpc_timeout(),
            subscription,
            _request: PhantomData,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sends `request` under a fresh correlation id and waits for the
    /// matching response. Not retried on timeout.
    pub async fn request(&self, mut request: Req) -> Result<Resp, BusError> {
        let correlation_id = Uuid::new_v4().to_string();
        request.set_correlation_id(correlation_id.clone());

        let (tx, rx) = oneshot::channel();
        lock(&self.outstanding).insert(correlation_id.clone(), tx);

        if let Err(e) = self.publisher.publish(&self.command_queue, &request).await {
            lock(&self.outstanding).remove(&correlation_id);
            return Err(e);
        }

        match timeout(self.timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(BusError::ConnectionClosed),
            Err(_) => {
                lock(&self.outstanding).remove(&correlation_id);
                warn!(%correlation_id, "request timed out");
                Err(BusError::RequestTimeout {
                    correlation_id,
                    timeout: self.timeout,
                })
            }
        }
    }

    /// Requests still waiting for a response.
    pub fn outstanding(&self) -> usize {
        lock(&self.outstanding).len()
    }

    pub async fn shutdown(self) {
        self.subscription.shutdown().await;
    }
}

/// The responding side: answers every command on `command_queue` with the
/// handler's response, published on `response_queue` under the command's
/// correlation id.
pub async fn serve_requests<Req, Resp, F, Fut, E>(
    bus: &MessageBus,
    command_queue: &str,
    response_queue: &str,
    handler: F,
) -> Result<Subscription, BusError>
where
    Req: Correlated + DeserializeOwned + Send + 'static,
    Resp: Correlated + Serialize + Send + Sync + 'static,
    F: Fn(Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp, E>> + Send + 'static,
    E: Into<BoxError> + 'static,
{
    bus.registry().check::<Resp>(response_queue)?;

    let publisher = bus.publisher();
    let handler = Arc::new(handler);
    let response_queue = response_queue.to_string();

    bus.subscriber()
        .subscribe(command_queue, move |request: Req| {
            let publisher = publisher.clone();
            let handler = handler.clone();
            let response_queue = response_queue.clone();
            async move {
                let correlation_id = request.correlation_id().to_string();
                let mut response = handler(request).await.map_err(Into::<BoxError>::into)?;
                response.set_correlation_id(correlation_id);
                publisher.publish(&response_queue, &response).await?;
                Ok::<(), BoxError>(())
            }
        })
        .await
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
