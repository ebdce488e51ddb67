//! Broker connection
//!
//! One `Connection` per process. It owns the WebSocket to the broker and two
//! background tasks: a writer draining an outbound frame queue into the
//! socket, and a reader routing inbound frames either to the request that
//! is waiting for them (by `request_id`) or to the consumer they are
//! addressed to (by consumer tag).
//!
//! Channels are numbered lanes multiplexed over the connection. They are
//! cheap; the messaging layer opens one for publishing and one per consumer.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};
use tungstenite::protocol::Message as WsMessage;
use url::Url;

use crate::client::channel::{Channel, Delivery};
use crate::config::MessagingSettings;
use crate::transport::message::{ChannelId, ClientFrame, RequestId, ServerFrame};
use crate::utils::error::BusError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// State shared by a connection, its I/O tasks and its channels.
pub(crate) struct Shared {
    outbound: mpsc::UnboundedSender<WsMessage>,
    pending: Mutex<HashMap<RequestId, oneshot::Sender<ServerFrame>>>,
    consumers: Mutex<HashMap<String, (ChannelId, mpsc::UnboundedSender<Delivery>)>>,
    channels: Mutex<HashSet<ChannelId>>,
    next_request: AtomicU64,
    next_channel: AtomicU16,
    closed: AtomicBool,
    pub(crate) operation_timeout: Duration,
}

impl Shared {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Queues a frame for the writer task without waiting for an answer.
    pub(crate) fn send(&self, frame: &ClientFrame) -> Result<(), BusError> {
        if self.is_closed() {
            return Err(BusError::ConnectionClosed);
        }
        let json = serde_json::to_string(frame)?;
        self.outbound
            .send(WsMessage::text(json))
            .map_err(|_| BusError::ConnectionClosed)
    }

    /// Sends a request frame and waits for the broker's answer, bounded by
    /// the operation timeout. `error` answers become `BusError::Remote`.
    pub(crate) async fn call(
        &self,
        operation: &'static str,
        build: impl FnOnce(RequestId) -> ClientFrame,
    ) -> Result<ServerFrame, BusError> {
        let request_id = self.next_request.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = lock(&self.pending);
            if self.is_closed() {
                return Err(BusError::ConnectionClosed);
            }
            pending.insert(request_id, tx);
        }

        if let Err(e) = self.send(&build(request_id)) {
            lock(&self.pending).remove(&request_id);
            return Err(e);
        }

        match timeout(self.operation_timeout, rx).await {
            Ok(Ok(ServerFrame::Error { code, message, .. })) => Err(BusError::remote(code, message)),
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) => Err(BusError::ConnectionClosed),
            Err(_) => {
                lock(&self.pending).remove(&request_id);
                Err(BusError::Timeout {
                    operation,
                    timeout: self.operation_timeout,
                })
            }
        }
    }

    pub(crate) fn register_consumer(
        &self,
        tag: &str,
        channel: ChannelId,
        tx: mpsc::UnboundedSender<Delivery>,
    ) {
        lock(&self.consumers).insert(tag.to_string(), (channel, tx));
    }

    pub(crate) fn remove_consumer(&self, tag: &str) {
        lock(&self.consumers).remove(tag);
    }

    /// Drops a channel and ends the delivery streams of its consumers.
    pub(crate) fn forget_channel(&self, id: ChannelId) {
        lock(&self.channels).remove(&id);
        lock(&self.consumers).retain(|_, (channel, _)| *channel != id);
    }

    fn route(&self, text: &str) {
        let frame = match serde_json::from_str::<ServerFrame>(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("undecodable frame from broker: {e}");
                return;
            }
        };

        match frame {
            ServerFrame::Deliver {
                channel,
                consumer_tag,
                delivery_tag,
                redelivered,
                queue,
                properties,
                body,
            } => {
                let consumers = lock(&self.consumers);
                let Some((_, tx)) = consumers.get(&consumer_tag) else {
                    warn!(consumer = %consumer_tag, delivery_tag, "delivery for unknown consumer");
                    return;
                };
                let delivery = Delivery {
                    channel,
                    consumer_tag: consumer_tag.clone(),
                    delivery_tag,
                    redelivered,
                    queue,
                    properties,
                    body,
                };
                if tx.send(delivery).is_err() {
                    debug!(consumer = %consumer_tag, delivery_tag, "consumer stream already dropped");
                }
            }
            ServerFrame::Error {
                request_id: None,
                code,
                message,
            } => warn!(?code, "broker reported error: {message}"),
            frame => {
                let Some(request_id) = frame.request_id() else {
                    return;
                };
                match lock(&self.pending).remove(&request_id) {
                    Some(tx) => {
                        let _ = tx.send(frame);
                    }
                    None => debug!(request_id, "answer to abandoned request"),
                }
            }
        }
    }

    /// Marks the connection dead and releases everyone waiting on it:
    /// pending requests resolve to `ConnectionClosed`, delivery streams end.
    fn shutdown(&self) {
        {
            let mut pending = lock(&self.pending);
            self.closed.store(true, Ordering::SeqCst);
            pending.clear();
        }
        lock(&self.consumers).clear();
        lock(&self.channels).clear();
    }
}

/// A live connection to the broker.
///
/// Dropping a `Connection` aborts its I/O tasks; `close` shuts it down
/// gracefully instead.
pub struct Connection {
    shared: Arc<Shared>,
    uri: String,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

impl Connection {
    /// Connects to the broker at `uri` (`ws://host:port`).
    ///
    /// Fails fast: an unreachable broker, a refused handshake or an
    /// expired connect timeout are all returned as errors. Credentials in
    /// the URI are never logged.
    pub async fn connect(uri: &str, settings: &MessagingSettings) -> Result<Self, BusError> {
        let parsed = Url::parse(uri).map_err(|e| BusError::InvalidUri {
            uri: uri.to_string(),
            reason: e.to_string(),
        })?;
        let redacted = redact(&parsed);
        if parsed.scheme() != "ws" {
            return Err(BusError::InvalidUri {
                uri: redacted,
                reason: format!("unsupported scheme '{}'", parsed.scheme()),
            });
        }

        let connect_timeout = settings.connect_timeout();
        let (ws, _) = match timeout(connect_timeout, connect_async(uri)).await {
            Ok(Ok(pair)) => pair,
            Ok(Err(source)) => {
                return Err(BusError::Connect {
                    uri: redacted,
                    source,
                });
            }
            Err(_) => {
                return Err(BusError::ConnectTimeout {
                    uri: redacted,
                    timeout: connect_timeout,
                });
            }
        };

        let (sink, stream) = ws.split();
        let (tx, rx) = mpsc::unbounded_channel::<WsMessage>();
        let shared = Arc::new(Shared {
            outbound: tx,
            pending: Mutex::new(HashMap::new()),
            consumers: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashSet::new()),
            next_request: AtomicU64::new(1),
            next_channel: AtomicU16::new(1),
            closed: AtomicBool::new(false),
            operation_timeout: settings.operation_timeout(),
        });

        let writer = tokio::spawn(write_loop(sink, rx));
        let reader = tokio::spawn(read_loop(stream, shared.clone()));

        info!(broker = %redacted, "connected to broker");
        Ok(Self {
            shared,
            uri: redacted,
            reader: Some(reader),
            writer: Some(writer),
        })
    }

    /// The broker URI with any password masked.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn is_open(&self) -> bool {
        !self.shared.is_closed()
    }

    pub fn open_channel(&self) -> Result<Channel, BusError> {
        if self.shared.is_closed() {
            return Err(BusError::ConnectionClosed);
        }
        let id = {
            let mut channels = lock(&self.shared.channels);
            let start = self.shared.next_channel.load(Ordering::SeqCst);
            let id = next_free_channel(&channels, start).ok_or(BusError::ChannelsExhausted)?;
            channels.insert(id);
            self.shared
                .next_channel
                .store(id.wrapping_add(1), Ordering::SeqCst);
            id
        };
        debug!(channel = id, "channel opened");
        Ok(Channel::new(id, self.shared.clone()))
    }

    /// Closes every channel still open, then the connection, and waits for
    /// the I/O tasks to finish.
    pub async fn close(mut self) -> Result<(), BusError> {
        let open: Vec<ChannelId> = lock(&self.shared.channels).iter().copied().collect();
        for channel in open {
            let result = self
                .shared
                .call("channel.close", |request_id| ClientFrame::CloseChannel {
                    request_id,
                    channel,
                })
                .await;
            if let Err(e) = result {
                warn!(channel, "failed to close channel: {e}");
            }
        }

        {
            let _pending = lock(&self.shared.pending);
            self.shared.closed.store(true, Ordering::SeqCst);
        }
        let _ = self.shared.outbound.send(WsMessage::Close(None));

        let grace = self.shared.operation_timeout;
        for handle in [self.writer.take(), self.reader.take()].into_iter().flatten() {
            join_or_abort(handle, grace).await;
        }
        self.shared.shutdown();

        info!(broker = %self.uri, "connection to broker closed");
        Ok(())
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("uri", &self.uri)
            .field("open", &self.is_open())
            .finish()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        for handle in [self.writer.take(), self.reader.take()].into_iter().flatten() {
            handle.abort();
        }
        self.shared.shutdown();
    }
}

async fn join_or_abort(mut handle: JoinHandle<()>, grace: Duration) {
    if timeout(grace, &mut handle).await.is_err() {
        handle.abort();
    }
}

async fn write_loop(
    mut sink: SplitSink<WsStream, WsMessage>,
    mut rx: mpsc::UnboundedReceiver<WsMessage>,
) {
    while let Some(msg) = rx.recv().await {
        let closing = msg.is_close();
        if let Err(e) = sink.send(msg).await {
            warn!("failed to send frame to broker: {e}");
            break;
        }
        if closing {
            break;
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(mut stream: SplitStream<WsStream>, shared: Arc<Shared>) {
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(WsMessage::Text(text)) => shared.route(text.as_str()),
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!("connection to broker lost: {e}");
                break;
            }
        }
    }
    shared.shutdown();
    debug!("broker read loop finished");
}

/// First channel id at or after `start` that is not in use. Ids wrap
/// around and `0` is never handed out.
pub(crate) fn next_free_channel(
    in_use: &HashSet<ChannelId>,
    start: ChannelId,
) -> Option<ChannelId> {
    (0..=u16::MAX)
        .map(|offset| start.wrapping_add(offset))
        .find(|id| *id != 0 && !in_use.contains(id))
}

fn redact(url: &Url) -> String {
    let mut url = url.clone();
    if url.password().is_some() {
        let _ = url.set_password(Some("***"));
    }
    url.to_string()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
