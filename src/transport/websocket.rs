//! WebSocket transport
//!
//! A minimal WebSocket server that translates JSON frames into broker
//! operations. Responsibilities:
//! - Accept TCP/WebSocket connections, up to `server.max_connections`
//! - Create a `Session` for each connection and register it with the broker
//! - Decode `ClientFrame`s, apply them to the broker and answer requests
//! - On disconnect, clean up the session so unacknowledged messages return
//!   to their queues

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, MutexGuard};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::spawn;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tracing::{debug, error, info, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::broker::{Broker, Session, SharedBroker};
use crate::config::Settings;
use crate::transport::message::{ClientFrame, ErrorCode, RequestId, ServerFrame};
use crate::utils::error::BrokerError;

pub async fn start_websocket_server(
    addr: String,
    broker: SharedBroker,
    settings: Settings,
) -> io::Result<()> {
    let listener = TcpListener::bind(&addr).await?;
    serve(listener, broker, settings).await
}

/// Accepts connections on an already bound listener until it fails.
pub async fn serve(listener: TcpListener, broker: SharedBroker, settings: Settings) -> io::Result<()> {
    info!("broker listening on ws://{}", listener.local_addr()?);
    let active = Arc::new(AtomicUsize::new(0));

    loop {
        let (stream, peer) = listener.accept().await?;

        if active.load(Ordering::SeqCst) >= settings.server.max_connections {
            warn!(%peer, "connection limit reached, refusing connection");
            drop(stream);
            continue;
        }
        active.fetch_add(1, Ordering::SeqCst);

        let broker = broker.clone();
        let active = active.clone();
        spawn(async move {
            handle_connection(stream, broker).await;
            active.fetch_sub(1, Ordering::SeqCst);
        });
    }
}

async fn handle_connection(stream: TcpStream, broker: SharedBroker) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            error!("WebSocket handshake error: {e}");
            return;
        }
    };
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();

    let session = Session::new(tx.clone());
    let session_id = session.id.clone();
    lock(&broker).register_session(session);
    info!(session = %session_id, "connection opened");

    let send_loop = {
        let session_id = session_id.clone();
        spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = ws_sender.send(msg).await {
                    warn!(session = %session_id, "failed to send frame: {e}");
                    break;
                }
            }
            let _ = ws_sender.close().await;
            debug!(session = %session_id, "send loop closed");
        })
    };

    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(WsMessage::Text(text)) => {
                if let Some(reply) = handle_frame(&broker, &session_id, text.as_str()) {
                    match serde_json::to_string(&reply) {
                        Ok(json) => {
                            if tx.send(WsMessage::text(json)).is_err() {
                                break;
                            }
                        }
                        Err(e) => error!(session = %session_id, "failed to serialize reply: {e}"),
                    }
                }
            }
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(session = %session_id, "connection error: {e}");
                break;
            }
        }
    }

    lock(&broker).cleanup_session(&session_id);
    drop(tx);
    let _ = send_loop.await;
    info!(session = %session_id, "connection closed");
}

/// Applies one client frame to the broker. Returns the frame to answer with,
/// if any.
pub fn handle_frame(broker: &SharedBroker, session_id: &str, text: &str) -> Option<ServerFrame> {
    let frame = match serde_json::from_str::<ClientFrame>(text) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(
                session = %session_id,
                "invalid client frame: {err} | {}",
                text.chars().take(100).collect::<String>()
            );
            return Some(ServerFrame::Error {
                request_id: None,
                code: ErrorCode::InvalidFrame,
                message: err.to_string(),
            });
        }
    };

    let mut broker = lock(broker);
    match frame {
        ClientFrame::Declare {
            request_id,
            queue,
            options,
            ..
        } => Some(answer(
            request_id,
            broker
                .declare_queue(session_id, &queue, options)
                .map(|info| ServerFrame::DeclareOk {
                    request_id,
                    queue: info.name,
                    message_count: info.message_count,
                    consumer_count: info.consumer_count,
                }),
        )),
        ClientFrame::Publish {
            request_id,
            queue,
            properties,
            body,
            ..
        } => Some(answer(
            request_id,
            broker
                .publish(session_id, &queue, properties, body)
                .map(|()| ServerFrame::PublishOk { request_id }),
        )),
        ClientFrame::Consume {
            request_id,
            channel,
            queue,
            consumer_tag,
            prefetch,
        } => Some(answer(
            request_id,
            broker
                .consume(session_id, channel, &queue, &consumer_tag, prefetch)
                .map(|()| ServerFrame::ConsumeOk {
                    request_id,
                    consumer_tag,
                }),
        )),
        ClientFrame::Cancel {
            request_id,
            channel,
            consumer_tag,
        } => Some(answer(
            request_id,
            broker
                .cancel(session_id, channel, &consumer_tag)
                .map(|()| ServerFrame::CancelOk { request_id }),
        )),
        ClientFrame::CloseChannel {
            request_id,
            channel,
        } => {
            broker.close_channel(session_id, channel);
            Some(ServerFrame::CloseOk { request_id })
        }
        ClientFrame::Ack {
            channel,
            delivery_tag,
        } => broker
            .ack(session_id, channel, delivery_tag)
            .err()
            .map(unsolicited_error),
        ClientFrame::Nack {
            channel,
            delivery_tag,
            requeue,
        } => broker
            .nack(session_id, channel, delivery_tag, requeue)
            .err()
            .map(unsolicited_error),
    }
}

fn answer(request_id: RequestId, result: Result<ServerFrame, BrokerError>) -> ServerFrame {
    result.unwrap_or_else(|e| ServerFrame::Error {
        request_id: Some(request_id),
        code: e.code(),
        message: e.to_string(),
    })
}

fn unsolicited_error(e: BrokerError) -> ServerFrame {
    ServerFrame::Error {
        request_id: None,
        code: e.code(),
        message: e.to_string(),
    }
}

fn lock(broker: &SharedBroker) -> MutexGuard<'_, Broker> {
    broker.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
