use futures_util::{SinkExt, Stream, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::broker::{Broker, SharedBroker};
use crate::config::Settings;
use crate::transport::message::ServerFrame;
use crate::transport::websocket::serve;

async fn start_server() -> (String, SharedBroker) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = format!("ws://{}", listener.local_addr().unwrap());
    let broker = Broker::new().shared();
    tokio::spawn(serve(listener, broker.clone(), Settings::default()));
    (addr, broker)
}

async fn next_frame<S>(ws: &mut S) -> ServerFrame
where
    S: Stream<Item = Result<WsMessage, tungstenite::Error>> + Unpin,
{
    let msg = ws
        .next()
        .await
        .expect("Did not receive response")
        .expect("websocket error");
    serde_json::from_slice(&msg.into_data()).expect("server frame")
}

#[tokio::test]
async fn test_declare_over_websocket() {
    let (addr, broker) = start_server().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(addr.as_str())
        .await
        .expect("WebSocket handshake failed");

    let declare = json!({
        "type": "declare",
        "request_id": 1,
        "channel": 1,
        "queue": "produto.criado",
        "options": { "durable": true, "exclusive": false, "auto_delete": false }
    });
    ws.send(WsMessage::text(declare.to_string())).await.unwrap();

    match next_frame(&mut ws).await {
        ServerFrame::DeclareOk { request_id, .. } => assert_eq!(request_id, 1),
        other => panic!("Expected DeclareOk, got {other:?}"),
    }
    assert!(broker.lock().unwrap().queues.contains_key("produto.criado"));
}

#[tokio::test]
async fn test_disconnect_returns_unacked_messages() {
    let (addr, broker) = start_server().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(addr.as_str())
        .await
        .expect("WebSocket handshake failed");

    let frames = [
        json!({
            "type": "declare", "request_id": 1, "channel": 1, "queue": "estoque.alterado",
            "options": { "durable": true, "exclusive": false, "auto_delete": false }
        }),
        json!({
            "type": "publish", "request_id": 2, "channel": 1, "queue": "estoque.alterado",
            "properties": {
                "message_id": "m1", "timestamp": 0,
                "content_type": "application/json", "persistent": true
            },
            "body": "{}"
        }),
        json!({
            "type": "consume", "request_id": 3, "channel": 1, "queue": "estoque.alterado",
            "consumer_tag": "c1", "prefetch": 1
        }),
    ];
    for frame in frames {
        ws.send(WsMessage::text(frame.to_string())).await.unwrap();
    }

    let mut delivered = false;
    for _ in 0..4 {
        if let ServerFrame::Deliver { .. } = next_frame(&mut ws).await {
            delivered = true;
            break;
        }
    }
    assert!(delivered, "message should have been delivered");
    assert_eq!(
        broker
            .lock()
            .unwrap()
            .queue_info("estoque.alterado")
            .unwrap()
            .message_count,
        0
    );

    ws.close(None).await.unwrap();
    drop(ws);

    let mut returned = false;
    for _ in 0..50 {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let info = broker.lock().unwrap().queue_info("estoque.alterado").unwrap();
        if info.message_count == 1 && info.consumer_count == 0 {
            returned = true;
            break;
        }
    }
    assert!(returned, "unacked message should be back in the queue");
}
