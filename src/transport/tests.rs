use serde_json::json;
use tokio::sync::mpsc;
use tungstenite::protocol::Message as WsMessage;

use crate::broker::{Broker, Session, SharedBroker};
use crate::transport::message::{ErrorCode, ServerFrame};
use crate::transport::websocket::handle_frame;

fn broker_with_session() -> (SharedBroker, String, mpsc::UnboundedReceiver<WsMessage>) {
    let broker = Broker::new().shared();
    let (tx, rx) = mpsc::unbounded_channel();
    let session = Session::new(tx);
    let id = session.id.clone();
    broker.lock().unwrap().register_session(session);
    (broker, id, rx)
}

fn declare(broker: &SharedBroker, session: &str, request_id: u64) -> Option<ServerFrame> {
    let msg = json!({
        "type": "declare",
        "request_id": request_id,
        "channel": 1,
        "queue": "venda.registrada",
        "options": { "durable": true, "exclusive": false, "auto_delete": false }
    })
    .to_string();
    handle_frame(broker, session, &msg)
}

#[test]
fn test_handle_declare() {
    let (broker, session, _rx) = broker_with_session();

    match declare(&broker, &session, 7) {
        Some(ServerFrame::DeclareOk {
            request_id, queue, ..
        }) => {
            assert_eq!(request_id, 7);
            assert_eq!(queue, "venda.registrada");
        }
        other => panic!("expected declare_ok, got {other:?}"),
    }
    assert!(broker.lock().unwrap().queues.contains_key("venda.registrada"));
}

#[test]
fn test_handle_conflicting_declare() {
    let (broker, session, _rx) = broker_with_session();
    declare(&broker, &session, 1);

    let msg = json!({
        "type": "declare",
        "request_id": 2,
        "channel": 1,
        "queue": "venda.registrada",
        "options": { "durable": false, "exclusive": false, "auto_delete": false }
    })
    .to_string();

    match handle_frame(&broker, &session, &msg) {
        Some(ServerFrame::Error {
            request_id, code, ..
        }) => {
            assert_eq!(request_id, Some(2));
            assert_eq!(code, ErrorCode::PreconditionFailed);
        }
        other => panic!("expected error, got {other:?}"),
    }
}

#[test]
fn test_handle_publish_and_consume() {
    let (broker, session, mut rx) = broker_with_session();
    declare(&broker, &session, 1);

    let publish = json!({
        "type": "publish",
        "request_id": 2,
        "channel": 1,
        "queue": "venda.registrada",
        "properties": {
            "message_id": "abc",
            "timestamp": 1_725_000_000_000i64,
            "content_type": "application/json",
            "persistent": true
        },
        "body": "{\"VendaId\":1}"
    })
    .to_string();
    assert!(matches!(
        handle_frame(&broker, &session, &publish),
        Some(ServerFrame::PublishOk { request_id: 2 })
    ));

    let consume = json!({
        "type": "consume",
        "request_id": 3,
        "channel": 2,
        "queue": "venda.registrada",
        "consumer_tag": "ctag-1",
        "prefetch": 1
    })
    .to_string();
    assert!(matches!(
        handle_frame(&broker, &session, &consume),
        Some(ServerFrame::ConsumeOk { request_id: 3, .. })
    ));

    let pushed = rx.try_recv().expect("delivery pushed to session");
    let frame: ServerFrame = serde_json::from_str(pushed.to_text().unwrap()).unwrap();
    let delivery_tag = match frame {
        ServerFrame::Deliver {
            channel,
            consumer_tag,
            delivery_tag,
            properties,
            body,
            ..
        } => {
            assert_eq!(channel, 2);
            assert_eq!(consumer_tag, "ctag-1");
            assert_eq!(properties.message_id, "abc");
            assert_eq!(body, "{\"VendaId\":1}");
            delivery_tag
        }
        other => panic!("expected deliver, got {other:?}"),
    };

    let ack = json!({ "type": "ack", "channel": 2, "delivery_tag": delivery_tag }).to_string();
    assert!(handle_frame(&broker, &session, &ack).is_none());
}

#[test]
fn test_handle_ack_for_unknown_tag() {
    let (broker, session, _rx) = broker_with_session();
    let ack = json!({ "type": "ack", "channel": 1, "delivery_tag": 99 }).to_string();

    match handle_frame(&broker, &session, &ack) {
        Some(ServerFrame::Error {
            request_id, code, ..
        }) => {
            assert_eq!(request_id, None);
            assert_eq!(code, ErrorCode::UnknownDeliveryTag);
        }
        other => panic!("expected error, got {other:?}"),
    }
}

#[test]
fn test_handle_invalid_frame() {
    let (broker, session, _rx) = broker_with_session();

    match handle_frame(&broker, &session, "{\"type\":\"subscribe\"}") {
        Some(ServerFrame::Error { code, .. }) => assert_eq!(code, ErrorCode::InvalidFrame),
        other => panic!("expected error, got {other:?}"),
    }
}
