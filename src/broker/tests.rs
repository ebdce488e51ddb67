use tempfile::tempdir;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tungstenite::protocol::Message as WsMessage;

use super::Broker;
use super::session::Session;
use crate::persistence::Persistence;
use crate::transport::message::{DeliveryTag, MessageProperties, QueueOptions, ServerFrame};
use crate::utils::error::BrokerError;

const QUEUE: &str = "venda.registrada";

fn props(id: &str) -> MessageProperties {
    MessageProperties {
        message_id: id.to_string(),
        timestamp: 1_725_000_000_000,
        content_type: "application/json".to_string(),
        persistent: true,
    }
}

fn attach_session(broker: &mut Broker) -> (String, UnboundedReceiver<WsMessage>) {
    let (tx, rx) = mpsc::unbounded_channel::<WsMessage>();
    let session = Session::new(tx);
    let id = session.id.clone();
    broker.register_session(session);
    (id, rx)
}

/// Pulls the next delivery out of a session's outbound channel.
fn next_delivery(rx: &mut UnboundedReceiver<WsMessage>) -> Option<(DeliveryTag, String, bool)> {
    let msg = rx.try_recv().ok()?;
    let text = msg.to_text().expect("text frame");
    match serde_json::from_str::<ServerFrame>(text).expect("server frame") {
        ServerFrame::Deliver {
            delivery_tag,
            body,
            redelivered,
            ..
        } => Some((delivery_tag, body, redelivered)),
        other => panic!("expected a delivery, got {other:?}"),
    }
}

#[test]
fn test_broker_new() {
    let broker = Broker::default();
    assert!(broker.queues.is_empty());
    assert!(broker.sessions.is_empty());
    assert!(broker.consumers.is_empty());
}

#[test]
fn test_declare_is_idempotent() {
    let mut broker = Broker::new();
    let (session, _rx) = attach_session(&mut broker);

    let first = broker
        .declare_queue(&session, QUEUE, QueueOptions::DURABLE)
        .unwrap();
    broker
        .publish(&session, QUEUE, props("m1"), "{}".into())
        .unwrap();
    let second = broker
        .declare_queue(&session, QUEUE, QueueOptions::DURABLE)
        .unwrap();

    assert_eq!(first.message_count, 0);
    assert_eq!(second.message_count, 1);
    assert_eq!(broker.queues.len(), 1);
}

#[test]
fn test_declare_conflict_is_rejected() {
    let mut broker = Broker::new();
    let (session, _rx) = attach_session(&mut broker);
    broker
        .declare_queue(&session, QUEUE, QueueOptions::DURABLE)
        .unwrap();

    let transient = QueueOptions {
        durable: false,
        ..QueueOptions::DURABLE
    };
    let err = broker
        .declare_queue(&session, QUEUE, transient)
        .unwrap_err();

    assert!(matches!(err, BrokerError::PreconditionFailed { .. }));
    assert_eq!(broker.queues[QUEUE].options, QueueOptions::DURABLE);
}

#[test]
fn test_publish_to_undeclared_queue_fails() {
    let mut broker = Broker::new();
    let (session, _rx) = attach_session(&mut broker);

    let err = broker
        .publish(&session, "nao.existe", props("m1"), "{}".into())
        .unwrap_err();
    assert!(matches!(err, BrokerError::QueueNotFound(_)));
}

#[test]
fn test_prefetch_one_holds_back_next_message_until_ack() {
    let mut broker = Broker::new();
    let (session, mut rx) = attach_session(&mut broker);
    broker
        .declare_queue(&session, QUEUE, QueueOptions::DURABLE)
        .unwrap();
    broker.publish(&session, QUEUE, props("m1"), "one".into()).unwrap();
    broker.publish(&session, QUEUE, props("m2"), "two".into()).unwrap();

    broker.consume(&session, 1, QUEUE, "c1", 1).unwrap();

    let (tag, body, _) = next_delivery(&mut rx).expect("first delivery");
    assert_eq!(body, "one");
    assert!(next_delivery(&mut rx).is_none(), "second message must wait");
    assert_eq!(broker.queue_info(QUEUE).unwrap().message_count, 1);

    broker.ack(&session, 1, tag).unwrap();

    let (_, body, _) = next_delivery(&mut rx).expect("second delivery");
    assert_eq!(body, "two");
}

#[test]
fn test_ack_removes_message_permanently() {
    let mut broker = Broker::new();
    let (session, mut rx) = attach_session(&mut broker);
    broker
        .declare_queue(&session, QUEUE, QueueOptions::DURABLE)
        .unwrap();
    broker.publish(&session, QUEUE, props("m1"), "one".into()).unwrap();
    broker.consume(&session, 1, QUEUE, "c1", 1).unwrap();

    let (tag, _, _) = next_delivery(&mut rx).unwrap();
    broker.ack(&session, 1, tag).unwrap();
    broker.close_channel(&session, 1);

    assert_eq!(broker.queue_info(QUEUE).unwrap().message_count, 0);
    assert!(matches!(
        broker.ack(&session, 1, tag),
        Err(BrokerError::UnknownDeliveryTag(_))
    ));
}

#[test]
fn test_nack_without_requeue_drops_message() {
    let mut broker = Broker::new();
    let (session, mut rx) = attach_session(&mut broker);
    broker
        .declare_queue(&session, QUEUE, QueueOptions::DURABLE)
        .unwrap();
    broker.publish(&session, QUEUE, props("m1"), "bad".into()).unwrap();
    broker.publish(&session, QUEUE, props("m2"), "good".into()).unwrap();
    broker.consume(&session, 1, QUEUE, "c1", 1).unwrap();

    let (tag, body, _) = next_delivery(&mut rx).unwrap();
    assert_eq!(body, "bad");
    broker.nack(&session, 1, tag, false).unwrap();

    let (tag, body, redelivered) = next_delivery(&mut rx).unwrap();
    assert_eq!(body, "good");
    assert!(!redelivered);
    broker.ack(&session, 1, tag).unwrap();

    assert!(next_delivery(&mut rx).is_none());
    assert_eq!(broker.queue_info(QUEUE).unwrap().message_count, 0);
}

#[test]
fn test_nack_with_requeue_redelivers_first() {
    let mut broker = Broker::new();
    let (session, mut rx) = attach_session(&mut broker);
    broker
        .declare_queue(&session, QUEUE, QueueOptions::DURABLE)
        .unwrap();
    broker.publish(&session, QUEUE, props("m1"), "one".into()).unwrap();
    broker.publish(&session, QUEUE, props("m2"), "two".into()).unwrap();
    broker.consume(&session, 1, QUEUE, "c1", 1).unwrap();

    let (tag, _, _) = next_delivery(&mut rx).unwrap();
    broker.nack(&session, 1, tag, true).unwrap();

    let (_, body, redelivered) = next_delivery(&mut rx).unwrap();
    assert_eq!(body, "one");
    assert!(redelivered);
}

#[test]
fn test_closing_channel_returns_unacked_messages() {
    let mut broker = Broker::new();
    let (session_a, mut rx_a) = attach_session(&mut broker);
    let (session_b, mut rx_b) = attach_session(&mut broker);
    broker
        .declare_queue(&session_a, QUEUE, QueueOptions::DURABLE)
        .unwrap();
    broker.publish(&session_a, QUEUE, props("m1"), "one".into()).unwrap();
    broker.consume(&session_a, 1, QUEUE, "a", 1).unwrap();
    assert!(next_delivery(&mut rx_a).is_some());

    broker.consume(&session_b, 1, QUEUE, "b", 1).unwrap();
    assert!(next_delivery(&mut rx_b).is_none());

    broker.cleanup_session(&session_a);

    let (_, body, redelivered) = next_delivery(&mut rx_b).expect("handed to survivor");
    assert_eq!(body, "one");
    assert!(redelivered);
    assert!(!broker.sessions.contains_key(&session_a));
}

#[test]
fn test_consumers_share_a_queue_round_robin() {
    let mut broker = Broker::new();
    let (session, mut rx) = attach_session(&mut broker);
    broker
        .declare_queue(&session, QUEUE, QueueOptions::DURABLE)
        .unwrap();
    broker.consume(&session, 1, QUEUE, "c1", 1).unwrap();
    broker.consume(&session, 2, QUEUE, "c2", 1).unwrap();

    broker.publish(&session, QUEUE, props("m1"), "one".into()).unwrap();
    broker.publish(&session, QUEUE, props("m2"), "two".into()).unwrap();

    let c1 = &broker.consumers.values().find(|c| c.key.tag == "c1").unwrap();
    let c2 = &broker.consumers.values().find(|c| c.key.tag == "c2").unwrap();
    assert_eq!(c1.unacked.len(), 1);
    assert_eq!(c2.unacked.len(), 1);
    assert!(next_delivery(&mut rx).is_some());
    assert!(next_delivery(&mut rx).is_some());
}

#[test]
fn test_exclusive_queue_is_locked_to_its_owner() {
    let mut broker = Broker::new();
    let (owner, _rx_a) = attach_session(&mut broker);
    let (other, _rx_b) = attach_session(&mut broker);
    let exclusive = QueueOptions {
        durable: false,
        exclusive: true,
        auto_delete: true,
    };
    broker.declare_queue(&owner, "reply.abc", exclusive).unwrap();

    assert!(matches!(
        broker.declare_queue(&other, "reply.abc", exclusive),
        Err(BrokerError::ResourceLocked(_))
    ));

    broker.cleanup_session(&owner);
    assert!(broker.queue_info("reply.abc").is_none());
}

#[test]
fn test_durable_messages_survive_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().to_str().unwrap().to_string();

    {
        let persistence = Persistence::open(&path).unwrap();
        let mut broker = Broker::with_persistence(persistence.clone()).unwrap();
        let (session, mut rx) = attach_session(&mut broker);
        broker
            .declare_queue(&session, QUEUE, QueueOptions::DURABLE)
            .unwrap();
        broker.publish(&session, QUEUE, props("m1"), "acked".into()).unwrap();
        broker.publish(&session, QUEUE, props("m2"), "kept".into()).unwrap();
        broker.consume(&session, 1, QUEUE, "c1", 1).unwrap();
        let (tag, _, _) = next_delivery(&mut rx).unwrap();
        broker.ack(&session, 1, tag).unwrap();
        persistence.flush().unwrap();
    }

    let broker = Broker::with_persistence(Persistence::open(&path).unwrap()).unwrap();
    let queue = &broker.queues[QUEUE];
    assert_eq!(queue.options, QueueOptions::DURABLE);
    assert_eq!(queue.ready.len(), 1);
    assert_eq!(queue.ready[0].body, "kept");
    assert_eq!(queue.ready[0].properties.message_id, "m2");
}

#[test]
fn test_auto_delete_queue_is_dropped_from_storage() {
    let dir = tempdir().unwrap();
    let path = dir.path().to_str().unwrap().to_string();
    let options = QueueOptions {
        auto_delete: true,
        ..QueueOptions::DURABLE
    };

    {
        let persistence = Persistence::open(&path).unwrap();
        let mut broker = Broker::with_persistence(persistence.clone()).unwrap();
        let (session, mut rx) = attach_session(&mut broker);
        broker.declare_queue(&session, "tmp.q", options).unwrap();
        broker.publish(&session, "tmp.q", props("m1"), "pending".into()).unwrap();
        broker.consume(&session, 1, "tmp.q", "c1", 1).unwrap();
        assert!(next_delivery(&mut rx).is_some());
        broker.cancel(&session, 1, "c1").unwrap();
        assert!(broker.queue_info("tmp.q").is_none());
        persistence.flush().unwrap();
    }

    let persistence = Persistence::open(&path).unwrap();
    assert!(persistence.load_queues().unwrap().is_empty());
    assert!(persistence.load_messages("tmp.q").unwrap().is_empty());
    let broker = Broker::with_persistence(persistence).unwrap();
    assert!(broker.queue_info("tmp.q").is_none());
}

#[test]
fn test_transient_messages_are_not_persisted() {
    let dir = tempdir().unwrap();
    let path = dir.path().to_str().unwrap().to_string();

    {
        let persistence = Persistence::open(&path).unwrap();
        let mut broker = Broker::with_persistence(persistence.clone()).unwrap();
        let (session, _rx) = attach_session(&mut broker);
        broker
            .declare_queue(&session, QUEUE, QueueOptions::DURABLE)
            .unwrap();
        let mut transient = props("m1");
        transient.persistent = false;
        broker.publish(&session, QUEUE, transient, "gone".into()).unwrap();
        persistence.flush().unwrap();
    }

    let broker = Broker::with_persistence(Persistence::open(&path).unwrap()).unwrap();
    assert!(broker.queues[QUEUE].ready.is_empty());
}
