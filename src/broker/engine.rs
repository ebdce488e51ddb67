//! Broker engine
//!
//! This module contains the queue broker responsible for:
//! - declaring queues idempotently and rejecting conflicting redeclarations
//! - accepting published messages into a queue
//! - dispatching ready messages to consumers, never exceeding a consumer's
//!   prefetch limit of unacknowledged deliveries
//! - settling deliveries: ack removes a message for good, nack either drops
//!   it or puts it back at the head of the queue
//! - returning unacknowledged messages to their queue when a consumer,
//!   channel or session goes away
//! - writing durable queues and persistent messages through to `Persistence`
//!
//! Concurrency and usage notes:
//! - The API here is synchronous and designed to be held behind a lock
//!   (`SharedBroker`) by the transport layer. Frames to sessions are pushed
//!   into unbounded channels, so no network I/O happens under the lock.
//! - There is no dead-letter routing. A message rejected without requeue is
//!   gone.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use tracing::{debug, error, info, warn};

use crate::broker::message::QueuedMessage;
use crate::broker::queue::{ConsumerKey, Queue, QueueInfo};
use crate::broker::session::{Session, SessionId};
use crate::persistence::{Persistence, QueueRecord};
use crate::transport::message::{
    ChannelId, DeliveryTag, MessageProperties, QueueOptions, ServerFrame,
};
use crate::utils::error::BrokerError;

pub type SharedBroker = Arc<Mutex<Broker>>;

/// One consumer registration and the deliveries it has not settled yet.
#[derive(Debug)]
pub struct Consumer {
    pub key: ConsumerKey,
    pub channel: ChannelId,
    pub queue: String,
    /// Maximum unacknowledged deliveries; `0` means unlimited.
    pub prefetch: u16,
    pub unacked: BTreeMap<DeliveryTag, QueuedMessage>,
}

impl Consumer {
    pub fn has_capacity(&self) -> bool {
        self.prefetch == 0 || self.unacked.len() < usize::from(self.prefetch)
    }
}

#[derive(Debug, Default)]
pub struct Broker {
    pub queues: HashMap<String, Queue>,
    pub sessions: HashMap<SessionId, Session>,
    pub consumers: HashMap<ConsumerKey, Consumer>,
    persistence: Option<Persistence>,
}

impl Broker {
    /// A broker whose queues live in memory only.
    pub fn new() -> Self {
        Self::default()
    }

    /// A broker backed by `persistence`. Durable queues declared in an
    /// earlier run are restored together with their pending messages.
    pub fn with_persistence(persistence: Persistence) -> Result<Self, BrokerError> {
        let mut queues = HashMap::new();
        for record in persistence.load_queues()? {
            let mut queue = Queue::new(&record.name, record.options, None);
            for (seq, stored) in persistence.load_messages(&record.name)? {
                queue.ready.push_back(QueuedMessage::restored(seq, stored));
            }
            info!(
                queue = %record.name,
                messages = queue.ready.len(),
                "restored durable queue"
            );
            queues.insert(record.name, queue);
        }

        Ok(Self {
            queues,
            sessions: HashMap::new(),
            consumers: HashMap::new(),
            persistence: Some(persistence),
        })
    }

    pub fn shared(self) -> SharedBroker {
        Arc::new(Mutex::new(self))
    }

    pub fn register_session(&mut self, session: Session) {
        debug!(session = %session.id, "session registered");
        self.sessions.insert(session.id.clone(), session);
    }

    pub fn queue_info(&self, name: &str) -> Option<QueueInfo> {
        self.queues.get(name).map(Queue::info)
    }

    /// Declares a queue, creating it if it does not exist.
    ///
    /// Redeclaring with identical options is a no-op that reports the
    /// current state. Redeclaring with different options fails and leaves
    /// the queue untouched.
    pub fn declare_queue(
        &mut self,
        session_id: &str,
        name: &str,
        options: QueueOptions,
    ) -> Result<QueueInfo, BrokerError> {
        if let Some(queue) = self.queues.get(name) {
            if !queue.accessible_by(session_id) {
                return Err(BrokerError::ResourceLocked(name.to_string()));
            }
            if queue.options != options {
                return Err(BrokerError::PreconditionFailed {
                    queue: name.to_string(),
                    existing: queue.options.to_string(),
                    requested: options.to_string(),
                });
            }
            return Ok(queue.info());
        }

        if options.durable && !options.exclusive {
            if let Some(persistence) = &self.persistence {
                persistence.save_queue(&QueueRecord {
                    name: name.to_string(),
                    options,
                })?;
            }
        }

        let owner = options.exclusive.then(|| session_id.to_string());
        let queue = Queue::new(name, options, owner);
        let info = queue.info();
        self.queues.insert(name.to_string(), queue);
        info!(queue = %name, %options, "queue declared");
        Ok(info)
    }

    /// Appends a message to a queue and dispatches it if a consumer is free.
    pub fn publish(
        &mut self,
        session_id: &str,
        queue_name: &str,
        properties: MessageProperties,
        body: String,
    ) -> Result<(), BrokerError> {
        let queue = self
            .queues
            .get_mut(queue_name)
            .ok_or_else(|| BrokerError::QueueNotFound(queue_name.to_string()))?;
        if !queue.accessible_by(session_id) {
            return Err(BrokerError::ResourceLocked(queue_name.to_string()));
        }

        let mut msg = QueuedMessage::new(queue_name, properties, body);
        if queue.options.durable && msg.properties.persistent {
            if let Some(persistence) = &self.persistence {
                let seq = persistence.next_sequence()?;
                persistence.store_message(seq, &msg.to_stored())?;
                msg.seq = Some(seq);
            }
        }

        debug!(queue = %queue_name, message_id = %msg.properties.message_id, "message enqueued");
        queue.ready.push_back(msg);
        self.dispatch(queue_name);
        Ok(())
    }

    /// Attaches a consumer to a queue. Ready messages start flowing
    /// immediately, at most `prefetch` at a time.
    pub fn consume(
        &mut self,
        session_id: &str,
        channel: ChannelId,
        queue_name: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<(), BrokerError> {
        if !self.sessions.contains_key(session_id) {
            return Err(BrokerError::UnknownSession(session_id.to_string()));
        }
        let queue = self
            .queues
            .get_mut(queue_name)
            .ok_or_else(|| BrokerError::QueueNotFound(queue_name.to_string()))?;
        if !queue.accessible_by(session_id) {
            return Err(BrokerError::ResourceLocked(queue_name.to_string()));
        }

        let key = ConsumerKey {
            session: session_id.to_string(),
            tag: consumer_tag.to_string(),
        };
        if self.consumers.contains_key(&key) {
            return Err(BrokerError::DuplicateConsumer(consumer_tag.to_string()));
        }

        queue.add_consumer(key.clone());
        self.consumers.insert(
            key.clone(),
            Consumer {
                key,
                channel,
                queue: queue_name.to_string(),
                prefetch,
                unacked: BTreeMap::new(),
            },
        );
        info!(queue = %queue_name, consumer = %consumer_tag, prefetch, "consumer attached");

        self.dispatch(queue_name);
        Ok(())
    }

    /// Settles a delivery as processed. The message is removed for good.
    pub fn ack(
        &mut self,
        session_id: &str,
        channel: ChannelId,
        delivery_tag: DeliveryTag,
    ) -> Result<(), BrokerError> {
        let msg = self.take_unacked(session_id, channel, delivery_tag)?;
        self.forget(&msg)?;
        debug!(queue = %msg.queue, delivery_tag, "delivery acknowledged");
        self.dispatch(&msg.queue);
        Ok(())
    }

    /// Settles a delivery as failed. With `requeue` the message goes back to
    /// the head of its queue; without it the message is discarded.
    pub fn nack(
        &mut self,
        session_id: &str,
        channel: ChannelId,
        delivery_tag: DeliveryTag,
        requeue: bool,
    ) -> Result<(), BrokerError> {
        let msg = self.take_unacked(session_id, channel, delivery_tag)?;
        let queue_name = msg.queue.clone();

        if requeue {
            if let Some(queue) = self.queues.get_mut(&queue_name) {
                queue.requeue_front(vec![msg]);
            }
        } else {
            self.forget(&msg)?;
            warn!(
                queue = %queue_name,
                message_id = %msg.properties.message_id,
                "message rejected without requeue; no dead-letter target, discarded"
            );
        }

        self.dispatch(&queue_name);
        Ok(())
    }

    /// Detaches a consumer. Its unacknowledged deliveries return to the queue.
    pub fn cancel(
        &mut self,
        session_id: &str,
        channel: ChannelId,
        consumer_tag: &str,
    ) -> Result<(), BrokerError> {
        let key = ConsumerKey {
            session: session_id.to_string(),
            tag: consumer_tag.to_string(),
        };
        match self.consumers.get(&key) {
            Some(consumer) if consumer.channel == channel => {}
            _ => return Err(BrokerError::ConsumerNotFound(consumer_tag.to_string())),
        }
        self.detach(&key);
        Ok(())
    }

    /// Detaches every consumer opened on a channel of a session.
    pub fn close_channel(&mut self, session_id: &str, channel: ChannelId) {
        let keys: Vec<_> = self
            .consumers
            .values()
            .filter(|c| c.key.session == session_id && c.channel == channel)
            .map(|c| c.key.clone())
            .collect();
        for key in keys {
            self.detach(&key);
        }
        debug!(session = %session_id, channel, "channel closed");
    }

    /// Removes a session: detaches its consumers, returning their
    /// unacknowledged messages, and deletes the exclusive queues it owned.
    pub fn cleanup_session(&mut self, session_id: &str) {
        let keys: Vec<_> = self
            .consumers
            .keys()
            .filter(|k| k.session == session_id)
            .cloned()
            .collect();
        for key in keys {
            self.detach(&key);
        }

        self.sessions.remove(session_id);
        self.queues
            .retain(|_, q| q.owner.as_deref() != Some(session_id));

        info!(session = %session_id, "cleaned up session");
    }

    fn detach(&mut self, key: &ConsumerKey) {
        let Some(consumer) = self.consumers.remove(key) else {
            return;
        };

        let mut delete_queue = false;
        if let Some(queue) = self.queues.get_mut(&consumer.queue) {
            queue.remove_consumer(key);
            let returned = consumer.unacked.into_values().collect::<Vec<_>>();
            if !returned.is_empty() {
                debug!(queue = %queue.name, count = returned.len(), "returning unacked messages");
            }
            queue.requeue_front(returned);
            delete_queue = queue.options.auto_delete && queue.consumers.is_empty();
        }
        info!(queue = %consumer.queue, consumer = %key.tag, "consumer detached");

        if delete_queue {
            self.queues.remove(&consumer.queue);
            if let Some(persistence) = &self.persistence {
                if let Err(e) = persistence.remove_queue(&consumer.queue) {
                    error!(queue = %consumer.queue, "failed to drop stored queue: {e}");
                }
            }
            info!(queue = %consumer.queue, "auto-delete queue removed");
        } else {
            self.dispatch(&consumer.queue);
        }
    }

    fn take_unacked(
        &mut self,
        session_id: &str,
        channel: ChannelId,
        delivery_tag: DeliveryTag,
    ) -> Result<QueuedMessage, BrokerError> {
        self.consumers
            .values_mut()
            .filter(|c| c.key.session == session_id && c.channel == channel)
            .find_map(|c| c.unacked.remove(&delivery_tag))
            .ok_or(BrokerError::UnknownDeliveryTag(delivery_tag))
    }

    fn forget(&self, msg: &QueuedMessage) -> Result<(), BrokerError> {
        if let (Some(seq), Some(persistence)) = (msg.seq, &self.persistence) {
            persistence.remove_message(&msg.queue, seq)?;
        }
        Ok(())
    }

    /// Hands ready messages to consumers with spare prefetch capacity,
    /// round-robin, until either runs out.
    fn dispatch(&mut self, queue_name: &str) {
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return;
        };

        while !queue.ready.is_empty() {
            let order: Vec<usize> = queue.rotation().collect();
            let chosen = order.into_iter().find(|&i| {
                self.consumers
                    .get(&queue.consumers[i])
                    .is_some_and(Consumer::has_capacity)
            });
            let Some(index) = chosen else {
                break;
            };
            queue.advance_past(index);

            let key = &queue.consumers[index];
            let (Some(consumer), Some(session)) =
                (self.consumers.get_mut(key), self.sessions.get_mut(&key.session))
            else {
                break;
            };
            let Some(msg) = queue.ready.pop_front() else {
                break;
            };

            let delivery_tag = session.next_delivery_tag();
            let frame = ServerFrame::Deliver {
                channel: consumer.channel,
                consumer_tag: key.tag.clone(),
                delivery_tag,
                redelivered: msg.redelivered,
                queue: msg.queue.clone(),
                properties: msg.properties.clone(),
                body: msg.body.clone(),
            };

            if !session.send(&frame) {
                warn!(session = %session.id, queue = %queue_name, "session gone, keeping message queued");
                queue.ready.push_front(msg);
                break;
            }
            consumer.unacked.insert(delivery_tag, msg);
        }
    }
}
