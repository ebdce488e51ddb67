use std::collections::VecDeque;

use crate::broker::message::QueuedMessage;
use crate::broker::session::SessionId;
use crate::transport::message::QueueOptions;

/// Identifies one consumer registration: consumer tags are unique per session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConsumerKey {
    pub session: SessionId,
    pub tag: String,
}

/// Snapshot of a queue's state returned by declarations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    pub message_count: usize,
    pub consumer_count: usize,
}

/// A named queue in the broker.
///
/// Holds the messages that are ready for delivery, in delivery order, and
/// the consumers attached to it. Messages handed to a consumer but not yet
/// acknowledged are tracked by the consumer, not here.
#[derive(Debug)]
pub struct Queue {
    pub name: String,
    pub options: QueueOptions,
    /// Owning session of an exclusive queue.
    pub owner: Option<SessionId>,
    pub ready: VecDeque<QueuedMessage>,
    pub consumers: Vec<ConsumerKey>,
    cursor: usize,
}

impl Queue {
    pub fn new(name: &str, options: QueueOptions, owner: Option<SessionId>) -> Self {
        Self {
            name: name.to_string(),
            options,
            owner,
            ready: VecDeque::new(),
            consumers: Vec::new(),
            cursor: 0,
        }
    }

    pub fn info(&self) -> QueueInfo {
        QueueInfo {
            name: self.name.clone(),
            message_count: self.ready.len(),
            consumer_count: self.consumers.len(),
        }
    }

    /// Whether `session` may use this queue.
    pub fn accessible_by(&self, session: &str) -> bool {
        match &self.owner {
            Some(owner) => owner == session,
            None => true,
        }
    }

    pub fn add_consumer(&mut self, key: ConsumerKey) {
        self.consumers.push(key);
    }

    pub fn remove_consumer(&mut self, key: &ConsumerKey) {
        self.consumers.retain(|k| k != key);
        if self.cursor >= self.consumers.len() {
            self.cursor = 0;
        }
    }

    /// Consumer indices in round-robin order, starting after the last one served.
    pub fn rotation(&self) -> impl Iterator<Item = usize> + '_ {
        let n = self.consumers.len();
        (0..n).map(move |i| (self.cursor + i) % n)
    }

    pub fn advance_past(&mut self, index: usize) {
        self.cursor = (index + 1) % self.consumers.len().max(1);
    }

    /// Returns messages to the head of the queue, keeping their relative order.
    pub fn requeue_front(&mut self, messages: Vec<QueuedMessage>) {
        for mut msg in messages.into_iter().rev() {
            msg.redelivered = true;
            self.ready.push_front(msg);
        }
    }
}
