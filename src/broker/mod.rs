//! The broker side: durable queues, sessions, consumers and delivery
//! settlement. The transport layer feeds it decoded frames.

pub mod engine;
pub mod message;
pub mod queue;
pub mod session;

pub use engine::{Broker, SharedBroker};
pub use queue::QueueInfo;
pub use session::Session;

#[cfg(test)]
mod tests;
