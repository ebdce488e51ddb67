//! The `persistence` module keeps durable queues alive across broker restarts.
//!
//! It uses `sled` as an embedded key-value store: queue declarations in one
//! tree, each durable queue's persistent messages in a tree of its own.

pub mod sled_store;

pub use sled_store::{Persistence, QueueRecord, StoredMessage};
