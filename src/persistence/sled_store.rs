use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use sled::{Db, Tree};

use crate::transport::message::{MessageProperties, QueueOptions};
use crate::utils::error::PersistenceError;

const QUEUES_TREE: &str = "queues";
const MESSAGES_TREE_PREFIX: &str = "messages:";

/// A durable queue declaration as written to disk.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct QueueRecord {
    pub name: String,
    pub options: QueueOptions,
}

/// A persistent message waiting in a durable queue.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub queue: String,
    pub properties: MessageProperties,
    pub body: String,
}

/// `sled`-backed store for durable queues and their persistent messages.
///
/// Declarations live in one tree keyed by queue name. Each queue's messages
/// live in their own tree keyed by a big-endian sequence number, so iteration
/// order is publish order.
#[derive(Clone)]
pub struct Persistence {
    db: Db,
}

impl Persistence {
    pub fn open(path: &str) -> Result<Self, PersistenceError> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    /// A fresh sequence number, monotonic across restarts.
    pub fn next_sequence(&self) -> Result<u64, PersistenceError> {
        Ok(self.db.generate_id()?)
    }

    pub fn save_queue(&self, record: &QueueRecord) -> Result<(), PersistenceError> {
        let data = serde_json::to_vec(record).map_err(PersistenceError::Encode)?;
        self.db
            .open_tree(QUEUES_TREE)?
            .insert(record.name.as_bytes(), data)?;
        Ok(())
    }

    /// Removes a queue declaration together with every message it held.
    pub fn remove_queue(&self, name: &str) -> Result<(), PersistenceError> {
        self.db.open_tree(QUEUES_TREE)?.remove(name.as_bytes())?;
        self.db.drop_tree(messages_tree(name))?;
        Ok(())
    }

    pub fn load_queues(&self) -> Result<Vec<QueueRecord>, PersistenceError> {
        let tree = self.db.open_tree(QUEUES_TREE)?;
        decode_all(&tree, QUEUES_TREE)
            .map(|records| records.into_iter().map(|(_, record)| record).collect())
    }

    pub fn store_message(&self, seq: u64, msg: &StoredMessage) -> Result<(), PersistenceError> {
        let data = serde_json::to_vec(msg).map_err(PersistenceError::Encode)?;
        self.db
            .open_tree(messages_tree(&msg.queue))?
            .insert(seq.to_be_bytes(), data)?;
        Ok(())
    }

    pub fn remove_message(&self, queue: &str, seq: u64) -> Result<(), PersistenceError> {
        self.db
            .open_tree(messages_tree(queue))?
            .remove(seq.to_be_bytes())?;
        Ok(())
    }

    /// Pending messages of a queue in publish order, with their sequence numbers.
    pub fn load_messages(&self, queue: &str) -> Result<Vec<(u64, StoredMessage)>, PersistenceError> {
        let name = messages_tree(queue);
        let tree = self.db.open_tree(&name)?;
        decode_all(&tree, &name)
    }

    pub fn flush(&self) -> Result<(), PersistenceError> {
        self.db.flush()?;
        Ok(())
    }
}

fn messages_tree(queue: &str) -> String {
    format!("{MESSAGES_TREE_PREFIX}{queue}")
}

fn decode_all<T: DeserializeOwned>(
    tree: &Tree,
    name: &str,
) -> Result<Vec<(u64, T)>, PersistenceError> {
    let mut out = Vec::new();
    for entry in tree.iter() {
        let (key, value) = entry?;
        let seq = <[u8; 8]>::try_from(key.as_ref())
            .map(u64::from_be_bytes)
            .unwrap_or_default();
        let record = serde_json::from_slice(&value).map_err(|source| PersistenceError::Corrupt {
            tree: name.to_string(),
            source,
        })?;
        out.push((seq, record));
    }
    Ok(out)
}

impl std::fmt::Debug for Persistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Persistence")
            .field("db", &"sled::Db")
            .finish()
    }
}
