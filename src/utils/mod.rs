//! Shared utilities: the crate's error types and logging setup.

pub mod error;
pub mod logging;

pub use error::{BrokerError, BusError, InventoryError, PersistenceError};
