//! The `client` module is the service side of the broker protocol.
//!
//! A [`Connection`] owns the socket to the broker; [`Channel`]s are numbered
//! lanes over it on which queues are declared, messages published and
//! consumers started.

pub mod channel;
pub mod connection;

pub use channel::{Channel, Deliveries, Delivery};
pub use connection::Connection;
