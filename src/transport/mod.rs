//! The `transport` module carries frames between connections and the broker.
//!
//! It defines the JSON frame protocol shared by the broker and the client
//! library, and implements the WebSocket server that feeds decoded frames
//! to the broker.

pub mod message;
pub mod websocket;

pub use message::{ClientFrame, QueueOptions, ServerFrame};
pub use websocket::{serve, start_websocket_server};

#[cfg(test)]
mod tests;
#[cfg(test)]
mod websocket_tests;
