//! # salesbus
//!
//! `salesbus` is the messaging layer between a sales service and an
//! inventory service: durable queues, persistent JSON messages,
//! at-least-once delivery with manual acknowledgment, one message in flight
//! per consumer, and a request/response pattern correlated by id.
//!
//! ## Core Modules
//!
//! - `broker`: the queue engine: queues, consumers, dispatch and settlement.
//! - `transport`: the JSON frame protocol and the WebSocket server in front of the broker.
//! - `persistence`: `sled` storage for durable queues and persistent messages.
//! - `client`: connections and channels to the broker.
//! - `bus`: publishers, subscribers, the type registry and request/response.
//! - `events`: queue names and the payloads exchanged on them.
//! - `inventory`: the stock ledger driven by sales.
//! - `config`: layered settings from file, `.env` and environment.
//! - `utils`: error types and logging.

pub mod broker;
pub mod bus;
pub mod client;
pub mod config;
pub mod events;
pub mod inventory;
pub mod persistence;
pub mod transport;
pub mod utils;
