//! # stormq
//!
//! `stormq` is the processing core of a small MQTT message broker: it turns
//! decoded control packets into durable, ordered publish/subscribe semantics
//! across many concurrently connected clients, with at-least-once and
//! exactly-once delivery handshakes, session continuity across reconnects,
//! and retained messages persisted in an embedded `sled` store.
//!
//! ## Core Modules
//!
//! - `protocol`: the decoded control-packet sum type and QoS levels.
//! - `broker`: the connection dispatcher, the protocol engine, and the
//!   subscription registry.
//! - `client`: the broker-side handle to one client's transport channel.
//! - `persistence`: durable storage of messages, the retained index, and
//!   per-client pending-delivery maps.
//! - `config`: loading and merging server configuration.
//! - `transport`: the websocket server feeding the dispatcher.
//! - `utils`: error types and logging setup.

pub mod broker;
pub mod client;
pub mod config;
pub mod persistence;
pub mod protocol;
pub mod transport;
pub mod utils;

#[cfg(test)]
mod tests;
