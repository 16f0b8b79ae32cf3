//! The broker core: connection dispatcher, protocol engine, and the
//! subscription registry.
//!
//! The dispatcher routes decoded packets by kind and tracks the live
//! connection set; the engine owns MQTT semantics (QoS handshakes, session
//! lifecycle, retained messages) and talks to the persistence layer.

pub mod dispatcher;
pub mod engine;
pub mod topic;

pub use dispatcher::Dispatcher;
pub use engine::{AllowAll, Authenticator, Engine};
