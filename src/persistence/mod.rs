//! The `persistence` module provides durable storage for published messages,
//! the retained-message index, and per-client pending-delivery maps.
//!
//! It uses `sled` as an embedded key-value store; every table from the
//! logical layout (retained, messages, sessions, refs) is one named tree.

pub mod guid;
pub mod message_store;
pub mod session_store;

pub use guid::Guid;
pub use message_store::{MessageStore, StoredMessage};
pub use session_store::SessionStore;

#[cfg(test)]
mod tests;
