//! The `transport` module handles network communication with clients over
//! websockets.
//!
//! It is a thin collaborator: frames are decoded into `Packet`s with
//! serde_json and handed to the dispatcher, which owns all protocol
//! semantics. Writability and close decisions stay here.

pub mod websocket;
