//! The `client` module defines the broker-side representation of a
//! connected client's transport channel.
//!
//! A `Connection` is an opaque handle: the dispatcher and engine use it to
//! send packets and to read the client identifier bound at CONNECT; the
//! transport layer uses its signals to decide when to close the socket.

pub mod connection;
pub use connection::{Connection, ConnectionId};
