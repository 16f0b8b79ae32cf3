//! Connection dispatcher
//!
//! Demultiplexes decoded packets from every transport connection into the
//! protocol engine. The dispatcher is intentionally dumb: a dispatch table
//! plus connection bookkeeping, so all protocol correctness lives in the
//! engine and can be tested without a transport.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, error, info};

use crate::broker::engine::Engine;
use crate::client::{Connection, ConnectionId};
use crate::protocol::Packet;

pub struct Dispatcher {
    engine: Arc<Engine>,
    connections: DashMap<ConnectionId, Arc<Connection>>,
}

impl Dispatcher {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            connections: DashMap::new(),
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Register a connection in the live set.
    pub fn connection_established(&self, conn: Arc<Connection>) {
        debug!(conn = %conn.id(), "connection established");
        self.connections.insert(conn.id(), conn);
    }

    /// Route one decoded packet to the matching engine handler.
    ///
    /// PINGREQ is answered inline; outbound-only packet kinds arriving
    /// inbound are silently ignored for forward compatibility. An engine
    /// failure is logged with the packet kind and converted into the
    /// connection's error signal; whether to close is the transport's call.
    pub fn on_message(&self, conn: &Arc<Connection>, packet: Packet) {
        let kind = packet.kind();
        debug!(conn = %conn.id(), kind, "processing packet");

        let result = match packet {
            Packet::Connect {
                client_id,
                clean_session,
            } => self.engine.process_connect(conn, &client_id, clean_session),
            Packet::Subscribe { message_id, topics } => {
                self.engine.process_subscribe(conn, message_id, &topics)
            }
            Packet::Unsubscribe { message_id, topics } => {
                self.engine.process_unsubscribe(conn, message_id, &topics)
            }
            Packet::Publish {
                topic,
                payload,
                qos,
                retain,
                message_id,
                ..
            } => self
                .engine
                .process_publish(conn, &topic, &payload, qos, retain, message_id),
            Packet::PubAck { message_id } => self.engine.process_pub_ack(conn, message_id),
            Packet::PubRec { message_id } => self.engine.process_pub_rec(conn, message_id),
            Packet::PubRel { message_id } => self.engine.process_pub_rel(conn, message_id),
            Packet::PubComp { message_id } => self.engine.process_pub_comp(conn, message_id),
            Packet::Disconnect => self.engine.process_disconnect(conn),
            Packet::PingReq => {
                // Pure keep-alive, no session effect.
                conn.send(Packet::PingResp);
                Ok(())
            }
            Packet::ConnAck { .. }
            | Packet::SubAck { .. }
            | Packet::UnsubAck { .. }
            | Packet::PingResp => Ok(()),
        };

        if let Err(e) = result {
            error!(conn = %conn.id(), kind, error = %e, "error while processing packet");
            conn.signal_error();
        }
    }

    /// Terminal transport event for a connection. Fires once per connection,
    /// on normal close, reset, or protocol error alike.
    pub fn connection_lost(&self, conn: &Arc<Connection>) {
        if let Some(client_id) = conn.client_id() {
            info!(%client_id, "notifying connection lost");
            if let Err(e) = self.engine.process_connection_lost(&client_id, conn) {
                error!(%client_id, error = %e, "connection-lost cleanup failed");
            }
        }
        self.connections.remove(&conn.id());
        conn.request_close();
    }

    /// Advisory flow-control relay from the transport. Only a transition to
    /// writable reaches the engine, so repeated notifications are idempotent.
    pub fn writability_changed(&self, conn: &Arc<Connection>, is_writable: bool) {
        if conn.set_writable(is_writable) {
            self.engine.notify_channel_writable(conn);
        }
    }

    /// Size of the live-connection set.
    pub fn live_connection_count(&self) -> usize {
        self.connections.len()
    }
}
