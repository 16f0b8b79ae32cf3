//! Protocol engine
//!
//! One handler per MQTT control packet, implementing the QoS handshake
//! state machines, session continuity across reconnects, and retained
//! message semantics on top of the message store.
//!
//! Concurrency notes:
//! - Handlers are safe to invoke concurrently for different connections.
//!   The session and subscription registries are sharded maps, and a client
//!   identifier has at most one live connection at any instant, so one
//!   client's session state is never mutated from two tasks at once.
//! - Protocol anomalies (acknowledgments for unknown message ids, packets
//!   from connections that never completed CONNECT) are logged and ignored.
//!   Only persistence failures propagate to the dispatcher.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::broker::topic::{SubscriptionRegistry, topic_matches};
use crate::client::Connection;
use crate::persistence::{MessageStore, StoredMessage};
use crate::protocol::{ConnectReturnCode, Packet, Qos, SubscribeTopic};
use crate::utils::error::{BrokerError, StoreError};

/// CONNECT admission collaborator.
pub trait Authenticator: Send + Sync {
    fn check(&self, client_id: &str) -> bool;
}

/// Default admission policy: every client is accepted.
pub struct AllowAll;

impl Authenticator for AllowAll {
    fn check(&self, _client_id: &str) -> bool {
        true
    }
}

/// Engine-side session record. The durable messageID -> GUID pending map
/// lives in the session store; this tracks the live binding and the
/// clean-session policy the client asked for.
#[derive(Debug)]
struct ClientSession {
    clean_session: bool,
    connection: Option<Arc<Connection>>,
}

pub struct Engine {
    store: Arc<MessageStore>,
    sessions: DashMap<String, ClientSession>,
    subscriptions: SubscriptionRegistry,
    authenticator: Arc<dyn Authenticator>,
}

impl Engine {
    pub fn new(store: Arc<MessageStore>) -> Self {
        Self::with_authenticator(store, Arc::new(AllowAll))
    }

    pub fn with_authenticator(store: Arc<MessageStore>, authenticator: Arc<dyn Authenticator>) -> Self {
        Self {
            store,
            sessions: DashMap::new(),
            subscriptions: SubscriptionRegistry::new(),
            authenticator,
        }
    }

    pub fn store(&self) -> &Arc<MessageStore> {
        &self.store
    }

    /// Outstanding in-flight messages for a client, for operational
    /// monitoring.
    pub fn pending_count(&self, client_id: &str) -> Result<usize, StoreError> {
        self.store.pending_count(client_id)
    }

    /// CONNECT: admit the client, enforce the one-live-connection-per-id
    /// invariant, and create or resume its session.
    pub fn process_connect(
        &self,
        conn: &Arc<Connection>,
        client_id: &str,
        clean_session: bool,
    ) -> Result<(), BrokerError> {
        if client_id.is_empty() {
            warn!(conn = %conn.id(), "CONNECT with empty client identifier rejected");
            conn.send(Packet::ConnAck {
                session_present: false,
                return_code: ConnectReturnCode::IdentifierRejected,
            });
            conn.request_close();
            return Ok(());
        }
        if !self.authenticator.check(client_id) {
            warn!(%client_id, "CONNECT not authorized");
            conn.send(Packet::ConnAck {
                session_present: false,
                return_code: ConnectReturnCode::NotAuthorized,
            });
            conn.request_close();
            return Ok(());
        }

        let existed = self.sessions.contains_key(client_id);
        if clean_session {
            // Abort before binding anything if the store is unavailable.
            self.store.drop_session(client_id)?;
            self.subscriptions.remove_client(client_id);
        }
        let session_present =
            !clean_session && (existed || self.store.pending_count(client_id)? > 0);

        {
            let mut session = self
                .sessions
                .entry(client_id.to_string())
                .or_insert_with(|| ClientSession {
                    clean_session,
                    connection: None,
                });
            if let Some(previous) = session.connection.take() {
                if previous.id() != conn.id() {
                    info!(%client_id, "client takeover, disconnecting previous connection");
                    previous.unbind_client();
                    previous.request_close();
                }
            }
            session.clean_session = clean_session;
            session.connection = Some(conn.clone());
        }

        conn.bind_client(client_id);
        conn.send(Packet::ConnAck {
            session_present,
            return_code: ConnectReturnCode::Accepted,
        });
        info!(%client_id, clean_session, session_present, "client connected");
        Ok(())
    }

    /// SUBSCRIBE: register each filter, deliver retained catch-up messages
    /// at min(stored, requested) QoS, and acknowledge with the granted
    /// levels.
    pub fn process_subscribe(
        &self,
        conn: &Arc<Connection>,
        message_id: u16,
        topics: &[SubscribeTopic],
    ) -> Result<(), BrokerError> {
        let Some(client_id) = conn.client_id() else {
            warn!(conn = %conn.id(), "SUBSCRIBE from unbound connection ignored");
            return Ok(());
        };

        let mut granted = Vec::with_capacity(topics.len());
        for subscription in topics {
            self.subscriptions
                .subscribe(&subscription.filter, client_id.clone(), subscription.qos);
            granted.push(subscription.qos);
            debug!(%client_id, filter = %subscription.filter, qos = ?subscription.qos, "subscribed");

            let retained = self
                .store
                .search_matching(|topic| topic_matches(&subscription.filter, topic))?;
            for stored in retained {
                let qos = stored.qos.min(subscription.qos);
                let message_id = (qos > Qos::AtMostOnce).then(|| conn.next_message_id());
                conn.send(Packet::Publish {
                    topic: stored.topic,
                    payload: stored.payload,
                    qos,
                    retain: true,
                    message_id,
                    dup: false,
                });
            }
        }

        conn.send(Packet::SubAck { message_id, granted });
        Ok(())
    }

    /// UNSUBSCRIBE: drop the filters and acknowledge.
    pub fn process_unsubscribe(
        &self,
        conn: &Arc<Connection>,
        message_id: u16,
        topics: &[String],
    ) -> Result<(), BrokerError> {
        let Some(client_id) = conn.client_id() else {
            warn!(conn = %conn.id(), "UNSUBSCRIBE from unbound connection ignored");
            return Ok(());
        };
        for filter in topics {
            self.subscriptions.unsubscribe(filter, &client_id);
            debug!(%client_id, %filter, "unsubscribed");
        }
        conn.send(Packet::UnsubAck { message_id });
        Ok(())
    }

    /// PUBLISH: QoS 0 is fan-out only; QoS >= 1 persists the message,
    /// records the publisher's pending mapping, fans out, and starts the
    /// acknowledgment handshake. The retain flag updates (or, for an empty
    /// payload, clears) the retained index regardless of QoS.
    pub fn process_publish(
        &self,
        conn: &Arc<Connection>,
        topic: &str,
        payload: &[u8],
        qos: Qos,
        retain: bool,
        message_id: Option<u16>,
    ) -> Result<(), BrokerError> {
        let Some(client_id) = conn.client_id() else {
            warn!(conn = %conn.id(), "PUBLISH from unbound connection ignored");
            return Ok(());
        };

        match qos {
            Qos::AtMostOnce => {
                self.fan_out(topic, payload, qos);
                if retain {
                    self.update_retained_fire_and_forget(&client_id, topic, payload)?;
                }
            }
            Qos::AtLeastOnce | Qos::ExactlyOnce => {
                let Some(message_id) = message_id else {
                    warn!(%client_id, %topic, "QoS > 0 PUBLISH without message id ignored");
                    return Ok(());
                };
                let stored = StoredMessage::new(
                    &client_id,
                    message_id,
                    topic,
                    payload.to_vec(),
                    qos,
                    retain,
                );
                let guid = self.store.store_for_future(&stored)?;
                if retain {
                    if payload.is_empty() {
                        self.store.clean_retained(topic)?;
                    } else {
                        self.store.store_retained(topic, guid)?;
                    }
                }
                self.fan_out(topic, payload, qos);
                conn.send(match qos {
                    Qos::AtLeastOnce => Packet::PubAck { message_id },
                    _ => Packet::PubRec { message_id },
                });
            }
        }
        debug!(%client_id, %topic, ?qos, retain, "publish processed");
        Ok(())
    }

    /// PUBACK: QoS 1 completion, releases the publisher's pending entry.
    pub fn process_pub_ack(&self, conn: &Arc<Connection>, message_id: u16) -> Result<(), BrokerError> {
        let Some(client_id) = conn.client_id() else {
            warn!(conn = %conn.id(), "PUBACK from unbound connection ignored");
            return Ok(());
        };
        self.release_pending(&client_id, message_id, "PUBACK")?;
        Ok(())
    }

    /// PUBREC: first half of the outbound QoS 2 handshake; answer PUBREL.
    pub fn process_pub_rec(&self, conn: &Arc<Connection>, message_id: u16) -> Result<(), BrokerError> {
        debug!(conn = %conn.id(), message_id, "PUBREC received, sending PUBREL");
        conn.send(Packet::PubRel { message_id });
        Ok(())
    }

    /// PUBREL: second half of the inbound QoS 2 handshake; release the
    /// pending entry and always answer PUBCOMP, a duplicate retransmission
    /// after release is a logged anomaly only.
    pub fn process_pub_rel(&self, conn: &Arc<Connection>, message_id: u16) -> Result<(), BrokerError> {
        if let Some(client_id) = conn.client_id() {
            self.release_pending(&client_id, message_id, "PUBREL")?;
        } else {
            warn!(conn = %conn.id(), "PUBREL from unbound connection");
        }
        conn.send(Packet::PubComp { message_id });
        Ok(())
    }

    /// PUBCOMP: outbound QoS 2 completion. No broker-side state is tracked
    /// for deliveries to subscribers, so this is an observation point only.
    pub fn process_pub_comp(&self, conn: &Arc<Connection>, message_id: u16) -> Result<(), BrokerError> {
        debug!(conn = %conn.id(), message_id, "PUBCOMP received");
        Ok(())
    }

    /// DISCONNECT: graceful termination. Connection loss, graceful or not,
    /// runs session-lifecycle cleanup per the clean-session flag: a clean
    /// session is discarded here and now, a persistent one is kept for
    /// resumption at the next CONNECT.
    pub fn process_disconnect(&self, conn: &Arc<Connection>) -> Result<(), BrokerError> {
        if let Some(client_id) = conn.client_id() {
            let clean_session = {
                match self.sessions.get_mut(&client_id) {
                    Some(mut session) => {
                        session.connection = None;
                        session.clean_session
                    }
                    None => false,
                }
            };
            if clean_session {
                self.drop_client_state(&client_id)?;
                info!(%client_id, "client disconnected, clean session dropped");
            } else {
                info!(%client_id, "client disconnected, session kept for resumption");
            }
        }
        conn.unbind_client();
        conn.request_close();
        Ok(())
    }

    /// Ungraceful termination. A clean session is deleted together with its
    /// pending messages and subscriptions; otherwise the session is kept for
    /// resumption.
    pub fn process_connection_lost(
        &self,
        client_id: &str,
        conn: &Arc<Connection>,
    ) -> Result<(), BrokerError> {
        let clean_session = {
            let Some(mut session) = self.sessions.get_mut(client_id) else {
                return Ok(());
            };
            // A lost notification from a taken-over connection must not
            // touch the successor's session.
            if let Some(live) = &session.connection {
                if live.id() != conn.id() {
                    return Ok(());
                }
            }
            session.connection = None;
            session.clean_session
        };

        if clean_session {
            self.drop_client_state(client_id)?;
            info!(%client_id, "connection lost, clean session dropped");
        } else {
            info!(%client_id, "connection lost, session kept for resumption");
        }
        Ok(())
    }

    /// Writability resumed on a connection: flush its parked deliveries.
    /// Idempotent.
    pub fn notify_channel_writable(&self, conn: &Arc<Connection>) {
        debug!(conn = %conn.id(), "channel writable, draining backlog");
        conn.drain_backlog();
    }

    /// Discard everything the broker holds for a clean-session client:
    /// durable pending state, subscriptions and the session entry.
    fn drop_client_state(&self, client_id: &str) -> Result<(), StoreError> {
        self.store.drop_session(client_id)?;
        self.subscriptions.remove_client(client_id);
        self.sessions.remove(client_id);
        Ok(())
    }

    /// Remove a pending messageID -> GUID mapping and garbage-collect the
    /// message if nothing references it anymore.
    fn release_pending(
        &self,
        client_id: &str,
        message_id: u16,
        packet_kind: &str,
    ) -> Result<(), StoreError> {
        match self.store.sessions().take_pending(client_id, message_id)? {
            Some(guid) => {
                self.store.remove_if_unreferenced(guid)?;
                debug!(%client_id, message_id, %guid, packet_kind, "in-flight message released");
            }
            None => {
                warn!(%client_id, message_id, packet_kind, "acknowledgment for unknown message id");
            }
        }
        Ok(())
    }

    /// Persist-and-index path for a retained QoS 0 publish, which carries no
    /// delivery handshake. An empty payload clears the retention slot.
    fn update_retained_fire_and_forget(
        &self,
        client_id: &str,
        topic: &str,
        payload: &[u8],
    ) -> Result<(), StoreError> {
        if payload.is_empty() {
            return self.store.clean_retained(topic);
        }
        let stored =
            StoredMessage::new(client_id, 0, topic, payload.to_vec(), Qos::AtMostOnce, true);
        let guid = self.store.persist(&stored)?;
        self.store.store_retained(topic, guid)
    }

    /// Deliver a publish to every live subscriber whose filter matches, each
    /// at the minimum of the publish QoS and its subscription QoS.
    fn fan_out(&self, topic: &str, payload: &[u8], publish_qos: Qos) {
        for (subscriber, subscription_qos) in self.subscriptions.matching(topic) {
            let connection = match self.sessions.get(&subscriber) {
                Some(session) => session.connection.clone(),
                None => None,
            };
            let Some(connection) = connection else {
                debug!(%subscriber, %topic, "subscriber offline, delivery skipped");
                continue;
            };
            let qos = publish_qos.min(subscription_qos);
            let message_id = (qos > Qos::AtMostOnce).then(|| connection.next_message_id());
            connection.send(Packet::Publish {
                topic: topic.to_string(),
                payload: payload.to_vec(),
                qos,
                retain: false,
                message_id,
                dup: false,
            });
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("sessions", &self.sessions.len())
            .finish()
    }
}
