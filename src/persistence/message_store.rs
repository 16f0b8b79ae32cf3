//! Sled-backed message store.
//!
//! Three durable tables: `retained` maps a topic to the guid of its current
//! retained message, `messages` maps a guid to the stored record, and the
//! session store's trees track which guids sessions still want. Records are
//! serialized with serde_json, keys are raw bytes. Sled trees are internally
//! synchronized, so all operations are safe under concurrent callers without
//! a store-wide lock.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use tracing::debug;

use crate::persistence::guid::Guid;
use crate::persistence::session_store::SessionStore;
use crate::protocol::Qos;
use crate::utils::error::StoreError;

const RETAINED_TREE: &str = "retained";
const MESSAGES_TREE: &str = "messages";

/// One persisted publish.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub client_id: String,
    pub message_id: u16,
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: Qos,
    pub retain: bool,
    pub stored_at: i64,
}

impl StoredMessage {
    pub fn new(
        client_id: &str,
        message_id: u16,
        topic: &str,
        payload: Vec<u8>,
        qos: Qos,
        retain: bool,
    ) -> Self {
        Self {
            client_id: client_id.to_string(),
            message_id,
            topic: topic.to_string(),
            payload,
            qos,
            retain,
            stored_at: Utc::now().timestamp_millis(),
        }
    }
}

/// Durable storage of published messages and the retained-message index.
pub struct MessageStore {
    retained: Tree,
    messages: Tree,
    sessions: SessionStore,
}

impl MessageStore {
    /// Open or create the store at `path`.
    pub fn open(path: &str) -> Result<Self, StoreError> {
        Self::with_db(sled::open(path)?)
    }

    pub fn with_db(db: Db) -> Result<Self, StoreError> {
        Ok(Self {
            retained: db.open_tree(RETAINED_TREE)?,
            messages: db.open_tree(MESSAGES_TREE)?,
            sessions: SessionStore::open(&db)?,
        })
    }

    /// The per-client pending-map surface backed by the same database.
    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Persist a publish and record the publisher's messageID -> GUID
    /// mapping, so later acknowledgments can be correlated.
    ///
    /// A publish re-using a still-pending message id displaces the earlier
    /// mapping; the displaced message body is garbage-collected unless
    /// something else still references it.
    pub fn store_for_future(&self, message: &StoredMessage) -> Result<Guid, StoreError> {
        let guid = self.persist(message)?;
        let displaced =
            self.sessions
                .insert_pending(&message.client_id, message.message_id, guid)?;
        if let Some(displaced) = displaced {
            self.remove_if_unreferenced(displaced)?;
        }
        debug!(
            client_id = %message.client_id,
            message_id = message.message_id,
            %guid,
            topic = %message.topic,
            "stored publish for future delivery"
        );
        Ok(guid)
    }

    /// Persist a message body without touching any session map. Used for
    /// retained QoS 0 publishes, which carry no delivery handshake.
    pub fn persist(&self, message: &StoredMessage) -> Result<Guid, StoreError> {
        if message.client_id.is_empty() {
            return Err(StoreError::MissingClientId);
        }
        let guid = Guid::random();
        let encoded = serde_json::to_vec(message)?;
        self.messages.insert(guid.as_bytes(), encoded)?;
        Ok(guid)
    }

    /// Make `guid` the retained message for `topic`, displacing any previous
    /// mapping. The displaced message becomes eligible for collection.
    pub fn store_retained(&self, topic: &str, guid: Guid) -> Result<(), StoreError> {
        debug!(%topic, %guid, "storing retained mapping");
        let previous = self.retained.insert(topic.as_bytes(), &guid.as_bytes()[..])?;
        if let Some(raw) = previous {
            if let Some(displaced) = Guid::from_slice(&raw) {
                self.remove_if_unreferenced(displaced)?;
            }
        }
        Ok(())
    }

    /// Clear the retained mapping for a topic (the empty-payload publish
    /// path). The former retained message becomes eligible for collection.
    pub fn clean_retained(&self, topic: &str) -> Result<(), StoreError> {
        debug!(%topic, "cleaning retained mapping");
        if let Some(raw) = self.retained.remove(topic.as_bytes())? {
            if let Some(displaced) = Guid::from_slice(&raw) {
                self.remove_if_unreferenced(displaced)?;
            }
        }
        Ok(())
    }

    /// Scan the retained index and return the stored message for every topic
    /// the predicate accepts. An entry whose message vanished under the scan
    /// is skipped rather than reported.
    pub fn search_matching<F>(&self, condition: F) -> Result<Vec<StoredMessage>, StoreError>
    where
        F: Fn(&str) -> bool,
    {
        let mut results = Vec::new();
        for entry in self.retained.iter() {
            let (key, value) = entry?;
            let Ok(topic) = std::str::from_utf8(&key) else {
                continue;
            };
            if !condition(topic) {
                continue;
            }
            let Some(guid) = Guid::from_slice(&value) else {
                continue;
            };
            if let Some(message) = self.get_by_guid(guid)? {
                results.push(message);
            }
        }
        Ok(results)
    }

    pub fn get_by_guid(&self, guid: Guid) -> Result<Option<StoredMessage>, StoreError> {
        match self.messages.get(guid.as_bytes())? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    /// Drop every pending mapping for a client and collect messages no one
    /// references anymore. Idempotent.
    pub fn drop_session(&self, client_id: &str) -> Result<(), StoreError> {
        debug!(%client_id, "dropping session messages");
        for guid in self.sessions.clear_session(client_id)? {
            self.remove_if_unreferenced(guid)?;
        }
        Ok(())
    }

    /// Delete a stored message once nothing wants it: zero session references
    /// and not the current retained value for its topic. A retained message
    /// survives indefinitely until explicitly cleared, even with no session
    /// referencing it.
    pub fn remove_if_unreferenced(&self, guid: Guid) -> Result<(), StoreError> {
        if self.sessions.ref_count(guid)? > 0 {
            return Ok(());
        }
        let Some(message) = self.get_by_guid(guid)? else {
            return Ok(());
        };
        if let Some(current) = self.retained.get(message.topic.as_bytes())? {
            if current.as_ref() == &guid.as_bytes()[..] {
                return Ok(());
            }
        }
        debug!(
            client_id = %message.client_id,
            message_id = message.message_id,
            %guid,
            topic = %message.topic,
            "dropping stored message"
        );
        self.messages.remove(guid.as_bytes())?;
        Ok(())
    }

    /// Outstanding in-flight mappings for a client, for backlog introspection.
    pub fn pending_count(&self, client_id: &str) -> Result<usize, StoreError> {
        self.sessions.pending_count(client_id)
    }
}

impl std::fmt::Debug for MessageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageStore").field("db", &"sled::Db").finish()
    }
}
