//! Per-client pending-delivery bookkeeping.
//!
//! One sled tree holds every client's in-flight map under a compound
//! (client id, message id) key, so the tree count stays fixed no matter how
//! many clients exist. A second tree keeps the per-guid reference count the
//! message store consults before garbage-collecting a message.

use sled::{Db, Tree};

use crate::persistence::guid::Guid;
use crate::utils::error::StoreError;

const PENDING_TREE: &str = "sessions";
const REFS_TREE: &str = "refs";

/// Separator between client id and message id in compound keys. MQTT client
/// identifiers cannot contain NUL, so the prefix scan is unambiguous.
const KEY_SEP: u8 = 0;

fn pending_key(client_id: &str, message_id: u16) -> Vec<u8> {
    let mut key = Vec::with_capacity(client_id.len() + 3);
    key.extend_from_slice(client_id.as_bytes());
    key.push(KEY_SEP);
    key.extend_from_slice(&message_id.to_be_bytes());
    key
}

fn client_prefix(client_id: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(client_id.len() + 1);
    prefix.extend_from_slice(client_id.as_bytes());
    prefix.push(KEY_SEP);
    prefix
}

fn decode_guid(raw: &[u8]) -> Result<Guid, StoreError> {
    Guid::from_slice(raw).ok_or_else(|| StoreError::Corrupt {
        key: format!("guid value of {} bytes", raw.len()),
    })
}

fn decode_count(raw: &[u8]) -> u64 {
    raw.try_into().map(u64::from_be_bytes).unwrap_or(0)
}

/// Durable messageID -> GUID map, one logical namespace per client.
#[derive(Debug, Clone)]
pub struct SessionStore {
    pending: Tree,
    refs: Tree,
}

impl SessionStore {
    pub fn open(db: &Db) -> Result<Self, StoreError> {
        Ok(Self {
            pending: db.open_tree(PENDING_TREE)?,
            refs: db.open_tree(REFS_TREE)?,
        })
    }

    /// Record a pending mapping, bumping the guid's reference count.
    ///
    /// Re-using a message id that is still pending replaces the old mapping,
    /// releases its reference and returns the displaced guid so the caller
    /// can garbage-collect the message body.
    pub fn insert_pending(
        &self,
        client_id: &str,
        message_id: u16,
        guid: Guid,
    ) -> Result<Option<Guid>, StoreError> {
        let key = pending_key(client_id, message_id);
        let previous = self.pending.insert(key, &guid.as_bytes()[..])?;
        let displaced = match previous {
            Some(raw) => {
                let prev = decode_guid(&raw)?;
                self.decrement_ref(prev)?;
                Some(prev)
            }
            None => None,
        };
        self.increment_ref(guid)?;
        Ok(displaced)
    }

    /// Remove one pending mapping and return the guid it pointed at.
    pub fn take_pending(
        &self,
        client_id: &str,
        message_id: u16,
    ) -> Result<Option<Guid>, StoreError> {
        match self.pending.remove(pending_key(client_id, message_id))? {
            Some(raw) => {
                let guid = decode_guid(&raw)?;
                self.decrement_ref(guid)?;
                Ok(Some(guid))
            }
            None => Ok(None),
        }
    }

    /// Number of outstanding in-flight mappings for a client.
    pub fn pending_count(&self, client_id: &str) -> Result<usize, StoreError> {
        let mut count = 0;
        for entry in self.pending.scan_prefix(client_prefix(client_id)) {
            entry?;
            count += 1;
        }
        Ok(count)
    }

    /// Guids currently referenced by a client's pending map.
    pub fn pending_guids(&self, client_id: &str) -> Result<Vec<Guid>, StoreError> {
        let mut guids = Vec::new();
        for entry in self.pending.scan_prefix(client_prefix(client_id)) {
            let (_, raw) = entry?;
            guids.push(decode_guid(&raw)?);
        }
        Ok(guids)
    }

    /// Drop a client's entire pending map, releasing every reference it held.
    /// Returns the guids that were referenced. Idempotent.
    pub fn clear_session(&self, client_id: &str) -> Result<Vec<Guid>, StoreError> {
        let keys: Vec<_> = self
            .pending
            .scan_prefix(client_prefix(client_id))
            .keys()
            .collect::<Result<_, _>>()?;

        let mut guids = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(raw) = self.pending.remove(key)? {
                let guid = decode_guid(&raw)?;
                self.decrement_ref(guid)?;
                guids.push(guid);
            }
        }
        Ok(guids)
    }

    /// Current session reference count for a guid.
    pub fn ref_count(&self, guid: Guid) -> Result<u64, StoreError> {
        Ok(self
            .refs
            .get(guid.as_bytes())?
            .map(|raw| decode_count(&raw))
            .unwrap_or(0))
    }

    fn increment_ref(&self, guid: Guid) -> Result<(), StoreError> {
        self.refs.update_and_fetch(guid.as_bytes(), |old| {
            let count = old.map(decode_count).unwrap_or(0) + 1;
            Some(count.to_be_bytes().to_vec())
        })?;
        Ok(())
    }

    fn decrement_ref(&self, guid: Guid) -> Result<(), StoreError> {
        self.refs.update_and_fetch(guid.as_bytes(), |old| {
            let count = old.map(decode_count).unwrap_or(0).saturating_sub(1);
            if count == 0 {
                None
            } else {
                Some(count.to_be_bytes().to_vec())
            }
        })?;
        Ok(())
    }
}
