use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Durable message identifier.
///
/// 128 bits of randomness, assigned once when a message is persisted and
/// never changed. It is the only key used to reference a stored message
/// from session pending-maps and the retained index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Guid(Uuid);

impl Guid {
    pub fn random() -> Self {
        Guid(Uuid::new_v4())
    }

    /// Raw 16-byte form, used as the sled key.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        Uuid::from_slice(bytes).ok().map(Guid)
    }
}

impl std::fmt::Display for Guid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}
