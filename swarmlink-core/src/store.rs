//! Persistence seam: a byte key/value store plus versioned record encoding.

use std::collections::HashMap;
use std::sync::Mutex;

/// Key/value persistence provided by the host.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode error: {0}")]
    Encode(#[source] bincode::Error),
    #[error("decode error: {0}")]
    Decode(#[source] bincode::Error),
    #[error("unsupported record version {0}")]
    UnsupportedVersion(u8),
    #[error("empty record")]
    Empty,
    #[error("store unavailable")]
    Poisoned,
}

/// In-memory store for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        entries.remove(key);
        Ok(())
    }
}

/// Persisted records. Each is stored as `[version: u8] ++ bincode(record)`.
pub mod records {
    use serde::de::DeserializeOwned;
    use serde::{Deserialize, Serialize};

    use super::{KeyValueStore, StoreError};
    use crate::inbox::Cursor;
    use crate::node::{Node, Path};

    pub const RECORD_VERSION: u8 = 1;

    pub const POOL_KEY: &str = "node_pool";
    pub const PATHS_KEY: &str = "onion_paths";

    pub fn swarm_key(identity: &str) -> String {
        format!("swarm/{identity}")
    }

    pub fn cursor_key(node: &Node, identity: &str) -> String {
        format!("cursor/{identity}/{node}")
    }

    pub fn received_key(identity: &str) -> String {
        format!("received/{identity}")
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct PoolRecord {
        pub nodes: Vec<Node>,
        pub refreshed_at: Option<u64>,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct SwarmRecord {
        pub nodes: Vec<Node>,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct PathsRecord {
        pub paths: Vec<Path>,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct CursorRecord {
        pub node: Node,
        pub cursor: Cursor,
    }

    /// (hash, forget_at) pairs for one identity.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ReceivedHashesRecord {
        pub entries: Vec<(String, u64)>,
    }

    pub fn encode<T: Serialize>(record: &T) -> Result<Vec<u8>, StoreError> {
        let body = bincode::serialize(record).map_err(StoreError::Encode)?;
        let mut out = Vec::with_capacity(1 + body.len());
        out.push(RECORD_VERSION);
        out.extend_from_slice(&body);
        Ok(out)
    }

    pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
        let (&version, body) = bytes.split_first().ok_or(StoreError::Empty)?;
        if version != RECORD_VERSION {
            return Err(StoreError::UnsupportedVersion(version));
        }
        bincode::deserialize(body).map_err(StoreError::Decode)
    }

    pub fn load<T: DeserializeOwned>(store: &dyn KeyValueStore, key: &str) -> Result<Option<T>, StoreError> {
        store.get(key)?.map(|bytes| decode(&bytes)).transpose()
    }

    pub fn save<T: Serialize>(store: &dyn KeyValueStore, key: &str, record: &T) -> Result<(), StoreError> {
        store.set(key, &encode(record)?)
    }
}
