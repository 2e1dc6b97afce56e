//! Durable peer-address persistence.
//!
//! Records are JSON under `peer_addrs/v1/<peer-id>` in a sled tree. Store
//! failures are logged and surfaced as [`NetworkError::Persistence`]; they
//! never disturb in-memory state or abort manager loops.

use crate::types::{NetworkError, PeerAddrRecord};
use async_trait::async_trait;
use libp2p::PeerId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;

/// Key prefix for the current record format.
pub const KEY_PREFIX: &str = "peer_addrs/v1/";

fn record_key(peer: &PeerId) -> Vec<u8> {
    let mut key = Vec::with_capacity(KEY_PREFIX.len() + 52);
    key.extend_from_slice(KEY_PREFIX.as_bytes());
    key.extend_from_slice(peer.to_base58().as_bytes());
    key
}

/// Durable key-value store of [`PeerAddrRecord`]s.
#[async_trait]
pub trait AddrStore: Send + Sync {
    /// Load every stored record. Records that fail to decode are skipped
    /// with a warning rather than failing the load.
    async fn load_all(&self) -> Result<Vec<PeerAddrRecord>, NetworkError>;
    /// Fetch one record.
    async fn get(&self, peer: &PeerId) -> Result<Option<PeerAddrRecord>, NetworkError>;
    /// Insert or replace a record.
    async fn upsert(&self, record: &PeerAddrRecord) -> Result<(), NetworkError>;
    /// Delete a record. Deleting a missing record is not an error.
    async fn delete(&self, peer: &PeerId) -> Result<(), NetworkError>;
    /// Flush and release the store.
    async fn close(&self) -> Result<(), NetworkError>;
}

/// sled-backed store.
pub struct SledAddrStore {
    db: sled::Db,
}

impl SledAddrStore {
    /// Open (or create) the store under the given directory.
    pub fn open(dir: &Path) -> Result<Self, NetworkError> {
        let db = sled::open(dir).map_err(|e| {
            NetworkError::Persistence(format!("cannot open addr store at {}: {e}", dir.display()))
        })?;
        Ok(Self { db })
    }
}

#[async_trait]
impl AddrStore for SledAddrStore {
    async fn load_all(&self) -> Result<Vec<PeerAddrRecord>, NetworkError> {
        let mut records = Vec::new();
        for item in self.db.scan_prefix(KEY_PREFIX.as_bytes()) {
            let (key, value) =
                item.map_err(|e| NetworkError::Persistence(format!("addr store scan: {e}")))?;
            match serde_json::from_slice::<PeerAddrRecord>(&value) {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!(
                        key = %String::from_utf8_lossy(&key),
                        error = %e,
                        "skipping undecodable addr record"
                    );
                }
            }
        }
        Ok(records)
    }

    async fn get(&self, peer: &PeerId) -> Result<Option<PeerAddrRecord>, NetworkError> {
        let value = self
            .db
            .get(record_key(peer))
            .map_err(|e| NetworkError::Persistence(format!("addr store get: {e}")))?;
        match value {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| NetworkError::Persistence(format!("addr record decode: {e}"))),
            None => Ok(None),
        }
    }

    async fn upsert(&self, record: &PeerAddrRecord) -> Result<(), NetworkError> {
        let peer: PeerId = record.parse_peer_id()?;
        let bytes = serde_json::to_vec(record)
            .map_err(|e| NetworkError::Persistence(format!("addr record encode: {e}")))?;
        self.db
            .insert(record_key(&peer), bytes)
            .map_err(|e| NetworkError::Persistence(format!("addr store upsert: {e}")))?;
        Ok(())
    }

    async fn delete(&self, peer: &PeerId) -> Result<(), NetworkError> {
        self.db
            .remove(record_key(peer))
            .map_err(|e| NetworkError::Persistence(format!("addr store delete: {e}")))?;
        Ok(())
    }

    async fn close(&self) -> Result<(), NetworkError> {
        self.db
            .flush_async()
            .await
            .map_err(|e| NetworkError::Persistence(format!("addr store flush: {e}")))?;
        Ok(())
    }
}

/// In-memory store for tests and debug runs.
#[derive(Default)]
pub struct MemoryAddrStore {
    records: Mutex<HashMap<String, PeerAddrRecord>>,
}

impl MemoryAddrStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// True when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl AddrStore for MemoryAddrStore {
    async fn load_all(&self) -> Result<Vec<PeerAddrRecord>, NetworkError> {
        Ok(self.records.lock().values().cloned().collect())
    }

    async fn get(&self, peer: &PeerId) -> Result<Option<PeerAddrRecord>, NetworkError> {
        Ok(self.records.lock().get(&peer.to_base58()).cloned())
    }

    async fn upsert(&self, record: &PeerAddrRecord) -> Result<(), NetworkError> {
        self.records
            .lock()
            .insert(record.peer_id.clone(), record.clone());
        Ok(())
    }

    async fn delete(&self, peer: &PeerId) -> Result<(), NetworkError> {
        self.records.lock().remove(&peer.to_base58());
        Ok(())
    }

    async fn close(&self) -> Result<(), NetworkError> {
        Ok(())
    }
}
