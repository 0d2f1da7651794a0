//! Storage adapter implementations.
//!
//! `SledStorage` is the production store: one sled tree per named store,
//! flushed on every write so pending outbox entries survive a crash mid-run.
//! `MemoryStorage` backs ephemeral hosts and the test harness.
//!
//! Values are opaque bytes at this layer; the outbox and upload ledger own
//! their own encodings (bincode is used for local values only, never on the
//! wire).

use crate::adapters::{Storage, StoreKind};
use crate::error::StorageError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

/// Durable store backed by sled.
pub struct SledStorage {
    db: sled::Db,
    outbox: sled::Tree,
    ledger: sled::Tree,
}

impl SledStorage {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path).map_err(|e| StorageError::ReadFailed(e.to_string()))?;
        let outbox = db
            .open_tree(StoreKind::Outbox.name())
            .map_err(|e| StorageError::ReadFailed(e.to_string()))?;
        let ledger = db
            .open_tree(StoreKind::UploadLedger.name())
            .map_err(|e| StorageError::ReadFailed(e.to_string()))?;
        Ok(Self { db, outbox, ledger })
    }

    fn tree(&self, store: StoreKind) -> &sled::Tree {
        match store {
            StoreKind::Outbox => &self.outbox,
            StoreKind::UploadLedger => &self.ledger,
        }
    }
}

#[async_trait]
impl Storage for SledStorage {
    async fn put(&self, store: StoreKind, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        self.tree(store)
            .insert(key.as_bytes(), value)
            .map_err(|e| StorageError::WriteFailed(e.to_string()))?;
        self.db
            .flush_async()
            .await
            .map_err(|e| StorageError::WriteFailed(e.to_string()))?;
        Ok(())
    }

    async fn get(&self, store: StoreKind, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let value = self
            .tree(store)
            .get(key.as_bytes())
            .map_err(|e| StorageError::ReadFailed(e.to_string()))?;
        Ok(value.map(|v| v.to_vec()))
    }

    async fn remove(&self, store: StoreKind, key: &str) -> Result<(), StorageError> {
        self.tree(store)
            .remove(key.as_bytes())
            .map_err(|e| StorageError::WriteFailed(e.to_string()))?;
        self.db
            .flush_async()
            .await
            .map_err(|e| StorageError::WriteFailed(e.to_string()))?;
        Ok(())
    }

    async fn scan(&self, store: StoreKind) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        let mut out = Vec::new();
        for item in self.tree(store).iter() {
            let (key, value) = item.map_err(|e| StorageError::ReadFailed(e.to_string()))?;
            let key = String::from_utf8(key.to_vec())
                .map_err(|e| StorageError::ReadFailed(e.to_string()))?;
            out.push((key, value.to_vec()));
        }
        Ok(out)
    }
}

/// Non-durable store for ephemeral hosts and tests.
#[derive(Default)]
pub struct MemoryStorage {
    stores: Mutex<HashMap<StoreKind, HashMap<String, Vec<u8>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn put(&self, store: StoreKind, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        let mut stores = self
            .stores
            .lock()
            .map_err(|_| StorageError::WriteFailed("lock poisoned".into()))?;
        stores
            .entry(store)
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, store: StoreKind, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let stores = self
            .stores
            .lock()
            .map_err(|_| StorageError::ReadFailed("lock poisoned".into()))?;
        Ok(stores.get(&store).and_then(|s| s.get(key).cloned()))
    }

    async fn remove(&self, store: StoreKind, key: &str) -> Result<(), StorageError> {
        let mut stores = self
            .stores
            .lock()
            .map_err(|_| StorageError::WriteFailed("lock poisoned".into()))?;
        if let Some(s) = stores.get_mut(&store) {
            s.remove(key);
        }
        Ok(())
    }

    async fn scan(&self, store: StoreKind) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        let stores = self
            .stores
            .lock()
            .map_err(|_| StorageError::ReadFailed("lock poisoned".into()))?;
        Ok(stores
            .get(&store)
            .map(|s| s.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }
}
