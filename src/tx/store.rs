//! Store boundary used by the transaction manager

use crate::error::{FleetError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

/// Monotonic per-key version, starting at 1 on first write. Deleting a key
/// does not reset it.
pub type Version = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub value: Bytes,
    pub version: Version,
}

/// A staged change, applied only at commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Write {
    Put { key: String, value: Bytes },
    Delete { key: String },
}

impl Write {
    pub fn key(&self) -> &str {
        match self {
            Write::Put { key, .. } | Write::Delete { key } => key,
        }
    }
}

/// Persistence boundary.
///
/// Implementations apply a commit atomically: either every write becomes
/// visible or none does. `reads` holds the version each key had when the
/// transaction first read it (`None` = absent); a store must reject the
/// commit with `CommitConflict` if any of them changed since.
#[async_trait]
pub trait Store: Send + Sync {
    async fn read(&self, key: &str) -> Result<Option<Record>>;

    async fn commit(
        &self,
        tx_id: u64,
        writes: Vec<Write>,
        reads: HashMap<String, Option<Version>>,
    ) -> Result<()>;

    /// Every record whose key starts with `prefix`, in key order
    async fn scan(&self, prefix: &str) -> Result<Vec<(String, Record)>>;
}

#[derive(Default)]
struct Tables {
    records: HashMap<String, Record>,
    /// Last version of each deleted key, so a re-create never reuses one
    tombstones: HashMap<String, Version>,
}

/// In-memory store with optimistic version checks
#[derive(Default)]
pub struct MemoryStore {
    data: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.data.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn read(&self, key: &str) -> Result<Option<Record>> {
        Ok(self.data.read().await.records.get(key).cloned())
    }

    async fn commit(
        &self,
        tx_id: u64,
        writes: Vec<Write>,
        reads: HashMap<String, Option<Version>>,
    ) -> Result<()> {
        let mut guard = self.data.write().await;
        let data = &mut *guard;

        for (key, seen) in &reads {
            let current = data.records.get(key).map(|r| r.version);
            if current != *seen {
                return Err(FleetError::CommitConflict { key: key.clone() });
            }
        }

        let applied = writes.len();
        for write in writes {
            match write {
                Write::Put { key, value } => {
                    let last = match data.records.get(&key) {
                        Some(record) => record.version,
                        None => data.tombstones.remove(&key).unwrap_or(0),
                    };
                    data.records.insert(
                        key,
                        Record {
                            value,
                            version: last + 1,
                        },
                    );
                }
                Write::Delete { key } => {
                    if let Some(record) = data.records.remove(&key) {
                        data.tombstones.insert(key, record.version);
                    }
                }
            }
        }

        debug!("[TX] Store applied {} write(s) for tx {}", applied, tx_id);
        Ok(())
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<(String, Record)>> {
        let data = self.data.read().await;
        let mut hits: Vec<(String, Record)> = data
            .records
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, record)| (key.clone(), record.clone()))
            .collect();
        hits.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(hits)
    }
}
