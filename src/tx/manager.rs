//! Transaction manager
//!
//! `execute` opens a transaction, runs the unit of work against it and
//! commits. After-commit hooks run only once the store has accepted the
//! commit, each exactly once and in the order given. A failing hook is
//! reported in the result; the commit stands.

use super::store::{Store, Version, Write};
use crate::error::{FleetError, Result};
use bytes::Bytes;
use futures::future::BoxFuture;
use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, warn};

pub type TxId = u64;

/// Side effect to run after a successful commit
pub type AfterCommitHook<R> = Box<dyn FnOnce(&CommittedTx, &R) -> anyhow::Result<()> + Send>;

/// Open transaction boundary, owned by one `execute` call
pub struct TxContext {
    id: TxId,
    store: Arc<dyn Store>,
    /// Staged changes in write order; `None` is a delete
    writes: IndexMap<String, Option<Bytes>>,
    /// Version of every key at its first read
    reads: HashMap<String, Option<Version>>,
    started_at: Instant,
}

impl TxContext {
    fn new(id: TxId, store: Arc<dyn Store>) -> Self {
        Self {
            id,
            store,
            writes: IndexMap::new(),
            reads: HashMap::new(),
            started_at: Instant::now(),
        }
    }

    pub fn id(&self) -> TxId {
        self.id
    }

    /// Read a key, seeing this transaction's own staged writes first
    pub async fn get(&mut self, key: &str) -> Result<Option<Bytes>> {
        if let Some(staged) = self.writes.get(key) {
            return Ok(staged.clone());
        }

        let record = self.store.read(key).await?;
        self.reads
            .entry(key.to_string())
            .or_insert_with(|| record.as_ref().map(|r| r.version));
        Ok(record.map(|r| r.value))
    }

    pub fn put(&mut self, key: impl Into<String>, value: impl Into<Bytes>) {
        self.writes.insert(key.into(), Some(value.into()));
    }

    pub fn delete(&mut self, key: impl Into<String>) {
        self.writes.insert(key.into(), None);
    }

    pub fn is_dirty(&self) -> bool {
        !self.writes.is_empty()
    }

    fn into_parts(self) -> (Vec<Write>, HashMap<String, Option<Version>>) {
        let writes = self
            .writes
            .into_iter()
            .map(|(key, value)| match value {
                Some(value) => Write::Put { key, value },
                None => Write::Delete { key },
            })
            .collect();
        (writes, self.reads)
    }
}

/// What hooks see of a transaction that has committed
#[derive(Debug, Clone)]
pub struct CommittedTx {
    pub id: TxId,
    pub writes: usize,
    pub started_at: Instant,
    pub committed_at: Instant,
}

/// Result of a committed `execute`
#[derive(Debug)]
pub struct Committed<R> {
    pub value: R,
    pub tx: CommittedTx,
    /// One `HookFailure` per hook that returned an error
    pub hook_failures: Vec<FleetError>,
}

impl<R> Committed<R> {
    pub fn hooks_succeeded(&self) -> bool {
        self.hook_failures.is_empty()
    }

    pub fn into_value(self) -> R {
        self.value
    }
}

pub struct TransactionManager {
    store: Arc<dyn Store>,
    next_tx: AtomicU64,
}

impl TransactionManager {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            next_tx: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Run `work` in a fresh transaction and commit it.
    ///
    /// If `work` fails the staged writes are discarded, no hook runs and the
    /// error is returned unchanged. If the store rejects the commit the error
    /// is `CommitFailure` or `CommitConflict` and no hook runs.
    pub async fn execute<R, W>(&self, work: W, hooks: Vec<AfterCommitHook<R>>) -> Result<Committed<R>>
    where
        R: Send,
        W: for<'a> FnOnce(&'a mut TxContext) -> BoxFuture<'a, Result<R>>,
    {
        let id = self.next_tx.fetch_add(1, Ordering::SeqCst) + 1;
        let mut ctx = TxContext::new(id, self.store.clone());

        let value = match work(&mut ctx).await {
            Ok(value) => value,
            Err(e) => {
                warn!(
                    "[TX] Rolling back tx {} ({} staged write(s)): {}",
                    id,
                    ctx.writes.len(),
                    e
                );
                return Err(e);
            }
        };

        let started_at = ctx.started_at;
        let (writes, reads) = ctx.into_parts();
        let write_count = writes.len();

        if let Err(e) = self.store.commit(id, writes, reads).await {
            warn!("[TX] Commit of tx {} failed: {}", id, e);
            return Err(match e {
                FleetError::CommitFailure(_) | FleetError::CommitConflict { .. } => e,
                other => FleetError::CommitFailure(other.to_string()),
            });
        }

        let tx = CommittedTx {
            id,
            writes: write_count,
            started_at,
            committed_at: Instant::now(),
        };
        debug!("[TX] Committed tx {} ({} write(s))", id, write_count);

        let mut hook_failures = Vec::new();
        for (index, hook) in hooks.into_iter().enumerate() {
            if let Err(e) = hook(&tx, &value) {
                warn!("[TX] After-commit hook #{} of tx {} failed: {:#}", index, id, e);
                hook_failures.push(FleetError::HookFailure {
                    index,
                    reason: format!("{:#}", e),
                });
            }
        }

        Ok(Committed {
            value,
            tx,
            hook_failures,
        })
    }
}
