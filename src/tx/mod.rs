//! Transactional persistence with after-commit side effects
//!
//! This module handles:
//! - The store boundary (versioned records, atomic multi-key commits)
//! - Transaction contexts with staged writes and read-your-writes
//! - Running after-commit hooks exactly once, only when the commit succeeded

mod manager;
mod store;

pub use manager::{AfterCommitHook, Committed, CommittedTx, TransactionManager, TxContext, TxId};
pub use store::{MemoryStore, Record, Store, Version, Write};
