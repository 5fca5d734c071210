//! The pending-transaction pool.
//!
//! A bounded mapping from id to transaction with insertion order
//! preserved for fairness. Admission requires verification to have
//! succeeded and the id to be absent from both the chain and the pool;
//! eviction drops the oldest entries first. Transactions drained into a
//! block leave the pool entirely and are re-queued at the head, in their
//! original order, if production fails.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, warn};

use crate::types::Transaction;

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of pending transactions
    pub capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { capacity: 10_000 }
    }
}

/// Pool statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    /// Transactions accepted
    pub total_added: u64,
    /// Transactions drained into blocks
    pub total_drained: u64,
    /// Transactions evicted at capacity
    pub total_evicted: u64,
    /// Transactions re-queued after failed production
    pub total_requeued: u64,
}

struct PoolInner {
    txs: HashMap<String, Transaction>,
    order: VecDeque<String>,
    stats: PoolStats,
}

/// The bounded, insertion-ordered pending pool.
pub struct PendingPool {
    config: PoolConfig,
    inner: Mutex<PoolInner>,
}

impl PendingPool {
    /// Create a pool with the given configuration.
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(PoolInner {
                txs: HashMap::new(),
                order: VecDeque::new(),
                stats: PoolStats::default(),
            }),
        }
    }

    /// Admit a verified transaction. Duplicates are rejected; at capacity
    /// the oldest pending transaction is evicted first.
    pub fn add(&self, tx: Transaction) -> Result<(), PoolError> {
        let mut inner = self.inner.lock();
        if inner.txs.contains_key(&tx.id) {
            return Err(PoolError::Duplicate(tx.id));
        }

        while inner.txs.len() >= self.config.capacity {
            match inner.order.pop_front() {
                Some(oldest) => {
                    inner.txs.remove(&oldest);
                    inner.stats.total_evicted += 1;
                    warn!("Pool at capacity, evicted oldest transaction {}", oldest);
                }
                None => return Err(PoolError::CapacityExceeded),
            }
        }

        debug!("Pending transaction {} admitted", tx.id);
        inner.order.push_back(tx.id.clone());
        inner.txs.insert(tx.id.clone(), tx);
        inner.stats.total_added += 1;
        Ok(())
    }

    /// Whether an id is pending.
    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock().txs.contains_key(id)
    }

    /// Number of pending transactions.
    pub fn len(&self) -> usize {
        self.inner.lock().txs.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().txs.is_empty()
    }

    /// Remove the oldest pending transactions, up to `max_count` entries
    /// and `max_bytes` of encoded size, preserving insertion order. The
    /// drained transactions belong to the caller; eviction can no longer
    /// touch them.
    pub fn drain(&self, max_count: usize, max_bytes: usize) -> Vec<Transaction> {
        let mut inner = self.inner.lock();
        let mut drained = Vec::new();
        let mut used_bytes = 0usize;

        while drained.len() < max_count {
            let Some(id) = inner.order.front().cloned() else {
                break;
            };
            let Some(tx) = inner.txs.get(&id) else {
                // Evicted out from under the order queue; drop the stale id.
                inner.order.pop_front();
                continue;
            };

            let size = tx.encoded_size();
            if !drained.is_empty() && used_bytes + size > max_bytes {
                break;
            }
            used_bytes += size;

            inner.order.pop_front();
            let tx = inner.txs.remove(&id).expect("checked above");
            inner.stats.total_drained += 1;
            drained.push(tx);
        }
        drained
    }

    /// Return drained transactions to the head of the pool in their
    /// original order, after a failed production attempt.
    pub fn requeue_front(&self, txs: Vec<Transaction>) {
        let mut inner = self.inner.lock();
        for tx in txs.into_iter().rev() {
            if inner.txs.contains_key(&tx.id) {
                continue;
            }
            inner.order.push_front(tx.id.clone());
            inner.txs.insert(tx.id.clone(), tx);
            inner.stats.total_requeued += 1;
        }
    }

    /// Snapshot of pending transactions in insertion order.
    pub fn snapshot(&self) -> Vec<Transaction> {
        let inner = self.inner.lock();
        inner
            .order
            .iter()
            .filter_map(|id| inner.txs.get(id).cloned())
            .collect()
    }

    /// Pool counters.
    pub fn stats(&self) -> PoolStats {
        self.inner.lock().stats
    }
}

/// Pool admission errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("Transaction {0} already pending")]
    Duplicate(String),
    #[error("Transaction pool at capacity")]
    CapacityExceeded,
}
