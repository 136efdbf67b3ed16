//! Transaction identity, isolation and the MVCC visibility rule

pub mod log;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ConnectionOptions;
use crate::lock::OwnerId;

pub use log::{LogEntry, TransactionLog, TransactionStatus};

/// Transaction ID; zero means "no transaction"
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct TxnId(pub u64);

impl TxnId {
    pub const NONE: TxnId = TxnId(0);

    pub fn is_none(self) -> bool {
        self == Self::NONE
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// Transaction isolation levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum IsolationLevel {
    #[default]
    ReadCommitted,
    Snapshot,
}

/// Decide whether a row version is visible to transaction `test_id`.
///
/// `row_version` is the stamp the version was written with and
/// `writer_status` the status of that writer; for an outdated row it is the
/// status of the transaction that superseded it. Transactions no longer
/// present in a log count as committed.
///
/// Under read-committed a current (not outdated) row written by a committed
/// transaction is visible whatever the ordering of writer and reader.
pub fn pass_transaction(
    row_version: u64,
    outdated: bool,
    test_id: TxnId,
    writer_status: TransactionStatus,
    isolation: IsolationLevel,
) -> bool {
    if row_version == test_id.0 {
        return true;
    }

    let committed = writer_status == TransactionStatus::Committed;
    match (outdated, committed) {
        // Someone else's write still in flight
        (false, false) => false,
        (false, true) => match isolation {
            IsolationLevel::Snapshot => row_version <= test_id.0,
            IsolationLevel::ReadCommitted => true,
        },
        // Replacement not committed, the old version stands
        (true, false) => true,
        (true, true) => match isolation {
            IsolationLevel::Snapshot => row_version <= test_id.0,
            IsolationLevel::ReadCommitted => false,
        },
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TransactionInfo {
    pub id: TxnId,
    pub isolation: IsolationLevel,
    pub started: Instant,
}

/// Database-wide version counter and the set of running transactions.
///
/// The same counter stamps rows written outside a transaction and hands out
/// transaction ids, so the two never collide.
#[derive(Debug)]
pub struct TransactionRegistry {
    counter: AtomicU64,
    active: DashMap<TxnId, TransactionInfo>,
}

impl TransactionRegistry {
    pub fn new(last_version: u64) -> Self {
        Self {
            counter: AtomicU64::new(last_version),
            active: DashMap::new(),
        }
    }

    /// Next modification stamp
    pub fn next_version(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Last stamp handed out
    pub fn current_version(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }

    /// Make sure future stamps exceed `version`
    pub fn observe(&self, version: u64) {
        self.counter.fetch_max(version, Ordering::SeqCst);
    }

    pub fn begin(&self, isolation: IsolationLevel) -> TxnId {
        let id = TxnId(self.next_version());
        self.active.insert(
            id,
            TransactionInfo {
                id,
                isolation,
                started: Instant::now(),
            },
        );
        debug!("Transaction {} started ({:?})", id, isolation);
        id
    }

    pub fn end(&self, id: TxnId) -> Option<TransactionInfo> {
        self.active.remove(&id).map(|(_, info)| info)
    }

    pub fn is_active(&self, id: TxnId) -> bool {
        self.active.contains_key(&id)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

/// Connection state shared by every storage handle the connection opens
#[derive(Debug)]
pub struct Session {
    owner: OwnerId,
    txn: AtomicU64,
    isolation: Mutex<IsolationLevel>,
    lock_timeout: Mutex<Duration>,
}

impl Session {
    pub fn new(owner: OwnerId, options: ConnectionOptions) -> Self {
        Self {
            owner,
            txn: AtomicU64::new(TxnId::NONE.0),
            isolation: Mutex::new(options.isolation),
            lock_timeout: Mutex::new(options.lock_timeout),
        }
    }

    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    /// Running transaction, `TxnId::NONE` outside one
    pub fn transaction_id(&self) -> TxnId {
        TxnId(self.txn.load(Ordering::SeqCst))
    }

    pub fn set_transaction(&self, txn: TxnId) {
        self.txn.store(txn.0, Ordering::SeqCst);
    }

    pub fn isolation(&self) -> IsolationLevel {
        *self.isolation.lock()
    }

    pub fn set_isolation(&self, isolation: IsolationLevel) {
        *self.isolation.lock() = isolation;
    }

    pub fn lock_timeout(&self) -> Duration {
        *self.lock_timeout.lock()
    }

    pub fn set_lock_timeout(&self, timeout: Duration) {
        *self.lock_timeout.lock() = timeout;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use IsolationLevel::{ReadCommitted, Snapshot};
    use TransactionStatus::{Active, Committed, RolledBack};

    /// The visibility table, written out case by case
    fn expected(
        same: bool,
        outdated: bool,
        status: TransactionStatus,
        isolation: IsolationLevel,
        writer_before_reader: bool,
    ) -> bool {
        if same {
            return true;
        }
        let committed = status == Committed;
        match (outdated, committed, isolation) {
            (false, false, _) => false,
            (false, true, ReadCommitted) => true,
            (false, true, Snapshot) => writer_before_reader,
            (true, false, _) => true,
            (true, true, ReadCommitted) => false,
            (true, true, Snapshot) => writer_before_reader,
        }
    }

    #[test]
    fn test_visibility_table_is_complete() {
        let reader = TxnId(50);
        let mut cases = 0;

        for same in [false, true] {
            for outdated in [false, true] {
                for status in [Active, Committed, RolledBack] {
                    for isolation in [ReadCommitted, Snapshot] {
                        for writer_before_reader in [false, true] {
                            let writer = match (same, writer_before_reader) {
                                (true, _) => reader.0,
                                (false, true) => 40,
                                (false, false) => 60,
                            };
                            let visible =
                                pass_transaction(writer, outdated, reader, status, isolation);
                            assert_eq!(
                                visible,
                                expected(same, outdated, status, isolation, writer_before_reader),
                                "same={} outdated={} status={:?} isolation={:?} before={}",
                                same,
                                outdated,
                                status,
                                isolation,
                                writer_before_reader
                            );
                            cases += 1;
                        }
                    }
                }
            }
        }

        assert_eq!(cases, 48);
    }

    #[test]
    fn test_read_committed_ignores_writer_ordering() {
        // A later committed writer is still visible to an earlier reader
        assert!(pass_transaction(90, false, TxnId(10), Committed, ReadCommitted));
        assert!(!pass_transaction(90, false, TxnId(10), Committed, Snapshot));
    }

    #[test]
    fn test_registry_stamps_are_monotonic() {
        let registry = TransactionRegistry::new(7);
        assert_eq!(registry.next_version(), 8);

        let txn = registry.begin(ReadCommitted);
        assert_eq!(txn, TxnId(9));
        assert!(registry.is_active(txn));

        registry.observe(100);
        assert_eq!(registry.next_version(), 101);
        registry.observe(5);
        assert_eq!(registry.current_version(), 101);

        assert!(registry.end(txn).is_some());
        assert_eq!(registry.active_count(), 0);
    }
}
