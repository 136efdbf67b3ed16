//! Per-table transaction log

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::transaction::TxnId;

/// Transaction states as recorded in a table's log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionStatus {
    Active,
    Committed,
    RolledBack,
}

/// One transaction's footprint on a table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub status: TransactionStatus,
    pub row_delta: i64,
}

/// Status and row-count delta of every transaction that wrote to a table
/// and has not been finalized yet.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransactionLog {
    entries: BTreeMap<TxnId, LogEntry>,
    #[serde(skip)]
    modified: bool,
}

impl TransactionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `txn`; a no-op when it is already known
    pub fn register(&mut self, txn: TxnId) {
        if txn.is_none() {
            return;
        }
        if !self.entries.contains_key(&txn) {
            self.entries.insert(
                txn,
                LogEntry {
                    status: TransactionStatus::Active,
                    row_delta: 0,
                },
            );
            self.modified = true;
        }
    }

    pub fn status(&self, txn: TxnId) -> Option<TransactionStatus> {
        self.entries.get(&txn).map(|e| e.status)
    }

    /// Status of the writer stamped into a row. Anything the log no longer
    /// knows about has been finalized as committed.
    pub fn writer_status(&self, row_version: u64) -> TransactionStatus {
        self.status(TxnId(row_version))
            .unwrap_or(TransactionStatus::Committed)
    }

    /// Active writer other than `reader`, if the stamp belongs to one
    pub fn active_writer(&self, row_version: u64, reader: TxnId) -> Option<TxnId> {
        let writer = TxnId(row_version);
        (writer != reader && self.status(writer) == Some(TransactionStatus::Active))
            .then_some(writer)
    }

    pub fn add_delta(&mut self, txn: TxnId, delta: i64) {
        self.register(txn);
        if let Some(entry) = self.entries.get_mut(&txn) {
            entry.row_delta += delta;
            self.modified = true;
        }
    }

    pub fn delta(&self, txn: TxnId) -> i64 {
        self.entries.get(&txn).map(|e| e.row_delta).unwrap_or(0)
    }

    /// Sum of the deltas `reader` may see: its own, plus those of
    /// transactions that committed but were not folded in yet.
    pub fn visible_delta(&self, reader: TxnId) -> i64 {
        self.entries
            .iter()
            .filter(|(txn, entry)| {
                (**txn == reader && entry.status == TransactionStatus::Active)
                    || entry.status == TransactionStatus::Committed
            })
            .map(|(_, entry)| entry.row_delta)
            .sum()
    }

    /// Mark committed and hand back the delta to fold into the header
    pub fn commit(&mut self, txn: TxnId) -> i64 {
        match self.entries.get_mut(&txn) {
            Some(entry) => {
                entry.status = TransactionStatus::Committed;
                self.modified = true;
                entry.row_delta
            }
            None => 0,
        }
    }

    /// Mark rolled back; the delta is discarded
    pub fn rollback(&mut self, txn: TxnId) {
        if let Some(entry) = self.entries.get_mut(&txn) {
            entry.status = TransactionStatus::RolledBack;
            entry.row_delta = 0;
            self.modified = true;
        }
    }

    /// Drop a finished transaction from the log
    pub fn finalize(&mut self, txn: TxnId) -> Option<LogEntry> {
        let removed = self.entries.remove(&txn);
        if removed.is_some() {
            self.modified = true;
        }
        removed
    }

    /// Transactions still marked active
    pub fn active(&self) -> Vec<TxnId> {
        self.entries
            .iter()
            .filter(|(_, e)| e.status == TransactionStatus::Active)
            .map(|(txn, _)| *txn)
            .collect()
    }

    /// Transactions committed but not yet finalized
    pub fn committed(&self) -> Vec<TxnId> {
        self.entries
            .iter()
            .filter(|(_, e)| e.status == TransactionStatus::Committed)
            .map(|(txn, _)| *txn)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    pub fn clear_modified(&mut self) {
        self.modified = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_folds_delta() {
        let mut log = TransactionLog::new();
        let txn = TxnId(4);

        log.add_delta(txn, 1);
        log.add_delta(txn, 1);
        log.add_delta(txn, -1);
        assert_eq!(log.delta(txn), 1);
        assert_eq!(log.status(txn), Some(TransactionStatus::Active));

        assert_eq!(log.commit(txn), 1);
        assert!(log.finalize(txn).is_some());
        assert!(log.is_empty());
        assert_eq!(log.writer_status(4), TransactionStatus::Committed);
    }

    #[test]
    fn test_visible_delta_hides_other_active_transactions() {
        let mut log = TransactionLog::new();
        log.add_delta(TxnId(1), 3);
        log.add_delta(TxnId(2), 5);

        assert_eq!(log.visible_delta(TxnId(1)), 3);
        assert_eq!(log.visible_delta(TxnId(2)), 5);
        assert_eq!(log.visible_delta(TxnId::NONE), 0);

        log.commit(TxnId(2));
        assert_eq!(log.visible_delta(TxnId(1)), 8);

        log.rollback(TxnId(1));
        assert_eq!(log.visible_delta(TxnId(1)), 5);
        assert_eq!(log.status(TxnId(1)), Some(TransactionStatus::RolledBack));
    }

    #[test]
    fn test_active_writer_detection() {
        let mut log = TransactionLog::new();
        log.register(TxnId(7));
        assert_eq!(log.active_writer(7, TxnId(3)), Some(TxnId(7)));
        assert_eq!(log.active_writer(7, TxnId(7)), None);
        assert_eq!(log.active_writer(6, TxnId(3)), None);
        assert!(log.is_modified());
    }
}
