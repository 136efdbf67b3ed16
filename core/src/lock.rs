//! Advisory storage and row locks with timeouts

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::catalog::TableId;
use crate::error::{StrataError, StrataResult};
use crate::row::RowId;

/// Who holds a lock; one id per connection
pub type OwnerId = u64;

/// Lockable resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockTarget {
    /// The whole storage (schema changes, fences around row sequences)
    Storage(TableId),
    /// A single row
    Row(TableId, RowId),
}

impl LockTarget {
    fn table(&self) -> TableId {
        match self {
            LockTarget::Storage(t) | LockTarget::Row(t, _) => *t,
        }
    }
}

impl fmt::Display for LockTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockTarget::Storage(table) => write!(f, "storage {}", table.0),
            LockTarget::Row(table, row) => write!(f, "row {} of storage {}", row, table.0),
        }
    }
}

#[derive(Debug)]
struct Holder {
    owner: OwnerId,
    count: u32,
}

/// Re-entrant exclusive locks shared by every handle of a database.
///
/// A storage lock excludes row locks of other owners on the same storage
/// and the other way around.
#[derive(Debug, Default)]
pub struct LockManager {
    held: Mutex<HashMap<LockTarget, Holder>>,
    released: Condvar,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn blocked(held: &HashMap<LockTarget, Holder>, owner: OwnerId, target: LockTarget) -> bool {
        if let Some(holder) = held.get(&target) {
            return holder.owner != owner;
        }

        match target {
            LockTarget::Row(table, _) => held
                .get(&LockTarget::Storage(table))
                .is_some_and(|h| h.owner != owner),
            LockTarget::Storage(table) => held.iter().any(|(t, h)| {
                matches!(t, LockTarget::Row(..)) && t.table() == table && h.owner != owner
            }),
        }
    }

    /// Acquire `target`, waiting at most `timeout`
    pub fn lock(&self, owner: OwnerId, target: LockTarget, timeout: Duration) -> StrataResult<()> {
        let deadline = Instant::now() + timeout;
        let mut held = self.held.lock();

        loop {
            if !Self::blocked(&held, owner, target) {
                held.entry(target)
                    .and_modify(|h| h.count += 1)
                    .or_insert(Holder { owner, count: 1 });
                return Ok(());
            }

            if Instant::now() >= deadline {
                warn!("Owner {} timed out waiting for {}", owner, target);
                return Err(StrataError::LockTimeout {
                    resource: target.to_string(),
                    timeout,
                });
            }

            self.released.wait_until(&mut held, deadline);
        }
    }

    /// Release one acquisition; returns false when `owner` did not hold it
    pub fn unlock(&self, owner: OwnerId, target: LockTarget) -> bool {
        let mut held = self.held.lock();
        let Some(holder) = held.get_mut(&target) else {
            return false;
        };
        if holder.owner != owner {
            return false;
        }

        holder.count -= 1;
        if holder.count == 0 {
            held.remove(&target);
            self.released.notify_all();
        }
        true
    }

    /// Release everything `owner` holds
    pub fn release_all(&self, owner: OwnerId) {
        let mut held = self.held.lock();
        let before = held.len();
        held.retain(|_, h| h.owner != owner);
        if held.len() != before {
            debug!("Released {} locks of owner {}", before - held.len(), owner);
            self.released.notify_all();
        }
    }

    pub fn holder(&self, target: LockTarget) -> Option<OwnerId> {
        self.held.lock().get(&target).map(|h| h.owner)
    }

    pub fn held_count(&self) -> usize {
        self.held.lock().len()
    }
}

/// A storage object's view of the lock manager
#[derive(Debug, Clone)]
pub struct LockHandle {
    manager: Arc<LockManager>,
    owner: OwnerId,
    table: TableId,
    timeout: Duration,
    no_locks: bool,
}

impl LockHandle {
    pub fn new(
        manager: Arc<LockManager>,
        owner: OwnerId,
        table: TableId,
        timeout: Duration,
        no_locks: bool,
    ) -> Self {
        Self {
            manager,
            owner,
            table,
            timeout,
            no_locks,
        }
    }

    /// Exclusive and virtual-lock opens skip the manager entirely
    pub fn no_locks(&self) -> bool {
        self.no_locks
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn lock_storage(&self) -> StrataResult<()> {
        if self.no_locks {
            return Ok(());
        }
        self.manager
            .lock(self.owner, LockTarget::Storage(self.table), self.timeout)
    }

    pub fn unlock_storage(&self) {
        if !self.no_locks {
            self.manager
                .unlock(self.owner, LockTarget::Storage(self.table));
        }
    }

    pub fn lock_row(&self, row_id: RowId) -> StrataResult<()> {
        if self.no_locks {
            return Ok(());
        }
        self.manager
            .lock(self.owner, LockTarget::Row(self.table, row_id), self.timeout)
    }

    pub fn unlock_row(&self, row_id: RowId) {
        if !self.no_locks {
            self.manager
                .unlock(self.owner, LockTarget::Row(self.table, row_id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    const TABLE: TableId = TableId(1);

    #[test]
    fn test_row_lock_timeout_then_retry() {
        let manager = LockManager::new();
        let row = LockTarget::Row(TABLE, RowId(7));
        let (holder_a, requester_b) = (1, 2);

        manager.lock(holder_a, row, Duration::from_millis(10)).unwrap();

        let started = Instant::now();
        let err = manager
            .lock(requester_b, row, Duration::from_millis(200))
            .unwrap_err();
        let waited = started.elapsed();
        assert!(matches!(err, StrataError::LockTimeout { .. }));
        assert!(waited >= Duration::from_millis(200));
        assert!(waited < Duration::from_secs(2));

        assert!(manager.unlock(holder_a, row));
        manager
            .lock(requester_b, row, Duration::from_millis(200))
            .unwrap();
        assert_eq!(manager.holder(row), Some(requester_b));
    }

    #[test]
    fn test_waiter_wakes_on_release() {
        let manager = Arc::new(LockManager::new());
        let row = LockTarget::Row(TABLE, RowId(3));
        manager.lock(1, row, Duration::ZERO).unwrap();

        let waiter = {
            let manager = Arc::clone(&manager);
            thread::spawn(move || manager.lock(2, row, Duration::from_secs(5)))
        };

        thread::sleep(Duration::from_millis(50));
        manager.unlock(1, row);
        waiter.join().unwrap().unwrap();
        assert_eq!(manager.holder(row), Some(2));
    }

    #[test]
    fn test_reentrant_and_storage_exclusion() {
        let manager = LockManager::new();
        let storage = LockTarget::Storage(TABLE);
        let row = LockTarget::Row(TABLE, RowId(1));

        manager.lock(1, row, Duration::ZERO).unwrap();
        manager.lock(1, row, Duration::ZERO).unwrap();
        manager.lock(1, storage, Duration::ZERO).unwrap();

        // Another owner can take neither the storage nor one of its rows
        assert!(manager.lock(2, storage, Duration::ZERO).is_err());
        assert!(
            manager
                .lock(2, LockTarget::Row(TABLE, RowId(2)), Duration::ZERO)
                .is_err()
        );
        // A different storage is unaffected
        manager
            .lock(2, LockTarget::Storage(TableId(2)), Duration::ZERO)
            .unwrap();

        assert!(manager.unlock(1, row));
        assert_eq!(manager.holder(row), Some(1));
        assert!(!manager.unlock(2, row));

        manager.release_all(1);
        assert_eq!(manager.held_count(), 1);
        manager.lock(2, storage, Duration::ZERO).unwrap();
    }

    #[test]
    fn test_no_locks_handle_bypasses_manager() {
        let manager = Arc::new(LockManager::new());
        manager
            .lock(9, LockTarget::Storage(TABLE), Duration::ZERO)
            .unwrap();

        let handle = LockHandle::new(Arc::clone(&manager), 1, TABLE, Duration::ZERO, true);
        handle.lock_storage().unwrap();
        handle.lock_row(RowId(5)).unwrap();
        assert_eq!(manager.held_count(), 1);
    }
}
