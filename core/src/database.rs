//! Databases, connections and transaction control

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::catalog::{Column, PersistentCatalog, TableSchema};
use crate::config::{ConnectionOptions, DatabaseConfig};
use crate::error::{StrataError, StrataResult};
use crate::expression::{BuiltinCompiler, ExpressionCompiler};
use crate::lock::{LockManager, OwnerId};
use crate::storage::blob::BlobSlot;
use crate::storage::{
    ClusterStorage, ClusterStore, ClusteredRowSet, FileClusterStore, MemoryClusterStore,
    OpenOptions, TableShared,
};
use crate::transaction::{IsolationLevel, Session, TransactionRegistry, TxnId};

/// State shared by a database and every connection and row set on it
pub struct DatabaseShared {
    pub store: Arc<dyn ClusterStore>,
    pub catalog: RwLock<PersistentCatalog>,
    pub tables: DashMap<String, Arc<TableShared>>,
    pub registry: Arc<TransactionRegistry>,
    pub locks: Arc<LockManager>,
    pub compiler: Arc<dyn ExpressionCompiler>,
    pub config: DatabaseConfig,
    next_owner: AtomicU64,
}

impl DatabaseShared {
    pub fn table(&self, name: &str) -> StrataResult<Arc<TableShared>> {
        self.tables
            .get(&name.to_ascii_lowercase())
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| StrataError::NotFound(format!("table '{}'", name)))
    }

    fn loaded_tables(&self) -> Vec<Arc<TableShared>> {
        self.tables.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Drop superseded versions once no transaction is running
    pub fn vacuum(&self) -> StrataResult<usize> {
        if self.registry.active_count() > 0 || self.config.read_only {
            return Ok(0);
        }
        let mut removed = 0;
        for table in self.loaded_tables() {
            removed += table.vacuum(self)?;
        }
        Ok(removed)
    }
}

pub struct Database {
    shared: Arc<DatabaseShared>,
}

impl Database {
    /// Create a new database file
    pub fn create<P: AsRef<Path>>(path: P, config: DatabaseConfig) -> StrataResult<Self> {
        let store = FileClusterStore::create(path, config.page_size)?;
        Self::from_store(Arc::new(store), config, Arc::new(BuiltinCompiler))
    }

    /// Open an existing database file, recovering interrupted transactions
    pub fn open<P: AsRef<Path>>(path: P, config: DatabaseConfig) -> StrataResult<Self> {
        let store = FileClusterStore::open(path, config.read_only)?;
        Self::from_store(Arc::new(store), config, Arc::new(BuiltinCompiler))
    }

    /// Temporary database that lives in memory
    pub fn in_memory(config: DatabaseConfig) -> StrataResult<Self> {
        let store = MemoryClusterStore::new(config.page_size);
        Self::from_store(Arc::new(store), config, Arc::new(BuiltinCompiler))
    }

    pub fn from_store(
        store: Arc<dyn ClusterStore>,
        config: DatabaseConfig,
        compiler: Arc<dyn ExpressionCompiler>,
    ) -> StrataResult<Self> {
        let catalog = PersistentCatalog::load(store.as_ref())?;
        let tables = DashMap::new();
        let mut last_version = 0;

        for name in catalog.list_tables() {
            let Some(schema) = catalog.get_table(&name).cloned() else {
                continue;
            };
            let table = TableShared::load(store.as_ref(), schema)?;
            if !config.read_only {
                table.recover(store.as_ref())?;
            }
            last_version = last_version.max(table.max_version());
            tables.insert(name.to_ascii_lowercase(), Arc::new(table));
        }

        info!(
            "Opened database: {} table(s), version {}",
            tables.len(),
            last_version
        );

        Ok(Self {
            shared: Arc::new(DatabaseShared {
                store,
                catalog: RwLock::new(catalog),
                tables,
                registry: Arc::new(TransactionRegistry::new(last_version)),
                locks: Arc::new(LockManager::new()),
                compiler,
                config,
                next_owner: AtomicU64::new(1),
            }),
        })
    }

    pub fn shared(&self) -> &Arc<DatabaseShared> {
        &self.shared
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.shared.config
    }

    pub fn connect(&self) -> Connection {
        self.connect_with(self.shared.config.connection_options())
    }

    pub fn connect_with(&self, options: ConnectionOptions) -> Connection {
        let owner = self.shared.next_owner.fetch_add(1, Ordering::SeqCst);
        debug!("Connection {} opened", owner);
        Connection {
            db: Arc::clone(&self.shared),
            session: Arc::new(Session::new(owner, options)),
        }
    }

    pub fn create_table(&self, name: &str, columns: Vec<Column>) -> StrataResult<()> {
        let db = &self.shared;
        if db.config.read_only {
            return Err(StrataError::ReadOnly {
                table: name.to_string(),
            });
        }
        if name.trim().is_empty() || columns.is_empty() {
            return Err(StrataError::InvalidInput(
                "A table needs a name and at least one column".into(),
            ));
        }
        for (index, column) in columns.iter().enumerate() {
            if columns[..index]
                .iter()
                .any(|c| c.name.eq_ignore_ascii_case(&column.name))
            {
                return Err(StrataError::InvalidInput(format!(
                    "Duplicate column '{}' in '{}'",
                    column.name, name
                )));
            }
        }

        let mut catalog = db.catalog.write();
        if catalog.get_table(name).is_some() {
            return Err(StrataError::InvalidInput(format!(
                "Table '{}' already exists",
                name
            )));
        }

        let mut schema = TableSchema {
            id: catalog.allocate_table_id(),
            name: name.to_string(),
            columns,
            identities: Vec::new(),
            defaults: Vec::new(),
            constraints: Vec::new(),
            foreign_keys: Vec::new(),
            header: BlobSlot::default(),
            version: 1,
        };
        let table = TableShared::create(db.store.as_ref(), &mut schema)?;
        catalog.add_table(schema)?;
        catalog.save(db.store.as_ref())?;
        db.tables
            .insert(name.to_ascii_lowercase(), Arc::new(table));

        info!("Created table '{}'", name);
        Ok(())
    }

    /// Drop a table nobody has open and no other table references
    pub fn drop_table(&self, name: &str) -> StrataResult<()> {
        let db = &self.shared;
        if db.config.read_only {
            return Err(StrataError::ReadOnly {
                table: name.to_string(),
            });
        }
        let table = db.table(name)?;
        if table.handle_count() > 0 {
            return Err(StrataError::Storage(format!("Table '{}' is in use", name)));
        }

        let mut catalog = db.catalog.write();
        if let Some(fk) = catalog
            .references_to(name)
            .into_iter()
            .find(|fk| !fk.is_self_reference())
        {
            return Err(StrataError::InvalidInput(format!(
                "Table '{}' is referenced by '{}' through '{}'",
                name, fk.table, fk.name
            )));
        }

        catalog.remove_table(name)?;
        catalog.save(db.store.as_ref())?;
        db.tables.remove(&name.to_ascii_lowercase());
        table.destroy(db.store.as_ref())?;
        db.store.flush()?;

        info!("Dropped table '{}'", name);
        Ok(())
    }

    pub fn list_tables(&self) -> Vec<String> {
        let mut names = self.shared.catalog.read().list_tables();
        names.sort();
        names
    }

    pub fn table_schema(&self, name: &str) -> Option<TableSchema> {
        self.shared.catalog.read().get_table(name).cloned()
    }

    pub fn vacuum(&self) -> StrataResult<usize> {
        self.shared.vacuum()
    }
}

/// One client's view of the database: its transaction, isolation level
/// and lock timeout
pub struct Connection {
    db: Arc<DatabaseShared>,
    session: Arc<Session>,
}

impl Connection {
    pub fn owner(&self) -> OwnerId {
        self.session.owner()
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn transaction_id(&self) -> TxnId {
        self.session.transaction_id()
    }

    pub fn in_transaction(&self) -> bool {
        !self.transaction_id().is_none()
    }

    pub fn begin_transaction(&self) -> StrataResult<TxnId> {
        if self.in_transaction() {
            return Err(StrataError::Transaction(format!(
                "Transaction {} is still running",
                self.transaction_id()
            )));
        }
        let txn = self.db.registry.begin(self.session.isolation());
        self.session.set_transaction(txn);
        Ok(txn)
    }

    pub fn commit(&self) -> StrataResult<()> {
        self.end_transaction(true)
    }

    pub fn rollback(&self) -> StrataResult<()> {
        self.end_transaction(false)
    }

    fn end_transaction(&self, commit: bool) -> StrataResult<()> {
        let txn = self.transaction_id();
        if txn.is_none() {
            return Err(StrataError::Transaction("No transaction is running".into()));
        }

        let mut first_error = None;
        let mut touched = 0;
        for table in self.db.loaded_tables() {
            let outcome = if commit {
                table.commit_transaction(&self.db, txn)
            } else {
                table.rollback_transaction(&self.db, txn)
            };
            match outcome {
                Ok(true) => touched += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!("Finishing {} on '{}' failed: {}", txn, table.name(), e);
                    first_error.get_or_insert(e);
                }
            }
        }

        self.db.registry.end(txn);
        self.session.set_transaction(TxnId::NONE);
        info!(
            "{} {} ({} table(s))",
            txn,
            if commit { "committed" } else { "rolled back" },
            touched
        );

        if let Err(e) = self.db.vacuum() {
            warn!("Vacuum after {} failed: {}", txn, e);
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn open_table(&self, name: &str, options: OpenOptions) -> StrataResult<ClusteredRowSet> {
        ClusterStorage::open(&self.db, name, Arc::clone(&self.session), options)
    }

    pub fn open(&self, name: &str) -> StrataResult<ClusteredRowSet> {
        self.open_table(name, OpenOptions::default())
    }

    /// Applies to row sets opened afterwards
    pub fn set_lock_timeout(&self, timeout: Duration) {
        self.session.set_lock_timeout(timeout);
    }

    pub fn set_isolation(&self, isolation: IsolationLevel) {
        self.session.set_isolation(isolation);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.in_transaction() {
            if let Err(e) = self.rollback() {
                warn!("Rolling back on disconnect failed: {}", e);
            }
        }
        self.db.locks.release_all(self.session.owner());
        debug!("Connection {} closed", self.session.owner());
    }
}
