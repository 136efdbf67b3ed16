//! Row storage: page store, storage objects, clustered row sets and
//! relationships

pub mod blob;
pub mod clustered;
pub mod disk;
pub mod object;
pub mod page;
pub mod relation;
pub mod store;

#[cfg(test)]
mod tests;

pub use clustered::{ClusterStorage, ClusteredRowSet, DefaultRow, OpenOptions, TableHeader, TableShared};
pub use disk::FileClusterStore;
pub use object::{Operation, PartnerOpener, RowEventHook, RowPersistence, StorageObject, VersionRef};
pub use relation::{Relation, RelationRole, RelationSet};
pub use store::{ClusterStore, MemoryClusterStore};
