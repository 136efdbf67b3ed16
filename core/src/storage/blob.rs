//! Relocatable single-cluster blobs (catalog, headers, directories)

use serde::{Deserialize, Serialize};

use crate::error::StrataResult;
use crate::row::RefPosition;
use crate::storage::ClusterStore;

/// Where a blob currently lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BlobSlot {
    pub position: RefPosition,
    pub pages: u32,
}

impl BlobSlot {
    pub fn is_empty(&self) -> bool {
        self.position.is_empty()
    }
}

/// Write `data` into `slot`, moving it to a bigger cluster when it no
/// longer fits. Returns the slot now holding the data.
pub fn store(store: &dyn ClusterStore, slot: BlobSlot, data: &[u8]) -> StrataResult<BlobSlot> {
    let needed = store.pages_for(data.len());
    if !slot.is_empty() && slot.pages >= needed {
        store.write_cluster(slot.position, data)?;
        return Ok(slot);
    }

    let position = store.get_free_cluster(needed)?;
    store.write_cluster(position, data)?;
    if !slot.is_empty() {
        store.set_free_cluster(slot.position, slot.pages)?;
    }

    Ok(BlobSlot {
        position,
        pages: needed,
    })
}

pub fn load(store: &dyn ClusterStore, slot: BlobSlot) -> StrataResult<Vec<u8>> {
    store.read_cluster(slot.position)
}

/// Give the blob's pages back; an empty slot is a no-op
pub fn release(store: &dyn ClusterStore, slot: BlobSlot) -> StrataResult<()> {
    if slot.is_empty() {
        return Ok(());
    }
    store.set_free_cluster(slot.position, slot.pages)
}
