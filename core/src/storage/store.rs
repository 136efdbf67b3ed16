//! Page-layer contract and the in-memory cluster store

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;

use crate::error::{StrataError, StrataResult};
use crate::row::RefPosition;
use crate::storage::page::{CLUSTER_HEADER_SIZE, MIN_PAGE_SIZE};

/// Storage of variable-length clusters addressed by their first page.
///
/// A cluster spans `page_count` consecutive pages. Positions stay valid until
/// the cluster is handed back with `set_free_cluster`.
pub trait ClusterStore: Send + Sync {
    fn page_size(&self) -> usize;

    /// Read the payload of a cluster
    fn read_cluster(&self, position: RefPosition) -> StrataResult<Vec<u8>>;

    /// Overwrite the payload of an allocated cluster; it must fit
    fn write_cluster(&self, position: RefPosition, data: &[u8]) -> StrataResult<()>;

    /// Pages allocated to the cluster at `position`
    fn cluster_pages(&self, position: RefPosition) -> StrataResult<u32>;

    /// Allocate `page_count` consecutive pages
    fn get_free_cluster(&self, page_count: u32) -> StrataResult<RefPosition>;

    /// Return pages to the free-space map
    fn set_free_cluster(&self, position: RefPosition, page_count: u32) -> StrataResult<()>;

    /// Cluster holding the catalog
    fn root(&self) -> RefPosition;

    fn set_root(&self, position: RefPosition) -> StrataResult<()>;

    /// Make every write so far durable
    fn flush(&self) -> StrataResult<()>;

    /// Payload bytes a cluster of `pages` pages can hold
    fn capacity(&self, pages: u32) -> usize {
        (pages as usize * self.page_size()).saturating_sub(CLUSTER_HEADER_SIZE)
    }

    /// Pages needed for a payload of `len` bytes
    fn pages_for(&self, len: usize) -> u32 {
        (len + CLUSTER_HEADER_SIZE).div_ceil(self.page_size()).max(1) as u32
    }
}

#[derive(Debug)]
struct MemoryState {
    clusters: HashMap<u64, (u32, Vec<u8>)>,
    free: BTreeMap<u64, u32>,
    next_page: u64,
    root: RefPosition,
}

/// Cluster store kept entirely in memory, used for temporary databases
#[derive(Debug)]
pub struct MemoryClusterStore {
    page_size: usize,
    state: Mutex<MemoryState>,
}

impl MemoryClusterStore {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size: page_size.max(MIN_PAGE_SIZE),
            state: Mutex::new(MemoryState {
                clusters: HashMap::new(),
                free: BTreeMap::new(),
                next_page: 1,
                root: RefPosition::EMPTY,
            }),
        }
    }

    /// Number of live clusters
    pub fn cluster_count(&self) -> usize {
        self.state.lock().clusters.len()
    }

    /// Pages currently sitting in the free-space map
    pub fn free_pages(&self) -> u64 {
        self.state.lock().free.values().map(|&p| p as u64).sum()
    }
}

impl ClusterStore for MemoryClusterStore {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn read_cluster(&self, position: RefPosition) -> StrataResult<Vec<u8>> {
        let state = self.state.lock();
        state
            .clusters
            .get(&position.0)
            .map(|(_, data)| data.clone())
            .ok_or_else(|| StrataError::Storage(format!("Cluster {} is not allocated", position)))
    }

    fn write_cluster(&self, position: RefPosition, data: &[u8]) -> StrataResult<()> {
        let capacity_for = |pages: u32| self.capacity(pages);
        let mut state = self.state.lock();
        let (pages, payload) = state
            .clusters
            .get_mut(&position.0)
            .ok_or_else(|| StrataError::Storage(format!("Cluster {} is not allocated", position)))?;

        if data.len() > capacity_for(*pages) {
            return Err(StrataError::Storage(format!(
                "Cluster {} overflow: {} bytes into {} pages",
                position,
                data.len(),
                pages
            )));
        }

        payload.clear();
        payload.extend_from_slice(data);
        Ok(())
    }

    fn cluster_pages(&self, position: RefPosition) -> StrataResult<u32> {
        let state = self.state.lock();
        state
            .clusters
            .get(&position.0)
            .map(|(pages, _)| *pages)
            .ok_or_else(|| StrataError::Storage(format!("Cluster {} is not allocated", position)))
    }

    fn get_free_cluster(&self, page_count: u32) -> StrataResult<RefPosition> {
        if page_count == 0 {
            return Err(StrataError::InvalidInput("Empty cluster requested".into()));
        }

        let mut state = self.state.lock();
        let reusable = state
            .free
            .iter()
            .find(|&(_, &pages)| pages >= page_count)
            .map(|(&position, &pages)| (position, pages));

        let position = match reusable {
            Some((position, pages)) => {
                state.free.remove(&position);
                if pages > page_count {
                    state
                        .free
                        .insert(position + page_count as u64, pages - page_count);
                }
                position
            }
            None => {
                let position = state.next_page;
                state.next_page += page_count as u64;
                position
            }
        };

        state.clusters.insert(position, (page_count, Vec::new()));
        Ok(RefPosition(position))
    }

    fn set_free_cluster(&self, position: RefPosition, page_count: u32) -> StrataResult<()> {
        let mut state = self.state.lock();
        if state.clusters.remove(&position.0).is_none() {
            return Err(StrataError::Storage(format!(
                "Freeing unallocated cluster {}",
                position
            )));
        }
        state.free.insert(position.0, page_count);
        Ok(())
    }

    fn root(&self) -> RefPosition {
        self.state.lock().root
    }

    fn set_root(&self, position: RefPosition) -> StrataResult<()> {
        self.state.lock().root = position;
        Ok(())
    }

    fn flush(&self) -> StrataResult<()> {
        Ok(())
    }
}
