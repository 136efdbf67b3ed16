//! File-backed cluster store

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{StrataError, StrataResult};
use crate::row::RefPosition;
use crate::storage::page::{CLUSTER_HEADER_SIZE, ClusterHeader, FileHeader, MIN_PAGE_SIZE};
use crate::storage::ClusterStore;

struct FileState {
    file: File,
    header: FileHeader,
    free: BTreeMap<u64, u32>,
    dirty: bool,
}

/// Single-file store of fixed-size pages. Page 0 is the file header.
pub struct FileClusterStore {
    path: PathBuf,
    page_size: usize,
    state: Mutex<FileState>,
}

impl FileClusterStore {
    /// Create a new, empty store file
    pub fn create<P: AsRef<Path>>(path: P, page_size: usize) -> StrataResult<Self> {
        let path = path.as_ref().to_path_buf();
        let page_size = page_size.max(MIN_PAGE_SIZE);
        let mut file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)?;

        let header = FileHeader::new(page_size);
        file.write_all(&header.to_bytes())?;
        file.sync_all()?;
        debug!("Created store {} with {}-byte pages", path.display(), page_size);

        Ok(Self {
            path,
            page_size,
            state: Mutex::new(FileState {
                file,
                header,
                free: BTreeMap::new(),
                dirty: false,
            }),
        })
    }

    /// Open an existing store file
    pub fn open<P: AsRef<Path>>(path: P, read_only: bool) -> StrataResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(&path)?;

        let mut lead = [0u8; 8];
        file.read_exact(&mut lead)?;
        let page_size = u32::from_le_bytes([lead[4], lead[5], lead[6], lead[7]]) as usize;
        if page_size < MIN_PAGE_SIZE {
            return Err(StrataError::Storage(format!(
                "Invalid page size {} in {}",
                page_size,
                path.display()
            )));
        }

        let mut page = vec![0u8; page_size];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut page)?;
        let header = FileHeader::from_bytes(&page)?;
        let free = header.free.iter().copied().collect();
        debug!(
            "Opened store {} ({} pages)",
            path.display(),
            header.page_count
        );

        Ok(Self {
            path,
            page_size,
            state: Mutex::new(FileState {
                file,
                header,
                free,
                dirty: false,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn offset(&self, position: RefPosition) -> u64 {
        position.0 * self.page_size as u64
    }

    fn read_header(&self, file: &mut File, position: RefPosition) -> StrataResult<ClusterHeader> {
        let mut bytes = [0u8; CLUSTER_HEADER_SIZE];
        file.seek(SeekFrom::Start(self.offset(position)))?;
        file.read_exact(&mut bytes)?;
        ClusterHeader::from_bytes(&bytes)
            .map_err(|e| StrataError::Storage(format!("Cluster {}: {}", position, e)))
    }

    fn check_position(state: &FileState, position: RefPosition) -> StrataResult<()> {
        if position.is_empty() || position.0 == 0 || position.0 >= state.header.page_count {
            return Err(StrataError::Storage(format!(
                "Cluster {} is outside the file",
                position
            )));
        }
        Ok(())
    }
}

impl ClusterStore for FileClusterStore {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn read_cluster(&self, position: RefPosition) -> StrataResult<Vec<u8>> {
        let mut state = self.state.lock();
        Self::check_position(&state, position)?;

        let header = self.read_header(&mut state.file, position)?;
        let mut data = vec![0u8; header.data_len as usize];
        state.file.read_exact(&mut data)?;
        header.verify(&data)?;
        Ok(data)
    }

    fn write_cluster(&self, position: RefPosition, data: &[u8]) -> StrataResult<()> {
        let mut state = self.state.lock();
        Self::check_position(&state, position)?;

        let pages = self.read_header(&mut state.file, position)?.page_count;
        if data.len() > self.capacity(pages) {
            return Err(StrataError::Storage(format!(
                "Cluster {} overflow: {} bytes into {} pages",
                position,
                data.len(),
                pages
            )));
        }

        let header = ClusterHeader::new(pages, data);
        let offset = self.offset(position);
        state.file.seek(SeekFrom::Start(offset))?;
        state.file.write_all(&header.to_bytes())?;
        state.file.write_all(data)?;
        Ok(())
    }

    fn cluster_pages(&self, position: RefPosition) -> StrataResult<u32> {
        let mut state = self.state.lock();
        Self::check_position(&state, position)?;
        Ok(self.read_header(&mut state.file, position)?.page_count)
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
                let position = state.header.page_count;
                state.header.page_count += page_count as u64;
                let new_len = state.header.page_count * self.page_size as u64;
                state.file.set_len(new_len)?;
                position
            }
        };

        let header = ClusterHeader::new(page_count, &[]);
        state.file.seek(SeekFrom::Start(self.offset(RefPosition(position))))?;
        state.file.write_all(&header.to_bytes())?;
        state.dirty = true;

        Ok(RefPosition(position))
    }

    fn set_free_cluster(&self, position: RefPosition, page_count: u32) -> StrataResult<()> {
        let mut state = self.state.lock();
        Self::check_position(&state, position)?;

        // Scrub the header so a stale read fails its magic check
        state.file.seek(SeekFrom::Start(self.offset(position)))?;
        state.file.write_all(&[0u8; CLUSTER_HEADER_SIZE])?;

        state.free.insert(position.0, page_count);
        state.dirty = true;
        Ok(())
    }

    fn root(&self) -> RefPosition {
        self.state.lock().header.root
    }

    fn set_root(&self, position: RefPosition) -> StrataResult<()> {
        let mut state = self.state.lock();
        state.header.root = position;
        state.dirty = true;
        Ok(())
    }

    fn flush(&self) -> StrataResult<()> {
        let mut state = self.state.lock();
        if state.dirty {
            let free: Vec<(u64, u32)> = state.free.iter().map(|(&p, &n)| (p, n)).collect();
            let capacity = FileHeader::free_capacity(self.page_size);
            if free.len() > capacity {
                warn!(
                    "Free-space map of {} holds {} extents, only {} persisted",
                    self.path.display(),
                    free.len(),
                    capacity
                );
            }
            state.header.free = free;

            let bytes = state.header.to_bytes();
            state.file.seek(SeekFrom::Start(0))?;
            state.file.write_all(&bytes)?;
            state.dirty = false;
        }
        state.file.sync_all()?;
        Ok(())
    }
}

impl Drop for FileClusterStore {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!("Failed to flush {} on close: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_file_store_round_trip() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("test.sdb");

        let (position, big) = {
            let store = FileClusterStore::create(&path, 512).unwrap();
            let position = store.get_free_cluster(1).unwrap();
            store.write_cluster(position, b"test data").unwrap();

            let big_data = vec![7u8; 1500];
            let big = store.get_free_cluster(store.pages_for(big_data.len())).unwrap();
            store.write_cluster(big, &big_data).unwrap();
            store.set_root(position).unwrap();
            store.flush().unwrap();
            (position, big)
        };

        let store = FileClusterStore::open(&path, false).unwrap();
        assert_eq!(store.root(), position);
        assert_eq!(store.read_cluster(position).unwrap(), b"test data");
        assert_eq!(store.read_cluster(big).unwrap(), vec![7u8; 1500]);
        assert_eq!(store.cluster_pages(big).unwrap(), 3);
    }

    #[test]
    fn test_freed_cluster_is_unreadable_and_reused() {
        let temp_dir = tempdir().unwrap();
        let store = FileClusterStore::create(temp_dir.path().join("free.sdb"), 512).unwrap();

        let position = store.get_free_cluster(2).unwrap();
        store.write_cluster(position, b"soon gone").unwrap();
        store.set_free_cluster(position, 2).unwrap();
        assert!(store.read_cluster(position).is_err());

        assert_eq!(store.get_free_cluster(1).unwrap(), position);
    }

    #[test]
    fn test_create_refuses_existing_file() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("dup.sdb");
        let _store = FileClusterStore::create(&path, 512).unwrap();
        assert!(FileClusterStore::create(&path, 512).is_err());
    }
}
