//! On-disk page and cluster framing

use crate::error::{StrataError, StrataResult};
use crate::row::RefPosition;

/// Default page size in bytes (4KB)
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Smallest page size a store accepts
pub const MIN_PAGE_SIZE: usize = 256;

/// Bytes in front of every cluster payload
pub const CLUSTER_HEADER_SIZE: usize = 16;

/// Bytes taken by the fixed part of the file header
const FILE_HEADER_FIXED: usize = 4 + 4 + 8 + 8 + 4;

/// Bytes per persisted free extent
const FREE_ENTRY_SIZE: usize = 12;

/// Header written at the start of the first page of a cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterHeader {
    pub magic: u32,      // Magic number for validation
    pub page_count: u32, // Pages spanned by the cluster
    pub data_len: u32,   // Payload length
    pub checksum: u32,   // CRC32 of the payload
}

impl ClusterHeader {
    /// Magic number for cluster validation
    const MAGIC: u32 = 0x5354_434C; // "STCL"

    pub fn new(page_count: u32, data: &[u8]) -> Self {
        Self {
            magic: Self::MAGIC,
            page_count,
            data_len: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    pub fn to_bytes(&self) -> [u8; CLUSTER_HEADER_SIZE] {
        let mut bytes = [0u8; CLUSTER_HEADER_SIZE];
        bytes[0..4].copy_from_slice(&self.magic.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.page_count.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.data_len.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> StrataResult<Self> {
        if bytes.len() < CLUSTER_HEADER_SIZE {
            return Err(StrataError::Storage("Truncated cluster header".into()));
        }

        let header = Self {
            magic: read_u32(bytes, 0),
            page_count: read_u32(bytes, 4),
            data_len: read_u32(bytes, 8),
            checksum: read_u32(bytes, 12),
        };

        if header.magic != Self::MAGIC {
            return Err(StrataError::Storage("Invalid cluster magic number".into()));
        }

        Ok(header)
    }

    /// Check a payload against the stored checksum
    pub fn verify(&self, data: &[u8]) -> StrataResult<()> {
        if data.len() != self.data_len as usize {
            return Err(StrataError::Storage(format!(
                "Cluster length mismatch: expected {}, got {}",
                self.data_len,
                data.len()
            )));
        }
        if crc32fast::hash(data) != self.checksum {
            return Err(StrataError::Storage("Cluster checksum mismatch".into()));
        }
        Ok(())
    }
}

/// Page 0 of a store file: geometry, root cluster and free-space map
#[derive(Debug, Clone, PartialEq)]
pub struct FileHeader {
    pub page_size: u32,
    pub page_count: u64,
    pub root: RefPosition,
    pub free: Vec<(u64, u32)>,
}

impl FileHeader {
    /// "STRA"
    const MAGIC: u32 = 0x5354_5241;

    pub fn new(page_size: usize) -> Self {
        Self {
            page_size: page_size as u32,
            page_count: 1,
            root: RefPosition::EMPTY,
            free: Vec::new(),
        }
    }

    /// How many free extents fit into the header page
    pub fn free_capacity(page_size: usize) -> usize {
        (page_size - FILE_HEADER_FIXED - 4) / FREE_ENTRY_SIZE
    }

    /// Serialize to exactly one page. Free extents beyond the page capacity
    /// are dropped; the space they describe is simply never reused.
    pub fn to_bytes(&self) -> Vec<u8> {
        let page_size = self.page_size as usize;
        let capacity = Self::free_capacity(page_size);
        let free = &self.free[..self.free.len().min(capacity)];

        let mut bytes = Vec::with_capacity(page_size);
        bytes.extend_from_slice(&Self::MAGIC.to_le_bytes());
        bytes.extend_from_slice(&self.page_size.to_le_bytes());
        bytes.extend_from_slice(&self.page_count.to_le_bytes());
        bytes.extend_from_slice(&self.root.0.to_le_bytes());
        bytes.extend_from_slice(&(free.len() as u32).to_le_bytes());
        for (position, pages) in free {
            bytes.extend_from_slice(&position.to_le_bytes());
            bytes.extend_from_slice(&pages.to_le_bytes());
        }

        bytes.resize(page_size - 4, 0);
        let checksum = crc32fast::hash(&bytes);
        bytes.extend_from_slice(&checksum.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> StrataResult<Self> {
        if bytes.len() < FILE_HEADER_FIXED + 4 {
            return Err(StrataError::Storage("Truncated file header".into()));
        }
        if read_u32(bytes, 0) != Self::MAGIC {
            return Err(StrataError::Storage("Not a strata database file".into()));
        }

        let page_size = read_u32(bytes, 4);
        if bytes.len() != page_size as usize {
            return Err(StrataError::Storage(format!(
                "Invalid header size: expected {}, got {}",
                page_size,
                bytes.len()
            )));
        }

        let body = &bytes[..bytes.len() - 4];
        let stored_checksum = read_u32(bytes, bytes.len() - 4);
        if crc32fast::hash(body) != stored_checksum {
            return Err(StrataError::Storage("File header checksum mismatch".into()));
        }

        let page_count = read_u64(bytes, 8);
        let root = RefPosition(read_u64(bytes, 16));
        let free_len = read_u32(bytes, 24) as usize;
        if free_len > Self::free_capacity(page_size as usize) {
            return Err(StrataError::Storage("Corrupted free-space map".into()));
        }

        let mut free = Vec::with_capacity(free_len);
        let mut offset = FILE_HEADER_FIXED;
        for _ in 0..free_len {
            free.push((read_u64(bytes, offset), read_u32(bytes, offset + 8)));
            offset += FREE_ENTRY_SIZE;
        }

        Ok(Self {
            page_size,
            page_count,
            root,
            free,
        })
    }
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(buf)
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(buf)
}
