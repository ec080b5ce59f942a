//! Fragment planning for bounded-size transfers
//!
//! Splits the byte range of one logical request into fragments no larger
//! than the engine's maximum transfer size.

use blockbridge_common::DeviceConfig;

/// One fragment of a logical request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRange {
    /// Fragment index within the request
    pub index: usize,
    /// Byte offset into the caller's buffer
    pub buffer_offset: usize,
    /// First device sector covered by the fragment
    pub sector: u64,
    /// Number of bytes in this fragment
    pub length: usize,
}

impl ChunkRange {
    /// Byte range of the caller's buffer this fragment covers
    #[must_use]
    pub fn buffer_range(&self) -> std::ops::Range<usize> {
        self.buffer_offset..self.buffer_offset + self.length
    }
}

/// Plans fragments for a device
///
/// ```text
/// Request: sector S, 2.5 MiB, max transfer 1 MiB
/// ├── Fragment 0: buffer [0, 1 MiB)         → sector S
/// ├── Fragment 1: buffer [1 MiB, 2 MiB)     → sector S + 2048
/// └── Fragment 2: buffer [2 MiB, 2.5 MiB)   → sector S + 4096
/// ```
#[derive(Debug, Clone)]
pub struct ChunkPlanner {
    max_transfer: u64,
    block_size: u64,
}

impl ChunkPlanner {
    /// Create a planner
    ///
    /// # Panics
    ///
    /// Panics unless `max_transfer` is a positive multiple of `block_size`.
    #[must_use]
    pub fn new(max_transfer: u64, block_size: u64) -> Self {
        assert!(block_size > 0, "Block size must be positive");
        assert!(
            max_transfer > 0 && max_transfer % block_size == 0,
            "Max transfer size must be a positive multiple of the block size"
        );
        Self {
            max_transfer,
            block_size,
        }
    }

    /// Create a planner from a validated device configuration
    #[must_use]
    pub fn from_config(config: &DeviceConfig) -> Self {
        Self::new(config.max_transfer_bytes, u64::from(config.block_size))
    }

    /// Maximum bytes per fragment
    #[must_use]
    pub fn max_transfer(&self) -> u64 {
        self.max_transfer
    }

    /// Device block size
    #[must_use]
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Number of fragments needed for `length` bytes
    #[must_use]
    pub fn fragment_count(&self, length: u64) -> usize {
        if length == 0 {
            return 0;
        }
        ((length - 1) / self.max_transfer + 1) as usize
    }

    /// Split `length` bytes starting at `sector` into fragments
    #[must_use]
    pub fn plan(&self, sector: u64, length: u64) -> Vec<ChunkRange> {
        let count = self.fragment_count(length);
        let sectors_per_fragment = self.max_transfer / self.block_size;

        (0..count)
            .map(|index| {
                let start = index as u64 * self.max_transfer;
                let end = (start + self.max_transfer).min(length);
                ChunkRange {
                    index,
                    buffer_offset: start as usize,
                    sector: sector + index as u64 * sectors_per_fragment,
                    length: (end - start) as usize,
                }
            })
            .collect()
    }
}
