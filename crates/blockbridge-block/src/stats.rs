//! Per-device I/O statistics
//!
//! Lock-free counters updated on the fragment path. Outstanding staging
//! bytes go up when a read fragment allocates its staging buffer and back
//! down when the buffer is released, whatever the fragment's outcome.

use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of [`DeviceStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub read_ops: u64,
    pub write_ops: u64,
    pub flush_ops: u64,
    pub sectors_read: u64,
    pub sectors_written: u64,
    pub fragments_submitted: u64,
    pub fragments_failed: u64,
    pub staging_bytes: u64,
    pub requests_completed: u64,
    pub requests_failed: u64,
}

/// Real-time I/O statistics for a device
#[derive(Debug, Default)]
pub struct DeviceStats {
    read_ops: AtomicU64,
    write_ops: AtomicU64,
    flush_ops: AtomicU64,
    sectors_read: AtomicU64,
    sectors_written: AtomicU64,
    fragments_submitted: AtomicU64,
    fragments_failed: AtomicU64,
    staging_bytes: AtomicU64,
    requests_completed: AtomicU64,
    requests_failed: AtomicU64,
}

impl DeviceStats {
    /// Create a zeroed tracker
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an admitted read
    pub fn record_read(&self, sectors: u64) {
        self.read_ops.fetch_add(1, Ordering::Relaxed);
        self.sectors_read.fetch_add(sectors, Ordering::Relaxed);
    }

    /// Record an admitted write
    pub fn record_write(&self, sectors: u64) {
        self.write_ops.fetch_add(1, Ordering::Relaxed);
        self.sectors_written.fetch_add(sectors, Ordering::Relaxed);
    }

    /// Record an admitted flush
    pub fn record_flush(&self) {
        self.flush_ops.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a fragment handed to the work queue
    pub fn record_fragment_submitted(&self) {
        self.fragments_submitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record failed fragments
    pub fn record_fragments_failed(&self, count: u64) {
        self.fragments_failed.fetch_add(count, Ordering::Relaxed);
    }

    /// Record the aggregate completion of a request
    pub fn record_request_done(&self, success: bool) {
        if success {
            self.requests_completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.requests_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Account a staging allocation
    pub fn staging_allocated(&self, bytes: u64) {
        self.staging_bytes.fetch_add(bytes, Ordering::AcqRel);
    }

    /// Account a staging release
    pub fn staging_released(&self, bytes: u64) {
        self.staging_bytes.fetch_sub(bytes, Ordering::AcqRel);
    }

    /// Bytes currently held in read staging buffers
    #[must_use]
    pub fn staging_bytes(&self) -> u64 {
        self.staging_bytes.load(Ordering::Acquire)
    }

    /// Copy all counters
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            read_ops: self.read_ops.load(Ordering::Relaxed),
            write_ops: self.write_ops.load(Ordering::Relaxed),
            flush_ops: self.flush_ops.load(Ordering::Relaxed),
            sectors_read: self.sectors_read.load(Ordering::Relaxed),
            sectors_written: self.sectors_written.load(Ordering::Relaxed),
            fragments_submitted: self.fragments_submitted.load(Ordering::Relaxed),
            fragments_failed: self.fragments_failed.load(Ordering::Relaxed),
            staging_bytes: self.staging_bytes(),
            requests_completed: self.requests_completed.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
        }
    }
}
