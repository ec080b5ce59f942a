//! Storage engine interface
//!
//! The replication engine is consumed only through [`StorageEngine`]. A
//! fragment becomes exactly one [`EngineIo`]; the engine never sees a
//! transfer larger than the configured maximum.
//!
//! [`MemoryEngine`] is a RAM-backed engine with a switchable role and
//! capacity, used by tests and by the NBD binary's `--memory` mode.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::watch;

use crate::error::BridgeError;

/// One bounded operation submitted to the engine
#[derive(Debug)]
pub enum EngineIo<'a> {
    Read { sector: u64, buf: &'a mut [u8] },
    Write { sector: u64, data: &'a [u8] },
    Flush,
}

impl EngineIo<'_> {
    /// First sector touched, if any
    #[must_use]
    pub fn sector(&self) -> Option<u64> {
        match self {
            Self::Read { sector, .. } | Self::Write { sector, .. } => Some(*sector),
            Self::Flush => None,
        }
    }

    /// Bytes transferred
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Read { buf, .. } => buf.len(),
            Self::Write { data, .. } => data.len(),
            Self::Flush => 0,
        }
    }

    /// Whether no data is transferred
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Errors reported by a storage engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Out of range: sector {sector}, {len} bytes")]
    OutOfRange { sector: u64, len: usize },

    #[error("Engine is not primary")]
    NotPrimary,
}

impl EngineError {
    /// Create an I/O error
    pub fn io(msg: impl Into<String>) -> Self {
        Self::Io(msg.into())
    }

    /// Convert into the error reported for a failed fragment
    #[must_use]
    pub fn into_bridge(self, sector: u64) -> BridgeError {
        BridgeError::MediumFailure {
            sector,
            reason: self.to_string(),
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// The replicated storage a device forwards its data region to
#[async_trait]
pub trait StorageEngine: Send + Sync {
    /// Perform one bounded operation
    async fn submit(&self, io: EngineIo<'_>) -> Result<(), EngineError>;

    /// Whether this node may accept writes
    fn is_primary(&self) -> bool;

    /// Size of the replicated data region in bytes (0 while unknown)
    fn size_bytes(&self) -> u64;
}

/// RAM-backed storage engine
#[derive(Debug)]
pub struct MemoryEngine {
    data: RwLock<Vec<u8>>,
    block_size: u64,
    primary: AtomicBool,
    stalled: watch::Sender<bool>,
}

impl MemoryEngine {
    /// Create a primary engine of `size_bytes` with 512-byte sectors
    #[must_use]
    pub fn new(size_bytes: u64) -> Self {
        Self::with_block_size(size_bytes, 512)
    }

    /// Create a primary engine with a custom sector size
    #[must_use]
    pub fn with_block_size(size_bytes: u64, block_size: u64) -> Self {
        Self {
            data: RwLock::new(vec![0u8; size_bytes as usize]),
            block_size,
            primary: AtomicBool::new(true),
            stalled: watch::Sender::new(false),
        }
    }

    /// Change the replication role
    pub fn set_primary(&self, primary: bool) {
        self.primary.store(primary, Ordering::Release);
    }

    /// Grow or shrink the data region; new space reads as zeros
    pub fn resize(&self, size_bytes: u64) {
        self.data.write().resize(size_bytes as usize, 0);
    }

    /// Hold every submission until unstalled
    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.send_replace(stalled);
    }

    /// Copy bytes out of the engine, bypassing the I/O path
    #[must_use]
    pub fn read_at(&self, offset: u64, len: usize) -> Vec<u8> {
        let data = self.data.read();
        let start = offset as usize;
        data[start..start + len].to_vec()
    }

    /// Copy bytes into the engine, bypassing the I/O path
    pub fn write_at(&self, offset: u64, bytes: &[u8]) {
        let mut data = self.data.write();
        let start = offset as usize;
        data[start..start + bytes.len()].copy_from_slice(bytes);
    }

    fn byte_range(&self, sector: u64, len: usize, size: usize) -> Result<usize, EngineError> {
        let start = sector
            .checked_mul(self.block_size)
            .and_then(|s| usize::try_from(s).ok())
            .ok_or(EngineError::OutOfRange { sector, len })?;
        if start.checked_add(len).is_none_or(|end| end > size) {
            return Err(EngineError::OutOfRange { sector, len });
        }
        Ok(start)
    }
}

#[async_trait]
impl StorageEngine for MemoryEngine {
    async fn submit(&self, io: EngineIo<'_>) -> Result<(), EngineError> {
        let mut stalled = self.stalled.subscribe();
        // Sender lives in self, so the channel cannot close under us.
        let _ = stalled.wait_for(|s| !*s).await;

        match io {
            EngineIo::Read { sector, buf } => {
                let data = self.data.read();
                let start = self.byte_range(sector, buf.len(), data.len())?;
                buf.copy_from_slice(&data[start..start + buf.len()]);
            }
            EngineIo::Write { sector, data: payload } => {
                if !self.is_primary() {
                    return Err(EngineError::NotPrimary);
                }
                let mut data = self.data.write();
                let start = self.byte_range(sector, payload.len(), data.len())?;
                data[start..start + payload.len()].copy_from_slice(payload);
            }
            EngineIo::Flush => {}
        }
        Ok(())
    }

    fn is_primary(&self) -> bool {
        self.primary.load(Ordering::Acquire)
    }

    fn size_bytes(&self) -> u64 {
        self.data.read().len() as u64
    }
}
