//! File-backed storage engine
//!
//! Serves a regular file or block device as the data region. Positional
//! I/O runs on the blocking pool with owned buffers.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::info;

use blockbridge_block::{EngineError, EngineIo, StorageEngine};

/// Storage engine over a local file
#[derive(Debug)]
pub struct FileEngine {
    file: Arc<Mutex<File>>,
    path: PathBuf,
    size: u64,
    block_size: u64,
    primary: AtomicBool,
}

impl FileEngine {
    /// Open `path`, creating it with `create_size` bytes if it does not exist
    pub fn open(path: impl AsRef<Path>, create_size: Option<u64>, block_size: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let exists = path.exists();

        let mut options = OpenOptions::new();
        options.read(true).write(true);
        if !exists {
            options.create(true);
        }
        let file = options
            .open(&path)
            .with_context(|| format!("open backing file {}", path.display()))?;

        if !exists {
            let size = create_size
                .with_context(|| format!("{} does not exist and no size given", path.display()))?;
            file.set_len(size)
                .with_context(|| format!("set size of {}", path.display()))?;
            info!("Created backing file {} ({} bytes)", path.display(), size);
        }

        let mut file = file;
        let size = file
            .seek(SeekFrom::End(0))
            .with_context(|| format!("query size of {}", path.display()))?;
        let size = size - size % block_size;

        Ok(Self {
            file: Arc::new(Mutex::new(file)),
            path,
            size,
            block_size,
            primary: AtomicBool::new(true),
        })
    }

    /// Backing file path
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Change the replication role
    pub fn set_primary(&self, primary: bool) {
        self.primary.store(primary, Ordering::Release);
    }

    fn offset(&self, sector: u64, len: usize) -> Result<u64, EngineError> {
        let offset = sector
            .checked_mul(self.block_size)
            .filter(|o| o.checked_add(len as u64).is_some_and(|end| end <= self.size))
            .ok_or(EngineError::OutOfRange { sector, len })?;
        Ok(offset)
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T, EngineError>
    where
        T: Send + 'static,
        F: FnOnce(&mut File) -> std::io::Result<T> + Send + 'static,
    {
        let file = Arc::clone(&self.file);
        tokio::task::spawn_blocking(move || op(&mut file.lock()))
            .await
            .map_err(|e| EngineError::io(format!("blocking task failed: {e}")))?
            .map_err(EngineError::from)
    }
}

#[async_trait]
impl StorageEngine for FileEngine {
    async fn submit(&self, io: EngineIo<'_>) -> Result<(), EngineError> {
        match io {
            EngineIo::Read { sector, buf } => {
                let offset = self.offset(sector, buf.len())?;
                let len = buf.len();
                let data = self
                    .blocking(move |file| {
                        let mut data = vec![0u8; len];
                        file.seek(SeekFrom::Start(offset))?;
                        file.read_exact(&mut data)?;
                        Ok(data)
                    })
                    .await?;
                buf.copy_from_slice(&data);
            }
            EngineIo::Write { sector, data } => {
                if !self.is_primary() {
                    return Err(EngineError::NotPrimary);
                }
                let offset = self.offset(sector, data.len())?;
                let data = data.to_vec();
                self.blocking(move |file| {
                    file.seek(SeekFrom::Start(offset))?;
                    file.write_all(&data)
                })
                .await?;
            }
            EngineIo::Flush => {
                self.blocking(|file| file.sync_data()).await?;
            }
        }
        Ok(())
    }

    fn is_primary(&self) -> bool {
        self.primary.load(Ordering::Acquire)
    }

    fn size_bytes(&self) -> u64 {
        self.size
    }
}
