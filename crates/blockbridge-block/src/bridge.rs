//! Top-level I/O bridge for one device
//!
//! [`IoBridge`] is what a host adapter talks to. It admits each request
//! through the lifecycle gate, waits out suspension and (on a boot device)
//! missing authority, serves partition overlay regions from memory and
//! forwards the data region to the [`RequestSplitter`].

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use blockbridge_common::BridgeConfig;

use crate::authority::AuthorityGate;
use crate::chunk::ChunkPlanner;
use crate::engine::StorageEngine;
use crate::error::{BridgeError, BridgeResult};
use crate::fault::{FaultInjector, FaultKind, FaultTarget};
use crate::lifecycle::{DeviceLifecycle, DeviceState, SuspendGate};
use crate::overlay::{FilesystemKind, PartitionLayout, PartitionOverlay, SECTOR_SIZE};
use crate::request::{
    CompletionHandle, Direction, Dispatch, IoBuffer, IoOutcome, LogicalRequest, RequestBuffer,
};
use crate::splitter::RequestSplitter;
use crate::stats::{DeviceStats, StatsSnapshot};
use crate::workqueue::WorkQueue;

/// Tracks per cylinder reported in the disk geometry
pub const TRACKS_PER_CYLINDER: u32 = 255;

/// Sectors per track reported in the disk geometry
pub const SECTORS_PER_TRACK: u32 = 63;

/// Legacy CHS geometry of the data region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskGeometry {
    pub cylinders: u64,
    pub tracks_per_cylinder: u32,
    pub sectors_per_track: u32,
    pub bytes_per_sector: u32,
}

/// The single partition the host should see
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionDescriptor {
    /// Byte offset of the partition on the presented disk
    pub starting_offset: u64,
    /// Partition length in bytes
    pub partition_length: u64,
    pub partition_number: u32,
    /// Filesystem that triggered the overlay, if any
    pub filesystem: Option<FilesystemKind>,
    pub disk_guid: Option<Uuid>,
    pub partition_guid: Option<Uuid>,
}

/// One bridged block device
#[derive(Debug)]
pub struct IoBridge {
    name: String,
    config: BridgeConfig,
    lifecycle: Arc<DeviceLifecycle>,
    suspend: SuspendGate,
    authority: AuthorityGate,
    overlay: PartitionOverlay,
    faults: Arc<FaultInjector>,
    stats: Arc<DeviceStats>,
    queue: Arc<WorkQueue>,
    splitter: RwLock<Option<Arc<RequestSplitter>>>,
    boot_sector: Mutex<Option<Vec<u8>>>,
    capacity: watch::Sender<u64>,
    openers: AtomicUsize,
}

impl IoBridge {
    /// Create a device with no engine attached
    ///
    /// Fails if `config` does not validate.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn new(name: impl Into<String>, config: BridgeConfig) -> BridgeResult<Arc<Self>> {
        let name = name.into();
        config
            .validate()
            .map_err(|e| BridgeError::invalid_argument(format!("device {name}: {e}")))?;
        let mut config = config;
        if config.overlay.enabled && config.device.block_size as usize != SECTOR_SIZE {
            warn!(
                "Device {}: partition overlay needs {} byte sectors, block size is {}; disabling it",
                name, SECTOR_SIZE, config.device.block_size
            );
            config.overlay.enabled = false;
        }

        let queue = Arc::new(WorkQueue::new(
            format!("{name}-io"),
            config.device.work_queue_depth,
        ));
        Ok(Arc::new(Self {
            lifecycle: DeviceLifecycle::new(name.clone()),
            suspend: SuspendGate::new(),
            authority: AuthorityGate::new(config.device.boot_device),
            overlay: PartitionOverlay::new(config.overlay.clone()),
            faults: Arc::new(FaultInjector::new()),
            stats: Arc::new(DeviceStats::new()),
            queue,
            splitter: RwLock::new(None),
            boot_sector: Mutex::new(None),
            capacity: watch::Sender::new(0),
            openers: AtomicUsize::new(0),
            name,
            config,
        }))
    }

    /// Device name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Lifecycle state
    #[must_use]
    pub fn state(&self) -> DeviceState {
        self.lifecycle.state()
    }

    /// Requests admitted and not yet completed
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.lifecycle.in_flight()
    }

    /// Bytes per sector on the host interface
    #[must_use]
    pub fn block_size(&self) -> u64 {
        u64::from(self.config.device.block_size)
    }

    fn splitter(&self) -> Option<Arc<RequestSplitter>> {
        self.splitter.read().clone()
    }

    // ── Engine wiring ─────────────────────────────────────────────────────

    /// Wire the device to its storage engine and make it active
    pub async fn attach_engine(&self, engine: Arc<dyn StorageEngine>) {
        let splitter = Arc::new(RequestSplitter::new(
            Arc::clone(&engine),
            Arc::clone(&self.queue),
            ChunkPlanner::from_config(&self.config.device),
            Arc::clone(&self.faults),
            Arc::clone(&self.stats),
            Arc::clone(&self.lifecycle),
        ));
        if self.splitter.write().replace(splitter).is_some() {
            warn!("Device {}: replacing attached storage engine", self.name);
        }
        self.boot_sector.lock().take();

        self.lifecycle.activate();
        self.authority.publish(engine.is_primary());
        self.size_changed().await;
    }

    /// The engine reported a new size
    ///
    /// A nonzero size unblocks capacity queries and triggers the boot
    /// sector scan.
    pub async fn size_changed(&self) {
        let Some(splitter) = self.splitter() else {
            return;
        };
        let size = splitter.engine().size_bytes();
        self.capacity.send_replace(size);

        if size == 0 {
            info!("Device {}: size set to 0, engine is diskless or unconnected", self.name);
            return;
        }
        info!("Device {}: got a valid size ({} bytes)", self.name, size);
        if let Err(e) = self.check_for_filesystem(false).await {
            warn!("Device {}: could not read boot sector on size change: {}", self.name, e);
        }
    }

    /// The engine's replication role changed
    pub async fn role_changed(&self) {
        let Some(splitter) = self.splitter() else {
            return;
        };
        let primary = splitter.engine().is_primary();
        self.authority.publish(primary);
        if primary && let Err(e) = self.check_for_filesystem(false).await {
            warn!("Device {}: boot sector scan failed after promotion: {}", self.name, e);
        }
    }

    /// Re-read the boot sector and rebuild the overlay
    ///
    /// An already published partition length is kept.
    pub async fn rescan_partition_table(&self) -> BridgeResult<Option<FilesystemKind>> {
        self.check_for_filesystem(true).await
    }

    async fn check_for_filesystem(&self, force: bool) -> BridgeResult<Option<FilesystemKind>> {
        if !self.overlay.is_enabled() {
            return Ok(None);
        }
        let Some(splitter) = self.splitter() else {
            return Ok(None);
        };
        let engine = splitter.engine();
        let size = engine.size_bytes();
        if !engine.is_primary() || size == 0 {
            debug!("Device {}: not scanning boot sector (secondary or no size)", self.name);
            return Ok(None);
        }

        let cached = if force {
            None
        } else {
            self.boot_sector.lock().clone()
        };
        let boot_sector = match cached {
            Some(sector) => sector,
            None => {
                let buf = IoBuffer::zeroed((self.block_size() as usize).max(SECTOR_SIZE));
                splitter
                    .submit_and_wait(0, RequestBuffer::Read(buf.clone()))
                    .await?;
                let sector = buf.to_vec();
                *self.boot_sector.lock() = Some(sector.clone());
                sector
            }
        };

        Ok(self.overlay.apply_boot_sector(&boot_sector, size))
    }

    // ── Open / close ──────────────────────────────────────────────────────

    /// Register an opener
    ///
    /// Succeeds trivially while no engine is attached. A boot device waits
    /// for the primary role first.
    pub async fn open(&self, write: bool) -> BridgeResult<usize> {
        if matches!(
            self.lifecycle.state(),
            DeviceState::Quiescing | DeviceState::Removed
        ) {
            return Err(BridgeError::DeviceGone);
        }

        if let Some(splitter) = self.splitter() {
            let engine = splitter.engine().as_ref();
            if self.authority.is_boot_device() {
                self.authority.wait_for_primary(engine, &self.lifecycle).await?;
            } else if write && !engine.is_primary() {
                return Err(BridgeError::Unauthoritative);
            }
        }

        let openers = self.openers.fetch_add(1, Ordering::AcqRel) + 1;
        debug!("Device {} opened ({} openers)", self.name, openers);
        Ok(openers)
    }

    /// Drop an opener; returns the remaining count
    pub fn close(&self) -> usize {
        let previous = self
            .openers
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n.saturating_sub(1))
            })
            .unwrap_or_default();
        let openers = previous.saturating_sub(1);
        debug!("Device {} closed ({} openers)", self.name, openers);
        openers
    }

    /// Current number of openers
    #[must_use]
    pub fn openers(&self) -> usize {
        self.openers.load(Ordering::Acquire)
    }

    // ── I/O ───────────────────────────────────────────────────────────────

    /// Read `length` bytes at `sector` into `buffer`
    pub async fn read(
        &self,
        sector: u64,
        length: u64,
        buffer: Option<IoBuffer>,
        completion: CompletionHandle,
    ) -> Dispatch {
        self.submit(LogicalRequest {
            direction: Direction::Read,
            sector,
            length,
            buffer: buffer.map(RequestBuffer::Read),
            completion,
        })
        .await
    }

    /// Write `payload` at `sector`
    pub async fn write(&self, sector: u64, payload: Bytes, completion: CompletionHandle) -> Dispatch {
        self.submit(LogicalRequest::write(sector, payload, completion))
            .await
    }

    /// Flush the engine's write path
    pub async fn flush(&self, completion: CompletionHandle) -> Dispatch {
        self.submit(LogicalRequest {
            direction: Direction::Flush,
            sector: 0,
            length: 0,
            buffer: None,
            completion,
        })
        .await
    }

    /// Read into `buffer` and wait for the outcome
    pub async fn read_async(&self, sector: u64, buffer: IoBuffer) -> IoOutcome {
        let (completion, rx) = CompletionHandle::channel();
        let length = buffer.len() as u64;
        self.read(sector, length, Some(buffer), completion)
            .await
            .resolve(rx)
            .await
    }

    /// Write `payload` and wait for the outcome
    pub async fn write_async(&self, sector: u64, payload: Bytes) -> IoOutcome {
        let (completion, rx) = CompletionHandle::channel();
        self.write(sector, payload, completion)
            .await
            .resolve(rx)
            .await
    }

    /// Flush and wait for the outcome
    pub async fn flush_async(&self) -> IoOutcome {
        let (completion, rx) = CompletionHandle::channel();
        self.flush(completion).await.resolve(rx).await
    }

    /// Answer one host request
    ///
    /// Either returns [`Dispatch::Immediate`] without touching the
    /// completion handle, or [`Dispatch::Pending`] and signals the handle
    /// exactly once later.
    pub async fn submit(&self, request: LogicalRequest) -> Dispatch {
        match self.admit_and_route(request).await {
            Ok(dispatch) => dispatch,
            Err(err) => {
                debug!("Device {}: request rejected: {}", self.name, err);
                Dispatch::Immediate(IoOutcome::failure(err))
            }
        }
    }

    async fn admit_and_route(&self, request: LogicalRequest) -> BridgeResult<Dispatch> {
        let guard = self.lifecycle.admit()?;
        self.suspend.wait_resumed(&self.lifecycle).await?;

        let splitter = self.splitter().ok_or(BridgeError::NotReady)?;
        let engine = splitter.engine();
        if self.authority.is_boot_device() {
            self.authority
                .wait_for_primary(engine.as_ref(), &self.lifecycle)
                .await?;
        }

        match request.direction {
            Direction::Flush => {
                self.stats.record_flush();
                return Ok(splitter
                    .submit_flush(request.completion, Some(guard))
                    .await);
            }
            Direction::Discard => {
                return Err(BridgeError::invalid_argument("discard is not supported"));
            }
            Direction::Read | Direction::Write => {}
        }

        let (data_shift, appended) = self.overlay.shifts();
        if data_shift == 0 && appended == 0 {
            self.record(&request);
            return Ok(splitter.split_and_submit(request, Some(guard)).await);
        }

        let request = self.validate_overlay_request(request, engine.as_ref(), data_shift + appended)?;
        self.record(&request);
        let data_sectors = engine.size_bytes() / SECTOR_SIZE as u64;
        let LogicalRequest {
            direction,
            sector,
            length,
            buffer,
            completion,
        } = request;
        let length = length as usize;

        let (split, data_buffer) = match buffer {
            Some(RequestBuffer::Read(buf)) => {
                let buf = buf.slice(0, length);
                let split = self.overlay.serve_read(sector, &buf, data_sectors)?;
                let part = split
                    .data
                    .map(|d| RequestBuffer::Read(buf.slice(d.buffer_offset, d.length)));
                (split, part)
            }
            Some(RequestBuffer::Write(data)) => {
                let data = data.slice(..length);
                let split = self.overlay.serve_write(sector, &data, data_sectors)?;
                let part = split.data.map(|d| {
                    RequestBuffer::Write(data.slice(d.buffer_offset..d.buffer_offset + d.length))
                });
                (split, part)
            }
            None => {
                return Err(BridgeError::resource_exhausted("request buffer is not mapped"));
            }
        };

        let (Some(part), Some(data_buffer)) = (split.data, data_buffer) else {
            debug!(
                "{} at sector {} served entirely from the partition overlay",
                direction, sector
            );
            self.stats.record_request_done(true);
            return Ok(Dispatch::Immediate(IoOutcome::success(split.overlay_bytes)));
        };

        let overlay_bytes = split.overlay_bytes;
        let completion = if overlay_bytes > 0 {
            completion.map(move |mut outcome| {
                if outcome.is_success() {
                    outcome.bytes += overlay_bytes;
                }
                outcome
            })
        } else {
            completion
        };

        let data_request = LogicalRequest {
            direction,
            sector: part.sector,
            length: part.length as u64,
            buffer: Some(data_buffer),
            completion,
        };
        Ok(splitter.split_and_submit(data_request, Some(guard)).await)
    }

    /// Range and buffer checks for a request that may touch the overlay;
    /// returns the request with its length truncated to the device end
    fn validate_overlay_request(
        &self,
        mut request: LogicalRequest,
        engine: &dyn StorageEngine,
        overlay_sectors: u64,
    ) -> BridgeResult<LogicalRequest> {
        if request.direction == Direction::Write && !engine.is_primary() {
            return Err(BridgeError::Unauthoritative);
        }

        let total_sectors = engine.size_bytes() / SECTOR_SIZE as u64 + overlay_sectors;
        if request.sector >= total_sectors {
            return Err(BridgeError::invalid_argument(format!(
                "sector {} is beyond the end of the device ({total_sectors} sectors)",
                request.sector
            )));
        }
        let available = (total_sectors - request.sector) * SECTOR_SIZE as u64;
        if request.length > available {
            debug!(
                "Truncating {} at sector {} from {} to {} bytes",
                request.direction, request.sector, request.length, available
            );
            request.length = available;
        }
        if request.length == 0 {
            return Err(BridgeError::invalid_argument("zero length request"));
        }

        let Some(buffer) = &request.buffer else {
            return Err(BridgeError::resource_exhausted("request buffer is not mapped"));
        };
        let matches_direction = matches!(
            (request.direction, buffer),
            (Direction::Read, RequestBuffer::Read(_)) | (Direction::Write, RequestBuffer::Write(_))
        );
        if !matches_direction || (buffer.len() as u64) < request.length {
            return Err(BridgeError::invalid_argument(format!(
                "{} buffer of {} bytes cannot hold {} bytes",
                request.direction,
                buffer.len(),
                request.length
            )));
        }
        if request.length % SECTOR_SIZE as u64 != 0 {
            return Err(BridgeError::invalid_argument(format!(
                "length {} is not a multiple of the sector size",
                request.length
            )));
        }
        Ok(request)
    }

    fn record(&self, request: &LogicalRequest) {
        let sectors = request.length / self.block_size();
        match request.direction {
            Direction::Read => self.stats.record_read(sectors),
            Direction::Write => self.stats.record_write(sectors),
            Direction::Flush | Direction::Discard => {}
        }
    }

    // ── Queries ───────────────────────────────────────────────────────────

    fn data_bytes(&self) -> u64 {
        self.splitter()
            .map_or(0, |splitter| splitter.engine().size_bytes())
    }

    /// Wait until the engine reports a nonzero size
    pub async fn wait_for_capacity(&self) -> BridgeResult<u64> {
        let mut capacity = self.capacity.subscribe();
        self.lifecycle
            .interruptible(async move {
                // Sender lives in self, so the channel cannot close under us.
                capacity
                    .wait_for(|size| *size > 0)
                    .await
                    .map(|size| *size)
                    .unwrap_or_default()
            })
            .await
    }

    /// Capacity presented to the host, overlay included
    ///
    /// A boot device blocks until the size is known.
    pub async fn query_capacity(&self) -> BridgeResult<u64> {
        if self.authority.is_boot_device() {
            self.wait_for_capacity().await?;
        }
        let (data_shift, appended) = self.overlay.shifts();
        Ok(self.data_bytes() + (data_shift + appended) * SECTOR_SIZE as u64)
    }

    /// Legacy geometry of the data region
    #[must_use]
    pub fn query_geometry(&self) -> DiskGeometry {
        let block_size = self.block_size();
        DiskGeometry {
            cylinders: self.data_bytes()
                / block_size
                / u64::from(TRACKS_PER_CYLINDER)
                / u64::from(SECTORS_PER_TRACK),
            tracks_per_cylinder: TRACKS_PER_CYLINDER,
            sectors_per_track: SECTORS_PER_TRACK,
            bytes_per_sector: self.config.device.block_size,
        }
    }

    /// The partition the host should see
    #[must_use]
    pub fn query_partition_layout(&self) -> PartitionDescriptor {
        let layout = self.overlay.layout();
        if !layout.is_active() {
            return PartitionDescriptor {
                starting_offset: 0,
                partition_length: self.data_bytes(),
                partition_number: 1,
                filesystem: None,
                disk_guid: None,
                partition_guid: None,
            };
        }
        PartitionDescriptor {
            starting_offset: layout.data_shift * SECTOR_SIZE as u64,
            partition_length: layout
                .published_partition_sectors()
                .map_or_else(|| self.data_bytes(), |sectors| sectors * SECTOR_SIZE as u64),
            partition_number: 1,
            filesystem: layout.filesystem,
            disk_guid: layout.guids.map(|g| g.disk_uuid()),
            partition_guid: layout.guids.map(|g| g.partition_uuid()),
        }
    }

    /// Snapshot of the overlay layout
    #[must_use]
    pub fn layout(&self) -> PartitionLayout {
        self.overlay.layout()
    }

    /// Snapshot of the I/O counters
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    // ── Removal ───────────────────────────────────────────────────────────

    /// Announce removal; I/O is still admitted
    pub fn begin_removal(&self) {
        self.lifecycle.begin_removal();
    }

    /// Device vanished; refuse new I/O and let in-flight I/O finish
    pub fn surprise_removal(&self) {
        self.lifecycle.surprise_removal();
    }

    /// Close the gate, wait for in-flight I/O, then stop the work queue
    pub async fn completed_removal(&self) -> BridgeResult<()> {
        self.lifecycle.close_gate();
        self.lifecycle.wait_removed().await?;
        self.queue.close();
        self.splitter.write().take();
        info!("Device {} removed", self.name);
        Ok(())
    }

    /// Interrupt every blocking wait; used on process shutdown
    pub fn shutdown(&self) {
        self.lifecycle.shutdown();
    }

    // ── Suspension and faults ─────────────────────────────────────────────

    /// Hold new application I/O at the front door
    pub fn suspend_io(&self) {
        self.suspend.suspend();
    }

    /// Let held application I/O through
    pub fn resume_io(&self) {
        self.suspend.resume();
    }

    /// Arm a fault rule
    pub fn inject_fault(&self, kind: FaultKind, target: FaultTarget) {
        self.faults.arm(kind, target);
    }

    /// Disarm every fault rule
    pub fn clear_faults(&self) {
        self.faults.clear();
    }
}
