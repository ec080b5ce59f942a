//! Request splitting
//!
//! Turns one logical read or write into bounded fragments, queues each on
//! the device work queue and wires every fragment to one shared
//! [`CompletionAggregator`].
//!
//! Reads go through a private staging buffer per fragment; the data is
//! copied into the caller's buffer only when the fragment succeeds. Writes
//! slice the caller's payload without copying.

use std::sync::Arc;

use bytes::Bytes;
use futures::FutureExt;
use tracing::{debug, warn};

use crate::aggregator::CompletionAggregator;
use crate::chunk::{ChunkPlanner, ChunkRange};
use crate::engine::{EngineIo, StorageEngine};
use crate::error::{BridgeError, BridgeResult};
use crate::fault::{FaultInjector, FaultKind};
use crate::lifecycle::{AdmissionGuard, DeviceLifecycle};
use crate::request::{
    CompletionHandle, Direction, Dispatch, IoBuffer, IoOutcome, LogicalRequest, RequestBuffer,
};
use crate::stats::DeviceStats;
use crate::workqueue::WorkQueue;

/// Read staging memory, released back to the stats on drop
#[derive(Debug)]
struct StagingBuffer {
    data: Vec<u8>,
    stats: Arc<DeviceStats>,
}

impl StagingBuffer {
    fn allocate(len: usize, stats: &Arc<DeviceStats>) -> Self {
        stats.staging_allocated(len as u64);
        Self {
            data: vec![0u8; len],
            stats: Arc::clone(stats),
        }
    }
}

impl Drop for StagingBuffer {
    fn drop(&mut self) {
        self.stats.staging_released(self.data.len() as u64);
    }
}

#[derive(Debug)]
enum FragmentPayload {
    Read {
        staging: StagingBuffer,
        dest: IoBuffer,
    },
    Write(Bytes),
    Flush,
}

/// One fragment of a logical request
#[derive(Debug)]
pub struct ChunkedIoRequest {
    /// Where the fragment sits in the request and on the device
    pub range: ChunkRange,
    aggregator: Arc<CompletionAggregator>,
    payload: FragmentPayload,
}

impl ChunkedIoRequest {
    async fn run(mut self, engine: Arc<dyn StorageEngine>, faults: Arc<FaultInjector>) {
        let sector = self.range.sector;
        let io = match &mut self.payload {
            FragmentPayload::Read { staging, .. } => EngineIo::Read {
                sector,
                buf: &mut staging.data,
            },
            FragmentPayload::Write(data) => EngineIo::Write {
                sector,
                data: &data[..],
            },
            FragmentPayload::Flush => EngineIo::Flush,
        };

        let mut result = engine
            .submit(io)
            .await
            .map_err(|e| e.into_bridge(sector));
        if result.is_ok() && faults.should_fail(FaultKind::Completion, self.range.index) {
            result = Err(BridgeError::MediumFailure {
                sector,
                reason: "injected completion fault".into(),
            });
        }

        match (&result, &self.payload) {
            (Ok(()), FragmentPayload::Read { staging, dest }) => {
                dest.copy_in(self.range.buffer_offset, &staging.data);
            }
            (Err(err), _) => {
                warn!(
                    "Fragment {} at sector {} failed: {}",
                    self.range.index, sector, err
                );
            }
            _ => {}
        }

        // Staging and payload slices are released before the aggregate
        // completion can fire.
        let aggregator = self.aggregator;
        drop(self.payload);
        aggregator.complete_fragment(result);
    }
}

/// Splits logical requests into engine-sized fragments
pub struct RequestSplitter {
    engine: Arc<dyn StorageEngine>,
    queue: Arc<WorkQueue>,
    planner: ChunkPlanner,
    faults: Arc<FaultInjector>,
    stats: Arc<DeviceStats>,
    lifecycle: Arc<DeviceLifecycle>,
}

impl std::fmt::Debug for RequestSplitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestSplitter")
            .field("queue", &self.queue.name())
            .field("planner", &self.planner)
            .finish_non_exhaustive()
    }
}

impl RequestSplitter {
    /// Create a splitter in front of `engine`
    pub fn new(
        engine: Arc<dyn StorageEngine>,
        queue: Arc<WorkQueue>,
        planner: ChunkPlanner,
        faults: Arc<FaultInjector>,
        stats: Arc<DeviceStats>,
        lifecycle: Arc<DeviceLifecycle>,
    ) -> Self {
        Self {
            engine,
            queue,
            planner,
            faults,
            stats,
            lifecycle,
        }
    }

    /// The engine fragments are submitted to
    #[must_use]
    pub fn engine(&self) -> &Arc<dyn StorageEngine> {
        &self.engine
    }

    /// Range checks shared by both variants; returns the possibly
    /// truncated length
    fn clip(&self, direction: Direction, sector: u64, length: u64) -> BridgeResult<u64> {
        if !direction.is_data_transfer() {
            return Err(BridgeError::invalid_argument(format!(
                "{direction} cannot be split"
            )));
        }
        if direction == Direction::Write && !self.engine.is_primary() {
            return Err(BridgeError::Unauthoritative);
        }

        let device_size = self.engine.size_bytes();
        let start = sector
            .checked_mul(self.planner.block_size())
            .ok_or_else(|| BridgeError::invalid_argument("sector overflows"))?;
        if start >= device_size {
            return Err(BridgeError::invalid_argument(format!(
                "sector {sector} is beyond the end of the device ({device_size} bytes)"
            )));
        }

        let mut length = length;
        if start.saturating_add(length) > device_size {
            let truncated = device_size - start;
            debug!(
                "Truncating {} at sector {} from {} to {} bytes",
                direction, sector, length, truncated
            );
            length = truncated;
        }
        if length == 0 {
            return Err(BridgeError::invalid_argument("zero length request"));
        }
        Ok(length)
    }

    /// Split `request` and queue its fragments
    ///
    /// Errors found before anything is queued come back as
    /// [`Dispatch::Immediate`] and the completion handle is never
    /// signalled. Otherwise the handle fires exactly once, after every
    /// queued fragment has finished.
    pub async fn split_and_submit(
        &self,
        request: LogicalRequest,
        guard: Option<AdmissionGuard>,
    ) -> Dispatch {
        let LogicalRequest {
            direction,
            sector,
            length,
            buffer,
            completion,
        } = request;

        let length = match self.clip(direction, sector, length) {
            Ok(length) => length,
            Err(err) => return Dispatch::Immediate(IoOutcome::failure(err)),
        };
        let Some(buffer) = buffer else {
            return Dispatch::Immediate(IoOutcome::failure(BridgeError::resource_exhausted(
                "request buffer is not mapped",
            )));
        };
        let matches_direction = matches!(
            (direction, &buffer),
            (Direction::Read, RequestBuffer::Read(_)) | (Direction::Write, RequestBuffer::Write(_))
        );
        if !matches_direction || (buffer.len() as u64) < length {
            return Dispatch::Immediate(IoOutcome::failure(BridgeError::invalid_argument(
                format!(
                    "{direction} buffer of {} bytes cannot hold {length} bytes",
                    buffer.len()
                ),
            )));
        }

        let fragments = self.planner.plan(sector, length);
        let total = fragments.len();
        debug!(
            "{} sector {} length {} split into {} fragments",
            direction, sector, length, total
        );

        let aggregator = CompletionAggregator::new(
            total,
            length,
            completion,
            guard,
            Some(Arc::clone(&self.stats)),
        );

        for range in fragments {
            let index = range.index;
            let payload = match self.fragment_payload(&buffer, &range) {
                Ok(payload) => payload,
                Err(err) => {
                    if let Some(dispatch) = self.abort_at(&aggregator, index, total, err) {
                        return dispatch;
                    }
                    break;
                }
            };

            let fragment = ChunkedIoRequest {
                range,
                aggregator: Arc::clone(&aggregator),
                payload,
            };

            if let Err(err) = self.queue_fragment(fragment).await {
                if let Some(dispatch) = self.abort_at(&aggregator, index, total, err) {
                    return dispatch;
                }
                break;
            }
        }

        Dispatch::Pending
    }

    /// Queue a single flush marker, aggregated like any other request
    pub async fn submit_flush(
        &self,
        completion: CompletionHandle,
        guard: Option<AdmissionGuard>,
    ) -> Dispatch {
        let aggregator =
            CompletionAggregator::new(1, 0, completion, guard, Some(Arc::clone(&self.stats)));
        let fragment = ChunkedIoRequest {
            range: ChunkRange {
                index: 0,
                buffer_offset: 0,
                sector: 0,
                length: 0,
            },
            aggregator: Arc::clone(&aggregator),
            payload: FragmentPayload::Flush,
        };

        match self.queue_fragment(fragment).await {
            Ok(()) => Dispatch::Pending,
            Err(err) => self
                .abort_at(&aggregator, 0, 1, err)
                .unwrap_or(Dispatch::Pending),
        }
    }

    fn fragment_payload(
        &self,
        buffer: &RequestBuffer,
        range: &ChunkRange,
    ) -> BridgeResult<FragmentPayload> {
        match buffer {
            RequestBuffer::Read(dest) => {
                if self.faults.should_fail(FaultKind::Allocation, range.index) {
                    return Err(BridgeError::resource_exhausted(format!(
                        "no memory for {} byte staging buffer",
                        range.length
                    )));
                }
                Ok(FragmentPayload::Read {
                    staging: StagingBuffer::allocate(range.length, &self.stats),
                    dest: dest.clone(),
                })
            }
            RequestBuffer::Write(data) => Ok(FragmentPayload::Write(data.slice(range.buffer_range()))),
        }
    }

    async fn queue_fragment(&self, fragment: ChunkedIoRequest) -> BridgeResult<()> {
        let index = fragment.range.index;
        if self.faults.should_fail(FaultKind::Submission, index) {
            return Err(BridgeError::SubmissionFailed {
                fragment: index,
                reason: "injected submission fault".into(),
            });
        }

        let engine = Arc::clone(&self.engine);
        let faults = Arc::clone(&self.faults);
        // A rejected job is dropped with its staging and aggregator handle.
        self.queue
            .submit(fragment.run(engine, faults).boxed())
            .await
            .map_err(|e| BridgeError::SubmissionFailed {
                fragment: index,
                reason: e.to_string(),
            })?;
        self.stats.record_fragment_submitted();
        Ok(())
    }

    /// Stop splitting at fragment `index`
    ///
    /// Nothing queued yet: answer synchronously. Otherwise account every
    /// fragment from `index` on as failed so the aggregate still fires once
    /// the queued ones finish.
    fn abort_at(
        &self,
        aggregator: &Arc<CompletionAggregator>,
        index: usize,
        total: usize,
        err: BridgeError,
    ) -> Option<Dispatch> {
        if index == 0 {
            aggregator.abandon();
            let err = match err {
                BridgeError::SubmissionFailed { reason, .. } => {
                    BridgeError::ResourceExhausted(reason)
                }
                other => other,
            };
            return Some(Dispatch::Immediate(IoOutcome::failure(err)));
        }

        warn!(
            "Fragment {} of {} could not be submitted: {}",
            index, total, err
        );
        let err = match err {
            err @ BridgeError::SubmissionFailed { .. } => err,
            other => BridgeError::SubmissionFailed {
                fragment: index,
                reason: other.to_string(),
            },
        };
        aggregator.fail_remaining(total - index, err);
        None
    }

    /// Split, queue and wait for the aggregate result
    ///
    /// Used for internal I/O such as the boot sector scan. Fragments take
    /// the same path as [`split_and_submit`](Self::split_and_submit). Only
    /// the wait ends early with `DeviceGone` if the device is torn down;
    /// fragments already queued still run to completion.
    pub async fn submit_and_wait(&self, sector: u64, buffer: RequestBuffer) -> BridgeResult<u64> {
        let (completion, rx) = CompletionHandle::channel();
        let request = match buffer {
            RequestBuffer::Read(buf) => LogicalRequest::read(sector, buf, completion),
            RequestBuffer::Write(data) => LogicalRequest::write(sector, data, completion),
        };
        let dispatch = self.split_and_submit(request, None).await;

        self.lifecycle
            .interruptible(dispatch.resolve(rx))
            .await?
            .into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemoryEngine;
    use crate::fault::FaultTarget;
    use crate::lifecycle::DeviceState;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const MIB: u64 = 1024 * 1024;

    struct Fixture {
        engine: Arc<MemoryEngine>,
        splitter: RequestSplitter,
        faults: Arc<FaultInjector>,
        stats: Arc<DeviceStats>,
        lifecycle: Arc<DeviceLifecycle>,
        queue: Arc<WorkQueue>,
    }

    fn fixture(size: u64, max_transfer: u64) -> Fixture {
        let engine = Arc::new(MemoryEngine::new(size));
        let queue = Arc::new(WorkQueue::new("test", 64));
        let faults = Arc::new(FaultInjector::new());
        let stats = Arc::new(DeviceStats::new());
        let lifecycle = DeviceLifecycle::new("test");
        lifecycle.activate();
        let splitter = RequestSplitter::new(
            engine.clone(),
            queue.clone(),
            ChunkPlanner::new(max_transfer, 512),
            faults.clone(),
            stats.clone(),
            lifecycle.clone(),
        );
        Fixture {
            engine,
            splitter,
            faults,
            stats,
            lifecycle,
            queue,
        }
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    async fn read(f: &Fixture, sector: u64, len: usize) -> (IoOutcome, Vec<u8>) {
        let buf = IoBuffer::zeroed(len);
        let (handle, rx) = CompletionHandle::channel();
        let dispatch = f
            .splitter
            .split_and_submit(LogicalRequest::read(sector, buf.clone(), handle), None)
            .await;
        (dispatch.resolve(rx).await, buf.to_vec())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_two_and_a_half_mib_write_then_read() {
        let f = fixture(8 * MIB, MIB);
        let data = pattern((5 * MIB / 2) as usize);

        let (handle, rx) = CompletionHandle::channel();
        let dispatch = f
            .splitter
            .split_and_submit(
                LogicalRequest::write(16, Bytes::from(data.clone()), handle),
                None,
            )
            .await;
        assert!(matches!(dispatch, Dispatch::Pending));
        assert_eq!(dispatch.resolve(rx).await, IoOutcome::success(2_621_440));
        assert_eq!(f.engine.read_at(16 * 512, data.len()), data);

        let (outcome, read_back) = read(&f, 16, data.len()).await;
        assert_eq!(outcome, IoOutcome::success(2_621_440));
        assert_eq!(read_back, data);

        let snap = f.stats.snapshot();
        assert_eq!(snap.fragments_submitted, 6);
        assert_eq!(snap.staging_bytes, 0);
    }

    #[tokio::test]
    async fn test_validation_order() {
        let f = fixture(4096, 4096);

        let (handle, _rx) = CompletionHandle::channel();
        let dispatch = f
            .splitter
            .split_and_submit(
                LogicalRequest {
                    direction: Direction::Discard,
                    sector: 0,
                    length: 512,
                    buffer: None,
                    completion: handle,
                },
                None,
            )
            .await;
        assert!(matches!(
            dispatch,
            Dispatch::Immediate(IoOutcome {
                status: Err(BridgeError::InvalidArgument(_)),
                ..
            })
        ));

        f.engine.set_primary(false);
        let (handle, _rx) = CompletionHandle::channel();
        let dispatch = f
            .splitter
            .split_and_submit(
                LogicalRequest::write(100, Bytes::from_static(&[0; 512]), handle),
                None,
            )
            .await;
        let Dispatch::Immediate(outcome) = dispatch else {
            panic!("expected synchronous rejection");
        };
        assert_eq!(outcome.status, Err(BridgeError::Unauthoritative));
        f.engine.set_primary(true);

        let (outcome, _) = read(&f, 8, 512).await;
        assert!(matches!(outcome.status, Err(BridgeError::InvalidArgument(_))));

        let (handle, _rx) = CompletionHandle::channel();
        let dispatch = f
            .splitter
            .split_and_submit(
                LogicalRequest {
                    direction: Direction::Read,
                    sector: 0,
                    length: 512,
                    buffer: None,
                    completion: handle,
                },
                None,
            )
            .await;
        let Dispatch::Immediate(outcome) = dispatch else {
            panic!("expected synchronous rejection");
        };
        assert!(matches!(outcome.status, Err(BridgeError::ResourceExhausted(_))));
    }

    #[tokio::test]
    async fn test_zero_length_rejected() {
        let f = fixture(4096, 4096);
        let (outcome, _) = read(&f, 0, 0).await;
        assert!(matches!(outcome.status, Err(BridgeError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_request_past_end_is_truncated() {
        let f = fixture(4096, 1024);
        f.engine.write_at(3072, &[7; 1024]);

        let (outcome, buf) = read(&f, 6, 4096).await;
        assert_eq!(outcome, IoOutcome::success(1024));
        assert!(buf[..1024].iter().all(|&b| b == 7));
        assert!(buf[1024..].iter().all(|&b| b == 0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_completion_fault_fails_request_and_releases_staging() {
        let f = fixture(8 * MIB, MIB);
        f.engine.write_at(0, &[9; 4096]);
        f.faults
            .arm(FaultKind::Completion, FaultTarget::Fragment(1));

        let (outcome, buf) = read(&f, 0, (3 * MIB) as usize).await;
        assert_eq!(outcome.bytes, 0);
        assert!(matches!(
            outcome.status,
            Err(BridgeError::MediumFailure { sector: 2048, .. })
        ));
        // Fragment 0 still completed and copied its data.
        assert_eq!(&buf[..4096], &[9; 4096][..]);

        let snap = f.stats.snapshot();
        assert_eq!(snap.staging_bytes, 0);
        assert_eq!(snap.fragments_submitted, 3);
        assert_eq!(snap.fragments_failed, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_submission_fault_mid_request() {
        let f = fixture(8 * MIB, MIB);
        f.faults
            .arm(FaultKind::Submission, FaultTarget::Fragment(2));

        let (outcome, _) = read(&f, 0, (4 * MIB) as usize).await;
        assert!(matches!(
            outcome.status,
            Err(BridgeError::SubmissionFailed { fragment: 2, .. })
        ));
        let snap = f.stats.snapshot();
        assert_eq!(snap.fragments_submitted, 2);
        assert_eq!(snap.fragments_failed, 2);
        assert_eq!(snap.staging_bytes, 0);
    }

    #[tokio::test]
    async fn test_allocation_failure_on_first_fragment_is_synchronous() {
        let f = fixture(8 * MIB, MIB);
        f.faults
            .arm(FaultKind::Allocation, FaultTarget::Fragment(0));

        let (handle, mut rx) = CompletionHandle::channel();
        let dispatch = f
            .splitter
            .split_and_submit(
                LogicalRequest::read(0, IoBuffer::zeroed(MIB as usize), handle),
                None,
            )
            .await;
        let Dispatch::Immediate(outcome) = dispatch else {
            panic!("expected synchronous failure");
        };
        assert!(matches!(outcome.status, Err(BridgeError::ResourceExhausted(_))));
        // The completion handle was dropped without being signalled.
        assert!(rx.try_recv().is_err());
        assert_eq!(f.stats.staging_bytes(), 0);
    }

    #[tokio::test]
    async fn test_closed_queue_at_first_fragment() {
        let f = fixture(4096, 4096);
        f.queue.close();
        let (outcome, _) = read(&f, 0, 512).await;
        assert!(matches!(outcome.status, Err(BridgeError::ResourceExhausted(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_guard_held_until_completion() {
        let f = fixture(8 * MIB, MIB);
        f.engine.set_stalled(true);

        let guard = f.lifecycle.admit().unwrap();
        let (handle, rx) = CompletionHandle::channel();
        let dispatch = f
            .splitter
            .split_and_submit(
                LogicalRequest::read(0, IoBuffer::zeroed((2 * MIB) as usize), handle),
                Some(guard),
            )
            .await;
        assert!(matches!(dispatch, Dispatch::Pending));

        f.lifecycle.close_gate();
        assert_eq!(f.lifecycle.state(), DeviceState::Quiescing);

        f.engine.set_stalled(false);
        assert!(dispatch.resolve(rx).await.is_success());
        f.lifecycle.wait_removed().await.unwrap();
        assert_eq!(f.lifecycle.state(), DeviceState::Removed);
    }

    #[tokio::test]
    async fn test_flush() {
        let f = fixture(4096, 4096);
        let (handle, rx) = CompletionHandle::channel();
        let dispatch = f.splitter.submit_flush(handle, None).await;
        assert_eq!(dispatch.resolve(rx).await, IoOutcome::success(0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_submit_and_wait_reads_through_staging() {
        let f = fixture(4 * MIB, MIB);
        let data = pattern((3 * MIB / 2) as usize);
        f.engine.write_at(512, &data);

        let buf = IoBuffer::zeroed(data.len());
        let bytes = f
            .splitter
            .submit_and_wait(1, RequestBuffer::Read(buf.clone()))
            .await
            .unwrap();
        assert_eq!(bytes, data.len() as u64);
        assert_eq!(buf.to_vec(), data);

        let snap = f.stats.snapshot();
        assert_eq!(snap.fragments_submitted, 2);
        assert_eq!(snap.staging_bytes, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_submit_and_wait_honours_faults() {
        let f = fixture(4 * MIB, MIB);
        f.faults
            .arm(FaultKind::Completion, FaultTarget::Fragment(1));

        let result = f
            .splitter
            .submit_and_wait(0, RequestBuffer::Write(Bytes::from(pattern((2 * MIB) as usize))))
            .await;
        assert!(matches!(
            result,
            Err(BridgeError::MediumFailure { sector: 2048, .. })
        ));
        assert_eq!(f.stats.snapshot().fragments_failed, 1);
    }

    /// Counts engine calls that ran to the end
    struct CountingEngine {
        inner: MemoryEngine,
        finished: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl StorageEngine for CountingEngine {
        async fn submit(&self, io: EngineIo<'_>) -> Result<(), crate::engine::EngineError> {
            let result = self.inner.submit(io).await;
            self.finished.fetch_add(1, Ordering::SeqCst);
            result
        }

        fn is_primary(&self) -> bool {
            self.inner.is_primary()
        }

        fn size_bytes(&self) -> u64 {
            self.inner.size_bytes()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_submit_and_wait_teardown_leaves_fragment_running() {
        let engine = Arc::new(CountingEngine {
            inner: MemoryEngine::new(4096),
            finished: AtomicUsize::new(0),
        });
        engine.inner.write_at(0, &[0x3C; 512]);
        engine.inner.set_stalled(true);

        let stats = Arc::new(DeviceStats::new());
        let lifecycle = DeviceLifecycle::new("test");
        lifecycle.activate();
        let splitter = Arc::new(RequestSplitter::new(
            engine.clone(),
            Arc::new(WorkQueue::new("test", 4)),
            ChunkPlanner::new(4096, 512),
            Arc::new(FaultInjector::new()),
            stats.clone(),
            lifecycle.clone(),
        ));

        let buf = IoBuffer::zeroed(512);
        let wait = {
            let splitter = splitter.clone();
            let buf = buf.clone();
            tokio::spawn(async move { splitter.submit_and_wait(0, RequestBuffer::Read(buf)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(stats.snapshot().fragments_submitted, 1);

        lifecycle.close_gate();
        assert_eq!(wait.await.unwrap(), Err(BridgeError::DeviceGone));
        assert_eq!(engine.finished.load(Ordering::SeqCst), 0);

        engine.inner.set_stalled(false);
        for _ in 0..100 {
            if engine.finished.load(Ordering::SeqCst) == 1 && stats.staging_bytes() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(engine.finished.load(Ordering::SeqCst), 1);
        assert_eq!(stats.staging_bytes(), 0);
        assert_eq!(buf.read_range(0, 4), vec![0x3C; 4]);
    }
}
