//! Logical requests as delivered by the host environment
//!
//! A [`LogicalRequest`] is one caller-visible read or write. The host hands
//! over a buffer and a [`CompletionHandle`]; the bridge either answers
//! immediately ([`Dispatch::Immediate`]) or promises to signal the handle
//! exactly once later ([`Dispatch::Pending`]).

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{BridgeError, BridgeResult};

/// Request direction as delivered by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
    /// Write barrier, never split
    Flush,
    /// Discard/trim; not forwarded by this bridge
    Discard,
}

impl Direction {
    /// Whether the request splitter accepts this direction
    #[must_use]
    pub fn is_data_transfer(self) -> bool {
        matches!(self, Self::Read | Self::Write)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Read => "READ",
            Self::Write => "WRITE",
            Self::Flush => "FLUSH",
            Self::Discard => "DISCARD",
        };
        f.write_str(name)
    }
}

/// Caller memory a read lands in
///
/// Cloning shares the same memory, and [`IoBuffer::slice`] hands out a
/// window onto it. Fragments stage their data privately and copy it in
/// under the buffer lock.
#[derive(Clone, Default)]
pub struct IoBuffer {
    inner: Arc<Mutex<Vec<u8>>>,
    offset: usize,
    len: usize,
}

impl IoBuffer {
    /// Allocate a zero-filled buffer
    #[must_use]
    pub fn zeroed(len: usize) -> Self {
        Self::from_vec(vec![0u8; len])
    }

    /// Wrap existing memory
    #[must_use]
    pub fn from_vec(data: Vec<u8>) -> Self {
        let len = data.len();
        Self {
            inner: Arc::new(Mutex::new(data)),
            offset: 0,
            len,
        }
    }

    /// A window of `len` bytes starting at `offset`, sharing memory
    ///
    /// # Panics
    ///
    /// Panics if the window does not fit in this buffer.
    #[must_use]
    pub fn slice(&self, offset: usize, len: usize) -> Self {
        assert!(offset + len <= self.len, "IoBuffer window out of range");
        Self {
            inner: Arc::clone(&self.inner),
            offset: self.offset + offset,
            len,
        }
    }

    /// Buffer length in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn span(&self, offset: usize, len: usize) -> std::ops::Range<usize> {
        assert!(offset + len <= self.len, "IoBuffer access out of range");
        self.offset + offset..self.offset + offset + len
    }

    /// Copy `data` into the buffer at `offset`
    ///
    /// # Panics
    ///
    /// Panics if the range is outside the buffer; callers validate ranges
    /// before admitting a request.
    pub fn copy_in(&self, offset: usize, data: &[u8]) {
        let span = self.span(offset, data.len());
        self.inner.lock()[span].copy_from_slice(data);
    }

    /// Fill `len` bytes at `offset` with `byte`
    pub fn fill(&self, offset: usize, len: usize, byte: u8) {
        let span = self.span(offset, len);
        self.inner.lock()[span].fill(byte);
    }

    /// Copy `len` bytes starting at `offset` out of the buffer
    #[must_use]
    pub fn read_range(&self, offset: usize, len: usize) -> Vec<u8> {
        let span = self.span(offset, len);
        self.inner.lock()[span].to_vec()
    }

    /// Snapshot of the whole buffer
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        self.read_range(0, self.len)
    }
}

impl fmt::Debug for IoBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoBuffer")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

/// Caller memory attached to a request
#[derive(Debug, Clone)]
pub enum RequestBuffer {
    /// Destination of a read
    Read(IoBuffer),
    /// Payload of a write, sliced per fragment without copying
    Write(Bytes),
}

impl RequestBuffer {
    /// Length of the attached memory
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Read(buf) => buf.len(),
            Self::Write(data) => data.len(),
        }
    }

    /// Whether the attached memory is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Final status of a logical request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoOutcome {
    /// Success, or the first failure observed
    pub status: BridgeResult<()>,
    /// Bytes transferred; always 0 on failure
    pub bytes: u64,
}

impl IoOutcome {
    /// Successful completion of `bytes`
    #[must_use]
    pub fn success(bytes: u64) -> Self {
        Self {
            status: Ok(()),
            bytes,
        }
    }

    /// Failed completion; byte count is reported as zero
    #[must_use]
    pub fn failure(error: BridgeError) -> Self {
        Self {
            status: Err(error),
            bytes: 0,
        }
    }

    /// Whether the request succeeded
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status.is_ok()
    }

    /// Convert into a `Result` carrying the byte count
    pub fn into_result(self) -> BridgeResult<u64> {
        self.status.map(|()| self.bytes)
    }
}

type CompletionFn = Box<dyn FnOnce(IoOutcome) + Send + 'static>;

/// Opaque host completion, consumed when signalled
pub struct CompletionHandle {
    callback: CompletionFn,
}

impl CompletionHandle {
    /// Wrap a host callback
    pub fn new(callback: impl FnOnce(IoOutcome) + Send + 'static) -> Self {
        Self {
            callback: Box::new(callback),
        }
    }

    /// A handle whose completion is delivered on a oneshot channel
    #[must_use]
    pub fn channel() -> (Self, oneshot::Receiver<IoOutcome>) {
        let (tx, rx) = oneshot::channel();
        let handle = Self::new(move |outcome| {
            // The receiver may have been dropped by an impatient host.
            let _ = tx.send(outcome);
        });
        (handle, rx)
    }

    /// A handle that discards its completion
    #[must_use]
    pub fn detached() -> Self {
        Self::new(|_| {})
    }

    /// Rewrite the outcome before it reaches the host
    #[must_use]
    pub fn map(self, f: impl FnOnce(IoOutcome) -> IoOutcome + Send + 'static) -> Self {
        let inner = self.callback;
        Self::new(move |outcome| inner(f(outcome)))
    }

    /// Signal the host
    pub fn complete(self, outcome: IoOutcome) {
        (self.callback)(outcome);
    }
}

impl fmt::Debug for CompletionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CompletionHandle")
    }
}

/// Answer to an incoming request
#[derive(Debug)]
#[must_use]
pub enum Dispatch {
    /// The completion handle will be signalled exactly once
    Pending,
    /// Answered synchronously; the completion handle was not signalled
    Immediate(IoOutcome),
}

impl Dispatch {
    /// Wait for the outcome, whichever way it is delivered
    pub async fn resolve(self, rx: oneshot::Receiver<IoOutcome>) -> IoOutcome {
        match self {
            Self::Immediate(outcome) => outcome,
            Self::Pending => rx
                .await
                .unwrap_or_else(|_| IoOutcome::failure(BridgeError::DeviceGone)),
        }
    }
}

/// One caller-visible I/O
#[derive(Debug)]
pub struct LogicalRequest {
    /// Requested direction
    pub direction: Direction,
    /// Starting offset in device blocks
    pub sector: u64,
    /// Length in bytes
    pub length: u64,
    /// Caller memory; `None` when the host could not map it
    pub buffer: Option<RequestBuffer>,
    /// Host completion
    pub completion: CompletionHandle,
}

impl LogicalRequest {
    /// Read `buffer.len()` bytes starting at `sector`
    #[must_use]
    pub fn read(sector: u64, buffer: IoBuffer, completion: CompletionHandle) -> Self {
        Self {
            direction: Direction::Read,
            sector,
            length: buffer.len() as u64,
            buffer: Some(RequestBuffer::Read(buffer)),
            completion,
        }
    }

    /// Write `data` starting at `sector`
    #[must_use]
    pub fn write(sector: u64, data: Bytes, completion: CompletionHandle) -> Self {
        Self {
            direction: Direction::Write,
            sector,
            length: data.len() as u64,
            buffer: Some(RequestBuffer::Write(data)),
            completion,
        }
    }
}
