#![allow(clippy::result_large_err)]
//! blockbridge block layer
//!
//! This crate bridges a host block interface to a replicated storage
//! engine. Host requests of any size are split into transfer-sized
//! fragments, run on a work queue and folded back into one completion.
//! Device lifetime is guarded by a remove-lock style admission gate, and a
//! volume holding a bare filesystem can be presented with a synthetic GPT
//! around it.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │   Host adapter   │  (NBD server, tests)
//! └────────┬─────────┘
//!          │
//! ┌────────▼─────────┐
//! │     IoBridge     │
//! │  - Lifecycle     │  admission, suspend, removal
//! │  - Authority     │  primary role gate
//! │  - Overlay       │  synthetic prolog / epilog
//! └────────┬─────────┘
//!          │ data region
//! ┌────────▼─────────┐
//! │ RequestSplitter  │  ChunkPlanner + WorkQueue + Aggregator
//! └────────┬─────────┘
//!          │
//! ┌────────▼─────────┐
//! │  StorageEngine   │  (file, memory)
//! └──────────────────┘
//! ```

pub mod aggregator;
pub mod authority;
pub mod bridge;
pub mod chunk;
pub mod engine;
pub mod error;
pub mod fault;
pub mod lifecycle;
pub mod overlay;
pub mod request;
pub mod splitter;
pub mod stats;
pub mod workqueue;

pub use aggregator::CompletionAggregator;
pub use authority::AuthorityGate;
pub use bridge::{DiskGeometry, IoBridge, PartitionDescriptor};
pub use chunk::{ChunkPlanner, ChunkRange};
pub use engine::{EngineError, EngineIo, MemoryEngine, StorageEngine};
pub use error::{BridgeError, BridgeResult};
pub use fault::{FaultInjector, FaultKind, FaultTarget};
pub use lifecycle::{AdmissionGuard, DeviceLifecycle, DeviceState, SuspendGate, Teardown};
pub use overlay::{FilesystemKind, GptGuids, PartitionLayout, PartitionOverlay};
pub use request::{
    CompletionHandle, Direction, Dispatch, IoBuffer, IoOutcome, LogicalRequest, RequestBuffer,
};
pub use splitter::{ChunkedIoRequest, RequestSplitter};
pub use stats::{DeviceStats, StatsSnapshot};
pub use workqueue::{WorkQueue, WorkQueueError};

/// Sector size the partition overlay works in
pub const SECTOR_SIZE: u64 = overlay::SECTOR_SIZE as u64;
