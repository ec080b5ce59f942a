//! Completion aggregation for split requests
//!
//! All fragments of one logical request share a [`CompletionAggregator`].
//! Each fragment records its failure (if any) before bumping the completed
//! count; the fragment whose increment reaches the total takes the host
//! completion out of its slot and fires it. The admission guard is
//! released right after, so the device's in-flight count only drops once
//! the host has been answered.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{BridgeError, BridgeResult};
use crate::lifecycle::AdmissionGuard;
use crate::request::{CompletionHandle, IoOutcome};
use crate::stats::DeviceStats;

/// Shared completion state of one logical request
#[derive(Debug)]
pub struct CompletionAggregator {
    total: usize,
    total_bytes: u64,
    completed: AtomicUsize,
    failure: Mutex<Option<BridgeError>>,
    completion: Mutex<Option<CompletionHandle>>,
    guard: Mutex<Option<AdmissionGuard>>,
    stats: Option<Arc<DeviceStats>>,
}

impl CompletionAggregator {
    /// Create an aggregator expecting `total` fragment completions
    pub fn new(
        total: usize,
        total_bytes: u64,
        completion: CompletionHandle,
        guard: Option<AdmissionGuard>,
        stats: Option<Arc<DeviceStats>>,
    ) -> Arc<Self> {
        debug_assert!(total > 0, "aggregator needs at least one fragment");
        Arc::new(Self {
            total,
            total_bytes,
            completed: AtomicUsize::new(0),
            failure: Mutex::new(None),
            completion: Mutex::new(Some(completion)),
            guard: Mutex::new(guard),
            stats,
        })
    }

    /// Expected fragment count
    #[must_use]
    pub fn total(&self) -> usize {
        self.total
    }

    /// Fragments completed so far
    #[must_use]
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::Acquire)
    }

    /// Whether any fragment failed so far
    #[must_use]
    pub fn has_failed(&self) -> bool {
        self.failure.lock().is_some()
    }

    /// Record one fragment completion
    ///
    /// Returns true when this call fired the aggregate completion.
    pub fn complete_fragment(&self, result: BridgeResult<()>) -> bool {
        match result {
            Ok(()) => self.record(1, None),
            Err(err) => self.record(1, Some(err)),
        }
    }

    /// Account `count` fragments that were never submitted as failed
    pub fn fail_remaining(&self, count: usize, error: BridgeError) -> bool {
        if count == 0 {
            return false;
        }
        self.record(count, Some(error))
    }

    fn record(&self, count: usize, error: Option<BridgeError>) -> bool {
        if let Some(err) = error {
            if let Some(stats) = &self.stats {
                stats.record_fragments_failed(count as u64);
            }
            let mut failure = self.failure.lock();
            if failure.is_none() {
                *failure = Some(err);
            }
        }

        let before = self.completed.fetch_add(count, Ordering::AcqRel);
        debug_assert!(before + count <= self.total, "fragment completed twice");
        if before + count != self.total {
            return false;
        }

        self.fire();
        true
    }

    /// Drop the host completion unsignalled and release the guard
    ///
    /// Only valid while no fragment has been submitted; the caller answers
    /// the host synchronously instead.
    pub(crate) fn abandon(&self) {
        debug_assert_eq!(self.completed(), 0, "abandoning a started request");
        drop(self.completion.lock().take());
        drop(self.guard.lock().take());
    }

    fn fire(&self) {
        let Some(completion) = self.completion.lock().take() else {
            return;
        };

        let outcome = match self.failure.lock().take() {
            Some(err) => IoOutcome::failure(err),
            None => IoOutcome::success(self.total_bytes),
        };
        debug!(
            "Aggregate completion: {} fragments, success={}, {} bytes",
            self.total,
            outcome.is_success(),
            outcome.bytes
        );
        if let Some(stats) = &self.stats {
            stats.record_request_done(outcome.is_success());
        }

        completion.complete(outcome);
        drop(self.guard.lock().take());
    }
}
