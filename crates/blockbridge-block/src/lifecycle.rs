//! Device lifecycle and admission gate
//!
//! Every I/O holds an [`AdmissionGuard`] from admission until its aggregate
//! completion has been signalled. Removal closes the gate, lets in-flight
//! I/O drain and only then declares the device removed.
//!
//! ```text
//! Created ──activate──▶ Active ──begin_removal──▶ RemovalRequested
//!    │                    │                             │
//!    └──────close_gate / surprise_removal───────────────┘
//!                         ▼
//!                     Quiescing ──in_flight == 0──▶ Removed
//! ```
//!
//! A teardown signal (a `watch` channel) interrupts every blocking wait
//! once the gate closes or the process shuts down.

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Notify, watch};
use tracing::{debug, info, warn};

use crate::error::{BridgeError, BridgeResult};

/// Lifecycle state of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// Exists but is not wired to a storage engine yet
    Created,
    /// Accepting I/O
    Active,
    /// Removal announced; I/O is still admitted
    RemovalRequested,
    /// No new I/O; waiting for in-flight I/O to finish
    Quiescing,
    /// Drained; resources may be released
    Removed,
}

/// Teardown signal observed by blocking waits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    Running,
    /// The admission gate closed
    Removing,
    /// The whole process is going away
    Shutdown,
}

#[derive(Debug)]
struct Inner {
    state: DeviceState,
    in_flight: usize,
}

/// State machine plus reference-counted admission gate
#[derive(Debug)]
pub struct DeviceLifecycle {
    name: String,
    inner: Mutex<Inner>,
    drained: Notify,
    teardown: watch::Sender<Teardown>,
}

impl DeviceLifecycle {
    /// Create a device in `Created`
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            inner: Mutex::new(Inner {
                state: DeviceState::Created,
                in_flight: 0,
            }),
            drained: Notify::new(),
            teardown: watch::Sender::new(Teardown::Running),
        })
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> DeviceState {
        self.inner.lock().state
    }

    /// Number of admitted, not yet completed requests
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.lock().in_flight
    }

    /// Created → Active
    pub fn activate(&self) {
        let mut inner = self.inner.lock();
        if inner.state == DeviceState::Created {
            inner.state = DeviceState::Active;
            info!("Device {} active", self.name);
        }
    }

    /// Admit one request
    pub fn admit(self: &Arc<Self>) -> BridgeResult<AdmissionGuard> {
        let mut inner = self.inner.lock();
        match inner.state {
            DeviceState::Active | DeviceState::RemovalRequested => {
                inner.in_flight += 1;
                Ok(AdmissionGuard {
                    lifecycle: Arc::clone(self),
                })
            }
            DeviceState::Created => Err(BridgeError::NotReady),
            DeviceState::Quiescing | DeviceState::Removed => {
                debug!("Device {} refused admission in {:?}", self.name, inner.state);
                Err(BridgeError::DeviceGone)
            }
        }
    }

    fn release(&self) {
        let mut inner = self.inner.lock();
        inner.in_flight -= 1;
        if inner.in_flight == 0 && inner.state == DeviceState::Quiescing {
            inner.state = DeviceState::Removed;
            drop(inner);
            info!("Device {} drained and removed", self.name);
            self.drained.notify_waiters();
        }
    }

    /// Active → RemovalRequested
    pub fn begin_removal(&self) {
        let mut inner = self.inner.lock();
        if inner.state == DeviceState::Active {
            inner.state = DeviceState::RemovalRequested;
            info!("Device {} removal requested", self.name);
        }
    }

    /// Forbid new admissions; Removed at once if nothing is in flight
    pub fn close_gate(&self) {
        self.quiesce("closing admission gate");
    }

    /// Device vanished underneath us; in-flight I/O still completes
    pub fn surprise_removal(&self) {
        warn!("Device {} surprise removal", self.name);
        self.quiesce("surprise removal");
    }

    fn quiesce(&self, why: &str) {
        let mut inner = self.inner.lock();
        match inner.state {
            DeviceState::Quiescing | DeviceState::Removed => return,
            _ if inner.in_flight == 0 => inner.state = DeviceState::Removed,
            _ => inner.state = DeviceState::Quiescing,
        }
        let state = inner.state;
        let in_flight = inner.in_flight;
        drop(inner);

        info!(
            "Device {} {}: {:?}, {} in flight",
            self.name, why, state, in_flight
        );
        self.teardown.send_if_modified(|t| {
            if *t == Teardown::Running {
                *t = Teardown::Removing;
                true
            } else {
                false
            }
        });
        if state == DeviceState::Removed {
            self.drained.notify_waiters();
        }
    }

    /// Wait until the device is `Removed`
    ///
    /// Interrupted only by process shutdown.
    pub async fn wait_removed(&self) -> BridgeResult<()> {
        let mut teardown = self.teardown.subscribe();
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.state() == DeviceState::Removed {
                return Ok(());
            }
            if *teardown.borrow_and_update() == Teardown::Shutdown {
                return Err(BridgeError::DeviceGone);
            }

            tokio::select! {
                () = &mut notified => {}
                _ = teardown.changed() => {}
            }
        }
    }

    /// Interrupt every blocking wait, including drain waits
    pub fn shutdown(&self) {
        self.teardown.send_replace(Teardown::Shutdown);
    }

    /// Current teardown signal
    #[must_use]
    pub fn teardown(&self) -> Teardown {
        *self.teardown.borrow()
    }

    /// Run `fut` unless teardown begins first
    pub async fn interruptible<F: Future>(&self, fut: F) -> BridgeResult<F::Output> {
        let mut teardown = self.teardown.subscribe();
        tokio::select! {
            biased;
            _ = teardown.wait_for(|t| *t != Teardown::Running) => Err(BridgeError::DeviceGone),
            out = fut => Ok(out),
        }
    }
}

/// RAII admission; releasing it may complete a pending removal
#[derive(Debug)]
#[must_use]
pub struct AdmissionGuard {
    lifecycle: Arc<DeviceLifecycle>,
}

impl Drop for AdmissionGuard {
    fn drop(&mut self) {
        self.lifecycle.release();
    }
}

/// Front-door pause for application I/O, independent of removal state
#[derive(Debug)]
pub struct SuspendGate {
    suspended: watch::Sender<bool>,
}

impl Default for SuspendGate {
    fn default() -> Self {
        Self::new()
    }
}

impl SuspendGate {
    /// Create an open gate
    #[must_use]
    pub fn new() -> Self {
        Self {
            suspended: watch::Sender::new(false),
        }
    }

    /// Make new requests wait
    pub fn suspend(&self) {
        if !self.suspended.send_replace(true) {
            info!("Application I/O suspended");
        }
    }

    /// Let waiting requests through
    pub fn resume(&self) {
        if self.suspended.send_replace(false) {
            info!("Application I/O resumed");
        }
    }

    /// Whether the gate is closed
    #[must_use]
    pub fn is_suspended(&self) -> bool {
        *self.suspended.borrow()
    }

    /// Wait until I/O is not suspended, or teardown begins
    pub async fn wait_resumed(&self, lifecycle: &DeviceLifecycle) -> BridgeResult<()> {
        let mut rx = self.suspended.subscribe();
        lifecycle
            .interruptible(async move {
                // Sender lives in self, so the channel cannot close under us.
                let _ = rx.wait_for(|s| !*s).await;
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_admission_by_state() {
        let device = DeviceLifecycle::new("test");
        assert_eq!(device.admit().unwrap_err(), BridgeError::NotReady);

        device.activate();
        let guard = device.admit().unwrap();
        assert_eq!(device.in_flight(), 1);

        device.begin_removal();
        assert_eq!(device.state(), DeviceState::RemovalRequested);
        let second = device.admit().unwrap();
        assert_eq!(device.in_flight(), 2);

        device.close_gate();
        assert_eq!(device.state(), DeviceState::Quiescing);
        assert_eq!(device.admit().unwrap_err(), BridgeError::DeviceGone);

        drop(guard);
        assert_eq!(device.state(), DeviceState::Quiescing);
        drop(second);
        assert_eq!(device.state(), DeviceState::Removed);
        assert_eq!(device.admit().unwrap_err(), BridgeError::DeviceGone);
    }

    #[test]
    fn test_idle_close_removes_immediately() {
        let device = DeviceLifecycle::new("idle");
        device.activate();
        device.close_gate();
        assert_eq!(device.state(), DeviceState::Removed);
        assert_eq!(device.teardown(), Teardown::Removing);
    }

    #[test]
    fn test_begin_removal_is_idempotent() {
        let device = DeviceLifecycle::new("twice");
        device.activate();
        device.begin_removal();
        device.begin_removal();
        assert_eq!(device.state(), DeviceState::RemovalRequested);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_wait_removed_after_drain() {
        let device = DeviceLifecycle::new("drain");
        device.activate();
        let guard = device.admit().unwrap();
        device.surprise_removal();

        let waiter = {
            let device = device.clone();
            tokio::spawn(async move { device.wait_removed().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap().unwrap();
        assert_eq!(device.state(), DeviceState::Removed);
    }

    #[tokio::test]
    async fn test_wait_removed_interrupted_by_shutdown() {
        let device = DeviceLifecycle::new("stuck");
        device.activate();
        let _guard = device.admit().unwrap();
        device.close_gate();

        let waiter = {
            let device = device.clone();
            tokio::spawn(async move { device.wait_removed().await })
        };
        device.shutdown();
        assert_eq!(waiter.await.unwrap(), Err(BridgeError::DeviceGone));
    }

    #[tokio::test]
    async fn test_interruptible() {
        let device = DeviceLifecycle::new("wait");
        assert_eq!(device.interruptible(async { 7 }).await, Ok(7));

        let pending = device.interruptible(std::future::pending::<()>());
        device.close_gate();
        assert_eq!(pending.await, Err(BridgeError::DeviceGone));
    }

    #[tokio::test]
    async fn test_suspend_gate() {
        let device = DeviceLifecycle::new("suspend");
        let gate = Arc::new(SuspendGate::new());
        gate.wait_resumed(&device).await.unwrap();

        gate.suspend();
        assert!(gate.is_suspended());
        let waiter = {
            let gate = gate.clone();
            let device = device.clone();
            tokio::spawn(async move { gate.wait_resumed(&device).await })
        };
        tokio::task::yield_now().await;
        gate.resume();
        waiter.await.unwrap().unwrap();

        gate.suspend();
        device.close_gate();
        assert_eq!(
            gate.wait_resumed(&device).await,
            Err(BridgeError::DeviceGone)
        );
    }
}
