//! Replication authority gate
//!
//! Only the primary may accept writes. On an ordinary device a write
//! while secondary is rejected outright; a boot device instead parks
//! every request until the node becomes primary or the device goes away.

use tokio::sync::watch;
use tracing::info;

use crate::engine::StorageEngine;
use crate::error::{BridgeError, BridgeResult};
use crate::lifecycle::DeviceLifecycle;

/// Role notifications for one device
#[derive(Debug)]
pub struct AuthorityGate {
    boot_device: bool,
    role: watch::Sender<bool>,
}

impl AuthorityGate {
    /// Create a gate; `boot_device` makes requests wait for the primary role
    #[must_use]
    pub fn new(boot_device: bool) -> Self {
        Self {
            boot_device,
            role: watch::Sender::new(false),
        }
    }

    /// Whether requests wait for authority instead of failing
    #[must_use]
    pub fn is_boot_device(&self) -> bool {
        self.boot_device
    }

    /// Publish a role change observed on the engine
    pub fn publish(&self, primary: bool) {
        let was = self.role.send_replace(primary);
        if was != primary {
            info!("Replication role changed: primary={}", primary);
        }
    }

    /// Wait until `engine` is primary
    ///
    /// Returns `Unauthoritative` at once unless this is a boot device.
    /// Interrupted with `DeviceGone` when teardown begins.
    pub async fn wait_for_primary(
        &self,
        engine: &dyn StorageEngine,
        lifecycle: &DeviceLifecycle,
    ) -> BridgeResult<()> {
        if engine.is_primary() {
            return Ok(());
        }
        if !self.boot_device {
            return Err(BridgeError::Unauthoritative);
        }

        info!("Boot device is not primary, waiting for it to become primary");
        let mut role = self.role.subscribe();
        loop {
            if engine.is_primary() {
                info!("Boot device became primary");
                return Ok(());
            }
            lifecycle
                .interruptible(async {
                    // Sender lives in self, so the channel cannot close under us.
                    let _ = role.changed().await;
                })
                .await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemoryEngine;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_non_boot_device_fails_fast() {
        let engine = MemoryEngine::new(4096);
        engine.set_primary(false);
        let lifecycle = DeviceLifecycle::new("dev");
        let gate = AuthorityGate::new(false);

        assert_eq!(
            gate.wait_for_primary(&engine, &lifecycle).await,
            Err(BridgeError::Unauthoritative)
        );
        engine.set_primary(true);
        assert!(gate.wait_for_primary(&engine, &lifecycle).await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_boot_device_waits_for_primary() {
        let engine = Arc::new(MemoryEngine::new(4096));
        engine.set_primary(false);
        let lifecycle = DeviceLifecycle::new("boot");
        let gate = Arc::new(AuthorityGate::new(true));

        let waiter = {
            let engine = engine.clone();
            let lifecycle = lifecycle.clone();
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait_for_primary(engine.as_ref(), &lifecycle).await })
        };
        tokio::task::yield_now().await;

        engine.set_primary(true);
        gate.publish(true);
        assert_eq!(waiter.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn test_boot_device_wait_interrupted() {
        let engine = MemoryEngine::new(4096);
        engine.set_primary(false);
        let lifecycle = DeviceLifecycle::new("boot");
        let gate = AuthorityGate::new(true);

        let wait = gate.wait_for_primary(&engine, &lifecycle);
        lifecycle.close_gate();
        assert_eq!(wait.await, Err(BridgeError::DeviceGone));
    }
}
