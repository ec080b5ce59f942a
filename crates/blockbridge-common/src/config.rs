//! Configuration types for blockbridge
//!
//! This module defines the per-device settings shared by the bridge core
//! and its host adapters. Every section is `serde(default)` so a partial
//! TOML file only overrides what it names.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Sector size every block device speaks
pub const DEFAULT_BLOCK_SIZE: u32 = 512;

/// Largest request the replication protocol carries in one message
pub const DEFAULT_MAX_TRANSFER_BYTES: u64 = 1024 * 1024;

/// Sectors reserved in front of and behind the data for the synthetic GPT
pub const DEFAULT_RESERVED_SECTORS: u64 = 128;

/// A GPT needs the protective MBR, the header and 32 sectors of entries
pub const MIN_RESERVED_SECTORS: u64 = 34;

/// Root configuration for one bridged device
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Device and request-splitting configuration
    pub device: DeviceConfig,
    /// Virtual partition overlay configuration
    pub overlay: OverlayConfig,
}

impl BridgeConfig {
    /// Parse a configuration from TOML text
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| Error::deserialization(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the invariants the I/O path relies on
    pub fn validate(&self) -> Result<()> {
        let block_size = u64::from(self.device.block_size);
        if block_size < u64::from(DEFAULT_BLOCK_SIZE) || !block_size.is_power_of_two() {
            return Err(Error::configuration(format!(
                "block_size must be a power of two >= 512, got {block_size}"
            )));
        }
        if self.device.max_transfer_bytes == 0
            || self.device.max_transfer_bytes % block_size != 0
        {
            return Err(Error::configuration(format!(
                "max_transfer_bytes ({}) must be a positive multiple of block_size ({block_size})",
                self.device.max_transfer_bytes
            )));
        }
        if self.device.work_queue_depth == 0 {
            return Err(Error::configuration("work_queue_depth must be positive"));
        }
        if self.overlay.enabled && self.overlay.reserved_sectors < MIN_RESERVED_SECTORS {
            return Err(Error::configuration(format!(
                "overlay.reserved_sectors must be at least {MIN_RESERVED_SECTORS}, got {}",
                self.overlay.reserved_sectors
            )));
        }
        Ok(())
    }
}

/// Device and request-splitting configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Logical block size in bytes
    pub block_size: u32,
    /// Maximum bytes per fragment submitted to the storage engine
    pub max_transfer_bytes: u64,
    /// Capacity of the per-device work queue
    pub work_queue_depth: usize,
    /// Boot device: I/O and open wait for the primary role, capacity
    /// queries wait for a known size
    pub boot_device: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            max_transfer_bytes: DEFAULT_MAX_TRANSFER_BYTES,
            work_queue_depth: 256,
            boot_device: false,
        }
    }
}

/// Virtual partition overlay configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    /// Synthesize a partition table around a bare filesystem
    pub enabled: bool,
    /// Sectors in each of the prolog and epilog regions
    pub reserved_sectors: u64,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            reserved_sectors: DEFAULT_RESERVED_SECTORS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert_eq!(config.device.block_size, 512);
        assert_eq!(config.device.max_transfer_bytes, 1024 * 1024);
        assert!(config.overlay.enabled);
        assert_eq!(config.overlay.reserved_sectors, 128);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = BridgeConfig::from_toml(
            r#"
            [device]
            boot_device = true
            "#,
        )
        .unwrap();
        assert!(config.device.boot_device);
        assert_eq!(config.device.block_size, 512);
        assert_eq!(config.overlay.reserved_sectors, 128);
    }

    #[test]
    fn test_rejects_unaligned_transfer_size() {
        let mut config = BridgeConfig::default();
        config.device.max_transfer_bytes = 1000;
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_rejects_tiny_overlay() {
        let mut config = BridgeConfig::default();
        config.overlay.reserved_sectors = 8;
        assert!(config.validate().is_err());

        config.overlay.enabled = false;
        assert!(config.validate().is_ok());
    }
}
