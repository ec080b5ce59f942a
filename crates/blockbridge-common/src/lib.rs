//! blockbridge Common - Shared configuration and utilities
//!
//! This crate provides the configuration model, error definitions and
//! checksum helpers used by the block bridge and its host adapters.

pub mod checksum;
pub mod config;
pub mod error;

pub use checksum::crc32;
pub use config::{BridgeConfig, DeviceConfig, OverlayConfig};
pub use error::{Error, Result};
