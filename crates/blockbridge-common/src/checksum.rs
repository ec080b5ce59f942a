//! Checksum utilities for blockbridge
//!
//! GPT headers and partition entry arrays are protected by the IEEE 802.3
//! CRC-32 (reflected polynomial `0xEDB88320`), not CRC-32C.

/// Compute the IEEE CRC-32 of `data`
#[must_use]
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}
