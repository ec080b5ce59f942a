//! GPT synthesis for the partition overlay
//!
//! The prolog holds a protective MBR, the primary GPT header and the
//! partition entry array, followed by zeros up to `data_shift` sectors.
//! The epilog holds a copy of the entry array in its first 32 sectors and
//! the backup header in its last sector.
//!
//! ```text
//! LBA 0              protective MBR (one 0xEE entry)
//! LBA 1              primary header
//! LBA 2..34          entry array (128 x 128 bytes, entry 0 used)
//! LBA data_shift..   data region (the replicated volume)
//! LBA D+shift..      entry array copy
//! LBA total-1        backup header
//! ```
//!
//! All integers are little endian.

use blockbridge_common::crc32;
use uuid::Uuid;

use crate::error::{BridgeError, BridgeResult};

/// Sector size the overlay is laid out in
pub const SECTOR_SIZE: usize = 512;

/// Number of partition entries in the array
pub const GPT_ENTRY_COUNT: u32 = 128;

/// Size of one partition entry
pub const GPT_ENTRY_SIZE: u32 = 128;

/// Bytes in the partition entry array (32 sectors)
pub const ENTRY_ARRAY_BYTES: usize = (GPT_ENTRY_COUNT * GPT_ENTRY_SIZE) as usize;

/// First LBA usable by partitions behind the primary structures
pub const FIRST_USABLE_LBA: u64 = 34;

/// Microsoft basic data partition
pub const BASIC_DATA_PARTITION: Uuid = Uuid::from_u128(0xEBD0_A0A2_B9E5_4433_87C0_68B6_B726_99C7);

const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";
const GPT_REVISION: u32 = 0x0001_0000;
const GPT_HEADER_SIZE: u32 = 0x5C;

const MBR_ENTRY: usize = 0x1BE;
const HEADER: usize = 0x200;
const ENTRIES: usize = 0x400;

// Header fields, relative to the header
const HDR_CRC: usize = 0x10;
const HDR_CURRENT_LBA: usize = 0x18;
const HDR_BACKUP_LBA: usize = 0x20;
const HDR_FIRST_USABLE: usize = 0x28;
const HDR_LAST_USABLE: usize = 0x30;
const HDR_DISK_GUID: usize = 0x38;
const HDR_ENTRIES_LBA: usize = 0x48;
const HDR_ENTRY_COUNT: usize = 0x50;
const HDR_ENTRY_SIZE: usize = 0x54;
const HDR_ENTRIES_CRC: usize = 0x58;

// Entry fields, relative to the entry
const ENT_UNIQUE_GUID: usize = 0x10;
const ENT_FIRST_LBA: usize = 0x20;
const ENT_LAST_LBA: usize = 0x28;
const ENT_NAME: usize = 0x38;

/// Tail bytes of the disk GUID for serial-derived GUIDs
const DISK_GUID_TAIL: [u8; 8] = [0xac, 0x5c, 0x0f, 0xb5, 0x55, 0x05, 0x7c, 0xe6];

/// Tail bytes of the partition GUID for serial-derived GUIDs
const PARTITION_GUID_TAIL: [u8; 8] = [0x38, 0x0d, 0x87, 0xfe, 0x28, 0x09, 0x7b, 0xa7];

/// Disk and partition GUIDs as stored on disk (mixed endian)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GptGuids {
    pub disk: [u8; 16],
    pub partition: [u8; 16],
}

impl GptGuids {
    /// Stable GUIDs whose first 8 bytes are the volume serial
    #[must_use]
    pub fn from_serial(serial: [u8; 8]) -> Self {
        let mut disk = [0u8; 16];
        let mut partition = [0u8; 16];
        disk[..8].copy_from_slice(&serial);
        disk[8..].copy_from_slice(&DISK_GUID_TAIL);
        partition[..8].copy_from_slice(&serial);
        partition[8..].copy_from_slice(&PARTITION_GUID_TAIL);
        Self { disk, partition }
    }

    /// Fresh random GUIDs
    #[must_use]
    pub fn random() -> Self {
        Self {
            disk: Uuid::new_v4().to_bytes_le(),
            partition: Uuid::new_v4().to_bytes_le(),
        }
    }

    /// Disk GUID in its textual form
    #[must_use]
    pub fn disk_uuid(&self) -> Uuid {
        Uuid::from_bytes_le(self.disk)
    }

    /// Partition GUID in its textual form
    #[must_use]
    pub fn partition_uuid(&self) -> Uuid {
        Uuid::from_bytes_le(self.partition)
    }
}

/// Sizes the synthetic table is built for, in sectors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GptGeometry {
    /// Sectors of replicated data
    pub data_sectors: u64,
    /// Prolog sectors in front of the data
    pub data_shift: u64,
    /// Epilog sectors behind the data
    pub appended_sectors: u64,
}

impl GptGeometry {
    /// Sectors presented to the host
    #[must_use]
    pub fn total_sectors(&self) -> u64 {
        self.data_sectors + self.data_shift + self.appended_sectors
    }

    /// Last LBA of the data region
    #[must_use]
    pub fn last_data_lba(&self) -> u64 {
        self.data_sectors + self.data_shift - 1
    }

    /// First LBA of the epilog
    #[must_use]
    pub fn epilog_lba(&self) -> u64 {
        self.data_sectors + self.data_shift
    }
}

pub(crate) fn get_u32(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

pub(crate) fn get_u64(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

fn seal_header(header: &mut [u8]) {
    put_u32(header, HDR_CRC, 0);
    let crc = crc32(&header[..GPT_HEADER_SIZE as usize]);
    put_u32(header, HDR_CRC, crc);
}

/// Partition length recorded in an existing prolog (last LBA of entry 0)
#[must_use]
pub fn partition_last_lba(prolog: &[u8]) -> u64 {
    get_u64(prolog, ENTRIES + ENT_LAST_LBA)
}

/// Build the prolog
///
/// `frozen_last_lba` is the partition's last LBA from a previous prolog;
/// once a partition length has been published it is never changed.
/// Fails if `data_shift` is smaller than [`FIRST_USABLE_LBA`].
pub fn build_prolog(
    geometry: &GptGeometry,
    guids: &GptGuids,
    frozen_last_lba: Option<u64>,
) -> BridgeResult<Vec<u8>> {
    if geometry.data_shift < FIRST_USABLE_LBA {
        return Err(BridgeError::invalid_argument(format!(
            "prolog of {} sectors cannot hold a GPT ({FIRST_USABLE_LBA} needed)",
            geometry.data_shift
        )));
    }
    let mut prolog = vec![0u8; geometry.data_shift as usize * SECTOR_SIZE];
    let total = geometry.total_sectors();

    // Protective MBR
    let mbr = &mut prolog[MBR_ENTRY..MBR_ENTRY + 16];
    mbr[1..4].copy_from_slice(&[0x00, 0x02, 0x00]);
    mbr[4] = 0xEE;
    mbr[5..8].copy_from_slice(&[0xFF, 0xFF, 0xFF]);
    put_u32(mbr, 8, 1);
    put_u32(mbr, 12, u32::try_from(total - 1).unwrap_or(u32::MAX));
    prolog[0x1FE] = 0x55;
    prolog[0x1FF] = 0xAA;

    // Partition entry 0
    {
        let entry = &mut prolog[ENTRIES..ENTRIES + GPT_ENTRY_SIZE as usize];
        entry[..16].copy_from_slice(&BASIC_DATA_PARTITION.to_bytes_le());
        entry[ENT_UNIQUE_GUID..ENT_UNIQUE_GUID + 16].copy_from_slice(&guids.partition);
        put_u64(entry, ENT_FIRST_LBA, geometry.data_shift);
        put_u64(
            entry,
            ENT_LAST_LBA,
            frozen_last_lba.unwrap_or_else(|| geometry.last_data_lba()),
        );
        for (i, unit) in "Basic data partition".encode_utf16().enumerate() {
            entry[ENT_NAME + i * 2..ENT_NAME + i * 2 + 2].copy_from_slice(&unit.to_le_bytes());
        }
    }
    let entries_crc = crc32(&prolog[ENTRIES..ENTRIES + ENTRY_ARRAY_BYTES]);

    // Primary header
    let header = &mut prolog[HEADER..HEADER + SECTOR_SIZE];
    header[..8].copy_from_slice(GPT_SIGNATURE);
    put_u32(header, 0x08, GPT_REVISION);
    put_u32(header, 0x0C, GPT_HEADER_SIZE);
    put_u64(header, HDR_CURRENT_LBA, 1);
    put_u64(header, HDR_BACKUP_LBA, total - 1);
    put_u64(header, HDR_FIRST_USABLE, FIRST_USABLE_LBA);
    put_u64(header, HDR_LAST_USABLE, geometry.last_data_lba());
    header[HDR_DISK_GUID..HDR_DISK_GUID + 16].copy_from_slice(&guids.disk);
    put_u64(header, HDR_ENTRIES_LBA, 2);
    put_u32(header, HDR_ENTRY_COUNT, GPT_ENTRY_COUNT);
    put_u32(header, HDR_ENTRY_SIZE, GPT_ENTRY_SIZE);
    put_u32(header, HDR_ENTRIES_CRC, entries_crc);
    seal_header(header);

    Ok(prolog)
}

/// Build the epilog from a finished prolog
///
/// Fails if `appended_sectors` cannot hold the entry array and the
/// backup header.
pub fn build_epilog(prolog: &[u8], geometry: &GptGeometry) -> BridgeResult<Vec<u8>> {
    let sectors = geometry.appended_sectors as usize;
    if sectors * SECTOR_SIZE <= ENTRY_ARRAY_BYTES || prolog.len() < ENTRIES + ENTRY_ARRAY_BYTES {
        return Err(BridgeError::invalid_argument(format!(
            "epilog of {sectors} sectors cannot hold a backup GPT"
        )));
    }
    let mut epilog = vec![0u8; sectors * SECTOR_SIZE];

    epilog[..ENTRY_ARRAY_BYTES].copy_from_slice(&prolog[ENTRIES..ENTRIES + ENTRY_ARRAY_BYTES]);

    let backup = &mut epilog[(sectors - 1) * SECTOR_SIZE..];
    backup.copy_from_slice(&prolog[HEADER..HEADER + SECTOR_SIZE]);
    let current = get_u64(backup, HDR_CURRENT_LBA);
    let other = get_u64(backup, HDR_BACKUP_LBA);
    put_u64(backup, HDR_CURRENT_LBA, other);
    put_u64(backup, HDR_BACKUP_LBA, current);
    put_u64(backup, HDR_ENTRIES_LBA, geometry.epilog_lba());
    seal_header(backup);

    Ok(epilog)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry() -> GptGeometry {
        GptGeometry {
            data_sectors: 2048,
            data_shift: 128,
            appended_sectors: 128,
        }
    }

    fn header_crc_ok(header: &[u8]) -> bool {
        let mut copy = header[..GPT_HEADER_SIZE as usize].to_vec();
        let stored = get_u32(&copy, HDR_CRC);
        put_u32(&mut copy, HDR_CRC, 0);
        crc32(&copy) == stored
    }

    #[test]
    fn test_prolog_fields() {
        let g = geometry();
        let guids = GptGuids::from_serial([1, 2, 3, 4, 5, 6, 7, 8]);
        let prolog = build_prolog(&g, &guids, None).unwrap();

        assert_eq!(prolog.len(), 128 * 512);
        assert_eq!(prolog[0x1C2], 0xEE);
        assert_eq!(get_u32(&prolog, 0x1C6), 1);
        assert_eq!(get_u32(&prolog, 0x1CA), 2048 + 256 - 1);
        assert_eq!(&prolog[0x1FE..0x200], &[0x55, 0xAA]);

        assert_eq!(&prolog[0x200..0x208], b"EFI PART");
        assert_eq!(get_u32(&prolog, 0x208), 0x0001_0000);
        assert_eq!(get_u32(&prolog, 0x20C), 0x5C);
        assert_eq!(get_u64(&prolog, 0x218), 1);
        assert_eq!(get_u64(&prolog, 0x220), 2048 + 256 - 1);
        assert_eq!(get_u64(&prolog, 0x228), 34);
        assert_eq!(get_u64(&prolog, 0x230), 2048 + 128 - 1);
        assert_eq!(&prolog[0x238..0x248], &guids.disk);
        assert_eq!(get_u64(&prolog, 0x248), 2);
        assert_eq!(get_u32(&prolog, 0x250), 128);
        assert_eq!(get_u32(&prolog, 0x254), 128);

        assert_eq!(&prolog[0x410..0x420], &guids.partition);
        assert_eq!(get_u64(&prolog, 0x420), 128);
        assert_eq!(get_u64(&prolog, 0x428), 2048 + 128 - 1);
        assert_eq!(partition_last_lba(&prolog), 2175);
    }

    #[test]
    fn test_prolog_checksums() {
        let prolog = build_prolog(&geometry(), &GptGuids::random(), None).unwrap();
        assert!(header_crc_ok(&prolog[0x200..]));
        assert_eq!(
            get_u32(&prolog, 0x258),
            crc32(&prolog[0x400..0x400 + ENTRY_ARRAY_BYTES])
        );
    }

    #[test]
    fn test_partition_type_is_basic_data() {
        let prolog = build_prolog(&geometry(), &GptGuids::random(), None).unwrap();
        assert_eq!(
            &prolog[0x400..0x410],
            &[
                0xA2, 0xA0, 0xD0, 0xEB, 0xE5, 0xB9, 0x33, 0x44, 0x87, 0xC0, 0x68, 0xB6, 0xB7, 0x26,
                0x99, 0xC7
            ]
        );
    }

    #[test]
    fn test_frozen_partition_length() {
        let mut g = geometry();
        let guids = GptGuids::random();
        let first = build_prolog(&g, &guids, None).unwrap();

        g.data_sectors = 4096;
        let second = build_prolog(&g, &guids, Some(partition_last_lba(&first))).unwrap();
        assert_eq!(partition_last_lba(&second), 2175);
        // The header still describes the grown device.
        assert_eq!(get_u64(&second, 0x230), 4096 + 128 - 1);
        assert!(header_crc_ok(&second[0x200..]));
    }

    #[test]
    fn test_epilog_backup_header() {
        let g = geometry();
        let prolog = build_prolog(&g, &GptGuids::random(), None).unwrap();
        let epilog = build_epilog(&prolog, &g).unwrap();

        assert_eq!(epilog.len(), 128 * 512);
        assert_eq!(&epilog[..ENTRY_ARRAY_BYTES], &prolog[0x400..0x400 + ENTRY_ARRAY_BYTES]);

        let backup = &epilog[127 * 512..];
        assert_eq!(&backup[..8], b"EFI PART");
        assert_eq!(get_u64(backup, 0x18), g.total_sectors() - 1);
        assert_eq!(get_u64(backup, 0x20), 1);
        assert_eq!(get_u64(backup, 0x48), 2048 + 128);
        assert_eq!(get_u32(backup, 0x58), get_u32(&prolog, 0x258));
        assert!(header_crc_ok(backup));
    }

    #[test]
    fn test_serial_guids() {
        let guids = GptGuids::from_serial([0x11; 8]);
        assert_eq!(&guids.disk[..8], &[0x11; 8]);
        assert_eq!(&guids.disk[8..], &DISK_GUID_TAIL);
        assert_eq!(&guids.partition[8..], &PARTITION_GUID_TAIL);
        assert_ne!(guids.disk_uuid(), guids.partition_uuid());
    }

    #[test]
    fn test_undersized_regions_rejected() {
        let mut g = geometry();
        g.data_shift = 16;
        let err = build_prolog(&g, &GptGuids::random(), None).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidArgument(_)));

        let g = GptGeometry {
            appended_sectors: 32,
            ..geometry()
        };
        let prolog = build_prolog(&g, &GptGuids::random(), None).unwrap();
        assert!(matches!(
            build_epilog(&prolog, &g),
            Err(BridgeError::InvalidArgument(_))
        ));
    }
}
