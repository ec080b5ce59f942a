//! Filesystem signature detection on a boot sector

use std::fmt;

const BOOT_SIGNATURE_OFFSET: usize = 0x1FE;

/// Filesystems whose bare boot sector triggers the partition overlay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilesystemKind {
    Ntfs,
    Refs,
    Exfat,
    Fat32,
    /// FAT12 or FAT16
    Fat,
}

impl FilesystemKind {
    /// Identify the filesystem starting at `boot_sector`, if any
    #[must_use]
    pub fn detect(boot_sector: &[u8]) -> Option<Self> {
        if boot_sector.len() < 512 {
            return None;
        }
        let at = |offset: usize, pattern: &[u8]| {
            boot_sector[offset..offset + pattern.len()] == *pattern
        };
        let boot_signature = at(BOOT_SIGNATURE_OFFSET, &[0x55, 0xAA]);

        // ReFS does not carry the 0x55AA trailer.
        if at(3, b"ReFS") {
            return Some(Self::Refs);
        }
        if !boot_signature {
            return None;
        }

        if at(3, b"NTFS    ") {
            Some(Self::Ntfs)
        } else if at(3, b"EXFAT   ") {
            Some(Self::Exfat)
        } else if at(0x52, b"FAT32   ") {
            Some(Self::Fat32)
        } else if at(0x36, b"FAT") {
            Some(Self::Fat)
        } else {
            None
        }
    }

    /// Volume serial used to derive stable GUIDs
    ///
    /// NTFS keeps an 8-byte serial at 0x48, ReFS at 0x38. Other
    /// filesystems get random GUIDs.
    #[must_use]
    pub fn volume_serial(self, boot_sector: &[u8]) -> Option<[u8; 8]> {
        let offset = match self {
            Self::Ntfs => 0x48,
            Self::Refs => 0x38,
            Self::Exfat | Self::Fat32 | Self::Fat => return None,
        };
        boot_sector
            .get(offset..offset + 8)
            .and_then(|s| s.try_into().ok())
    }
}

impl fmt::Display for FilesystemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ntfs => "NTFS",
            Self::Refs => "ReFS",
            Self::Exfat => "exFAT",
            Self::Fat32 => "FAT32",
            Self::Fat => "FAT",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn ntfs_boot_sector(serial: [u8; 8]) -> Vec<u8> {
        let mut sector = vec![0u8; 512];
        sector[0..3].copy_from_slice(&[0xEB, 0x52, 0x90]);
        sector[3..11].copy_from_slice(b"NTFS    ");
        sector[0x48..0x50].copy_from_slice(&serial);
        sector[0x1FE] = 0x55;
        sector[0x1FF] = 0xAA;
        sector
    }

    #[test]
    fn test_detect_ntfs_and_serial() {
        let sector = ntfs_boot_sector([1, 2, 3, 4, 5, 6, 7, 8]);
        let kind = FilesystemKind::detect(&sector).unwrap();
        assert_eq!(kind, FilesystemKind::Ntfs);
        assert_eq!(kind.volume_serial(&sector), Some([1, 2, 3, 4, 5, 6, 7, 8]));
    }

    #[test]
    fn test_ntfs_needs_boot_signature() {
        let mut sector = ntfs_boot_sector([0; 8]);
        sector[0x1FF] = 0;
        assert_eq!(FilesystemKind::detect(&sector), None);
    }

    #[test]
    fn test_detect_refs_without_trailer() {
        let mut sector = vec![0u8; 512];
        sector[3..7].copy_from_slice(b"ReFS");
        sector[0x38..0x40].copy_from_slice(&[9; 8]);
        let kind = FilesystemKind::detect(&sector).unwrap();
        assert_eq!(kind, FilesystemKind::Refs);
        assert_eq!(kind.volume_serial(&sector), Some([9; 8]));
    }

    #[test]
    fn test_detect_fat_variants() {
        let mut fat32 = vec![0u8; 512];
        fat32[0x52..0x5A].copy_from_slice(b"FAT32   ");
        fat32[0x1FE] = 0x55;
        fat32[0x1FF] = 0xAA;
        assert_eq!(FilesystemKind::detect(&fat32), Some(FilesystemKind::Fat32));
        assert_eq!(FilesystemKind::Fat32.volume_serial(&fat32), None);

        let mut fat16 = vec![0u8; 512];
        fat16[0x36..0x3E].copy_from_slice(b"FAT16   ");
        fat16[0x1FE] = 0x55;
        fat16[0x1FF] = 0xAA;
        assert_eq!(FilesystemKind::detect(&fat16), Some(FilesystemKind::Fat));

        let mut exfat = vec![0u8; 512];
        exfat[3..11].copy_from_slice(b"EXFAT   ");
        exfat[0x1FE] = 0x55;
        exfat[0x1FF] = 0xAA;
        assert_eq!(FilesystemKind::detect(&exfat), Some(FilesystemKind::Exfat));
    }

    #[test]
    fn test_partition_table_is_not_a_filesystem() {
        let mut mbr = vec![0u8; 512];
        mbr[0x1C2] = 0xEE;
        mbr[0x1FE] = 0x55;
        mbr[0x1FF] = 0xAA;
        assert_eq!(FilesystemKind::detect(&mbr), None);
        assert_eq!(FilesystemKind::detect(&[0u8; 100]), None);
    }
}
