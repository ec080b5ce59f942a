//! Virtual partition overlay
//!
//! A replicated volume often holds a bare filesystem with no partition
//! table. When the boot sector carries a known filesystem signature the
//! device is presented with a synthetic GPT around it:
//!
//! ```text
//! ┌──────────────┬──────────────────────────────┬──────────────┐
//! │ prolog       │ data (engine sectors 0..D)   │ epilog       │
//! │ data_shift   │ rebased by -data_shift       │ appended     │
//! └──────────────┴──────────────────────────────┴──────────────┘
//! ```
//!
//! Prolog and epilog sectors are served from memory under the layout lock;
//! the data part is handed back to the caller to forward after the lock is
//! released.

pub mod detect;
pub mod gpt;

use bytes::Bytes;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use blockbridge_common::OverlayConfig;

use crate::error::{BridgeError, BridgeResult};
use crate::request::IoBuffer;

pub use detect::FilesystemKind;
pub use gpt::{GptGeometry, GptGuids, SECTOR_SIZE};

/// Current overlay layout
#[derive(Debug, Clone, Default)]
pub struct PartitionLayout {
    /// Prolog sectors in front of the data
    pub data_shift: u64,
    /// Epilog sectors behind the data
    pub appended_sectors: u64,
    /// Filesystem that triggered the overlay
    pub filesystem: Option<FilesystemKind>,
    /// GUIDs written into the prolog
    pub guids: Option<GptGuids>,
    pub(crate) prolog: Option<Vec<u8>>,
    pub(crate) epilog: Option<Vec<u8>>,
}

impl PartitionLayout {
    /// Whether the device is presented with a synthetic table
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.data_shift > 0
    }

    /// Partition length published in the prolog, in sectors
    #[must_use]
    pub fn published_partition_sectors(&self) -> Option<u64> {
        if !self.is_active() {
            return None;
        }
        self.prolog
            .as_deref()
            .map(|p| gpt::partition_last_lba(p) + 1 - self.data_shift)
    }

    /// Raw prolog bytes
    #[must_use]
    pub fn prolog(&self) -> Option<&[u8]> {
        self.prolog.as_deref()
    }

    /// Raw epilog bytes
    #[must_use]
    pub fn epilog(&self) -> Option<&[u8]> {
        self.epilog.as_deref()
    }
}

/// Data-region part of a request, left for the splitter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataPart {
    /// Engine sector (already rebased)
    pub sector: u64,
    /// Offset of this part in the caller's buffer
    pub buffer_offset: usize,
    /// Bytes in this part
    pub length: usize,
}

/// How one request divides across the three regions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionSplit {
    /// Bytes served from the prolog and epilog
    pub overlay_bytes: u64,
    /// Part to forward to the engine, if any
    pub data: Option<DataPart>,
}

#[derive(Debug, Clone, Copy)]
struct Span {
    start: u64,
    end: u64,
}

impl Span {
    fn sectors(self) -> u64 {
        self.end - self.start
    }
}

#[derive(Debug)]
struct Regions {
    prolog: Option<Span>,
    data: Option<Span>,
    epilog: Option<Span>,
}

/// Partition overlay for one device
#[derive(Debug)]
pub struct PartitionOverlay {
    config: OverlayConfig,
    layout: RwLock<PartitionLayout>,
}

impl PartitionOverlay {
    /// Create an overlay presenting the device raw until a scan says otherwise
    #[must_use]
    pub fn new(config: OverlayConfig) -> Self {
        Self {
            config,
            layout: RwLock::new(PartitionLayout::default()),
        }
    }

    /// Whether synthesis is enabled at all
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Snapshot of the current layout
    #[must_use]
    pub fn layout(&self) -> PartitionLayout {
        self.layout.read().clone()
    }

    /// Prolog and epilog sector counts
    #[must_use]
    pub fn shifts(&self) -> (u64, u64) {
        let layout = self.layout.read();
        (layout.data_shift, layout.appended_sectors)
    }

    /// Rebuild the layout from a freshly read boot sector
    ///
    /// A partition length that was already published is carried over.
    pub fn apply_boot_sector(&self, boot_sector: &[u8], data_bytes: u64) -> Option<FilesystemKind> {
        let filesystem = if self.config.enabled {
            FilesystemKind::detect(boot_sector)
        } else {
            None
        };

        let mut layout = self.layout.write();
        let Some(filesystem) = filesystem else {
            if layout.is_active() || layout.prolog.is_some() {
                info!("No filesystem on device any more, presenting it raw");
            } else {
                debug!("No filesystem found, device should contain a partition table already");
            }
            layout.data_shift = 0;
            layout.appended_sectors = 0;
            layout.filesystem = None;
            return None;
        };

        let guids = filesystem
            .volume_serial(boot_sector)
            .map_or_else(GptGuids::random, GptGuids::from_serial);
        let geometry = GptGeometry {
            data_sectors: data_bytes / SECTOR_SIZE as u64,
            data_shift: self.config.reserved_sectors,
            appended_sectors: self.config.reserved_sectors,
        };
        let frozen = layout.prolog.as_deref().map(gpt::partition_last_lba);
        let tables = gpt::build_prolog(&geometry, &guids, frozen).and_then(|prolog| {
            let epilog = gpt::build_epilog(&prolog, &geometry)?;
            Ok((prolog, epilog))
        });
        let (prolog, epilog) = match tables {
            Ok((prolog, epilog)) => {
                info!(
                    "Found {} on device, faking partition table around it (disk GUID {})",
                    filesystem,
                    guids.disk_uuid()
                );
                (Some(prolog), Some(epilog))
            }
            Err(e) => {
                // Keep the shifts so the filesystem stays where the host
                // expects it; the table regions read as zeros.
                warn!("Found {} on device but cannot build its partition table: {}", filesystem, e);
                (None, None)
            }
        };

        *layout = PartitionLayout {
            data_shift: geometry.data_shift,
            appended_sectors: geometry.appended_sectors,
            filesystem: Some(filesystem),
            guids: Some(guids),
            prolog,
            epilog,
        };
        Some(filesystem)
    }

    fn regions(
        layout: &PartitionLayout,
        sector: u64,
        sectors: u64,
        data_sectors: u64,
    ) -> BridgeResult<Regions> {
        let shift = layout.data_shift;
        let data_end = shift + data_sectors;
        let total = data_end + layout.appended_sectors;
        if sector >= total {
            return Err(BridgeError::invalid_argument(format!(
                "sector {sector} is beyond the end of the device ({total} sectors)"
            )));
        }
        let end = sector.saturating_add(sectors).min(total);

        let span = |from: u64, to: u64| {
            let start = sector.max(from);
            let stop = end.min(to);
            (start < stop).then_some(Span { start, end: stop })
        };
        Ok(Regions {
            prolog: span(0, shift),
            data: span(shift, data_end),
            epilog: span(data_end, total),
        })
    }

    fn data_part(regions: &Regions, sector: u64, shift: u64) -> Option<DataPart> {
        regions.data.map(|span| DataPart {
            sector: span.start - shift,
            buffer_offset: ((span.start - sector) as usize) * SECTOR_SIZE,
            length: span.sectors() as usize * SECTOR_SIZE,
        })
    }

    /// Serve the overlay parts of a read into `buf`
    ///
    /// Regions without a cached table read as zeros.
    pub fn serve_read(
        &self,
        sector: u64,
        buf: &IoBuffer,
        data_sectors: u64,
    ) -> BridgeResult<RegionSplit> {
        let layout = self.layout.read();
        let sectors = (buf.len() / SECTOR_SIZE) as u64;
        let regions = Self::regions(&layout, sector, sectors, data_sectors)?;
        let data_end = layout.data_shift + data_sectors;
        let mut overlay_bytes = 0u64;

        for (span, cache, base) in [
            (regions.prolog, layout.prolog.as_deref(), 0),
            (regions.epilog, layout.epilog.as_deref(), data_end),
        ] {
            let Some(span) = span else { continue };
            let offset = ((span.start - sector) as usize) * SECTOR_SIZE;
            let len = span.sectors() as usize * SECTOR_SIZE;
            match cache {
                Some(cache) => {
                    let from = ((span.start - base) as usize) * SECTOR_SIZE;
                    buf.copy_in(offset, &cache[from..from + len]);
                }
                None => buf.fill(offset, len, 0),
            }
            overlay_bytes += len as u64;
        }

        Ok(RegionSplit {
            overlay_bytes,
            data: Self::data_part(&regions, sector, layout.data_shift),
        })
    }

    /// Apply the overlay parts of a write to the cached table
    ///
    /// Fails without touching anything if an overlay region has no cache.
    pub fn serve_write(
        &self,
        sector: u64,
        data: &Bytes,
        data_sectors: u64,
    ) -> BridgeResult<RegionSplit> {
        let mut layout = self.layout.write();
        let sectors = (data.len() / SECTOR_SIZE) as u64;
        let regions = Self::regions(&layout, sector, sectors, data_sectors)?;
        let data_end = layout.data_shift + data_sectors;

        if (regions.prolog.is_some() && layout.prolog.is_none())
            || (regions.epilog.is_some() && layout.epilog.is_none())
        {
            return Err(BridgeError::invalid_argument(
                "write to a partition overlay region that has no table",
            ));
        }

        let mut overlay_bytes = 0u64;
        let layout = &mut *layout;
        for (span, cache, base) in [
            (regions.prolog, layout.prolog.as_mut(), 0),
            (regions.epilog, layout.epilog.as_mut(), data_end),
        ] {
            let (Some(span), Some(cache)) = (span, cache) else {
                continue;
            };
            let offset = ((span.start - sector) as usize) * SECTOR_SIZE;
            let len = span.sectors() as usize * SECTOR_SIZE;
            let from = ((span.start - base) as usize) * SECTOR_SIZE;
            cache[from..from + len].copy_from_slice(&data[offset..offset + len]);
            overlay_bytes += len as u64;
        }

        Ok(RegionSplit {
            overlay_bytes,
            data: Self::data_part(&regions, sector, layout.data_shift),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::detect::tests::ntfs_boot_sector;

    const DATA_SECTORS: u64 = 1024;

    fn active_overlay() -> PartitionOverlay {
        let overlay = PartitionOverlay::new(OverlayConfig::default());
        let fs = overlay.apply_boot_sector(&ntfs_boot_sector([4; 8]), DATA_SECTORS * 512);
        assert_eq!(fs, Some(FilesystemKind::Ntfs));
        overlay
    }

    #[test]
    fn test_raw_device_when_no_filesystem() {
        let overlay = PartitionOverlay::new(OverlayConfig::default());
        assert_eq!(overlay.apply_boot_sector(&[0u8; 512], 4096), None);
        assert_eq!(overlay.shifts(), (0, 0));

        let buf = IoBuffer::zeroed(1024);
        let split = overlay.serve_read(2, &buf, 8).unwrap();
        assert_eq!(split.overlay_bytes, 0);
        assert_eq!(
            split.data,
            Some(DataPart {
                sector: 2,
                buffer_offset: 0,
                length: 1024
            })
        );
    }

    #[test]
    fn test_disabled_overlay_ignores_filesystems() {
        let overlay = PartitionOverlay::new(OverlayConfig {
            enabled: false,
            ..OverlayConfig::default()
        });
        assert_eq!(
            overlay.apply_boot_sector(&ntfs_boot_sector([1; 8]), 4096),
            None
        );
        assert!(!overlay.layout().is_active());
    }

    #[test]
    fn test_read_spanning_prolog_and_data() {
        let overlay = active_overlay();
        let layout = overlay.layout();
        let buf = IoBuffer::zeroed(5 * 512);

        let split = overlay.serve_read(126, &buf, DATA_SECTORS).unwrap();
        assert_eq!(split.overlay_bytes, 2 * 512);
        assert_eq!(
            split.data,
            Some(DataPart {
                sector: 0,
                buffer_offset: 1024,
                length: 3 * 512
            })
        );
        assert_eq!(
            buf.read_range(0, 1024),
            layout.prolog().unwrap()[126 * 512..128 * 512].to_vec()
        );
    }

    #[test]
    fn test_read_of_mbr_and_backup_header() {
        let overlay = active_overlay();
        let buf = IoBuffer::zeroed(512);
        let split = overlay.serve_read(0, &buf, DATA_SECTORS).unwrap();
        assert_eq!(split.data, None);
        assert_eq!(&buf.to_vec()[0x1FE..], &[0x55, 0xAA]);

        let last = 128 + DATA_SECTORS + 127;
        let buf = IoBuffer::zeroed(4 * 512);
        let split = overlay.serve_read(last, &buf, DATA_SECTORS).unwrap();
        // Reads past the end of the epilog are truncated.
        assert_eq!(split.overlay_bytes, 512);
        assert_eq!(&buf.read_range(0, 8), b"EFI PART");
    }

    #[test]
    fn test_read_across_all_three_regions() {
        let overlay = active_overlay();
        let total = 128 + DATA_SECTORS + 128;
        let buf = IoBuffer::zeroed(total as usize * 512);
        let split = overlay.serve_read(0, &buf, DATA_SECTORS).unwrap();
        assert_eq!(split.overlay_bytes, 256 * 512);
        assert_eq!(
            split.data,
            Some(DataPart {
                sector: 0,
                buffer_offset: 128 * 512,
                length: DATA_SECTORS as usize * 512
            })
        );
    }

    #[test]
    fn test_read_beyond_end_rejected() {
        let overlay = active_overlay();
        let buf = IoBuffer::zeroed(512);
        let err = overlay
            .serve_read(128 + DATA_SECTORS + 128, &buf, DATA_SECTORS)
            .unwrap_err();
        assert!(matches!(err, BridgeError::InvalidArgument(_)));
    }

    #[test]
    fn test_write_into_prolog_updates_cache() {
        let overlay = active_overlay();
        let data = Bytes::from(vec![0x5A; 1024]);
        let split = overlay.serve_write(127, &data, DATA_SECTORS).unwrap();
        assert_eq!(split.overlay_bytes, 512);
        assert_eq!(split.data.unwrap().sector, 0);
        assert_eq!(split.data.unwrap().buffer_offset, 512);

        let layout = overlay.layout();
        assert!(layout.prolog().unwrap()[127 * 512..].iter().all(|&b| b == 0x5A));
    }

    #[test]
    fn test_missing_tables() {
        let overlay = PartitionOverlay::new(OverlayConfig {
            enabled: true,
            reserved_sectors: 16,
        });
        let fs = overlay.apply_boot_sector(&ntfs_boot_sector([4; 8]), DATA_SECTORS * 512);
        assert_eq!(fs, Some(FilesystemKind::Ntfs));
        let layout = overlay.layout();
        assert!(layout.is_active());
        assert!(layout.prolog().is_none());
        assert_eq!(layout.published_partition_sectors(), None);

        let buf = IoBuffer::from_vec(vec![0xFF; 512]);
        let split = overlay.serve_read(0, &buf, DATA_SECTORS).unwrap();
        assert_eq!(split.overlay_bytes, 512);
        assert!(buf.to_vec().iter().all(|&b| b == 0));

        let err = overlay
            .serve_write(0, &Bytes::from(vec![1; 512]), DATA_SECTORS)
            .unwrap_err();
        assert!(matches!(err, BridgeError::InvalidArgument(_)));

        // Data-only writes are unaffected.
        assert!(overlay
            .serve_write(16, &Bytes::from(vec![1; 512]), DATA_SECTORS)
            .is_ok());
    }

    #[test]
    fn test_rescan_keeps_published_length() {
        let overlay = active_overlay();
        assert_eq!(
            overlay.layout().published_partition_sectors(),
            Some(DATA_SECTORS)
        );

        overlay.apply_boot_sector(&ntfs_boot_sector([4; 8]), 2 * DATA_SECTORS * 512);
        let layout = overlay.layout();
        assert_eq!(layout.published_partition_sectors(), Some(DATA_SECTORS));
        assert_eq!(
            gpt::get_u64(layout.prolog().unwrap(), 0x230),
            2 * DATA_SECTORS + 128 - 1
        );
    }

    #[test]
    fn test_serial_guids_are_stable() {
        let a = active_overlay().layout().guids.unwrap();
        let b = active_overlay().layout().guids.unwrap();
        assert_eq!(a, b);
    }
}
