//! Per-slot device records filled in by probing.

use crate::modes::TransferMode;
use crate::regs::ATA_SECTOR_SIZE;

/// An ATA disk: fixed 512-byte sectors, capacity known at probe time.
#[derive(Debug, Clone, Copy)]
pub struct AtaInfo {
    /// Total LBA28-addressable sectors (IDENTIFY words 60-61)
    pub total_sectors: u32,
}

/// An ATAPI packet device. Geometry stays zero until the first `open`
/// runs READ CAPACITY; there may be no disc in the drive at probe.
#[derive(Debug, Clone, Copy)]
pub struct AtapiInfo {
    /// Overlapped-operation capability (IDENTIFY word 49 bit 13)
    pub overlapped: bool,
    /// Logical block size, rounded down to a 512-byte multiple
    pub sector_size: u32,
    /// Total addressable sectors
    pub total_sectors: u32,
}

#[derive(Debug, Clone, Copy)]
pub enum DeviceKind {
    Absent,
    Ata(AtaInfo),
    Atapi(AtapiInfo),
}

/// One of the four (host, device) slots.
#[derive(Debug, Clone, Copy)]
pub struct DeviceSlot {
    pub kind: DeviceKind,
    /// Negotiated transfer mode; `None` until the first successful
    /// SET FEATURES, so a fresh probe always programs the device.
    pub mode: Option<TransferMode>,
}

impl DeviceSlot {
    pub const fn empty() -> Self {
        DeviceSlot {
            kind: DeviceKind::Absent,
            mode: None,
        }
    }

    pub fn present(&self) -> bool {
        !matches!(self.kind, DeviceKind::Absent)
    }

    pub fn is_packet(&self) -> bool {
        matches!(self.kind, DeviceKind::Atapi(_))
    }

    pub fn total_sectors(&self) -> u32 {
        match self.kind {
            DeviceKind::Absent => 0,
            DeviceKind::Ata(info) => info.total_sectors,
            DeviceKind::Atapi(info) => info.total_sectors,
        }
    }

    pub fn sector_size(&self) -> u32 {
        match self.kind {
            DeviceKind::Absent => 0,
            DeviceKind::Ata(_) => ATA_SECTOR_SIZE as u32,
            DeviceKind::Atapi(info) => info.sector_size,
        }
    }

    pub fn overlapped(&self) -> bool {
        matches!(self.kind, DeviceKind::Atapi(info) if info.overlapped)
    }

    /// The negotiated mode, defaulting to PIO before negotiation.
    pub fn mode(&self) -> TransferMode {
        self.mode.unwrap_or(TransferMode::Pio)
    }
}
