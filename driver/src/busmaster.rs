//! IDE bus-master (first-party DMA) engine: PCI discovery of the IDE
//! function, the physical region descriptor, and transfer kick-off /
//! rendezvous / stop.
//!
//! Register block per host at `bm_base`: +0 command, +2 status,
//! +4 descriptor table pointer (32-bit). The secondary host's block
//! sits 8 bytes above the primary's.

use bitbybit::bitfield;

use crate::driver::{AtaDriver, Dir};
use crate::error::AtaError;
use crate::platform::{PciSlot, Platform};
use crate::regs::TIMEOUT_MS;

/// Bus Master IDE Command register offset
pub const BM_COMMAND: u16 = 0x0;
/// Bus Master IDE Status register offset
pub const BM_STATUS: u16 = 0x2;
/// Bus Master IDE Descriptor Table Pointer register offset (32-bit)
pub const BM_PRDT: u16 = 0x4;
/// Offset of the secondary host's register block
pub const BM_SECONDARY_OFFSET: u16 = 0x8;

/// PCI (class, subclass) of an IDE controller function
pub const PCI_CLASS_IDE: u32 = 0x0101;
/// PCI command register offset
pub const PCI_COMMAND: u8 = 0x04;
/// Bus Master enable bit in the PCI command register
pub const PCI_COMMAND_BUS_MASTER: u16 = 0x0004;
/// BAR4: bus-master I/O base
pub const PCI_BMBASE: u8 = 0x20;

#[bitfield(u8, default = 0)]
pub struct BmCommand {
    // Start/stop the engine
    #[bit(0, rw)]
    start: bool,
    // Device-to-memory when set
    #[bit(3, rw)]
    read: bool,
}

#[bitfield(u8, default = 0)]
pub struct BmStatus {
    // Engine is transferring
    #[bit(0, rw)]
    active: bool,
    // Transfer error; write 1 to clear
    #[bit(1, rw)]
    error: bool,
    // Device raised its interrupt; write 1 to clear
    #[bit(2, rw)]
    interrupt: bool,
}

/// Physical Region Descriptor. The engine follows `BMIDTP` to this
/// structure; bit 31 of `byte_count` marks the end of the table. One
/// descriptor covers one physically contiguous region of at most
/// 64 KiB.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Prd {
    pub phys_addr: u32,
    pub byte_count: u32,
}

/// End-of-table bit in [`Prd::byte_count`]
pub const PRD_EOT: u32 = 1 << 31;

impl Prd {
    pub const fn empty() -> Self {
        Prd {
            phys_addr: 0,
            byte_count: 0,
        }
    }
}

impl<P: Platform> AtaDriver<P> {
    /// Locate the IDE function on the PCI bus, enable bus mastering,
    /// and learn both hosts' bus-master register bases from BAR4.
    /// Returns the function's address and its vendor:device dword for
    /// the bridge-specific mode tables.
    pub(crate) fn init_busmaster(&self, host: usize) -> Result<(PciSlot, u32), AtaError> {
        let p = self.platform();

        let slot = p.pci_find_class(PCI_CLASS_IDE).ok_or(AtaError::NoDevice)?;

        // Bus mastering must take; some bridges hard-wire it off.
        let command = p.pci_read_config(slot, PCI_COMMAND);
        p.pci_write_config16(
            slot,
            PCI_COMMAND,
            (command & 0xFFFF) as u16 | PCI_COMMAND_BUS_MASTER,
        );
        if p.pci_read_config(slot, PCI_COMMAND) & u32::from(PCI_COMMAND_BUS_MASTER) == 0 {
            return Err(AtaError::NotSupported);
        }

        let bar = p.pci_read_config(slot, PCI_BMBASE);
        if bar == 0 {
            return Err(AtaError::NotSupported);
        }
        let base = (bar & 0xFFF0) as u16;

        // One BAR read covers both hosts.
        self.host(0).state().bm_base = Some(base);
        self.host(1).state().bm_base = Some(base + BM_SECONDARY_OFFSET);

        // Quiesce the engine before anyone programs it.
        let bm = if host == 0 { base } else { base + BM_SECONDARY_OFFSET };
        p.outb(bm + BM_COMMAND, 0);

        Ok((slot, p.pci_read_config(slot, 0x00)))
    }

    /// Run one bus-master transfer over a single contiguous region and
    /// rendezvous with the completion interrupt. Returns the drive's
    /// final status byte.
    pub(crate) fn dma_transfer(
        &self,
        host: usize,
        dir: Dir,
        addr: *const u8,
        bytes: u32,
    ) -> Result<u8, AtaError> {
        let p = self.platform();
        let ch = self.host(host);

        let (bm, prd_phys) = {
            let mut state = ch.state();
            let bm = state.bm_base.ok_or(AtaError::NotSupported)?;
            state.prd = Prd {
                phys_addr: p.phys_addr(addr),
                byte_count: bytes | PRD_EOT,
            };
            let prd_ptr: *const Prd = &state.prd;
            (bm, p.phys_addr(prd_ptr.cast()))
        };

        p.outl(bm + BM_PRDT, prd_phys);

        // The engine will not raise a fresh interrupt while the status
        // interrupt/error bits are still set.
        let clear = BmStatus::default().with_interrupt(true).with_error(true);
        p.outb(bm + BM_STATUS, clear.raw_value());

        let kick = BmCommand::default()
            .with_start(true)
            .with_read(dir == Dir::Read);
        p.outb(bm + BM_COMMAND, kick.raw_value());

        if !p.intr_wait(host, TIMEOUT_MS) {
            p.outb(bm + BM_COMMAND, 0);
            return Err(AtaError::Timeout);
        }
        p.outb(bm + BM_COMMAND, 0);

        Ok(p.inb(ch.reg_status()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockManager;
    use crate::driver::AtaDriver;
    use crate::error::AtaError;
    use crate::modes::TransferMode;
    use crate::regs::TIMEOUT_MS;
    use crate::sim::{DiskConfig, SimPlatform};
    use std::sync::Arc;

    fn boot_with_disk(cfg: DiskConfig) -> Arc<AtaDriver<SimPlatform>> {
        let driver = AtaDriver::new(SimPlatform::new());
        driver.platform().attach_disk(0, 0, cfg);
        driver.platform().install_ide_bridge(0x244B_8086);
        let mut blocks = BlockManager::new();
        driver.clone().init(&mut blocks).unwrap();
        driver
    }

    fn bm_command_writes(driver: &AtaDriver<SimPlatform>) -> Vec<u32> {
        driver
            .platform()
            .port_log()
            .iter()
            .filter(|op| op.write && op.port == 0xC000)
            .map(|op| op.value)
            .collect()
    }

    #[test]
    fn dma_read_programs_engine_and_moves_data() {
        let driver = boot_with_disk(DiskConfig::default());
        driver
            .change_mode(0, 0, TransferMode::MultiwordDma)
            .unwrap();
        driver.platform().clear_port_log();

        let mut buf = vec![0u8; 8 * 512];
        assert_eq!(driver.read(0, 0, &mut buf, 8, 63 + 1600), Ok(8));

        assert_eq!(buf, driver.platform().sector_bytes(0, 0, 1663, 8));

        let prds = driver.platform().prd_log(0);
        assert_eq!(prds.len(), 1);
        assert_eq!(prds[0].1, 4096 | PRD_EOT);

        // engine kicked for a read, then stopped
        assert_eq!(bm_command_writes(&driver), vec![0x09, 0x00]);
    }

    #[test]
    fn dma_write_kicks_engine_without_read_bit() {
        let driver = boot_with_disk(DiskConfig::default());
        driver
            .change_mode(0, 0, TransferMode::MultiwordDma)
            .unwrap();
        driver.platform().clear_port_log();

        let buf = vec![0xA5u8; 4 * 512];
        assert_eq!(driver.write(0, 0, &buf, 4, 100), Ok(4));
        assert_eq!(driver.platform().sector_bytes(0, 0, 100, 4), buf);
        assert_eq!(bm_command_writes(&driver), vec![0x01, 0x00]);
    }

    #[test]
    fn dma_timeout_stops_engine() {
        let driver = boot_with_disk(DiskConfig {
            dma_completes: false,
            ..DiskConfig::default()
        });
        driver
            .change_mode(0, 0, TransferMode::MultiwordDma)
            .unwrap();
        driver.platform().clear_port_log();

        let before = driver.platform().ticks_ms();
        let mut buf = vec![0u8; 512];
        assert_eq!(driver.read(0, 0, &mut buf, 1, 0), Err(AtaError::Timeout));
        let elapsed = driver.platform().ticks_ms() - before;

        assert!(elapsed >= TIMEOUT_MS, "waited only {} ms", elapsed);
        assert!(elapsed <= TIMEOUT_MS + 100, "waited {} ms", elapsed);

        // the engine was force-stopped on the way out
        assert_eq!(bm_command_writes(&driver).last(), Some(&0));
    }

    #[test]
    fn busmaster_discovery_learns_both_bases() {
        let driver = boot_with_disk(DiskConfig::default());
        let (_, vendor_device) = driver.init_busmaster(0).unwrap();
        assert_eq!(vendor_device, 0x244B_8086);
        assert_eq!(driver.host(0).state().bm_base, Some(0xC000));
        assert_eq!(driver.host(1).state().bm_base, Some(0xC008));
    }

    #[test]
    fn busmaster_discovery_without_ide_function() {
        let driver = AtaDriver::new(SimPlatform::new());
        assert_eq!(
            driver.init_busmaster(0).unwrap_err(),
            AtaError::NoDevice
        );
    }
}
