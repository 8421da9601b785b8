//! Transfer-mode negotiation: pick a SET FEATURES subcommand from the
//! IDENTIFY capability words and program the PCI IDE bridge's
//! per-device Ultra DMA enables.
//!
//! The bridge table is the load-bearing part. Families cap the
//! achievable Ultra DMA mode below what the drive advertises, and the
//! BIOS may have pre-enabled Ultra DMA in the bridge: downgrading to
//! Multi-word DMA without clearing that enable corrupts data on the
//! wire.

use alloc::boxed::Box;

use crate::driver::AtaDriver;
use crate::error::AtaError;
use crate::identify::{IdentifyBlock, MDMA_MASK, PIO_MODE3, PIO_MODE4, IDENTIFY_SIZE};
use crate::platform::{PciSlot, Platform};
use crate::regs::{
    FEAT_SET_TRANSFER, XFER_MULTI_DMA, XFER_PIO_DEFAULT, XFER_PIO_FLOW, XFER_ULTRA_DMA,
};

/// A transfer mode family. The concrete mode number within the family
/// is negotiated from the IDENTIFY words and the bridge cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    Pio,
    MultiwordDma,
    UltraDma,
}

impl TransferMode {
    pub fn is_dma(self) -> bool {
        !matches!(self, TransferMode::Pio)
    }
}

/// How a bridge family lays out its per-device Ultra DMA enables.
#[derive(Clone, Copy)]
enum BridgeKind {
    /// One enable bit per (host, dev) slot in config dword 0x48
    Intel,
    /// Top bit of each slot's byte in config dword 0x50
    ViaAmd,
    /// Per-host timing dword at 0x40 / 0x44, a 4-bit pattern in the
    /// device's half-word selecting the mode. Only the listed
    /// (mode, pattern) pairs exist.
    Sis(&'static [(u8, u32)]),
}

/// Ultra DMA enable strategy for one PCI IDE function.
struct Bridge {
    /// device-id : vendor-id dword as read from config offset 0
    id: u32,
    kind: BridgeKind,
    /// Highest Ultra DMA mode the family signals; `None` means the
    /// family only participates in the Multi-word DMA cleanup.
    max_udma: Option<u8>,
}

const SIS_MODERN: &[(u8, u32)] = &[(5, 0x8000), (4, 0x9000), (2, 0xB000)];
const SIS_LEGACY: &[(u8, u32)] = &[(4, 0x9000), (2, 0xA000)];

#[rustfmt::skip]
static BRIDGES: &[Bridge] = &[
    // Intel ICH4 / ICH3 / ICH2: UDMA5
    Bridge { id: 0x24CB_8086, kind: BridgeKind::Intel, max_udma: Some(5) },
    Bridge { id: 0x248A_8086, kind: BridgeKind::Intel, max_udma: Some(5) },
    Bridge { id: 0x248B_8086, kind: BridgeKind::Intel, max_udma: Some(5) },
    Bridge { id: 0x244A_8086, kind: BridgeKind::Intel, max_udma: Some(5) },
    Bridge { id: 0x244B_8086, kind: BridgeKind::Intel, max_udma: Some(5) },
    // Intel ICH: UDMA4
    Bridge { id: 0x2411_8086, kind: BridgeKind::Intel, max_udma: Some(4) },
    Bridge { id: 0x7601_8086, kind: BridgeKind::Intel, max_udma: Some(4) },
    // Intel ICH0 / PIIX4: UDMA2
    Bridge { id: 0x2421_8086, kind: BridgeKind::Intel, max_udma: Some(2) },
    Bridge { id: 0x7111_8086, kind: BridgeKind::Intel, max_udma: Some(2) },
    Bridge { id: 0x84CA_8086, kind: BridgeKind::Intel, max_udma: Some(2) },
    Bridge { id: 0x7199_8086, kind: BridgeKind::Intel, max_udma: Some(2) },
    // AMD 768 / 766: UDMA5, AMD 756: UDMA4
    Bridge { id: 0x7441_1022, kind: BridgeKind::ViaAmd, max_udma: Some(5) },
    Bridge { id: 0x7411_1022, kind: BridgeKind::ViaAmd, max_udma: Some(5) },
    Bridge { id: 0x7409_1022, kind: BridgeKind::ViaAmd, max_udma: Some(4) },
    // VIA 8233a: UDMA6
    Bridge { id: 0x3147_1106, kind: BridgeKind::ViaAmd, max_udma: Some(6) },
    // VIA 82C686b / 8231 / 8233 / 8233c: UDMA5
    Bridge { id: 0x0686_1106, kind: BridgeKind::ViaAmd, max_udma: Some(5) },
    Bridge { id: 0x8231_1106, kind: BridgeKind::ViaAmd, max_udma: Some(5) },
    Bridge { id: 0x3074_1106, kind: BridgeKind::ViaAmd, max_udma: Some(5) },
    Bridge { id: 0x3109_1106, kind: BridgeKind::ViaAmd, max_udma: Some(5) },
    // VIA 82C596b: UDMA4, 82C586b: UDMA2
    Bridge { id: 0x0596_1106, kind: BridgeKind::ViaAmd, max_udma: Some(4) },
    Bridge { id: 0x0586_1106, kind: BridgeKind::ViaAmd, max_udma: Some(2) },
    // VIA 82C571 family: leave Ultra DMA to the BIOS
    Bridge { id: 0x0571_1106, kind: BridgeKind::ViaAmd, max_udma: None },
    // SiS 5591 and the 6xx/7xx line
    Bridge { id: 0x5513_1039, kind: BridgeKind::Sis(SIS_MODERN), max_udma: Some(5) },
    Bridge { id: 0x0630_1039, kind: BridgeKind::Sis(SIS_MODERN), max_udma: Some(5) },
    Bridge { id: 0x0633_1039, kind: BridgeKind::Sis(SIS_MODERN), max_udma: Some(5) },
    Bridge { id: 0x0635_1039, kind: BridgeKind::Sis(SIS_MODERN), max_udma: Some(5) },
    Bridge { id: 0x0640_1039, kind: BridgeKind::Sis(SIS_MODERN), max_udma: Some(5) },
    Bridge { id: 0x0645_1039, kind: BridgeKind::Sis(SIS_MODERN), max_udma: Some(5) },
    Bridge { id: 0x0650_1039, kind: BridgeKind::Sis(SIS_MODERN), max_udma: Some(5) },
    Bridge { id: 0x0730_1039, kind: BridgeKind::Sis(SIS_MODERN), max_udma: Some(5) },
    Bridge { id: 0x0733_1039, kind: BridgeKind::Sis(SIS_MODERN), max_udma: Some(5) },
    Bridge { id: 0x0735_1039, kind: BridgeKind::Sis(SIS_MODERN), max_udma: Some(5) },
    Bridge { id: 0x0740_1039, kind: BridgeKind::Sis(SIS_MODERN), max_udma: Some(5) },
    Bridge { id: 0x0745_1039, kind: BridgeKind::Sis(SIS_MODERN), max_udma: Some(5) },
    Bridge { id: 0x0750_1039, kind: BridgeKind::Sis(SIS_MODERN), max_udma: Some(5) },
    // SiS 530 / 540 / 620: UDMA4
    Bridge { id: 0x0530_1039, kind: BridgeKind::Sis(SIS_LEGACY), max_udma: Some(4) },
    Bridge { id: 0x0540_1039, kind: BridgeKind::Sis(SIS_LEGACY), max_udma: Some(4) },
    Bridge { id: 0x0620_1039, kind: BridgeKind::Sis(SIS_LEGACY), max_udma: Some(4) },
];

fn bridge_for(vendor_device: u32) -> Option<&'static Bridge> {
    BRIDGES.iter().find(|b| b.id == vendor_device)
}

impl Bridge {
    /// Highest Ultra DMA mode both the bridge and the drive (word 88)
    /// can run.
    fn pick_udma(&self, udma_word: u16) -> Option<u8> {
        match self.kind {
            BridgeKind::Sis(patterns) => patterns
                .iter()
                .find(|(mode, _)| udma_word & (1u16 << mode) != 0)
                .map(|(mode, _)| *mode),
            BridgeKind::Intel | BridgeKind::ViaAmd => {
                let max = self.max_udma?;
                (0..=max).rev().find(|&mode| udma_word & (1u16 << mode) != 0)
            }
        }
    }

    fn enable_udma(&self, p: &dyn Platform, slot: PciSlot, host: usize, dev: usize, mode: u8) {
        match self.kind {
            BridgeKind::Intel => {
                let value = p.pci_read_config(slot, 0x48);
                p.pci_write_config(slot, 0x48, value | 1 << (host * 2 + dev));
            }
            BridgeKind::ViaAmd => {
                let value = p.pci_read_config(slot, 0x50);
                p.pci_write_config(slot, 0x50, value | 0x4000_0000 >> (host * 16 + dev * 8));
            }
            BridgeKind::Sis(patterns) => {
                let offset = 0x40 + (host as u8) * 4;
                if let Some((_, pattern)) = patterns.iter().find(|(m, _)| *m == mode) {
                    let value = p.pci_read_config(slot, offset);
                    p.pci_write_config(slot, offset, value | pattern << (dev * 16));
                }
            }
        }
    }

    /// Clear any Ultra DMA enable the BIOS left behind for this slot.
    fn disable_udma(&self, p: &dyn Platform, slot: PciSlot, host: usize, dev: usize) {
        match self.kind {
            BridgeKind::Intel => {
                let value = p.pci_read_config(slot, 0x48);
                p.pci_write_config(slot, 0x48, value & !(1 << (host * 2 + dev)));
            }
            BridgeKind::ViaAmd => {
                let value = p.pci_read_config(slot, 0x50);
                p.pci_write_config(slot, 0x50, value & !(0x4000_0000 >> (host * 16 + dev * 8)));
            }
            BridgeKind::Sis(_) => {
                let offset = 0x40 + (host as u8) * 4;
                let value = p.pci_read_config(slot, offset);
                p.pci_write_config(slot, offset, value & !(0xF000 << (dev * 16)));
            }
        }
    }
}

/// SET FEATURES transfer value for the best advertised PIO mode.
fn pio_subcommand(pio_word: u16) -> u8 {
    if pio_word & PIO_MODE4 != 0 {
        XFER_PIO_FLOW | 4
    } else if pio_word & PIO_MODE3 != 0 {
        XFER_PIO_FLOW | 3
    } else {
        XFER_PIO_DEFAULT
    }
}

/// SET FEATURES transfer value for the best advertised Multi-word DMA
/// mode, if any.
fn mdma_subcommand(mdma_word: u16) -> Option<u8> {
    (0u8..3)
        .rev()
        .find(|&mode| mdma_word & MDMA_MASK & (1u16 << mode) != 0)
        .map(|mode| XFER_MULTI_DMA | mode)
}

impl<P: Platform> AtaDriver<P> {
    /// Negotiate `mode` for the device: derive the SET FEATURES
    /// subcommand from a fresh IDENTIFY, program the bridge enables,
    /// and issue the command. The slot's recorded mode changes only
    /// after the device accepts.
    pub fn change_mode(&self, host: usize, dev: usize, mode: TransferMode) -> Result<(), AtaError> {
        let ch = self.host(host);
        let slot = ch.slot(dev);

        if slot.mode == Some(mode) {
            return Ok(());
        }
        if !slot.present() {
            return Err(AtaError::NoDevice);
        }

        let mut id = Box::new([0u8; IDENTIFY_SIZE]);
        self.identify_device(host, dev, slot.is_packet(), id.as_mut_slice())?;
        let id = IdentifyBlock::ref_from_bytes(id.as_slice())
            .expect("identify block is 512 bytes");

        let subcommand = match mode {
            TransferMode::Pio => pio_subcommand(id.advanced_pio()),

            TransferMode::MultiwordDma => {
                let sub = mdma_subcommand(id.multiword_dma()).ok_or(AtaError::NotSupported)?;

                // The BIOS configures Ultra DMA-capable drives for
                // Ultra DMA; that bridge enable must go before the
                // drive drops to Multi-word timing.
                let (pci, vendor_device) = self.init_busmaster(host)?;
                if let Some(bridge) = bridge_for(vendor_device) {
                    bridge.disable_udma(self.platform(), pci, host, dev);
                }
                sub
            }

            TransferMode::UltraDma => {
                if id.ultra_dma() & 0x3F == 0 {
                    return Err(AtaError::NotSupported);
                }

                let (pci, vendor_device) = self.init_busmaster(host)?;
                let bridge = bridge_for(vendor_device).ok_or(AtaError::NotSupported)?;
                let udma = bridge.pick_udma(id.ultra_dma()).ok_or(AtaError::NotSupported)?;
                bridge.enable_udma(self.platform(), pci, host, dev, udma);
                XFER_ULTRA_DMA | udma
            }
        };

        self.set_features(host, dev, FEAT_SET_TRANSFER, subcommand)?;

        self.host(host).state().devs[dev].mode = Some(mode);
        Ok(())
    }

    /// Recover a wedged channel: software reset, then renegotiate each
    /// present device's recorded transfer mode (devices fall back to
    /// power-on defaults across a reset).
    pub fn reset_host(&self, host: usize) -> Result<(), AtaError> {
        self.host(host).soft_reset(self.platform())?;

        for dev in 0..2 {
            let slot = self.host(host).slot(dev);
            if !slot.present() {
                continue;
            }
            let Some(mode) = slot.mode else {
                continue;
            };

            self.host(host).state().devs[dev].mode = None;
            if let Err(err) = self.change_mode(host, dev, mode) {
                log::warn!("ide{}: device {} mode restore failed: {}", host, dev, err);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pio_subcommand_prefers_mode4() {
        assert_eq!(pio_subcommand(PIO_MODE4 | PIO_MODE3), XFER_PIO_FLOW | 4);
        assert_eq!(pio_subcommand(PIO_MODE3), XFER_PIO_FLOW | 3);
        assert_eq!(pio_subcommand(0), XFER_PIO_DEFAULT);
    }

    #[test]
    fn mdma_subcommand_picks_highest() {
        assert_eq!(mdma_subcommand(0x0007), Some(XFER_MULTI_DMA | 2));
        assert_eq!(mdma_subcommand(0x0003), Some(XFER_MULTI_DMA | 1));
        assert_eq!(mdma_subcommand(0x0001), Some(XFER_MULTI_DMA));
        assert_eq!(mdma_subcommand(0x0000), None);
        // stale high bits beyond the support mask are ignored
        assert_eq!(mdma_subcommand(0x0400), None);
    }

    #[test]
    fn intel_caps_by_generation() {
        let ich2 = bridge_for(0x244B_8086).unwrap();
        assert_eq!(ich2.pick_udma(0x3F), Some(5));
        let ich = bridge_for(0x2411_8086).unwrap();
        assert_eq!(ich.pick_udma(0x3F), Some(4));
        let piix4 = bridge_for(0x7111_8086).unwrap();
        assert_eq!(piix4.pick_udma(0x3F), Some(2));
        // drive slower than the bridge cap: take the drive's best
        assert_eq!(ich2.pick_udma(0x07), Some(2));
    }

    #[test]
    fn via_8233a_reaches_udma6() {
        let via = bridge_for(0x3147_1106).unwrap();
        assert_eq!(via.pick_udma(0x7F), Some(6));
        assert_eq!(via.pick_udma(0x3F), Some(5));
    }

    #[test]
    fn via_571_does_not_negotiate_udma() {
        let via = bridge_for(0x0571_1106).unwrap();
        assert_eq!(via.pick_udma(0x7F), None);
    }

    #[test]
    fn sis_only_knows_listed_modes() {
        let sis = bridge_for(0x0730_1039).unwrap();
        assert_eq!(sis.pick_udma(0x3F), Some(5));
        assert_eq!(sis.pick_udma(0x1F), Some(4));
        // UDMA3-only drive has no usable pattern on SiS
        assert_eq!(sis.pick_udma(0x08), None);
        let legacy = bridge_for(0x0530_1039).unwrap();
        assert_eq!(legacy.pick_udma(0x3F), Some(4));
        assert_eq!(legacy.pick_udma(0x07), Some(2));
    }

    #[test]
    fn unknown_bridge_is_absent() {
        assert!(bridge_for(0xDEAD_BEEF).is_none());
    }
}

#[cfg(test)]
mod sim_tests {
    use super::*;
    use crate::block::BlockManager;
    use crate::sim::{DiskConfig, SimPlatform};
    use std::sync::Arc;

    fn boot_with_bridge(vendor_device: u32, disk: DiskConfig) -> Arc<AtaDriver<SimPlatform>> {
        let driver = AtaDriver::new(SimPlatform::new());
        driver.platform().attach_disk(0, 0, disk);
        driver.platform().install_ide_bridge(vendor_device);
        let mut blocks = BlockManager::new();
        driver.clone().init(&mut blocks).unwrap();
        driver
    }

    #[test]
    fn ich2_ultra_dma_programs_bridge_and_drive() {
        let driver = boot_with_bridge(0x244B_8086, DiskConfig::default());

        driver.change_mode(0, 0, TransferMode::UltraDma).unwrap();

        // primary master enable bit in config dword 0x48
        assert!(driver
            .platform()
            .bridge_writes()
            .contains(&(0x48, 0x0000_0001)));
        // SET FEATURES transfer-mode subcommand: Ultra DMA mode 5
        assert_eq!(
            driver.platform().features_log(0, 0).last(),
            Some(&(0x03, 0x45))
        );
    }

    #[test]
    fn slave_slot_uses_its_own_enable_bit() {
        let driver = AtaDriver::new(SimPlatform::new());
        driver.platform().attach_disk(0, 1, DiskConfig::default());
        driver.platform().install_ide_bridge(0x244B_8086);
        let mut blocks = BlockManager::new();
        driver.clone().init(&mut blocks).unwrap();

        driver.change_mode(0, 1, TransferMode::UltraDma).unwrap();
        assert!(driver
            .platform()
            .bridge_writes()
            .contains(&(0x48, 0x0000_0002)));
    }

    #[test]
    fn multiword_downgrade_clears_bios_udma_enable() {
        let driver = boot_with_bridge(0x244B_8086, DiskConfig::default());
        driver.platform().set_bridge_config(0x48, 0x0000_000F);

        driver
            .change_mode(0, 0, TransferMode::MultiwordDma)
            .unwrap();

        assert!(driver
            .platform()
            .bridge_writes()
            .contains(&(0x48, 0x0000_000E)));
        assert_eq!(driver.platform().bridge_config(0x48), 0x0000_000E);
        assert_eq!(
            driver.platform().features_log(0, 0).last(),
            Some(&(0x03, 0x22))
        );
    }

    #[test]
    fn piix4_caps_ultra_dma_at_mode_2() {
        let driver = boot_with_bridge(0x7111_8086, DiskConfig::default());

        driver.change_mode(0, 0, TransferMode::UltraDma).unwrap();
        assert_eq!(
            driver.platform().features_log(0, 0).last(),
            Some(&(0x03, 0x42))
        );
    }

    #[test]
    fn via_bridge_uses_dword_50_patterns() {
        let driver = boot_with_bridge(0x3147_1106, DiskConfig::default());
        driver.platform().set_bridge_config(0x50, 0);

        driver.change_mode(0, 0, TransferMode::UltraDma).unwrap();
        // primary master: top bit of the first device byte
        assert!(driver
            .platform()
            .bridge_writes()
            .contains(&(0x50, 0x4000_0000)));
        // drive advertises up to UDMA5; the 8233a could do 6
        assert_eq!(
            driver.platform().features_log(0, 0).last(),
            Some(&(0x03, 0x45))
        );
    }

    #[test]
    fn sis_bridge_writes_mode_pattern() {
        let driver = boot_with_bridge(0x0730_1039, DiskConfig::default());

        driver.change_mode(0, 0, TransferMode::UltraDma).unwrap();
        assert!(driver
            .platform()
            .bridge_writes()
            .contains(&(0x40, 0x0000_8000)));
    }

    #[test]
    fn ultra_dma_needs_a_known_bridge() {
        let driver = boot_with_bridge(0x9999_9999, DiskConfig::default());
        assert_eq!(
            driver.change_mode(0, 0, TransferMode::UltraDma),
            Err(AtaError::NotSupported)
        );
    }

    #[test]
    fn ultra_dma_needs_a_bridge_at_all() {
        let driver = AtaDriver::new(SimPlatform::new());
        driver.platform().attach_disk(0, 0, DiskConfig::default());
        let mut blocks = BlockManager::new();
        driver.clone().init(&mut blocks).unwrap();

        assert_eq!(
            driver.change_mode(0, 0, TransferMode::UltraDma),
            Err(AtaError::NoDevice)
        );
    }

    #[test]
    fn drive_without_multiword_dma_is_refused() {
        let driver = boot_with_bridge(
            0x244B_8086,
            DiskConfig {
                mdma_word: 0,
                ..DiskConfig::default()
            },
        );
        assert_eq!(
            driver.change_mode(0, 0, TransferMode::MultiwordDma),
            Err(AtaError::NotSupported)
        );
    }

    #[test]
    fn drive_without_ultra_dma_is_refused() {
        let driver = boot_with_bridge(
            0x244B_8086,
            DiskConfig {
                udma_word: 0,
                ..DiskConfig::default()
            },
        );
        assert_eq!(
            driver.change_mode(0, 0, TransferMode::UltraDma),
            Err(AtaError::NotSupported)
        );
    }

    #[test]
    fn mode_is_committed_only_after_set_features() {
        let driver = boot_with_bridge(0x244B_8086, DiskConfig::default());

        driver
            .change_mode(0, 0, TransferMode::MultiwordDma)
            .unwrap();
        // asking again is a no-op: no second SET FEATURES
        let before = driver.platform().features_log(0, 0).len();
        driver
            .change_mode(0, 0, TransferMode::MultiwordDma)
            .unwrap();
        assert_eq!(driver.platform().features_log(0, 0).len(), before);
    }

    #[test]
    fn reset_host_renegotiates_recorded_modes() {
        let driver = boot_with_bridge(0x244B_8086, DiskConfig::default());
        driver
            .change_mode(0, 0, TransferMode::MultiwordDma)
            .unwrap();

        driver.reset_host(0).unwrap();

        let log = driver.platform().features_log(0, 0);
        let mdma_sets = log.iter().filter(|e| **e == (0x03, 0x22)).count();
        assert_eq!(mdma_sets, 2);

        // transfers still go out as DMA
        let mut buf = vec![0u8; 512];
        driver.read(0, 0, &mut buf, 1, 0).unwrap();
        assert_eq!(driver.platform().commands_log(0, 0).last(), Some(&0xC8));
    }
}
