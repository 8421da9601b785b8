//! Bus probe and driver bring-up: reset both channels, signature-detect
//! the four slots, identify and register what answers, then arm the
//! interrupt lines.

use alloc::boxed::Box;
use alloc::sync::Arc;

use crate::block::BlockManager;
use crate::channel::DriveHead;
use crate::device::{AtaInfo, AtapiInfo, DeviceKind, DeviceSlot};
use crate::driver::{AtaDriver, DiskHandle};
use crate::error::AtaError;
use crate::identify::{IdentifyBlock, CAP_OVERLAP, IDENTIFY_SIZE};
use crate::modes::TransferMode;
use crate::platform::Platform;
use crate::regs::{PRIMARY_IRQ, SECONDARY_IRQ, STA_BSY};

pub(crate) const DEVICE_NAMES: [[&str; 2]; 2] = [["hda", "hdb"], ["hdc", "hdd"]];

/// Cylinder-register signature a packet device presents after reset
const ATAPI_SIGNATURE: (u8, u8) = (0x14, 0xEB);

impl<P: Platform + 'static> AtaDriver<P> {
    /// Probe both channels and register every device that answers.
    ///
    /// On return the IRQ lines are unmasked and any interrupt latched
    /// in the 8259 during probing has been given time to fire; the
    /// caller wires vectors 14/15 to [`AtaDriver::handle_irq`] next.
    pub fn init(self: Arc<Self>, blocks: &mut BlockManager) -> Result<(), AtaError> {
        let p = self.platform();

        for host in 0..2 {
            let ch = self.host(host);
            if ch.soft_reset(p).is_err() {
                log::warn!("ide{}: channel stuck in reset, skipping", host);
                continue;
            }

            for dev in 0..2 {
                // The reset leaves a signature in the cylinder
                // registers: (0, 0) is ATA, (0x14, 0xEB) is ATAPI,
                // anything else is an empty slot.
                p.outb(ch.reg_device(), DriveHead::for_device(dev).raw_value());
                p.msleep(5);
                let sig = (p.inb(ch.reg_lbam()), p.inb(ch.reg_lbah()));

                let present = if sig == (0, 0) {
                    self.probe_ata(host, dev)
                } else if sig == ATAPI_SIGNATURE {
                    self.probe_atapi(host, dev)
                } else {
                    false
                };
                if !present {
                    continue;
                }

                // Park the device and drop it to a known-safe mode.
                let _ = self.idle_immediate(host, dev);
                if let Err(err) = self.change_mode(host, dev, TransferMode::Pio) {
                    log::warn!(
                        "{}: transfer mode set error: {}",
                        DEVICE_NAMES[host][dev],
                        err
                    );
                }

                blocks.register(
                    DEVICE_NAMES[host][dev],
                    Box::new(DiskHandle::new(Arc::clone(&self), host, dev)),
                );
            }
        }

        // Second look at every slot. Some devices leave the channel
        // wedged busy after the signature pokes when their sibling
        // slot is empty; a channel found busy here gets reset whether
        // or not its devices registered.
        for host in 0..2 {
            let ch = self.host(host);
            for dev in 0..2 {
                p.outb(ch.reg_device(), DriveHead::for_device(dev).raw_value());
                p.msleep(5);
                if p.inb(ch.reg_status()) & STA_BSY != 0 {
                    let _ = self.reset_host(host);
                }
            }
        }

        // Unmask both lines, then give an edge the 8259 latched while
        // we were masked time to fire before the caller installs the
        // real handlers.
        p.irq_unmask(PRIMARY_IRQ);
        p.irq_unmask(SECONDARY_IRQ);
        p.msleep(2);

        Ok(())
    }

    fn probe_ata(&self, host: usize, dev: usize) -> bool {
        let name = DEVICE_NAMES[host][dev];
        let mut id = Box::new([0u8; IDENTIFY_SIZE]);

        // Some ghost slots ack IDENTIFY but stream nothing; floating
        // data lines then leave this marker in place.
        id[54] = 0xFF;
        if self.identify_device(host, dev, false, id.as_mut_slice()).is_err() {
            return false;
        }
        if id[54] == 0xFF {
            return false;
        }
        let Some(info) = IdentifyBlock::ref_from_bytes(id.as_slice()) else {
            return false;
        };

        let total_sectors = info.lba_sectors();
        if total_sectors == 0 {
            log::warn!("{}: device does not support LBA, skipping", name);
            return false;
        }

        log::info!("{} : {}, ATA DISK drive", name, info.model());

        {
            let mut state = self.host(host).state();
            state.devs[dev] = DeviceSlot {
                kind: DeviceKind::Ata(AtaInfo { total_sectors }),
                mode: None,
            };
        }

        // Hand the drive its default geometry; legacy firmware paths
        // still reference it.
        let _ = self.init_device_params(
            host,
            dev,
            info.default_heads() as u8,
            info.default_sectors() as u8,
        );

        true
    }

    fn probe_atapi(&self, host: usize, dev: usize) -> bool {
        let name = DEVICE_NAMES[host][dev];
        let mut id = Box::new([0u8; IDENTIFY_SIZE]);

        if self.identify_device(host, dev, true, id.as_mut_slice()).is_err() {
            return false;
        }
        let Some(info) = IdentifyBlock::ref_from_bytes(id.as_slice()) else {
            return false;
        };

        let class = match info.device_type() {
            0x05 => "CDROM",
            _ => "OTHER",
        };
        log::info!("{} : {}, ATAPI {} drive", name, info.model(), class);

        let overlapped = info.capabilities() & CAP_OVERLAP != 0;
        let mut state = self.host(host).state();
        state.devs[dev] = DeviceSlot {
            kind: DeviceKind::Atapi(AtapiInfo {
                overlapped,
                sector_size: 0,
                total_sectors: 0,
            }),
            mode: None,
        };
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockManager, DiskGeometry};
    use crate::regs::CTL_SRST;
    use crate::sim::{CdromConfig, DiskConfig, Event, SimPlatform};
    use crate::AtaDriver;
    use std::sync::Arc;

    fn boot(sim: SimPlatform) -> (Arc<AtaDriver<SimPlatform>>, BlockManager) {
        let driver = AtaDriver::new(sim);
        let mut blocks = BlockManager::new();
        driver.clone().init(&mut blocks).unwrap();
        (driver, blocks)
    }

    #[test]
    fn empty_bus_registers_nothing() {
        let (driver, blocks) = boot(SimPlatform::new());

        assert!(blocks.is_empty());
        for host in 0..2 {
            for dev in 0..2 {
                let geometry = driver.geometry(host, dev);
                assert_eq!(geometry.sector_size, 0);
                assert_eq!(geometry.last_block, 0);
            }
        }
    }

    #[test]
    fn single_disk_registers_as_hda() {
        let sim = SimPlatform::new();
        sim.attach_disk(
            0,
            0,
            DiskConfig {
                total_sectors: 0x0010_0000,
                ..DiskConfig::default()
            },
        );
        let (driver, blocks) = boot(sim);

        assert_eq!(blocks.len(), 1);
        let hda = blocks.by_name("hda").unwrap();
        assert_eq!(
            hda.geometry(),
            DiskGeometry {
                last_block: 0x000F_FFFF,
                sector_size: 512,
            }
        );
        assert!(blocks.by_name("hdb").is_none());
        assert!(blocks.by_name("hdc").is_none());

        // probe dropped the drive to flow-controlled PIO 4
        assert_eq!(driver.platform().features_log(0, 0), vec![(0x03, 0x0C)]);
        // and handed over the default geometry
        assert_eq!(driver.platform().init_params(0, 0), Some((15, 63)));
    }

    #[test]
    fn cdrom_registers_without_geometry() {
        let sim = SimPlatform::new();
        sim.attach_cdrom(1, 0, CdromConfig::default());
        let (_driver, blocks) = boot(sim);

        assert_eq!(blocks.len(), 1);
        let hdc = blocks.by_name("hdc").unwrap();
        // no disc examined yet: geometry is published by open()
        assert_eq!(
            hdc.geometry(),
            DiskGeometry {
                last_block: 0,
                sector_size: 0,
            }
        );
    }

    #[test]
    fn disks_on_both_channels_get_all_names() {
        let sim = SimPlatform::new();
        sim.attach_disk(0, 0, DiskConfig::default());
        sim.attach_disk(0, 1, DiskConfig::default());
        sim.attach_disk(1, 0, DiskConfig::default());
        sim.attach_disk(1, 1, DiskConfig::default());
        let (_driver, blocks) = boot(sim);

        for name in ["hda", "hdb", "hdc", "hdd"] {
            assert!(blocks.by_name(name).is_some(), "{} missing", name);
        }
    }

    #[test]
    fn stuck_channel_is_reset_in_second_pass() {
        let sim = SimPlatform::new();
        sim.attach_disk(0, 0, DiskConfig::default());
        // secondary wedged busy for the whole probe
        sim.channel(1).force_status(crate::regs::STA_BSY);
        let (driver, blocks) = boot(sim);

        assert_eq!(blocks.len(), 1);

        // one SRST pulse from the initial (failed) reset, then one per
        // slot from the second-pass sweep, which resets a stuck
        // channel every time it looks
        let srst_pulses = driver
            .platform()
            .port_log()
            .iter()
            .filter(|op| op.write && op.port == 0x376 && op.value == u32::from(CTL_SRST))
            .count();
        assert_eq!(srst_pulses, 3);
    }

    #[test]
    fn irq_lines_armed_after_probe() {
        let (driver, _blocks) = boot(SimPlatform::new());

        let events = driver.platform().events();
        let tail = &events[events.len() - 3..];
        assert_eq!(
            tail,
            [
                Event::IrqUnmask(PRIMARY_IRQ),
                Event::IrqUnmask(SECONDARY_IRQ),
                Event::Sleep(2),
            ]
        );
    }
}
