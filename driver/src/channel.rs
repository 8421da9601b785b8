//! Host channel state and the low-level register protocol: busy
//! polling, device selection, software reset, interrupt-mode switching,
//! and the PIO data ping-pong.
//!
//! Reference: https://wiki.osdev.org/ATA_PIO_Mode

#![allow(dead_code)] // The register block is mapped in full

use arbitrary_int::u4;
use bitbybit::bitfield;

use crate::busmaster::Prd;
use crate::device::DeviceSlot;
use crate::error::AtaError;
use crate::platform::Platform;
use crate::regs::{
    CTL_NIEN, CTL_OFFSET, CTL_SRST, DEV_MBS, PRIMARY_BASE, PRIMARY_IRQ, SECONDARY_BASE,
    SECONDARY_IRQ, STA_BSY, STA_DRQ, TIMEOUT_MS,
};
use crate::sync::ticket::TicketMutexGuard;
use crate::sync::TicketMutex;

/// Channel interrupt mode. Matches the nIEN bit and the IRQ mask as a
/// pair; only [`HostChannel::set_intr`] moves between the two states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntrMode {
    Disabled,
    Enabled,
}

/// The drive/head register: device select bit, addressing mode, and
/// the head / top-of-LBA nibble.
#[bitfield(u8, default = 0)]
pub struct DriveHead {
    // CHS head number, or LBA bits 27:24
    #[bits(0..=3, rw)]
    head: u4,
    // 0 = master, 1 = slave
    #[bit(4, rw)]
    device: bool,
    // LBA addressing when set
    #[bit(6, rw)]
    lba: bool,
}

impl DriveHead {
    pub fn for_device(dev: usize) -> Self {
        DriveHead::default().with_device(dev == 1)
    }
}

/// Mutable per-host state. Short-lived accesses only; commands in
/// flight are serialized by the kernel wait-queue, not by this lock.
pub struct HostState {
    pub intr: IntrMode,
    pub devs: [DeviceSlot; 2],
    /// Bus-master I/O base, learned from PCI BAR4 on first DMA setup
    pub bm_base: Option<u16>,
    /// Physical region descriptor handed to the bus-master engine.
    /// Lives here so its address is stable for the duration of a
    /// transfer.
    pub prd: Prd,
}

/// One ATA host channel (aka controller). Each channel can control up
/// to two devices.
pub struct HostChannel {
    index: usize,
    /// Base I/O port of the command block
    base: u16,
    /// Interrupt line in use
    irq: u8,
    state: TicketMutex<HostState>,
}

// ATA command block port addresses
impl HostChannel {
    /// R/W Data Register
    pub const fn reg_data(&self) -> u16 {
        self.base
    }

    /// R   Error Register
    pub const fn reg_error(&self) -> u16 {
        self.base + 1
    }

    /// W   Features Register (packet flags, SET FEATURES subcommand)
    pub const fn reg_features(&self) -> u16 {
        self.base + 1
    }

    /// R/W Sector Count Register
    pub const fn reg_nsect(&self) -> u16 {
        self.base + 2
    }

    /// R   Interrupt Reason Register (packet devices; shares the port
    /// with the sector count register)
    pub const fn reg_intr_reason(&self) -> u16 {
        self.base + 2
    }

    /// R/W Sector Number Register (LBA bits 7:0)
    pub const fn reg_lbal(&self) -> u16 {
        self.base + 3
    }

    /// R/W Cylinder Low Register (LBA bits 15:8, packet byte count low)
    pub const fn reg_lbam(&self) -> u16 {
        self.base + 4
    }

    /// R/W Cylinder High Register (LBA bits 23:16, packet byte count
    /// high)
    pub const fn reg_lbah(&self) -> u16 {
        self.base + 5
    }

    /// R/W Device / Head Register
    pub const fn reg_device(&self) -> u16 {
        self.base + 6
    }

    /// R   Status Register
    pub const fn reg_status(&self) -> u16 {
        self.base + 7
    }

    /// W   Command Register
    pub const fn reg_command(&self) -> u16 {
        self.base + 7
    }

    /// R   Alternate Status Register
    ///
    /// A duplicate of the status register that does not acknowledge a
    /// pending interrupt when read.
    pub const fn reg_alt_status(&self) -> u16 {
        self.base + CTL_OFFSET
    }

    /// W   Device Control Register
    pub const fn reg_ctl(&self) -> u16 {
        self.base + CTL_OFFSET
    }
}

impl HostChannel {
    pub fn new(index: usize) -> HostChannel {
        let (base, irq) = match index {
            0 => (PRIMARY_BASE, PRIMARY_IRQ),
            1 => (SECONDARY_BASE, SECONDARY_IRQ),
            _ => panic!("invalid host channel index {}", index),
        };

        HostChannel {
            index,
            base,
            irq,
            state: TicketMutex::new(HostState {
                intr: IntrMode::Disabled,
                devs: [DeviceSlot::empty(); 2],
                bm_base: None,
                prd: Prd::empty(),
            }),
        }
    }

    pub fn irq(&self) -> u8 {
        self.irq
    }

    pub fn state(&self) -> TicketMutexGuard<'_, HostState> {
        self.state.lock()
    }

    /// Copy of the addressed device slot.
    pub fn slot(&self, dev: usize) -> DeviceSlot {
        self.state.lock().devs[dev]
    }

    /// Poll `port` until BSY clears or the wall-time budget runs out,
    /// and return the last status read. Never fails; the caller
    /// inspects the returned bits.
    pub fn check_busy(&self, p: &dyn Platform, port: u16) -> u8 {
        let start = p.ticks_ms();
        loop {
            let status = p.inb(port);
            if status & STA_BSY == 0 {
                return status;
            }
            if p.ticks_ms().wrapping_sub(start) > TIMEOUT_MS {
                return status;
            }
        }
    }

    /// Switch the channel between interrupting and polled operation.
    ///
    /// Idempotent: a request for the current mode is a no-op, so the
    /// ~5 ms mask/unmask settle is paid at most once per switch.
    pub fn set_intr(&self, p: &dyn Platform, mode: IntrMode) {
        let mut state = self.state.lock();
        if state.intr == mode {
            return;
        }

        match mode {
            IntrMode::Disabled => {
                p.irq_mask(self.irq);
                p.outb(self.reg_ctl(), CTL_NIEN);
            }
            IntrMode::Enabled => {
                p.outb(self.reg_ctl(), 0);
                p.irq_unmask(self.irq);
            }
        }
        p.msleep(5);

        state.intr = mode;
    }

    /// Program the drive/head register with `select` (device bit, LBA
    /// bit, head/LBA nibble), verifying the channel is idle before and
    /// after.
    pub fn device_select(&self, p: &dyn Platform, select: u8) -> Result<(), AtaError> {
        self.selection_check(p)?;

        p.outb(self.reg_device(), DEV_MBS | select);
        // 400 ns selection settle
        p.usleep(1);

        self.selection_check(p)
    }

    fn selection_check(&self, p: &dyn Platform) -> Result<(), AtaError> {
        let status = self.check_busy(p, self.reg_alt_status());
        if status & STA_DRQ != 0 {
            return Err(AtaError::DeviceError);
        }
        if status & STA_BSY != 0 {
            return Err(AtaError::DeviceBusy);
        }
        Ok(())
    }

    /// Pulse SRST, deassert it leaving nIEN set, and wait for the
    /// channel to come out of reset.
    pub fn soft_reset(&self, p: &dyn Platform) -> Result<(), AtaError> {
        log::debug!("ide{}: software reset", self.index);

        p.outb(self.reg_ctl(), CTL_SRST);
        p.msleep(5);
        p.outb(self.reg_ctl(), CTL_NIEN);
        p.msleep(20);

        // nIEN is now asserted; keep the bookkeeping in step.
        self.state.lock().intr = IntrMode::Disabled;

        if self.check_busy(p, self.reg_alt_status()) & STA_BSY != 0 {
            return Err(AtaError::DeviceBusy);
        }
        Ok(())
    }

    /// Stream `buf.len() / block` blocks from the data register, one
    /// status handshake per block. Returns the final status byte for
    /// the caller to triage.
    pub fn read_pio(&self, p: &dyn Platform, buf: &mut [u8], block: usize) -> u8 {
        if buf.is_empty() {
            return self.check_busy(p, self.reg_status());
        }

        for chunk in buf.chunks_mut(block) {
            let status = self.check_busy(p, self.reg_status());
            if status & (STA_BSY | STA_DRQ) != STA_DRQ {
                return status;
            }
            for word in chunk.chunks_exact_mut(2) {
                let w = p.inw(self.reg_data());
                word.copy_from_slice(&w.to_le_bytes());
            }
        }

        self.check_busy(p, self.reg_status())
    }

    /// Counterpart of [`HostChannel::read_pio`] for writes.
    pub fn write_pio(&self, p: &dyn Platform, buf: &[u8], block: usize) -> u8 {
        if buf.is_empty() {
            return self.check_busy(p, self.reg_status());
        }

        for chunk in buf.chunks(block) {
            let status = self.check_busy(p, self.reg_status());
            if status & (STA_BSY | STA_DRQ) != STA_DRQ {
                return status;
            }
            for word in chunk.chunks_exact(2) {
                p.outw(self.reg_data(), u16::from_le_bytes([word[0], word[1]]));
            }
        }

        self.check_busy(p, self.reg_status())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{Event, SimPlatform};

    #[test]
    fn check_busy_gives_up_after_budget() {
        let p = SimPlatform::new();
        p.channel(0).force_status(STA_BSY);
        let ch = HostChannel::new(0);

        let before = p.ticks_ms();
        let status = ch.check_busy(&p, ch.reg_status());
        assert_eq!(status & STA_BSY, STA_BSY);
        assert!(p.ticks_ms() - before >= TIMEOUT_MS);
    }

    #[test]
    fn set_intr_is_idempotent() {
        let p = SimPlatform::new();
        let ch = HostChannel::new(0);

        ch.set_intr(&p, IntrMode::Enabled);
        ch.set_intr(&p, IntrMode::Enabled);

        let events = p.events();
        let unmasks = events
            .iter()
            .filter(|e| matches!(e, Event::IrqUnmask(14)))
            .count();
        let settles = events
            .iter()
            .filter(|e| matches!(e, Event::Sleep(5)))
            .count();
        assert_eq!(unmasks, 1);
        assert_eq!(settles, 1);
    }

    #[test]
    fn set_intr_round_trip_masks_once_each_way() {
        let p = SimPlatform::new();
        let ch = HostChannel::new(0);

        ch.set_intr(&p, IntrMode::Enabled);
        ch.set_intr(&p, IntrMode::Disabled);
        ch.set_intr(&p, IntrMode::Disabled);

        let events = p.events();
        let masks = events
            .iter()
            .filter(|e| matches!(e, Event::IrqMask(14)))
            .count();
        assert_eq!(masks, 1);
    }

    #[test]
    fn device_select_rejects_busy_channel() {
        let p = SimPlatform::new();
        p.channel(0).force_status(STA_BSY);
        let ch = HostChannel::new(0);

        assert_eq!(
            ch.device_select(&p, 0),
            Err(AtaError::DeviceBusy)
        );
    }

    #[test]
    fn device_select_rejects_pending_drq() {
        let p = SimPlatform::new();
        p.channel(0).force_status(STA_DRQ);
        let ch = HostChannel::new(0);

        assert_eq!(
            ch.device_select(&p, 0),
            Err(AtaError::DeviceError)
        );
    }

    #[test]
    fn soft_reset_fails_on_stuck_busy() {
        let p = SimPlatform::new();
        p.channel(0).force_status(STA_BSY);
        let ch = HostChannel::new(0);

        assert_eq!(ch.soft_reset(&p), Err(AtaError::DeviceBusy));
    }

    #[test]
    fn drive_head_packs_lba_nibble() {
        let dh = DriveHead::for_device(1)
            .with_lba(true)
            .with_head(u4::new(0x3));
        assert_eq!(dh.raw_value(), 0x53);
    }
}
