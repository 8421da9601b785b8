//! Task-file command layer: the non-data housekeeping commands and the
//! LBA28 sector transfer protocol.

use arbitrary_int::u4;

use crate::channel::{DriveHead, IntrMode};
use crate::driver::{AtaDriver, Dir, Xfer};
use crate::error::AtaError;
use crate::identify::IDENTIFY_SIZE;
use crate::platform::Platform;
use crate::regs::{
    ATA_SECTOR_SIZE, CMD_DEVICE_RESET, CMD_IDENTIFY, CMD_IDENTIFY_PACKET, CMD_IDLE_IMMEDIATE,
    CMD_INIT_DEV_PARAMS, CMD_READ_DMA, CMD_READ_SECTORS, CMD_SET_FEATURES, CMD_WRITE_DMA,
    CMD_WRITE_SECTORS, STA_BSY, STA_DRQ, STA_ERR,
};

/// Map a final status byte after a data command: DRQ or ERR left set
/// means the device faulted, BSY means it never finished.
pub(crate) fn finish_data(status: u8) -> Result<(), AtaError> {
    if status & (STA_BSY | STA_DRQ | STA_ERR) != 0 {
        if status & (STA_DRQ | STA_ERR) != 0 {
            return Err(AtaError::DeviceError);
        }
        return Err(AtaError::DeviceBusy);
    }
    Ok(())
}

/// Map a final status byte after a non-data command.
pub(crate) fn finish_nondata(status: u8) -> Result<(), AtaError> {
    if status & (STA_BSY | STA_ERR) != 0 {
        if status & STA_ERR != 0 {
            return Err(AtaError::DeviceError);
        }
        return Err(AtaError::DeviceBusy);
    }
    Ok(())
}

impl<P: Platform> AtaDriver<P> {
    /// IDENTIFY (PACKET) DEVICE: read the 512-byte identify block into
    /// `buf` by PIO.
    pub(crate) fn identify_device(
        &self,
        host: usize,
        dev: usize,
        packet: bool,
        buf: &mut [u8],
    ) -> Result<(), AtaError> {
        let ch = self.host(host);
        let p = self.platform();

        ch.set_intr(p, IntrMode::Disabled);
        ch.device_select(p, DriveHead::for_device(dev).raw_value())?;

        let opcode = if packet { CMD_IDENTIFY_PACKET } else { CMD_IDENTIFY };
        p.outb(ch.reg_command(), opcode);
        p.usleep(1);

        finish_data(ch.read_pio(p, &mut buf[..IDENTIFY_SIZE], IDENTIFY_SIZE))
    }

    /// IDLE IMMEDIATE: park the device.
    pub(crate) fn idle_immediate(&self, host: usize, dev: usize) -> Result<(), AtaError> {
        self.nondata_command(host, dev, CMD_IDLE_IMMEDIATE, DriveHead::for_device(dev))
    }

    /// DEVICE RESET: packet devices only.
    pub(crate) fn reset_device(&self, host: usize, dev: usize) -> Result<(), AtaError> {
        self.nondata_command(host, dev, CMD_DEVICE_RESET, DriveHead::for_device(dev))
    }

    /// INITIALIZE DEVICE PARAMETERS with the drive's default geometry.
    pub(crate) fn init_device_params(
        &self,
        host: usize,
        dev: usize,
        heads: u8,
        sectors: u8,
    ) -> Result<(), AtaError> {
        if heads > 0xF {
            return Err(AtaError::InvalidArgument);
        }

        let ch = self.host(host);
        let p = self.platform();

        ch.set_intr(p, IntrMode::Disabled);
        let select = DriveHead::for_device(dev).with_head(u4::new(heads));
        ch.device_select(p, select.raw_value())?;

        p.outb(ch.reg_nsect(), sectors);
        p.outb(ch.reg_command(), CMD_INIT_DEV_PARAMS);
        p.usleep(1);

        finish_nondata(ch.check_busy(p, ch.reg_alt_status()))
    }

    /// SET FEATURES with `subcommand` in the features register and
    /// `value` in the sector count register.
    pub(crate) fn set_features(
        &self,
        host: usize,
        dev: usize,
        subcommand: u8,
        value: u8,
    ) -> Result<(), AtaError> {
        let ch = self.host(host);
        let p = self.platform();

        ch.set_intr(p, IntrMode::Disabled);
        ch.device_select(p, DriveHead::for_device(dev).raw_value())?;

        p.outb(ch.reg_features(), subcommand);
        p.outb(ch.reg_nsect(), value);
        p.outb(ch.reg_command(), CMD_SET_FEATURES);
        p.usleep(1);

        finish_nondata(ch.check_busy(p, ch.reg_alt_status()))
    }

    fn nondata_command(
        &self,
        host: usize,
        dev: usize,
        opcode: u8,
        select: DriveHead,
    ) -> Result<(), AtaError> {
        let ch = self.host(host);
        let p = self.platform();

        ch.set_intr(p, IntrMode::Disabled);
        ch.device_select(p, select.raw_value())?;

        p.outb(ch.reg_command(), opcode);
        p.usleep(1);

        finish_nondata(ch.check_busy(p, ch.reg_alt_status()))
    }

    /// LBA28 sector transfer: 1-255 sectors, PIO or DMA according to
    /// the negotiated mode. PIO runs polled; DMA arms the interrupt
    /// rendezvous.
    pub(crate) fn transfer_ata(
        &self,
        host: usize,
        dev: usize,
        xfer: &mut Xfer<'_>,
        count: u32,
        begin: u32,
    ) -> Result<(), AtaError> {
        let ch = self.host(host);
        let p = self.platform();
        let pio = !ch.slot(dev).mode().is_dma();

        ch.set_intr(p, if pio { IntrMode::Disabled } else { IntrMode::Enabled });

        let select = DriveHead::for_device(dev)
            .with_lba(true)
            .with_head(u4::new(((begin >> 24) & 0xF) as u8));
        ch.device_select(p, select.raw_value())?;

        p.outb(ch.reg_nsect(), count as u8);
        p.outb(ch.reg_lbal(), begin as u8);
        p.outb(ch.reg_lbam(), (begin >> 8) as u8);
        p.outb(ch.reg_lbah(), (begin >> 16) as u8);

        let status = if pio {
            match xfer {
                Xfer::Read(buf) => {
                    p.outb(ch.reg_command(), CMD_READ_SECTORS);
                    ch.read_pio(p, buf, ATA_SECTOR_SIZE)
                }
                Xfer::Write(buf) => {
                    p.outb(ch.reg_command(), CMD_WRITE_SECTORS);
                    ch.write_pio(p, buf, ATA_SECTOR_SIZE)
                }
            }
        } else {
            let opcode = match xfer.dir() {
                Dir::Read => CMD_READ_DMA,
                Dir::Write => CMD_WRITE_DMA,
            };
            p.outb(ch.reg_command(), opcode);
            self.dma_transfer(host, xfer.dir(), xfer.as_ptr(), xfer.len() as u32)?
        };

        finish_data(status)
    }
}
