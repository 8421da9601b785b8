//! ATAPI packet protocol: PACKET issue with the overlapped SERVICE
//! handshake, and the command set the driver needs from it
//! (TEST UNIT READY, REQUEST SENSE, READ CAPACITY, START STOP UNIT,
//! READ(10)/WRITE(10)).

use zerocopy::big_endian::U32;
use zerocopy::{FromBytes, FromZeroes, Unaligned};

use crate::channel::{DriveHead, IntrMode};
use crate::commands::finish_data;
use crate::driver::{AtaDriver, Dir, Xfer};
use crate::error::AtaError;
use crate::platform::Platform;
use crate::regs::{
    CMD_PACKET, CMD_SERVICE, IRR_CD, IRR_IO, PACKET_DMA, PACKET_OVERLAP, STA_BSY, STA_DRQ,
    STA_ERR, TIMEOUT_MS,
};

/// CDB opcodes this driver issues
const OP_TEST_UNIT_READY: u8 = 0x00;
const OP_REQUEST_SENSE: u8 = 0x03;
const OP_START_STOP_UNIT: u8 = 0x1B;
const OP_READ_CAPACITY: u8 = 0x25;
const OP_READ_10: u8 = 0x28;
const OP_WRITE_10: u8 = 0x2A;

/// REQUEST SENSE response length
const SENSE_LEN: usize = 14;

/// Outcome of a REQUEST SENSE triage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SenseOutcome {
    /// The device is (now) ready; a medium change may have occurred
    Ready,
    /// The device is becoming ready; ask again
    Retry,
}

/// START STOP UNIT operation byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
#[allow(dead_code)]
pub enum StartStopOp {
    Stop = 0x00,
    Start = 0x01,
    Eject = 0x02,
    Standby = 0x30,
}

/// 8-byte READ CAPACITY response, big-endian on the wire.
#[derive(FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
struct ReadCapacityData {
    last_lba: U32,
    block_len: U32,
}

impl<P: Platform> AtaDriver<P> {
    /// Issue one PACKET command: program the task file, send the CDB,
    /// run the overlapped SERVICE handshake when the device asked for
    /// it, then move the data phase by PIO or DMA.
    ///
    /// `block` is the data-phase block size in bytes; READ(10) and
    /// WRITE(10) carry their block count in the CDB, everything else
    /// transfers a single block.
    pub(crate) fn issue_packet_command(
        &self,
        host: usize,
        dev: usize,
        features: u8,
        cdb: &[u8; 12],
        mut data: Option<&mut Xfer<'_>>,
        block: usize,
    ) -> Result<(), AtaError> {
        let ch = self.host(host);
        let p = self.platform();

        ch.device_select(p, DriveHead::for_device(dev).raw_value())?;

        // Byte count 0xFFFF: let the device choose its own chunking.
        p.outb(ch.reg_features(), features);
        p.outb(ch.reg_nsect(), 0);
        p.outb(ch.reg_lbam(), 0xFF);
        p.outb(ch.reg_lbah(), 0xFF);
        p.outb(ch.reg_command(), CMD_PACKET);

        let status = ch.check_busy(p, ch.reg_status());
        if status & (STA_DRQ | STA_ERR) != STA_DRQ {
            return Err(AtaError::DeviceError);
        }
        if p.inb(ch.reg_intr_reason()) & (IRR_CD | IRR_IO) != IRR_CD {
            return Err(AtaError::DeviceError);
        }

        // Overlapped and DMA packets need the interrupt line live; a
        // plain polled packet runs quiet.
        let wants_intr = features & (PACKET_DMA | PACKET_OVERLAP) != 0;
        ch.set_intr(
            p,
            if wants_intr { IntrMode::Enabled } else { IntrMode::Disabled },
        );

        for word in cdb.chunks_exact(2) {
            p.outw(ch.reg_data(), u16::from_le_bytes([word[0], word[1]]));
        }

        let status = if features & PACKET_DMA != 0 {
            if features & PACKET_OVERLAP != 0 {
                // Bus released; the device interrupts when it is ready
                // to continue.
                if !p.intr_wait(host, TIMEOUT_MS) {
                    return Err(AtaError::Timeout);
                }
                let status = p.inb(ch.reg_status());
                if status & STA_ERR != 0 {
                    return Err(AtaError::DeviceError);
                }
                if status & STA_DRQ == 0 {
                    return Ok(()); // non-data command, already complete
                }
                self.service_handshake(host, dev)?;
            }

            match data.as_deref_mut() {
                Some(xfer) => {
                    self.dma_transfer(host, xfer.dir(), xfer.as_ptr(), xfer.len() as u32)?
                }
                // Device asserted DRQ for a command we expect no data
                // from; the final status triage will flag it.
                None => p.inb(ch.reg_status()),
            }
        } else {
            let status = ch.check_busy(p, ch.reg_status());
            if status & STA_ERR != 0 {
                return Err(AtaError::DeviceError);
            }
            if status & STA_DRQ == 0 {
                return Ok(()); // non-data command
            }

            if features & PACKET_OVERLAP != 0 {
                self.service_handshake(host, dev)?;
            }

            match data.as_deref_mut() {
                Some(Xfer::Read(buf)) => ch.read_pio(p, buf, block),
                Some(Xfer::Write(buf)) => ch.write_pio(p, buf, block),
                None => ch.check_busy(p, ch.reg_status()),
            }
        };

        finish_data(status)
    }

    /// The overlapped-mode resume: reselect, wait for the service
    /// interrupt, issue SERVICE, and confirm the device holds DRQ.
    fn service_handshake(&self, host: usize, dev: usize) -> Result<(), AtaError> {
        let ch = self.host(host);
        let p = self.platform();

        ch.device_select(p, DriveHead::for_device(dev).raw_value())?;
        if !p.intr_wait(host, TIMEOUT_MS) {
            return Err(AtaError::Timeout);
        }
        p.outb(ch.reg_command(), CMD_SERVICE);

        let status = ch.check_busy(p, ch.reg_status());
        if status & (STA_BSY | STA_DRQ) != STA_DRQ {
            return Err(AtaError::DeviceBusy);
        }
        Ok(())
    }

    /// TEST UNIT READY: empty CDB, no data phase.
    pub(crate) fn test_unit_ready(&self, host: usize, dev: usize) -> Result<(), AtaError> {
        let mut cdb = [0u8; 12];
        cdb[0] = OP_TEST_UNIT_READY;
        self.issue_packet_command(host, dev, 0, &cdb, None, 0)
    }

    /// REQUEST SENSE, triaged down to ready / retry / error.
    pub(crate) fn request_sense(&self, host: usize, dev: usize) -> Result<SenseOutcome, AtaError> {
        let features = if self.host(host).slot(dev).mode().is_dma() {
            PACKET_DMA
        } else {
            0
        };

        let mut buf = [0u8; SENSE_LEN];
        let mut cdb = [0u8; 12];
        cdb[0] = OP_REQUEST_SENSE;
        cdb[4] = SENSE_LEN as u8;

        let mut xfer = Xfer::Read(&mut buf);
        self.issue_packet_command(host, dev, features, &cdb, Some(&mut xfer), SENSE_LEN)?;

        triage_sense(buf[12], buf[13])
    }

    /// READ CAPACITY: returns (total sectors, sector size). The sector
    /// size is rounded down to a 512-byte multiple; some drives report
    /// their physical block size.
    pub(crate) fn read_capacity(&self, host: usize, dev: usize) -> Result<(u32, u32), AtaError> {
        let features = if self.host(host).slot(dev).mode().is_dma() {
            PACKET_DMA
        } else {
            0
        };

        let mut buf = [0u8; 8];
        let mut cdb = [0u8; 12];
        cdb[0] = OP_READ_CAPACITY;

        let buf_len = buf.len();
        let mut xfer = Xfer::Read(&mut buf);
        self.issue_packet_command(host, dev, features, &cdb, Some(&mut xfer), buf_len)?;

        let cap = ReadCapacityData::ref_from(&buf[..])
            .expect("READ CAPACITY response is 8 bytes");
        let total = cap.last_lba.get().wrapping_add(1);
        let sector_size = cap.block_len.get() / 512 * 512;
        Ok((total, sector_size))
    }

    /// START STOP UNIT with the requested operation byte.
    #[allow(dead_code)]
    pub(crate) fn start_stop_unit(
        &self,
        host: usize,
        dev: usize,
        op: StartStopOp,
    ) -> Result<(), AtaError> {
        let features = if self.host(host).slot(dev).overlapped() {
            PACKET_OVERLAP
        } else {
            0
        };

        let mut cdb = [0u8; 12];
        cdb[0] = OP_START_STOP_UNIT;
        cdb[4] = op as u8;

        self.issue_packet_command(host, dev, features, &cdb, None, 0)
    }

    /// READ(10)/WRITE(10) sector transfer for packet devices.
    pub(crate) fn transfer_atapi(
        &self,
        host: usize,
        dev: usize,
        xfer: &mut Xfer<'_>,
        count: u32,
        begin: u32,
    ) -> Result<(), AtaError> {
        let slot = self.host(host).slot(dev);

        let mut features = 0;
        if slot.overlapped() {
            features |= PACKET_OVERLAP;
        }
        if slot.mode().is_dma() {
            features |= PACKET_DMA;
        }

        let mut cdb = [0u8; 12];
        cdb[0] = match xfer.dir() {
            Dir::Read => OP_READ_10,
            Dir::Write => OP_WRITE_10,
        };
        cdb[2] = (begin >> 24) as u8;
        cdb[3] = (begin >> 16) as u8;
        cdb[4] = (begin >> 8) as u8;
        cdb[5] = begin as u8;
        cdb[7] = (count >> 8) as u8;
        cdb[8] = count as u8;

        let block = slot.sector_size() as usize;
        self.issue_packet_command(host, dev, features, &cdb, Some(xfer), block)
    }
}

/// Map an additional-sense (ASC, ASCQ) pair to what the readiness loop
/// should do next.
pub(crate) fn triage_sense(asc: u8, ascq: u8) -> Result<SenseOutcome, AtaError> {
    match (asc, ascq) {
        // Not ready -> ready transition; the medium may have changed
        (0x28, 0x00) => Ok(SenseOutcome::Ready),
        // Power on / reset, or becoming ready
        (0x29, 0x00) | (0x04, 0x01) => Ok(SenseOutcome::Retry),
        // Medium not present
        (0x3A, 0x00) => Err(AtaError::NoMedium),
        _ => Err(AtaError::DeviceError),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sense_triage_table() {
        assert_eq!(triage_sense(0x28, 0x00), Ok(SenseOutcome::Ready));
        assert_eq!(triage_sense(0x29, 0x00), Ok(SenseOutcome::Retry));
        assert_eq!(triage_sense(0x04, 0x01), Ok(SenseOutcome::Retry));
        assert_eq!(triage_sense(0x3A, 0x00), Err(AtaError::NoMedium));
        assert_eq!(triage_sense(0x00, 0x00), Err(AtaError::DeviceError));
        assert_eq!(triage_sense(0x04, 0x00), Err(AtaError::DeviceError));
    }

    #[test]
    fn read_capacity_parse_rounds_down() {
        let bytes: [u8; 8] = [0x00, 0x04, 0xA8, 0x53, 0x00, 0x00, 0x08, 0x30];
        let cap = ReadCapacityData::ref_from(&bytes[..]).unwrap();
        assert_eq!(cap.last_lba.get(), 0x0004_A853);
        // 0x830 = 2096 rounds down to 2048
        assert_eq!(cap.block_len.get() / 512 * 512, 2048);
    }
}

#[cfg(test)]
mod sim_tests {
    use super::*;
    use crate::block::BlockManager;
    use crate::driver::AtaDriver;
    use crate::sim::{CdromConfig, SimPlatform};
    use std::sync::Arc;

    fn boot_cdrom(cfg: CdromConfig) -> Arc<AtaDriver<SimPlatform>> {
        let driver = AtaDriver::new(SimPlatform::new());
        driver.platform().attach_cdrom(0, 0, cfg);
        let mut blocks = BlockManager::new();
        driver.clone().init(&mut blocks).unwrap();
        driver
    }

    #[test]
    fn start_stop_unit_sends_operation_byte() {
        let driver = boot_cdrom(CdromConfig::default());

        driver.start_stop_unit(0, 0, StartStopOp::Eject).unwrap();
        driver.start_stop_unit(0, 0, StartStopOp::Standby).unwrap();

        assert_eq!(driver.platform().start_stop_log(0, 0), vec![0x02, 0x30]);
    }

    #[test]
    fn test_unit_ready_reports_pending_sense() {
        let driver = boot_cdrom(CdromConfig {
            sense: vec![(6, 0x28, 0x00)],
            ..CdromConfig::default()
        });

        assert_eq!(
            driver.test_unit_ready(0, 0),
            Err(AtaError::DeviceError)
        );
        // medium-change sense drains the condition
        assert_eq!(driver.request_sense(0, 0), Ok(SenseOutcome::Ready));
        assert_eq!(driver.test_unit_ready(0, 0), Ok(()));
    }

    #[test]
    fn read_capacity_publishes_rounded_geometry() {
        let driver = boot_cdrom(CdromConfig {
            last_lba: 0x1000,
            sector_size: 2048,
            ..CdromConfig::default()
        });

        assert_eq!(driver.read_capacity(0, 0), Ok((0x1001, 2048)));
    }

    #[test]
    fn dma_packet_read_moves_through_bus_master() {
        let driver = AtaDriver::new(SimPlatform::new());
        driver.platform().attach_cdrom(0, 0, CdromConfig::default());
        driver.platform().install_ide_bridge(0x244B_8086);
        let mut blocks = BlockManager::new();
        driver.clone().init(&mut blocks).unwrap();

        driver.open(0, 0).unwrap();
        driver
            .change_mode(0, 0, crate::modes::TransferMode::MultiwordDma)
            .unwrap();
        driver.platform().clear_port_log();

        let mut buf = vec![0u8; 2048];
        assert_eq!(driver.read(0, 0, &mut buf, 1, 7), Ok(1));
        assert_eq!(buf, driver.platform().sector_bytes(0, 0, 7, 1));

        // the data phase ran on the engine, not the data port
        let kicked = driver
            .platform()
            .port_log()
            .iter()
            .any(|op| op.write && op.port == 0xC000 && op.value == 0x09);
        assert!(kicked);
    }

    #[test]
    fn overlapped_dma_read_resumes_with_service() {
        let driver = AtaDriver::new(SimPlatform::new());
        driver.platform().attach_cdrom(
            0,
            0,
            CdromConfig {
                overlapped: true,
                ..CdromConfig::default()
            },
        );
        driver.platform().install_ide_bridge(0x244B_8086);
        let mut blocks = BlockManager::new();
        driver.clone().init(&mut blocks).unwrap();

        driver.open(0, 0).unwrap();
        driver
            .change_mode(0, 0, crate::modes::TransferMode::MultiwordDma)
            .unwrap();
        driver.platform().clear_port_log();

        let mut buf = vec![0u8; 2048];
        assert_eq!(driver.read(0, 0, &mut buf, 1, 11), Ok(1));
        assert_eq!(buf, driver.platform().sector_bytes(0, 0, 11, 1));

        let log = driver.platform().port_log();
        let serviced = log
            .iter()
            .position(|op| op.write && op.port == 0x1F7 && op.value == 0xA2)
            .expect("SERVICE not issued");
        let kicked = log
            .iter()
            .position(|op| op.write && op.port == 0xC000 && op.value == 0x09)
            .expect("engine not started");
        // the engine starts only after the device asked to be resumed
        assert!(serviced < kicked);
    }
}
