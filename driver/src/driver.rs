//! Driver object and the user-facing entry points: the serialized
//! `transfer` dispatcher, ATAPI-aware `open`, the block-device vtable
//! handles, and the IRQ entry.

use alloc::sync::Arc;

use crate::block::{BlockDevice, DiskGeometry};
use crate::channel::HostChannel;
use crate::device::{AtapiInfo, DeviceKind};
use crate::error::AtaError;
use crate::packet::SenseOutcome;
use crate::platform::Platform;

/// Transfer direction, from the host's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dir {
    Read,
    Write,
}

/// A caller buffer plus its direction. Keeps the mutability of the
/// two directions honest without pointer casts.
pub(crate) enum Xfer<'a> {
    Read(&'a mut [u8]),
    Write(&'a [u8]),
}

impl Xfer<'_> {
    pub fn dir(&self) -> Dir {
        match self {
            Xfer::Read(_) => Dir::Read,
            Xfer::Write(_) => Dir::Write,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Xfer::Read(buf) => buf.len(),
            Xfer::Write(buf) => buf.len(),
        }
    }

    pub fn as_ptr(&self) -> *const u8 {
        match self {
            Xfer::Read(buf) => buf.as_ptr(),
            Xfer::Write(buf) => buf.as_ptr(),
        }
    }
}

/// The driver: both host channels and the platform they run on. One
/// instance owns all four device slots; the kernel's device registry
/// keeps it alive and routes IRQs 14/15 to [`AtaDriver::handle_irq`].
pub struct AtaDriver<P: Platform> {
    platform: P,
    hosts: [HostChannel; 2],
}

impl<P: Platform> AtaDriver<P> {
    pub fn new(platform: P) -> Arc<Self> {
        Arc::new(AtaDriver {
            platform,
            hosts: [HostChannel::new(0), HostChannel::new(1)],
        })
    }

    pub(crate) fn platform(&self) -> &P {
        &self.platform
    }

    pub(crate) fn host(&self, host: usize) -> &HostChannel {
        &self.hosts[host]
    }

    /// IRQ entry for the host's interrupt line. Wakes the task parked
    /// on the interrupt rendezvous; returns true to request a task
    /// switch on the way out of the handler.
    pub fn handle_irq(&self, host: usize) -> bool {
        self.platform.intr_wake(host);
        true
    }

    /// Published geometry of a slot. For packet devices this is all
    /// zeros until the first successful `open`.
    pub fn geometry(&self, host: usize, dev: usize) -> DiskGeometry {
        let slot = self.hosts[host].slot(dev);
        DiskGeometry {
            last_block: slot.total_sectors().saturating_sub(1),
            sector_size: slot.sector_size(),
        }
    }

    /// Open a device. ATA disks are always ready; packet devices run
    /// the readiness loop and publish their medium's geometry.
    pub fn open(&self, host: usize, dev: usize) -> Result<(), AtaError> {
        match self.hosts[host].slot(dev).kind {
            DeviceKind::Absent => Err(AtaError::NoDevice),
            DeviceKind::Ata(_) => Ok(()),
            DeviceKind::Atapi(_) => {
                self.platform.queue_wait(host);
                let result = self.open_atapi(host, dev);
                self.platform.queue_release(host);
                result
            }
        }
    }

    /// Spin the device up: TEST UNIT READY until it stops complaining,
    /// with REQUEST SENSE deciding between retry and hard failure,
    /// then READ CAPACITY for the medium's geometry.
    fn open_atapi(&self, host: usize, dev: usize) -> Result<(), AtaError> {
        loop {
            if self.test_unit_ready(host, dev).is_ok() {
                break;
            }
            match self.request_sense(host, dev)? {
                SenseOutcome::Ready => break,
                SenseOutcome::Retry => continue,
            }
        }

        let (total_sectors, sector_size) = self.read_capacity(host, dev)?;

        let mut state = self.hosts[host].state();
        if let DeviceKind::Atapi(info) = state.devs[dev].kind {
            state.devs[dev].kind = DeviceKind::Atapi(AtapiInfo {
                overlapped: info.overlapped,
                sector_size,
                total_sectors,
            });
        }
        Ok(())
    }

    /// Read `count` sectors starting at `begin` into `buf`.
    pub fn read(
        &self,
        host: usize,
        dev: usize,
        buf: &mut [u8],
        count: u32,
        begin: u32,
    ) -> Result<u32, AtaError> {
        self.transfer(host, dev, Xfer::Read(buf), count, begin)
    }

    /// Write `count` sectors starting at `begin` from `buf`.
    pub fn write(
        &self,
        host: usize,
        dev: usize,
        buf: &[u8],
        count: u32,
        begin: u32,
    ) -> Result<u32, AtaError> {
        self.transfer(host, dev, Xfer::Write(buf), count, begin)
    }

    /// No ioctl commands are defined.
    pub fn ioctl(&self, _host: usize, _dev: usize, _command: u32, _arg: usize) -> Result<u32, AtaError> {
        Ok(0)
    }

    /// Validate, serialize on the host's wait-queue, and dispatch to
    /// the device's data path. Returns the sector count on success.
    fn transfer(
        &self,
        host: usize,
        dev: usize,
        mut xfer: Xfer<'_>,
        count: u32,
        begin: u32,
    ) -> Result<u32, AtaError> {
        if count == 0 {
            return Ok(0);
        }

        let slot = self.hosts[host].slot(dev);

        if u64::from(begin) + u64::from(count) > u64::from(slot.total_sectors()) {
            return Err(AtaError::InvalidArgument);
        }

        let bytes = slot.sector_size() as usize * count as usize;
        if xfer.len() != bytes {
            return Err(AtaError::InvalidArgument);
        }

        // One command moves at most 255 sectors (8-bit count register)
        // and one bus-master descriptor covers at most 64 KiB; callers
        // split anything bigger.
        if matches!(slot.kind, DeviceKind::Ata(_)) && count > 255 {
            return Err(AtaError::InvalidArgument);
        }
        if slot.mode().is_dma() && bytes > 0x1_0000 {
            return Err(AtaError::InvalidArgument);
        }

        self.platform.queue_wait(host);

        // Keep the completion interrupt on the CPU that will park for
        // it.
        self.platform
            .irq_assign_current_cpu(self.hosts[host].irq());

        let result = match slot.kind {
            DeviceKind::Ata(_) => self.transfer_ata(host, dev, &mut xfer, count, begin),
            DeviceKind::Atapi(_) => self.transfer_atapi(host, dev, &mut xfer, count, begin),
            DeviceKind::Absent => Err(AtaError::NoDevice),
        };

        self.platform.queue_release(host);

        result.map(|()| count)
    }
}

/// The block-device vtable handle for one (host, device) slot; what
/// gets registered with the device filesystem.
pub struct DiskHandle<P: Platform> {
    driver: Arc<AtaDriver<P>>,
    host: usize,
    dev: usize,
}

impl<P: Platform> DiskHandle<P> {
    pub(crate) fn new(driver: Arc<AtaDriver<P>>, host: usize, dev: usize) -> Self {
        DiskHandle { driver, host, dev }
    }
}

impl<P: Platform + 'static> BlockDevice for DiskHandle<P> {
    fn open(&self) -> Result<(), AtaError> {
        self.driver.open(self.host, self.dev)
    }

    fn read(&self, buf: &mut [u8], count: u32, start: u32) -> Result<u32, AtaError> {
        self.driver.read(self.host, self.dev, buf, count, start)
    }

    fn write(&self, buf: &[u8], count: u32, start: u32) -> Result<u32, AtaError> {
        self.driver.write(self.host, self.dev, buf, count, start)
    }

    fn ioctl(&self, command: u32, arg: usize) -> Result<u32, AtaError> {
        self.driver.ioctl(self.host, self.dev, command, arg)
    }

    fn geometry(&self) -> DiskGeometry {
        self.driver.geometry(self.host, self.dev)
    }
}
