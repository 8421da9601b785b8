//! The block-device registration interface the driver publishes into.
//!
//! The operating system's device filesystem consumes this: each probed
//! device registers a named entry whose vtable routes back into the
//! driver.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use crate::error::AtaError;

/// Geometry a block device publishes: index of its last addressable
/// block and the block size in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskGeometry {
    pub last_block: u32,
    pub sector_size: u32,
}

/// Operation vtable the device filesystem expects of a block device.
pub trait BlockDevice: Send + Sync {
    fn open(&self) -> Result<(), AtaError>;

    /// Read `count` sectors starting at `start`; returns the sectors
    /// transferred, which equals `count` on success.
    fn read(&self, buf: &mut [u8], count: u32, start: u32) -> Result<u32, AtaError>;

    /// Write `count` sectors starting at `start`; same contract as
    /// [`BlockDevice::read`].
    fn write(&self, buf: &[u8], count: u32, start: u32) -> Result<u32, AtaError>;

    fn ioctl(&self, command: u32, arg: usize) -> Result<u32, AtaError>;

    /// Live geometry; packet devices update theirs on `open`.
    fn geometry(&self) -> DiskGeometry;
}

struct BlockEntry {
    name: String,
    device: Box<dyn BlockDevice>,
}

/// Registry of named block devices.
pub struct BlockManager {
    devices: Vec<BlockEntry>,
}

impl BlockManager {
    pub fn new() -> Self {
        BlockManager {
            devices: Vec::new(),
        }
    }

    /// Register a block device under `name`.
    pub fn register(&mut self, name: &str, device: Box<dyn BlockDevice>) {
        let geometry = device.geometry();
        log::info!(
            "registered block device \"{}\": last block {:#x}, {} byte sectors",
            name,
            geometry.last_block,
            geometry.sector_size
        );
        self.devices.push(BlockEntry {
            name: String::from(name),
            device,
        });
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Look up a device by name.
    pub fn by_name(&self, name: &str) -> Option<&dyn BlockDevice> {
        self.devices
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| entry.device.as_ref())
    }
}

impl Default for BlockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BlockManager {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "Block devices:")?;
        for entry in self.devices.iter() {
            let geometry = entry.device.geometry();
            writeln!(
                f,
                "    \"{}\": last block {:#x}, {} byte sectors",
                entry.name, geometry.last_block, geometry.sector_size
            )?;
        }
        Ok(())
    }
}
