use core::fmt::{Display, Formatter};

/// Error type for ATA/ATAPI operations.
///
/// The first function to detect an abnormal condition coins the error;
/// callers propagate it unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtaError {
    /// Invalid argument: out-of-range sector span, oversized request,
    /// or a buffer whose length does not match the transfer
    InvalidArgument,
    /// No device in the addressed slot
    NoDevice,
    /// The device or host bridge does not support the requested feature
    NotSupported,
    /// Out of kernel memory
    NoMemory,
    /// The interrupt wait expired before the device signalled completion
    Timeout,
    /// The drive reported BSY at a point where it must be clear
    DeviceBusy,
    /// The drive reported ERR, or DRQ at a point where it must be clear
    DeviceError,
    /// No medium present in a removable-media drive
    NoMedium,
}

impl Display for AtaError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        let msg = match self {
            AtaError::InvalidArgument => "invalid argument",
            AtaError::NoDevice => "no such device",
            AtaError::NotSupported => "operation not supported",
            AtaError::NoMemory => "out of memory",
            AtaError::Timeout => "device timed out",
            AtaError::DeviceBusy => "device busy",
            AtaError::DeviceError => "device error",
            AtaError::NoMedium => "no medium present",
        };
        write!(f, "{}", msg)
    }
}

impl core::error::Error for AtaError {}
