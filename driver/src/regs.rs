//! Task-file register layout, status bits, and command opcodes.
//!
//! Reference: https://wiki.osdev.org/ATA_PIO_Mode
//! Reference: https://wiki.osdev.org/ATA_Command_Matrix

#![allow(dead_code)] // Registers are mapped in full, used or not

// I/O bases and IRQ lines -------------------------------------------------

/// Primary ATA bus: 0x1F0 - 0x1F7, control at 0x3F6
pub const PRIMARY_BASE: u16 = 0x1F0;
/// Secondary ATA bus: 0x170 - 0x177, control at 0x376
pub const SECONDARY_BASE: u16 = 0x170;

/// Control block offset from the command block base (0x3F6 - 0x1F0)
pub const CTL_OFFSET: u16 = 0x206;

/// Primary ATA bus IRQ line
pub const PRIMARY_IRQ: u8 = 14;
/// Secondary ATA bus IRQ line
pub const SECONDARY_IRQ: u8 = 15;

// Status register bits ----------------------------------------------------

/// 0   ERR     Error
///
/// Indicates an error occurred. Send a new command to clear it (or nuke
/// it with a Software Reset). Doubles as CHK for packet devices.
pub const STA_ERR: u8 = 0x01;
/// 3   DRQ     Data Request
///
/// Set when the drive has PIO data to transfer, or is ready to accept
/// PIO data.
pub const STA_DRQ: u8 = 0x08;
/// 4   SRV     Overlapped Mode Service Request
pub const STA_SRV: u8 = 0x10;
/// 5   DF      Drive Fault
///
/// Drive Fault Error (**does not set [ERR](STA_ERR)**).
pub const STA_DF: u8 = 0x20;
/// 6   RDY     Drive Ready
///
/// Bit is clear when drive is spun down, or after an error. Set
/// otherwise.
pub const STA_RDY: u8 = 0x40;
/// 7   BSY     Busy
///
/// Indicates the drive is preparing to send/receive data (wait for it
/// to clear). In case of 'hang' (it never clears), do a software reset.
pub const STA_BSY: u8 = 0x80;

// Interrupt reason register bits (packet devices) -------------------------

/// 0   CD      Command/Data: the device expects a command packet
pub const IRR_CD: u8 = 0x01;
/// 1   IO      Direction: device-to-host when set
pub const IRR_IO: u8 = 0x02;
/// 2   REL     Bus released (overlapped operation)
pub const IRR_REL: u8 = 0x04;

// Device control register bits --------------------------------------------

/// 1   nIEN    Not Interrupt Enable
///
/// Set this to stop the device from sending interrupts.
pub const CTL_NIEN: u8 = 0x02;
/// 2   SRST    Software Reset
///
/// Set, then clear, to software-reset all devices on the bus.
pub const CTL_SRST: u8 = 0x04;

// Device/head register bits -----------------------------------------------

/// 6   LBA     Use LBA addressing instead of CHS
pub const DEV_LBA: u8 = 0x40;
/// 5&7         Must Be Set (ATA-5 obsolete bits, kept set by convention)
pub const DEV_MBS: u8 = 0xA0;

// Commands ----------------------------------------------------------------

/// DEVICE RESET               non-data    packet devices
pub const CMD_DEVICE_RESET: u8 = 0x08;
/// READ SECTOR(S)             PIO
pub const CMD_READ_SECTORS: u8 = 0x20;
/// WRITE SECTOR(S)            PIO
pub const CMD_WRITE_SECTORS: u8 = 0x30;
/// INITIALIZE DEVICE PARAMETERS
pub const CMD_INIT_DEV_PARAMS: u8 = 0x91;
/// PACKET                     ATAPI command packet follows
pub const CMD_PACKET: u8 = 0xA0;
/// IDENTIFY PACKET DEVICE     PIO
pub const CMD_IDENTIFY_PACKET: u8 = 0xA1;
/// SERVICE                    resume an overlapped command
pub const CMD_SERVICE: u8 = 0xA2;
/// READ DMA
pub const CMD_READ_DMA: u8 = 0xC8;
/// WRITE DMA
pub const CMD_WRITE_DMA: u8 = 0xCA;
/// IDLE IMMEDIATE             non-data
pub const CMD_IDLE_IMMEDIATE: u8 = 0xE1;
/// IDENTIFY DEVICE            PIO
pub const CMD_IDENTIFY: u8 = 0xEC;
/// SET FEATURES               non-data
pub const CMD_SET_FEATURES: u8 = 0xEF;

// SET FEATURES ------------------------------------------------------------

/// Subcommand: set transfer mode (mode goes in the sector count reg)
pub const FEAT_SET_TRANSFER: u8 = 0x03;

/// Transfer mode value: PIO default mode
pub const XFER_PIO_DEFAULT: u8 = 0x00;
/// Transfer mode value: PIO flow-control mode, OR in the mode number
pub const XFER_PIO_FLOW: u8 = 0x08;
/// Transfer mode value: Multi-word DMA, OR in the mode number
pub const XFER_MULTI_DMA: u8 = 0x20;
/// Transfer mode value: Ultra DMA, OR in the mode number
pub const XFER_ULTRA_DMA: u8 = 0x40;

// ATAPI packet feature flags ----------------------------------------------

/// Data for this packet command moves by DMA
pub const PACKET_DMA: u8 = 0x01;
/// The device may release the bus and request service later
pub const PACKET_OVERLAP: u8 = 0x02;

// Timing ------------------------------------------------------------------

/// Busy-wait and interrupt-wait budget, milliseconds
pub const TIMEOUT_MS: u64 = 2000;

/// ATA disk sector size; packet devices report theirs via READ CAPACITY
pub const ATA_SECTOR_SIZE: usize = 512;
