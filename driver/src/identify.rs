//! Typed view of the 512-byte IDENTIFY (PACKET) DEVICE response.
//!
//! Fields are indexed by 16-bit word number per ATA-5. Only the words
//! this driver relies on get accessors.

use alloc::string::String;
use zerocopy::little_endian::U16;
use zerocopy::{FromBytes, FromZeroes, Unaligned};

pub const IDENTIFY_SIZE: usize = 512;

// Capability / support bits within individual words

/// Word 49: overlapped operation supported (packet devices)
pub const CAP_OVERLAP: u16 = 0x2000;

/// Word 64: PIO mode 3 supported
pub const PIO_MODE3: u16 = 0x01;
/// Word 64: PIO mode 4 supported
pub const PIO_MODE4: u16 = 0x02;

/// Word 63: Multi-word DMA mode support mask, bits 2:0
pub const MDMA_MASK: u16 = 0x07;

#[derive(FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct IdentifyBlock {
    words: [U16; 256],
}

impl IdentifyBlock {
    pub fn ref_from_bytes(bytes: &[u8]) -> Option<&Self> {
        Self::ref_from(bytes)
    }

    fn word(&self, index: usize) -> u16 {
        self.words[index].get()
    }

    /// Word 0: general configuration. For packet devices, bits 12:8
    /// carry the device type (0x05 = CD-ROM).
    pub fn device_type(&self) -> u8 {
        ((self.word(0) >> 8) & 0x1F) as u8
    }

    /// Word 3: default number of heads (ATA only)
    pub fn default_heads(&self) -> u16 {
        self.word(3)
    }

    /// Word 6: default sectors per track (ATA only)
    pub fn default_sectors(&self) -> u16 {
        self.word(6)
    }

    /// Word 49: capabilities (IORDY, LBA, overlap)
    pub fn capabilities(&self) -> u16 {
        self.word(49)
    }

    /// Words 60-61: total LBA28-addressable sectors. Zero means the
    /// device does not support LBA.
    pub fn lba_sectors(&self) -> u32 {
        u32::from(self.word(61)) << 16 | u32::from(self.word(60))
    }

    /// Word 63: Multi-word DMA support mask
    pub fn multiword_dma(&self) -> u16 {
        self.word(63)
    }

    /// Word 64: advanced PIO mode support mask
    pub fn advanced_pio(&self) -> u16 {
        self.word(64)
    }

    /// Word 88: Ultra DMA support mask
    pub fn ultra_dma(&self) -> u16 {
        self.word(88)
    }

    /// Words 27-46: model string, decoded.
    pub fn model(&self) -> String {
        let mut raw = [0u8; 40];
        for (i, byte) in raw.iter_mut().enumerate() {
            let w = self.word(27 + i / 2);
            *byte = if i % 2 == 0 { (w & 0xFF) as u8 } else { (w >> 8) as u8 };
        }
        model_string(&raw)
    }
}

/// Decode an IDENTIFY ASCII field: characters are stored big-endian
/// within each 16-bit word, so adjacent bytes swap places; the field is
/// space-padded, and the name ends at the first double space.
pub fn model_string(raw: &[u8; 40]) -> String {
    let mut chars = [0u8; 40];
    for (pair, out) in raw.chunks_exact(2).zip(chars.chunks_exact_mut(2)) {
        out[0] = pair[1];
        out[1] = pair[0];
    }

    let end = chars
        .windows(2)
        .position(|w| w == b"  ")
        .unwrap_or(chars.len());

    String::from_utf8_lossy(&chars[..end]).trim_end().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Space-pad and pair-swap, producing the on-wire byte order.
    fn encode(name: &str) -> [u8; 40] {
        let mut padded = [b' '; 40];
        padded[..name.len()].copy_from_slice(name.as_bytes());
        let mut raw = [0u8; 40];
        for (pair, out) in padded.chunks_exact(2).zip(raw.chunks_exact_mut(2)) {
            out[0] = pair[1];
            out[1] = pair[0];
        }
        raw
    }

    #[test]
    fn model_decodes_swapped_pairs() {
        assert_eq!(model_string(&encode("Disk Dr C")), "Disk Dr C");
        assert_eq!(model_string(&encode("QEMU HARDDISK")), "QEMU HARDDISK");
    }

    #[test]
    fn model_stops_at_double_space() {
        // Double space inside the field cuts the name short even when
        // more characters follow.
        let mut padded = [b' '; 40];
        padded[..4].copy_from_slice(b"ABCD");
        padded[6..10].copy_from_slice(b"WXYZ");
        let mut raw = [0u8; 40];
        for (pair, out) in padded.chunks_exact(2).zip(raw.chunks_exact_mut(2)) {
            out[0] = pair[1];
            out[1] = pair[0];
        }
        assert_eq!(model_string(&raw), "ABCD");
    }

    #[test]
    fn model_uses_full_field_without_padding() {
        let name = "0123456789012345678901234567890123456789";
        let mut raw = [0u8; 40];
        for (pair, out) in name.as_bytes().chunks_exact(2).zip(raw.chunks_exact_mut(2)) {
            out[0] = pair[1];
            out[1] = pair[0];
        }
        assert_eq!(model_string(&raw), name);
    }

    #[test]
    fn word_accessors() {
        let mut bytes = [0u8; IDENTIFY_SIZE];
        // word 0 = 0x8500: packet device, type 5 (CD-ROM)
        bytes[1] = 0x85;
        // words 60-61 = 0x0010_0000 sectors
        bytes[121] = 0x00;
        bytes[122] = 0x10;
        let id = IdentifyBlock::ref_from_bytes(&bytes).unwrap();
        assert_eq!(id.device_type(), 5);
        assert_eq!(id.lba_sectors(), 0x0010_0000);
    }
}
