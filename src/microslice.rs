// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Microslice descriptor: the fixed 32-byte record the readout hardware
// deposits into the descriptor ring, one per microslice. The layout is
// shared with the DMA engine and must not change.

use serde::{Deserialize, Serialize};

/// Header format identifier stamped into every descriptor (`hdr_id`).
pub const HDR_ID_STANDARD: u8 = 0xDD;
/// Header format version stamped into every descriptor (`hdr_ver`).
pub const HDR_VER_STANDARD: u8 = 0x01;

/// Status and error flag bits in [`MicrosliceDescriptor::flags`].
pub mod ms_flags {
    /// CRC field holds a valid checksum over the content.
    pub const CRC_VALID: u16 = 1 << 0;
    /// The content was truncated by the producer.
    pub const DATA_ERROR: u16 = 1 << 1;
    /// One or more preceding microslices were dropped before this one.
    pub const OVERFLOW_FLIM: u16 = 1 << 2;
}

/// Subsystem identifiers (`sys_id`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SubsystemIdentifier {
    Sts = 0x10,
    Mvd = 0x20,
    Rich = 0x30,
    Trd = 0x40,
    Much = 0x50,
    Rpc = 0x60,
    Ecal = 0x70,
    Psd = 0x80,
    Fles = 0xF0,
}

/// Descriptor of a single microslice.
///
/// `idx` is the microslice timestamp in nanoseconds and is strictly
/// increasing along the descriptor ring. `offset` addresses the content
/// bytes in the co-indexed data ring; for contiguous microslices
/// `offset + size` equals the next descriptor's `offset` (mod ring size).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MicrosliceDescriptor {
    /// Header format identifier (0xDD).
    pub hdr_id: u8,
    /// Header format version (0x01).
    pub hdr_ver: u8,
    /// Equipment identifier.
    pub eq_id: u16,
    /// Status and error flags ([`ms_flags`]).
    pub flags: u16,
    /// Subsystem identifier.
    pub sys_id: u8,
    /// Subsystem format version.
    pub sys_ver: u8,
    /// Microslice time index in nanoseconds.
    pub idx: u64,
    /// CRC-32 checksum of the content.
    pub crc: u32,
    /// Content size in bytes.
    pub size: u32,
    /// Offset of the content in the data ring (bytes).
    pub offset: u64,
}

const _: () = assert!(std::mem::size_of::<MicrosliceDescriptor>() == 32);

impl MicrosliceDescriptor {
    /// Whether preceding microslices were dropped before this one.
    pub fn overflow_flim(&self) -> bool {
        self.flags & ms_flags::OVERFLOW_FLIM != 0
    }
}
