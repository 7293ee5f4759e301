// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Subtimeslice handles and descriptors.
//
// Handles reference byte ranges inside the sender's shared-memory arena
// and never own data. Descriptors are the serialized form that travels
// to the scheduler and the builder; decoding tolerates trailing bytes so
// fields can be appended later without breaking old consumers.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::microslice::MicrosliceDescriptor;

/// Identifies one timeslice: `start_time_ns / duration_ns`.
pub type StId = u64;

/// Flags on a subtimeslice ([`SubTimesliceHandle::flags`], [`StDescriptor::flags`]).
pub mod st_flags {
    /// At least one channel failed or timed out; its component is absent.
    pub const INCOMPLETE: u16 = 1 << 0;
    /// Some component is missing microslices (aggregated producer overflow).
    pub const OVERFLOW_FLIM: u16 = 1 << 1;
}

/// One contiguous byte range inside a shared-memory arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShmIovec {
    /// Byte offset within the segment.
    pub offset: u64,
    /// Length in bytes.
    pub len: u64,
}

/// One channel's contribution to one timeslice window, as ranges in the
/// sender's arena: one or two descriptor iovecs and one or two content
/// iovecs (two when the window wraps the ring).
#[derive(Debug, Clone, Default)]
pub struct StComponentHandle {
    pub descriptors: Vec<ShmIovec>,
    pub contents: Vec<ShmIovec>,
    /// Microslices are missing in this component.
    pub missing_microslices: bool,
}

impl StComponentHandle {
    /// Number of microslices, from the descriptor range sizes.
    pub fn num_microslices(&self) -> u64 {
        self.descriptors_size() / std::mem::size_of::<MicrosliceDescriptor>() as u64
    }

    /// Total descriptor bytes.
    pub fn descriptors_size(&self) -> u64 {
        self.descriptors.iter().map(|v| v.len).sum()
    }

    /// Total content bytes.
    pub fn contents_size(&self) -> u64 {
        self.contents.iter().map(|v| v.len).sum()
    }
}

/// A complete subtimeslice, handed from the builder loop to the sender.
#[derive(Debug, Clone, Default)]
pub struct SubTimesliceHandle {
    pub start_time_ns: u64,
    pub duration_ns: u64,
    pub flags: u16,
    pub components: Vec<StComponentHandle>,
}

impl SubTimesliceHandle {
    pub fn ts_id(&self) -> StId {
        self.start_time_ns / self.duration_ns
    }

    pub fn has_flag(&self, flag: u16) -> bool {
        self.flags & flag != 0
    }

    pub fn set_flag(&mut self, flag: u16) {
        self.flags |= flag;
    }

    /// Total payload bytes (descriptors + contents over all components).
    pub fn size(&self) -> u64 {
        self.components
            .iter()
            .map(|c| c.descriptors_size() + c.contents_size())
            .sum()
    }
}

// ---------------------------------------------------------------------------
// Serialized descriptors (wire form)
// ---------------------------------------------------------------------------

/// A byte range within the transferred subtimeslice blob.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataDescriptor {
    pub offset: u64,
    pub size: u64,
}

/// Serialized form of one component: where its descriptor and content
/// blocks sit within the transferred blob.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StComponentDescriptor {
    pub descriptor: DataDescriptor,
    pub content: DataDescriptor,
    pub missing_microslices: bool,
}

impl StComponentDescriptor {
    pub fn size(&self) -> u64 {
        self.descriptor.size + self.content.size
    }
}

/// Serialized form of a subtimeslice (or of an assembled timeslice, where
/// the components of all senders are concatenated).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StDescriptor {
    pub start_time_ns: u64,
    pub duration_ns: u64,
    pub flags: u16,
    pub components: Vec<StComponentDescriptor>,
}

impl StDescriptor {
    pub fn has_flag(&self, flag: u16) -> bool {
        self.flags & flag != 0
    }

    pub fn set_flag(&mut self, flag: u16) {
        self.flags |= flag;
    }

    pub fn size(&self) -> u64 {
        self.components.iter().map(|c| c.size()).sum()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        encode(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        decode(bytes)
    }
}

/// One sender's part of a timeslice assignment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TsCollectionEntry {
    /// The sender's listen address (`host:port`), as registered.
    pub sender_id: String,
    pub desc_size: u64,
    pub content_size: u64,
}

/// Assignment body sent to a timeslice builder: which senders announced
/// the timeslice and how much data each will deliver.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TsCollectionDescriptor {
    pub ts_id: StId,
    pub senders: Vec<TsCollectionEntry>,
}

impl TsCollectionDescriptor {
    /// Total bytes the builder will have to hold for this timeslice.
    pub fn total_size(&self) -> u64 {
        self.senders
            .iter()
            .map(|s| s.desc_size + s.content_size)
            .sum()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        encode(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        decode(bytes)
    }
}

/// Serialized work item published to distributor workers: where in which
/// shared-memory segment the assembled timeslice lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItemShm {
    pub shm_identifier: String,
    pub shm_uuid: Uuid,
    /// Offset of the assembled timeslice within the segment.
    pub offset: u64,
    pub ts_desc: StDescriptor,
}

impl WorkItemShm {
    pub fn to_bytes(&self) -> Vec<u8> {
        encode(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        decode(bytes)
    }
}

/// Portable binary encoding: fixed-width little-endian integers.
fn encode<T: Serialize>(value: &T) -> Vec<u8> {
    bincode::serialize(value).expect("descriptor serialization cannot fail")
}

/// Decoding counterpart; extra trailing bytes are ignored.
fn decode<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T, bincode::Error> {
    bincode::deserialize(bytes)
}
