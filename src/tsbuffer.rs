// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Build-node timeslice buffer: a shared-memory arena holding assembled
// timeslices, addressed by offset in the published work items. The
// allocator is a first-fit free list; space comes back when the
// distributor reports that the last worker is done with an item.

use std::collections::{BTreeMap, HashMap};
use std::io;

use log::{debug, info, warn};
use uuid::Uuid;

use crate::arena::{ShmArena, ARENA_DATA_START};
use crate::subtimeslice::{StDescriptor, StId, WorkItemShm};

const ALLOC_ALIGN: u64 = 64;

/// Shared-memory buffer for assembled timeslices.
pub struct TsBuffer {
    arena: ShmArena,
    /// Free ranges: offset -> length, coalesced on free.
    free: BTreeMap<u64, u64>,
    allocations: HashMap<StId, (u64, u64)>,
    bytes_processed: u64,
}

impl TsBuffer {
    /// Create the buffer segment (removing an orphan of the same name).
    pub fn new(shm_identifier: &str, buffer_size: usize) -> io::Result<Self> {
        let arena = ShmArena::create(shm_identifier, buffer_size)?;
        let mut free = BTreeMap::new();
        free.insert(ARENA_DATA_START, arena.capacity());
        info!(
            "timeslice buffer '{}' ready, {} bytes, uuid {}",
            shm_identifier,
            arena.capacity(),
            arena.uuid()
        );
        Ok(Self {
            arena,
            free,
            allocations: HashMap::new(),
            bytes_processed: 0,
        })
    }

    pub fn identifier(&self) -> &str {
        self.arena.identifier()
    }

    pub fn uuid(&self) -> Uuid {
        self.arena.uuid()
    }

    /// Sum of free bytes. Reported to the scheduler as capacity.
    pub fn bytes_available(&self) -> u64 {
        self.free.values().sum()
    }

    /// Total bytes of freed (fully processed) timeslices.
    pub fn bytes_processed(&self) -> u64 {
        self.bytes_processed
    }

    /// First-fit allocation for timeslice `id`.
    pub fn allocate(&mut self, id: StId, size: u64) -> Option<u64> {
        let size = size.max(1).next_multiple_of(ALLOC_ALIGN);
        let (offset, len) = self
            .free
            .iter()
            .find(|(_, &len)| len >= size)
            .map(|(&o, &l)| (o, l))?;

        self.free.remove(&offset);
        if len > size {
            self.free.insert(offset + size, len - size);
        }
        self.allocations.insert(id, (offset, size));
        debug!("{id}| allocated {size} bytes at offset {offset}");
        Some(offset)
    }

    /// Release the allocation of `id`, coalescing with its neighbours.
    pub fn free(&mut self, id: StId) {
        let Some((mut offset, mut len)) = self.allocations.remove(&id) else {
            warn!("{id}| free for unknown allocation");
            return;
        };
        self.bytes_processed += len;

        // merge with the preceding free range
        if let Some((&prev_off, &prev_len)) = self.free.range(..offset).next_back() {
            if prev_off + prev_len == offset {
                self.free.remove(&prev_off);
                offset = prev_off;
                len += prev_len;
            }
        }
        // merge with the following free range
        if let Some(&next_len) = self.free.get(&(offset + len)) {
            self.free.remove(&(offset + len));
            len += next_len;
        }
        self.free.insert(offset, len);
        debug!("{id}| freed, {} bytes available", self.bytes_available());
    }

    /// Write `bytes` into an allocation at `offset + within`.
    pub fn write(&mut self, offset: u64, within: u64, bytes: &[u8]) {
        self.arena
            .slice_at_mut(offset + within, bytes.len())
            .copy_from_slice(bytes);
    }

    /// Serialized work item for the assembled timeslice at `offset`.
    pub fn work_item(&self, offset: u64, ts_desc: StDescriptor) -> WorkItemShm {
        WorkItemShm {
            shm_identifier: self.arena.identifier().to_owned(),
            shm_uuid: self.arena.uuid(),
            offset,
            ts_desc,
        }
    }
}
