// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Managed shared-memory arena: a named segment carrying a small header
// (magic, UUID, sizes) followed by page-aligned allocations. Producers
// publish offsets into the arena; consumers map the same segment by name
// and validate the UUID before dereferencing anything.

use std::io;

use log::{debug, info};
use uuid::Uuid;

use crate::shm::{ShmHandle, ShmOpenMode};

const ARENA_MAGIC: u64 = 0x5453_4152_454e_4131; // "TSARENA1"

/// Offset of the first allocatable byte (one page reserved for the header).
pub const ARENA_DATA_START: u64 = 4096;

#[repr(C)]
struct ArenaHeader {
    magic: u64,
    total_size: u64,
    alloc_cursor: u64,
    uuid: [u8; 16],
}

/// System page size in bytes.
pub fn page_size() -> usize {
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz <= 0 {
        4096
    } else {
        sz as usize
    }
}

/// A named shared-memory arena with offset-addressed allocations.
pub struct ShmArena {
    shm: ShmHandle,
    identifier: String,
    uuid: Uuid,
}

impl ShmArena {
    /// Create a fresh arena of `size` usable bytes (plus the header page).
    /// An orphaned segment of the same name is removed first.
    pub fn create(identifier: &str, size: usize) -> io::Result<Self> {
        ShmHandle::unlink_by_name(identifier);

        let total = ARENA_DATA_START as usize + size;
        info!(
            "creating shared memory segment '{}' of size {} bytes",
            identifier, total
        );
        let shm = ShmHandle::acquire(identifier, total, ShmOpenMode::Create)?;
        let uuid = Uuid::new_v4();

        let hdr = shm.get() as *mut ArenaHeader;
        unsafe {
            (*hdr).total_size = total as u64;
            (*hdr).alloc_cursor = ARENA_DATA_START;
            (*hdr).uuid = *uuid.as_bytes();
            // magic last: consumers treat it as the "constructed" marker
            std::ptr::write_volatile(&mut (*hdr).magic, ARENA_MAGIC);
        }
        debug!("shared memory segment '{identifier}' initialized, uuid {uuid}");

        Ok(Self {
            shm,
            identifier: identifier.to_owned(),
            uuid,
        })
    }

    /// Map an existing arena by name and validate its header.
    pub fn open(identifier: &str) -> io::Result<Self> {
        let shm = ShmHandle::open_existing(identifier)?;
        let hdr = shm.get() as *const ArenaHeader;
        let (magic, total) = unsafe { ((*hdr).magic, (*hdr).total_size) };
        if magic != ARENA_MAGIC || total as usize > shm.user_size() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("segment '{identifier}' is not an arena"),
            ));
        }
        let uuid = Uuid::from_bytes(unsafe { (*hdr).uuid });
        Ok(Self {
            shm,
            identifier: identifier.to_owned(),
            uuid,
        })
    }

    /// The logical segment name.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// The UUID stored in the segment at creation.
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Usable bytes after the header page.
    pub fn capacity(&self) -> u64 {
        self.shm.user_size() as u64 - ARENA_DATA_START
    }

    fn header(&self) -> &ArenaHeader {
        unsafe { &*(self.shm.get() as *const ArenaHeader) }
    }

    fn header_mut(&mut self) -> &mut ArenaHeader {
        unsafe { &mut *(self.shm.get() as *mut ArenaHeader) }
    }

    /// Bytes handed out so far (bump allocations only).
    pub fn allocated(&self) -> u64 {
        self.header().alloc_cursor - ARENA_DATA_START
    }

    /// Bump-allocate `size` bytes aligned to `align`. Returns the offset of
    /// the allocation within the segment, or `None` when the arena is full.
    pub fn allocate_aligned(&mut self, size: usize, align: usize) -> Option<u64> {
        assert!(align.is_power_of_two());
        let total = self.shm.user_size() as u64;
        let hdr = self.header_mut();
        let offset = (hdr.alloc_cursor + align as u64 - 1) & !(align as u64 - 1);
        if offset + size as u64 > total {
            return None;
        }
        hdr.alloc_cursor = offset + size as u64;
        Some(offset)
    }

    /// Raw pointer to the byte at `offset`.
    ///
    /// # Safety (sort of)
    /// Callers must stay within ranges previously allocated; the arena does
    /// not track individual allocations after handing them out.
    pub fn ptr_at(&self, offset: u64) -> *mut u8 {
        debug_assert!(offset <= self.shm.user_size() as u64);
        unsafe { self.shm.get().add(offset as usize) }
    }

    /// Immutable byte slice at `offset`.
    pub fn slice_at(&self, offset: u64, len: usize) -> &[u8] {
        assert!(offset + len as u64 <= self.shm.user_size() as u64);
        unsafe { std::slice::from_raw_parts(self.ptr_at(offset), len) }
    }

    /// Mutable byte slice at `offset`.
    #[allow(clippy::mut_from_ref)]
    pub fn slice_at_mut(&self, offset: u64, len: usize) -> &mut [u8] {
        assert!(offset + len as u64 <= self.shm.user_size() as u64);
        unsafe { std::slice::from_raw_parts_mut(self.ptr_at(offset), len) }
    }
}

impl Drop for ShmArena {
    fn drop(&mut self) {
        debug!("releasing shared memory segment '{}'", self.identifier);
    }
}
