// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Named POSIX shared memory segments (shm_open + mmap). A trailing
// atomic reference counter shared by all mappings makes the last handle
// unlink the backing object on drop, so segments never outlive their
// processes on clean shutdown.

use std::ffi::CString;
use std::io;
use std::ptr;
use std::sync::atomic::{AtomicI32, Ordering};

/// Open mode for shared memory segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShmOpenMode {
    /// Create exclusively — fail if already exists.
    Create,
    /// Open existing — fail if it does not exist.
    Open,
    /// Create if missing, open if it already exists.
    CreateOrOpen,
}

const ALIGN: usize = std::mem::align_of::<AtomicI32>();

/// Total mapped size: the user size rounded up to the counter alignment,
/// plus the trailing `AtomicI32` reference counter.
fn mapped_size(user_size: usize) -> usize {
    let aligned = ((user_size.wrapping_sub(1) / ALIGN) + 1) * ALIGN;
    aligned + std::mem::size_of::<AtomicI32>()
}

/// Reference to the trailing counter inside a mapped region.
///
/// # Safety
/// `mem` must point to a valid mapping of at least `total` bytes.
unsafe fn ref_counter(mem: *mut u8, total: usize) -> &'static AtomicI32 {
    let offset = total - std::mem::size_of::<AtomicI32>();
    &*(mem.add(offset) as *const AtomicI32)
}

/// Turn a logical segment name into a POSIX shm object name.
fn posix_name(name: &str) -> String {
    let mut n = String::with_capacity(name.len() + 1);
    n.push('/');
    for c in name.chars() {
        n.push(if c == '/' { '_' } else { c });
    }
    n
}

/// A named, inter-process shared memory region.
pub struct ShmHandle {
    mem: *mut u8,
    size: usize,      // total mapped size (including the ref counter)
    user_size: usize, // user-requested size
    name: String,     // POSIX name (with leading '/')
    prev_ref: i32,    // counter value before our own increment
}

// The region is process-shared by design.
unsafe impl Send for ShmHandle {}
unsafe impl Sync for ShmHandle {}

impl ShmHandle {
    /// Acquire a named shared memory region of `size` usable bytes.
    ///
    /// The actual mapping is slightly larger to hold the ref counter.
    pub fn acquire(name: &str, size: usize, mode: ShmOpenMode) -> io::Result<Self> {
        if name.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "name is empty"));
        }
        if size == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "size is 0"));
        }

        let posix = posix_name(name);
        let c_name = CString::new(posix.as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let perms: libc::mode_t = 0o666;
        let total = mapped_size(size);

        // For CreateOrOpen: try exclusive create first so ftruncate only runs
        // on an object we actually own.
        let (fd, need_truncate) = match mode {
            ShmOpenMode::Create => {
                let f = unsafe {
                    libc::shm_open(
                        c_name.as_ptr(),
                        libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                        perms as libc::c_uint,
                    )
                };
                if f == -1 {
                    return Err(io::Error::last_os_error());
                }
                (f, true)
            }
            ShmOpenMode::Open => {
                let f =
                    unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, perms as libc::c_uint) };
                if f == -1 {
                    return Err(io::Error::last_os_error());
                }
                (f, false)
            }
            ShmOpenMode::CreateOrOpen => {
                let f = unsafe {
                    libc::shm_open(
                        c_name.as_ptr(),
                        libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                        perms as libc::c_uint,
                    )
                };
                if f != -1 {
                    (f, true)
                } else {
                    let e = io::Error::last_os_error();
                    if e.raw_os_error() != Some(libc::EEXIST) {
                        return Err(e);
                    }
                    let f2 = unsafe {
                        libc::shm_open(c_name.as_ptr(), libc::O_RDWR, perms as libc::c_uint)
                    };
                    if f2 == -1 {
                        return Err(io::Error::last_os_error());
                    }
                    (f2, false)
                }
            }
        };

        unsafe { libc::fchmod(fd, perms) };

        if need_truncate {
            let ret = unsafe { libc::ftruncate(fd, total as libc::off_t) };
            if ret != 0 {
                let err = io::Error::last_os_error();
                unsafe { libc::close(fd) };
                return Err(err);
            }
        }

        let mem = unsafe {
            libc::mmap(
                ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        unsafe { libc::close(fd) };
        if mem == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        let prev = unsafe { ref_counter(mem as *mut u8, total).fetch_add(1, Ordering::AcqRel) };

        Ok(Self {
            mem: mem as *mut u8,
            size: total,
            user_size: size,
            name: posix,
            prev_ref: prev,
        })
    }

    /// Map an existing named segment at its full on-disk size (fstat).
    /// Used by consumers that do not know the creator's size up front.
    pub fn open_existing(name: &str) -> io::Result<Self> {
        if name.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "name is empty"));
        }
        let posix = posix_name(name);
        let c_name = CString::new(posix.as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0o666 as libc::c_uint) };
        if fd == -1 {
            return Err(io::Error::last_os_error());
        }
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd, &mut st) } != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }
        let total = st.st_size as usize;
        if total <= std::mem::size_of::<AtomicI32>() {
            unsafe { libc::close(fd) };
            return Err(io::Error::new(io::ErrorKind::InvalidData, "segment too small"));
        }

        let mem = unsafe {
            libc::mmap(
                ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        unsafe { libc::close(fd) };
        if mem == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let prev = unsafe { ref_counter(mem as *mut u8, total).fetch_add(1, Ordering::AcqRel) };

        Ok(Self {
            mem: mem as *mut u8,
            size: total,
            user_size: total - std::mem::size_of::<AtomicI32>(),
            name: posix,
            prev_ref: prev,
        })
    }

    /// Mutable pointer to the start of the user-visible region.
    pub fn get(&self) -> *mut u8 {
        self.mem
    }

    /// Pointer to the start of the user-visible region.
    pub fn as_ptr(&self) -> *const u8 {
        self.mem
    }

    /// User-requested size (the usable portion).
    pub fn user_size(&self) -> usize {
        self.user_size
    }

    /// The counter value before our own increment; 0 means this handle was
    /// the first to map the segment.
    pub fn prev_ref_count(&self) -> i32 {
        self.prev_ref
    }

    /// Current reference count (number of handles mapping this segment).
    pub fn ref_count(&self) -> i32 {
        unsafe { ref_counter(self.mem, self.size).load(Ordering::Acquire) }
    }

    /// The POSIX name used to open the segment.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Remove the backing object for a named segment without an open handle.
    /// Used to clear orphaned segments before re-creation.
    pub fn unlink_by_name(name: &str) {
        if let Ok(c_name) = CString::new(posix_name(name).into_bytes()) {
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
        }
    }
}

impl Drop for ShmHandle {
    fn drop(&mut self) {
        if self.mem.is_null() {
            return;
        }
        let prev = unsafe { ref_counter(self.mem, self.size).fetch_sub(1, Ordering::AcqRel) };
        unsafe { libc::munmap(self.mem as *mut libc::c_void, self.size) };
        if prev <= 1 {
            if let Ok(c_name) = CString::new(self.name.as_bytes()) {
                unsafe { libc::shm_unlink(c_name.as_ptr()) };
            }
        }
    }
}
