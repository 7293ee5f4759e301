// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Pattern-generator channel: a software producer with the same ring
// interface as the DMA engine. One thread per channel stamps synthetic
// microslices at a fixed time spacing. When a ring is full the
// microslice is dropped and the next successful descriptor carries the
// overflow flag.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, warn};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::channel::DataSource;
use crate::microslice::{ms_flags, MicrosliceDescriptor, HDR_ID_STANDARD, HDR_VER_STANDARD};
use crate::ring::RingBufferView;
use crate::system::current_time_ns;

/// `--pgen-flags` bit 0: fill the content with the test pattern.
pub const PGEN_FLAG_PATTERN: u32 = 1 << 0;
/// `--pgen-flags` bit 1: randomise content sizes around the nominal size.
pub const PGEN_FLAG_RANDOM_SIZES: u32 = 1 << 1;

struct ReadState {
    desc_read_index: u64,
    data_read_index: u64,
    desc_offset: u64,
    data_offset: u64,
}

struct PgenShared {
    desc_buffer: RingBufferView<MicrosliceDescriptor>,
    data_buffer: RingBufferView<u8>,
    desc_write_index: AtomicU64,
    read: Mutex<ReadState>,
}

/// A pattern-generator producer for one channel.
pub struct PgenChannel {
    shared: Arc<PgenShared>,
    stop: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl PgenChannel {
    pub fn new(
        desc_buffer: RingBufferView<MicrosliceDescriptor>,
        data_buffer: RingBufferView<u8>,
        channel_index: u32,
        microslice_duration_ns: u64,
        microslice_size: usize,
        flags: u32,
    ) -> Self {
        assert!(microslice_duration_ns > 0);
        let shared = Arc::new(PgenShared {
            desc_buffer,
            data_buffer,
            desc_write_index: AtomicU64::new(0),
            read: Mutex::new(ReadState {
                desc_read_index: 0,
                data_read_index: 0,
                desc_offset: 0,
                data_offset: 0,
            }),
        });
        let stop = Arc::new(AtomicBool::new(false));

        let thread = {
            let shared = Arc::clone(&shared);
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name(format!("pgen-{channel_index}"))
                .spawn(move || {
                    generator_loop(
                        &shared,
                        &stop,
                        channel_index,
                        microslice_duration_ns,
                        microslice_size,
                        flags,
                    )
                })
                .expect("failed to spawn pgen thread")
        };

        Self {
            shared,
            stop,
            thread: Some(thread),
        }
    }

    /// The producer interface handed to the consuming channel.
    pub fn source(&self) -> Box<dyn DataSource> {
        Box::new(PgenSource {
            shared: Arc::clone(&self.shared),
        })
    }
}

impl Drop for PgenChannel {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

struct PgenSource {
    shared: Arc<PgenShared>,
}

impl DataSource for PgenSource {
    fn desc_write_index(&self) -> u64 {
        self.shared.desc_write_index.load(Ordering::Acquire)
    }

    fn set_read_pointers(&self, data_offset: u64, desc_offset: u64) {
        let mut guard = self.shared.read.lock().unwrap();
        let read = &mut *guard;

        // Offsets wrap at the ring size; accumulate the deltas to keep
        // monotonic read indices.
        fn advance(new_offset: u64, offset: &mut u64, ring_bytes: u64, index: &mut u64, elem: u64) {
            let diff = if new_offset >= *offset {
                new_offset - *offset
            } else {
                new_offset + ring_bytes - *offset
            };
            *index += diff / elem;
            *offset = new_offset;
        }

        let desc_bytes = self.shared.desc_buffer.bytes() as u64;
        let md_size = std::mem::size_of::<MicrosliceDescriptor>() as u64;
        advance(
            desc_offset,
            &mut read.desc_offset,
            desc_bytes,
            &mut read.desc_read_index,
            md_size,
        );

        let data_bytes = self.shared.data_buffer.bytes() as u64;
        advance(
            data_offset,
            &mut read.data_offset,
            data_bytes,
            &mut read.data_read_index,
            1,
        );
    }

    fn transfer_granule(&self) -> u64 {
        1
    }
}

fn generator_loop(
    shared: &PgenShared,
    stop: &AtomicBool,
    channel_index: u32,
    microslice_duration_ns: u64,
    microslice_size: usize,
    flags: u32,
) {
    let mut rng = SmallRng::seed_from_u64(u64::from(channel_index));
    let mut next_idx = current_time_ns() / microslice_duration_ns * microslice_duration_ns;
    let mut data_write_index: u64 = 0;
    let mut overflow_pending = false;
    let mut dropped: u64 = 0;

    let sleep = Duration::from_nanos((microslice_duration_ns / 2).clamp(100_000, 10_000_000));

    debug!("pgen-{channel_index}| generator started, first microslice at {next_idx}");

    while !stop.load(Ordering::Relaxed) {
        let now = current_time_ns();
        // A microslice is published once its time window has fully elapsed.
        while next_idx + microslice_duration_ns <= now {
            let size = if flags & PGEN_FLAG_RANDOM_SIZES != 0 {
                rng.gen_range(microslice_size / 2..=microslice_size * 3 / 2)
            } else {
                microslice_size
            };

            if emit_microslice(
                shared,
                channel_index,
                next_idx,
                size,
                flags,
                &mut data_write_index,
                &mut overflow_pending,
            ) {
                if dropped > 0 {
                    warn!("pgen-{channel_index}| dropped {dropped} microslices on full buffer");
                    dropped = 0;
                }
            } else {
                overflow_pending = true;
                dropped += 1;
            }
            next_idx += microslice_duration_ns;
        }
        thread::sleep(sleep);
    }

    debug!("pgen-{channel_index}| generator stopped");
}

/// Write one microslice. Returns `false` without side effects when either
/// ring lacks space.
fn emit_microslice(
    shared: &PgenShared,
    channel_index: u32,
    idx: u64,
    size: usize,
    flags: u32,
    data_write_index: &mut u64,
    overflow_pending: &mut bool,
) -> bool {
    let desc_write = shared.desc_write_index.load(Ordering::Relaxed);
    let (desc_read, data_read) = {
        let read = shared.read.lock().unwrap();
        (read.desc_read_index, read.data_read_index)
    };

    if desc_write - desc_read >= shared.desc_buffer.capacity() as u64 {
        return false;
    }
    if *data_write_index + size as u64 - data_read > shared.data_buffer.bytes() as u64 {
        return false;
    }

    let mut md_flags: u16 = 0;
    let mut crc: u32 = 0;

    if flags & PGEN_FLAG_PATTERN != 0 {
        let mut hasher = crc32fast::Hasher::new();
        for i in 0..size {
            let byte = (i & 0xFF) as u8 ^ (idx & 0xFF) as u8;
            unsafe {
                *shared.data_buffer.slot_ptr(*data_write_index + i as u64) = byte;
            }
            hasher.update(&[byte]);
        }
        crc = hasher.finalize();
        md_flags |= ms_flags::CRC_VALID;
    }
    if *overflow_pending {
        md_flags |= ms_flags::OVERFLOW_FLIM;
        *overflow_pending = false;
    }

    let md = MicrosliceDescriptor {
        hdr_id: HDR_ID_STANDARD,
        hdr_ver: HDR_VER_STANDARD,
        eq_id: 0xE000 | channel_index as u16,
        flags: md_flags,
        sys_id: 0xF0,
        sys_ver: 1,
        idx,
        crc,
        size: size as u32,
        offset: *data_write_index,
    };
    unsafe {
        *shared.desc_buffer.slot_ptr(desc_write) = md;
    }
    *data_write_index += size as u64;
    shared.desc_write_index.store(desc_write + 1, Ordering::Release);
    true
}
