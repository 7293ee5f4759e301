// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Pattern generator: descriptor stream shape, pacing, and the overflow
// flag after a full ring.

use std::time::{Duration, Instant};

use tsbnet::channel::DataSource;
use tsbnet::microslice::{ms_flags, MicrosliceDescriptor, HDR_ID_STANDARD, HDR_VER_STANDARD};
use tsbnet::pgen::{PgenChannel, PGEN_FLAG_PATTERN};
use tsbnet::ring::RingBufferView;

const DEADLINE: Duration = Duration::from_secs(10);
const MD_SIZE: u64 = 32;

struct Rig {
    pgen: PgenChannel,
    source: Box<dyn DataSource>,
    desc: RingBufferView<MicrosliceDescriptor>,
}

fn make_rig(desc_capacity: usize, data_capacity: usize, ms_size: usize, flags: u32) -> Rig {
    let desc_buf: &'static mut [MicrosliceDescriptor] = Box::leak(
        vec![MicrosliceDescriptor::default(); desc_capacity].into_boxed_slice(),
    );
    let data_buf: &'static mut [u8] = Box::leak(vec![0u8; data_capacity].into_boxed_slice());
    let desc_ptr = desc_buf.as_mut_ptr();
    let data_ptr = data_buf.as_mut_ptr();

    let pgen = PgenChannel::new(
        unsafe { RingBufferView::new(desc_ptr, desc_capacity) },
        unsafe { RingBufferView::new(data_ptr, data_capacity) },
        0,
        1_000_000, // 1 ms spacing
        ms_size,
        flags,
    );
    let source = pgen.source();
    Rig {
        pgen,
        source,
        desc: unsafe { RingBufferView::new(desc_ptr, desc_capacity) },
    }
}

fn wait_for_writes(rig: &Rig, count: u64) {
    let deadline = Instant::now() + DEADLINE;
    while rig.source.desc_write_index() < count {
        assert!(Instant::now() < deadline, "generator too slow");
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn descriptors_are_well_formed_and_time_ordered() {
    let rig = make_rig(256, 1 << 20, 128, PGEN_FLAG_PATTERN);
    wait_for_writes(&rig, 8);

    let write = rig.source.desc_write_index();
    let mut last_idx = 0;
    let mut expected_offset = 0;
    for i in 0..write {
        let md = *rig.desc.at(i);
        assert_eq!(md.hdr_id, HDR_ID_STANDARD);
        assert_eq!(md.hdr_ver, HDR_VER_STANDARD);
        assert_eq!(md.size, 128);
        assert_eq!(md.offset, expected_offset);
        assert_ne!(md.flags & ms_flags::CRC_VALID, 0);
        if i > 0 {
            assert!(md.idx > last_idx, "time index must increase");
            assert_eq!(md.idx - last_idx, 1_000_000);
        }
        last_idx = md.idx;
        expected_offset += u64::from(md.size);
    }
    drop(rig.pgen);
}

#[test]
fn full_ring_sets_overflow_on_the_next_microslice() {
    // 8 descriptor slots and no acknowledgements: the generator must drop
    let rig = make_rig(8, 1 << 16, 64, 0);
    wait_for_writes(&rig, 8);

    // let it run against the full ring for a few microslice periods
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(rig.source.desc_write_index(), 8);

    // release all but the newest descriptor, the way the consumer does
    let write = rig.source.desc_write_index();
    let keep = write - 1;
    let desc_offset = (keep & 7) * MD_SIZE;
    let kept_md = *rig.desc.at(keep);
    let data_offset = kept_md.offset & ((1 << 16) - 1);
    rig.source.set_read_pointers(data_offset, desc_offset);

    // the next successful microslice carries the overflow flag
    wait_for_writes(&rig, write + 1);
    let md = *rig.desc.at(write);
    assert_ne!(md.flags & ms_flags::OVERFLOW_FLIM, 0);

    // and the one after it is clean again
    wait_for_writes(&rig, write + 2);
    let md = *rig.desc.at(write + 1);
    assert_eq!(md.flags & ms_flags::OVERFLOW_FLIM, 0);
}
