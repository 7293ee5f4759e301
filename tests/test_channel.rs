// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Channel semantics: availability states, component extraction with
// overlap regions, ring-wrap iovec splitting and the acknowledgement
// discipline.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tsbnet::channel::{Channel, ChannelError, ChannelState, DataSource};
use tsbnet::microslice::{ms_flags, MicrosliceDescriptor};
use tsbnet::ring::RingBufferView;

const MS: u64 = 1_000_000; // 1 ms in ns
const MD_SIZE: u64 = 32;

struct TestSource {
    write_index: Arc<AtomicU64>,
    read_pointers: Arc<Mutex<(u64, u64)>>, // (data_offset, desc_offset)
}

impl DataSource for TestSource {
    fn desc_write_index(&self) -> u64 {
        self.write_index.load(Ordering::Acquire)
    }

    fn set_read_pointers(&self, data_offset: u64, desc_offset: u64) {
        *self.read_pointers.lock().unwrap() = (data_offset, desc_offset);
    }

    fn transfer_granule(&self) -> u64 {
        1
    }
}

/// Producer half of a test channel: writes descriptors directly.
struct Producer {
    desc: RingBufferView<MicrosliceDescriptor>,
    write_index: Arc<AtomicU64>,
    data_offset: u64,
    read_pointers: Arc<Mutex<(u64, u64)>>,
}

impl Producer {
    fn push(&mut self, idx: u64, size: u32, flags: u16) {
        let w = self.write_index.load(Ordering::Relaxed);
        let md = MicrosliceDescriptor {
            idx,
            size,
            flags,
            offset: self.data_offset,
            ..Default::default()
        };
        unsafe { *self.desc.slot_ptr(w) = md };
        self.data_offset += u64::from(size);
        self.write_index.store(w + 1, Ordering::Release);
    }

    fn read_pointers(&self) -> (u64, u64) {
        *self.read_pointers.lock().unwrap()
    }
}

fn make_channel(
    desc_capacity: usize,
    data_capacity: usize,
    overlap_before_ns: u64,
    overlap_after_ns: u64,
) -> (Channel, Producer) {
    let desc_buf: &'static mut [MicrosliceDescriptor] = Box::leak(
        vec![MicrosliceDescriptor::default(); desc_capacity].into_boxed_slice(),
    );
    let data_buf: &'static mut [u8] = Box::leak(vec![0u8; data_capacity].into_boxed_slice());
    let desc_ptr = desc_buf.as_mut_ptr();
    let data_ptr = data_buf.as_mut_ptr();

    let write_index = Arc::new(AtomicU64::new(0));
    let read_pointers = Arc::new(Mutex::new((0, 0)));

    let source = TestSource {
        write_index: Arc::clone(&write_index),
        read_pointers: Arc::clone(&read_pointers),
    };
    let channel = Channel::new(
        Box::new(source),
        unsafe { RingBufferView::new(desc_ptr, desc_capacity) },
        unsafe { RingBufferView::new(data_ptr, data_capacity) },
        0,
        (desc_capacity as u64) * MD_SIZE,
        overlap_before_ns,
        overlap_after_ns,
        "test".to_owned(),
    );
    let producer = Producer {
        desc: unsafe { RingBufferView::new(desc_ptr, desc_capacity) },
        write_index,
        data_offset: 0,
        read_pointers,
    };
    (channel, producer)
}

// --- availability ---

#[test]
fn empty_ring_is_try_later() {
    let (channel, _) = make_channel(64, 4096, 0, 0);
    assert_eq!(channel.check_availability(0, 10 * MS), ChannelState::TryLater);
}

#[test]
fn window_needs_data_past_the_end() {
    let (channel, mut producer) = make_channel(64, 65536, 0, MS);
    for k in 0..11 {
        producer.push(k * MS, 64, 0);
    }
    // last written idx is 10 ms; the window [0, 10 ms) + 1 ms overlap needs
    // a microslice past 11 ms
    assert_eq!(channel.check_availability(0, 10 * MS), ChannelState::TryLater);
    producer.push(12 * MS, 64, 0);
    assert_eq!(channel.check_availability(0, 10 * MS), ChannelState::Ok);
}

#[test]
fn stalled_producer_stays_try_later() {
    let (channel, mut producer) = make_channel(64, 65536, 0, 0);
    for k in 0..6 {
        producer.push(k * MS, 64, 0);
    }
    // producer stopped at 5 ms; a window starting at 10 ms can never be cut
    assert_eq!(
        channel.check_availability(10 * MS, 10 * MS),
        ChannelState::TryLater
    );
}

#[test]
fn window_before_buffered_data_fails() {
    let (mut channel, mut producer) = make_channel(64, 65536, 0, 0);
    for k in 10..30 {
        producer.push(k * MS, 64, 0);
    }
    channel.ack_before(20 * MS).unwrap();
    assert_eq!(
        channel.check_availability(10 * MS, 5 * MS),
        ChannelState::Failed
    );
}

// --- component extraction ---

#[test]
fn clean_path_component_counts() {
    // duration 10 ms, overlap_before 0, overlap_after 1 ms; one microslice
    // per ms of 64 bytes each
    let (channel, mut producer) = make_channel(64, 65536, 0, MS);
    for k in 0..35 {
        producer.push(k * MS, 64, 0);
    }

    for ts in 0..3u64 {
        let start = ts * 10 * MS;
        assert_eq!(channel.check_availability(start, 10 * MS), ChannelState::Ok);
        let component = channel.get_descriptor(start, 10 * MS).unwrap();
        assert_eq!(component.num_microslices(), 11);
        assert_eq!(component.descriptors_size(), 11 * MD_SIZE);
        assert_eq!(component.contents_size(), 11 * 64);
        assert!(!component.missing_microslices);
    }

    // the first timeslice covers 704 content bytes
    let first = channel.get_descriptor(0, 10 * MS).unwrap();
    assert_eq!(first.contents_size(), 704);
}

#[test]
fn successive_components_are_time_ordered() {
    let (channel, mut producer) = make_channel(128, 1 << 20, 0, MS);
    for k in 0..100 {
        producer.push(k * MS, 64, 0);
    }
    let mut last_start_offset = 0;
    for ts in 0..8u64 {
        let c = channel.get_descriptor(ts * 10 * MS, 10 * MS).unwrap();
        assert!(c.descriptors[0].offset >= last_start_offset);
        last_start_offset = c.descriptors[0].offset;
    }
}

#[test]
fn overlap_before_extends_the_window() {
    let (channel, mut producer) = make_channel(64, 65536, 2 * MS, MS);
    for k in 0..30 {
        producer.push(k * MS, 64, 0);
    }
    // window [10 ms - 2 ms, 20 ms + 1 ms): microslices 8..=20
    let c = channel.get_descriptor(10 * MS, 10 * MS).unwrap();
    assert_eq!(c.num_microslices(), 13);
}

#[test]
fn overflow_flag_aggregates_into_component() {
    let (channel, mut producer) = make_channel(64, 65536, 0, MS);
    for k in 0..15 {
        let flags = if k == 4 { ms_flags::OVERFLOW_FLIM } else { 0 };
        producer.push(k * MS, 64, flags);
    }
    let c = channel.get_descriptor(0, 10 * MS).unwrap();
    assert!(c.missing_microslices);
}

#[test]
fn zero_length_microslice_is_legal() {
    let (channel, mut producer) = make_channel(64, 65536, 0, MS);
    for k in 0..15 {
        let size = if k == 3 { 0 } else { 64 };
        producer.push(k * MS, size, 0);
    }
    let c = channel.get_descriptor(0, 10 * MS).unwrap();
    assert_eq!(c.num_microslices(), 11);
    assert_eq!(c.contents_size(), 10 * 64);
}

#[test]
fn unavailable_window_is_out_of_range() {
    let (channel, mut producer) = make_channel(64, 65536, 0, 0);
    for k in 0..5 {
        producer.push(k * MS, 64, 0);
    }
    let err = channel.get_descriptor(100 * MS, 10 * MS).unwrap_err();
    assert!(matches!(err, ChannelError::OutOfRange { .. }));
}

// --- ring wrap (two iovecs) ---

#[test]
fn data_ring_wrap_yields_two_content_iovecs() {
    // 64-byte data ring; after releasing the first round, 40 contiguous
    // bytes spread across two microslices wrap the ring end
    let (mut channel, mut producer) = make_channel(64, 64, 0, MS);
    producer.push(0, 24, 0); // offset 0
    producer.push(MS, 24, 0); // offset 24
    channel.ack_before(MS).unwrap(); // frees the first 24 bytes

    producer.push(2 * MS, 20, 0); // offset 48, wraps at 64
    producer.push(3 * MS, 20, 0); // offset 68
    producer.push(10 * MS, 0, 0);

    // window covering both wrapping microslices
    let c = channel.get_descriptor(2 * MS, 2 * MS).unwrap();
    assert_eq!(c.num_microslices(), 2);
    assert_eq!(c.contents.len(), 2);
    let total: u64 = c.contents.iter().map(|v| v.len).sum();
    assert_eq!(total, 40);
    // both pieces stay inside the data ring
    let data_base = 64 * MD_SIZE;
    for iov in &c.contents {
        assert!(iov.offset >= data_base);
        assert!(iov.offset + iov.len <= data_base + 64);
    }
}

#[test]
fn desc_ring_wrap_yields_two_descriptor_iovecs() {
    let (mut channel, mut producer) = make_channel(8, 1 << 16, 0, MS);
    // fill and release rounds so the live window wraps the 8-entry ring
    for k in 0..6 {
        producer.push(k * MS, 16, 0);
    }
    channel.ack_before(5 * MS).unwrap();
    for k in 6..12 {
        producer.push(k * MS, 16, 0);
    }
    // live range is indices 5..12 (wrapping at 8)
    let c = channel.get_descriptor(6 * MS, 3 * MS).unwrap();
    assert_eq!(c.descriptors.len(), 2);
    let total: u64 = c.descriptors.iter().map(|v| v.len).sum();
    assert_eq!(total, c.num_microslices() * MD_SIZE);
}

// --- acknowledgement ---

#[test]
fn ack_releases_only_older_microslices() {
    let (mut channel, mut producer) = make_channel(64, 65536, 0, 0);
    for k in 0..20 {
        producer.push(k * MS, 64, 0);
    }
    channel.ack_before(10 * MS).unwrap();
    // the microslice at exactly 10 ms is kept (read index points to it)
    let (data_offset, desc_offset) = producer.read_pointers();
    assert_eq!(desc_offset, 10 * MD_SIZE);
    assert_eq!(data_offset, 10 * 64);
}

#[test]
fn ack_respects_overlap_before() {
    let (mut channel, mut producer) = make_channel(64, 65536, 2 * MS, 0);
    for k in 0..20 {
        producer.push(k * MS, 64, 0);
    }
    channel.ack_before(10 * MS).unwrap();
    // only microslices with idx <= 10 ms - 2 ms are released
    let (_, desc_offset) = producer.read_pointers();
    assert_eq!(desc_offset, 8 * MD_SIZE);
}

#[test]
fn ack_never_moves_backward() {
    let (mut channel, mut producer) = make_channel(64, 65536, 0, 0);
    for k in 0..20 {
        producer.push(k * MS, 64, 0);
    }
    channel.ack_before(15 * MS).unwrap();
    let after_first = producer.read_pointers();
    // an older ack is a no-op, not a regression
    channel.ack_before(5 * MS).unwrap();
    assert_eq!(producer.read_pointers(), after_first);
}

#[test]
fn ack_with_no_new_data_is_noop() {
    let (mut channel, _) = make_channel(64, 65536, 0, 0);
    channel.ack_before(100 * MS).unwrap();
}

#[test]
fn monitoring_tracks_utilization_and_latest_time() {
    let (mut channel, mut producer) = make_channel(64, 65536, 0, 0);
    let empty = channel.get_monitoring();
    assert_eq!(empty.desc_buffer_utilization, 0.0);
    assert!(empty.latest_microslice_time_ns.is_none());

    for k in 0..32 {
        producer.push(k * MS, 64, 0);
    }
    let mon = channel.get_monitoring();
    assert_eq!(mon.desc_buffer_utilization, 0.5);
    assert_eq!(mon.latest_microslice_time_ns, Some(31 * MS));

    channel.ack_before(16 * MS).unwrap();
    let mon = channel.get_monitoring();
    assert_eq!(mon.desc_buffer_utilization, 0.25);
}
