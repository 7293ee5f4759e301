// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// One input channel: a descriptor ring and a data ring filled by a DMA
// engine or pattern generator, presented as a queryable, time-indexed
// microslice stream. The consumer acknowledges processed time ranges;
// backpressure happens by not advancing the producer's read pointers.

use log::trace;
use thiserror::Error;

use crate::microslice::MicrosliceDescriptor;
use crate::ring::RingBufferView;
use crate::subtimeslice::{ShmIovec, StComponentHandle};

/// Producer side of a channel: the minimal interface a DMA engine or
/// pattern-generator thread exposes to the consumer.
pub trait DataSource: Send {
    /// Current descriptor write index (single acquire load).
    fn desc_write_index(&self) -> u64;

    /// Advance the software read pointers, as byte offsets within the data
    /// and descriptor rings. Space before these offsets may be reused.
    fn set_read_pointers(&self, data_offset: u64, desc_offset: u64);

    /// Transfer granule of the engine in bytes (power of two). The data
    /// read pointer is rounded down to this, so it may lag one granule.
    fn transfer_granule(&self) -> u64;
}

/// Availability of a time window on this channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// The complete window is buffered.
    Ok,
    /// Data past the window end has not arrived yet.
    TryLater,
    /// The window start is older than what is still buffered.
    Failed,
}

/// Snapshot for telemetry.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChannelMonitoring {
    pub desc_buffer_utilization: f32,
    pub data_buffer_utilization: f32,
    pub latest_microslice_time_ns: Option<u64>,
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("component [{first_ms_time}, {last_ms_time}) out of buffered range")]
    OutOfRange {
        first_ms_time: u64,
        last_ms_time: u64,
    },
    #[error("new read index {new} is smaller than the current read index {current}")]
    ReadIndexRegression { new: u64, current: u64 },
}

/// Consumer view of one input channel.
pub struct Channel {
    source: Box<dyn DataSource>,
    desc_buffer: RingBufferView<MicrosliceDescriptor>,
    data_buffer: RingBufferView<u8>,
    /// Byte offset of the descriptor ring within the arena segment.
    desc_arena_offset: u64,
    /// Byte offset of the data ring within the arena segment.
    data_arena_offset: u64,
    overlap_before_ns: u64,
    overlap_after_ns: u64,
    cached_read_index: u64,
    name: String,
}

impl Channel {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: Box<dyn DataSource>,
        desc_buffer: RingBufferView<MicrosliceDescriptor>,
        data_buffer: RingBufferView<u8>,
        desc_arena_offset: u64,
        data_arena_offset: u64,
        overlap_before_ns: u64,
        overlap_after_ns: u64,
        name: String,
    ) -> Self {
        Self {
            source,
            desc_buffer,
            data_buffer,
            desc_arena_offset,
            data_arena_offset,
            overlap_before_ns,
            overlap_after_ns,
            cached_read_index: 0,
            name,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Release every microslice with `idx <= time_ns - overlap_before`.
    ///
    /// The read index moves to the last such microslice, which stays
    /// buffered; it never moves backward. A no-op when nothing new is
    /// releasable.
    pub fn ack_before(&mut self, time_ns: u64) -> Result<(), ChannelError> {
        let write_index = self.source.desc_write_index();
        let read_index = self.cached_read_index;
        let time = time_ns.saturating_sub(self.overlap_before_ns);

        // first index in [read, write) with idx > time
        let it = self
            .desc_buffer
            .partition_point(read_index, write_index, |d| d.idx <= time);

        trace!(
            "{}| ack before: searching for time {} in range {} - {}, candidate {}",
            self.name,
            time,
            read_index,
            write_index,
            it
        );

        if it != read_index {
            self.set_read_index(it - 1)?;
        }
        Ok(())
    }

    /// Whether the window `[start - overlap_before, start + duration +
    /// overlap_after)` can be cut out of the ring right now.
    pub fn check_availability(&self, start_time_ns: u64, duration_ns: u64) -> ChannelState {
        let write_index = self.source.desc_write_index();
        let read_index = self.cached_read_index;

        let first_ms_time = start_time_ns.saturating_sub(self.overlap_before_ns);
        let last_ms_time = start_time_ns + duration_ns + self.overlap_after_ns;

        if write_index == read_index {
            trace!("{}| write and read index equal, no data available", self.name);
            return ChannelState::TryLater;
        }
        if first_ms_time < self.desc_buffer.at(read_index).idx {
            trace!(
                "{}| failed: begin want={} have={}",
                self.name,
                first_ms_time,
                self.desc_buffer.at(read_index).idx
            );
            return ChannelState::Failed;
        }
        if self.desc_buffer.at(write_index - 1).idx <= last_ms_time {
            trace!(
                "{}| try later: end want={} have={}",
                self.name,
                last_ms_time,
                self.desc_buffer.at(write_index - 1).idx
            );
            return ChannelState::TryLater;
        }
        ChannelState::Ok
    }

    /// Cut the component for the given window out of the rings.
    ///
    /// The returned handle references the ring memory through arena
    /// offsets; the ranges stay valid until [`ack_before`] passes them.
    /// Call only after [`check_availability`] returned `Ok`.
    pub fn get_descriptor(
        &self,
        start_time_ns: u64,
        duration_ns: u64,
    ) -> Result<StComponentHandle, ChannelError> {
        let (first, last) = self.find_component(start_time_ns, duration_ns)?;
        debug_assert!(first < last);

        let md_size = std::mem::size_of::<MicrosliceDescriptor>() as u64;
        let descriptors = self.split_range(
            self.desc_arena_offset,
            self.desc_buffer.offset_bytes(first),
            self.desc_buffer.offset_bytes(last),
            (last - first) * md_size,
            self.desc_buffer.bytes() as u64,
        );

        let data_begin = self.desc_buffer.at(first).offset;
        let last_md = self.desc_buffer.at(last - 1);
        let data_end = last_md.offset + last_md.size as u64;
        let contents = self.split_range(
            self.data_arena_offset,
            self.data_buffer.offset_bytes(data_begin),
            self.data_buffer.offset_bytes(data_end),
            data_end - data_begin,
            self.data_buffer.bytes() as u64,
        );

        let mut missing_microslices = false;
        for i in first..last {
            if self.desc_buffer.at(i).overflow_flim() {
                missing_microslices = true;
                break;
            }
        }

        Ok(StComponentHandle {
            descriptors,
            contents,
            missing_microslices,
        })
    }

    /// Ring utilisations and the latest microslice time.
    pub fn get_monitoring(&self) -> ChannelMonitoring {
        let write_index = self.source.desc_write_index();
        let read_index = self.cached_read_index;
        if write_index == read_index {
            return ChannelMonitoring::default();
        }

        let desc_used = write_index - read_index;
        let last_md = self.desc_buffer.at(write_index - 1);
        let data_used = last_md.offset + last_md.size as u64 - self.desc_buffer.at(read_index).offset;

        ChannelMonitoring {
            desc_buffer_utilization: desc_used as f32 / self.desc_buffer.capacity() as f32,
            data_buffer_utilization: data_used as f32 / self.data_buffer.bytes() as f32,
            latest_microslice_time_ns: Some(last_md.idx),
        }
    }

    /// Microslice index range `[first, last)` covering the window.
    fn find_component(
        &self,
        start_time_ns: u64,
        duration_ns: u64,
    ) -> Result<(u64, u64), ChannelError> {
        let write_index = self.source.desc_write_index();
        let read_index = self.cached_read_index;

        let first_ms_time = start_time_ns.saturating_sub(self.overlap_before_ns);
        let last_ms_time = start_time_ns + duration_ns + self.overlap_after_ns;
        let out_of_range = || ChannelError::OutOfRange {
            first_ms_time,
            last_ms_time,
        };

        // last microslice with idx <= first_ms_time
        let first_it = self
            .desc_buffer
            .partition_point(read_index, write_index, |d| d.idx <= first_ms_time);
        if first_it == read_index || first_it == write_index {
            return Err(out_of_range());
        }
        let first = first_it - 1;

        // first microslice with idx >= last_ms_time (exclusive end)
        let last = self
            .desc_buffer
            .partition_point(first, write_index, |d| d.idx < last_ms_time);
        if last == read_index || last == write_index {
            return Err(out_of_range());
        }

        trace!(
            "{}| find_component: want [{}, {}), idx [{}, {}), {} microslices",
            self.name,
            first_ms_time,
            last_ms_time,
            first,
            last,
            last - first
        );

        Ok((first, last))
    }

    /// One iovec if `[begin_off, begin_off + len)` is contiguous within a
    /// ring of `ring_bytes`, two if it wraps. `begin_off`/`end_off` are the
    /// masked byte offsets of the range boundaries.
    fn split_range(
        &self,
        arena_base: u64,
        begin_off: u64,
        end_off: u64,
        len: u64,
        ring_bytes: u64,
    ) -> Vec<ShmIovec> {
        if len == 0 {
            return Vec::new();
        }
        if begin_off < end_off {
            vec![ShmIovec {
                offset: arena_base + begin_off,
                len,
            }]
        } else {
            vec![
                ShmIovec {
                    offset: arena_base + begin_off,
                    len: ring_bytes - begin_off,
                },
                ShmIovec {
                    offset: arena_base,
                    len: end_off,
                },
            ]
        }
    }

    /// Advance the cached read index and push the matching byte offsets to
    /// the producer. The data offset is rounded down to the transfer
    /// granule, so it may hang one granule behind.
    fn set_read_index(&mut self, read_index: u64) -> Result<(), ChannelError> {
        if read_index == self.cached_read_index {
            trace!("{}| updating read_index, nothing to do", self.name);
            return Ok(());
        }
        if read_index < self.cached_read_index {
            return Err(ChannelError::ReadIndexRegression {
                new: read_index,
                current: self.cached_read_index,
            });
        }

        let prev = self.desc_buffer.at(read_index - 1);
        let data_read_index = prev.offset + prev.size as u64;

        let desc_offset = self.desc_buffer.offset_bytes(read_index);
        let mut data_offset = self.data_buffer.offset_bytes(data_read_index);
        data_offset &= !(self.source.transfer_granule() - 1);

        trace!(
            "{}| updating read_index: desc {} data offset {}",
            self.name,
            read_index,
            data_offset
        );

        self.source.set_read_pointers(data_offset, desc_offset);
        self.cached_read_index = read_index;
        Ok(())
    }
}
