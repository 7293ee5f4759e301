// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Entry node daemon: presents DMA or pattern-generated channel rings,
// builds subtimeslices at every timeslice boundary and serves them to
// timeslice builders under the control of the cluster scheduler.

use std::process::ExitCode;
use std::sync::Arc;
use std::thread;

use clap::Parser;
use log::{error, info, warn};

use tsbnet::arena::{page_size, ShmArena, ARENA_DATA_START};
use tsbnet::channel::Channel;
use tsbnet::config::{merge_config_file, ByteSize, CommonOpts, DurationNs, PciAddress};
use tsbnet::microslice::MicrosliceDescriptor;
use tsbnet::monitor::Monitor;
use tsbnet::pgen::PgenChannel;
use tsbnet::ring::RingBufferView;
use tsbnet::sender::{ArenaRef, StSender, DEFAULT_SENDER_PORT};
use tsbnet::stbuilder::{SenderInfo, StBuilder};
use tsbnet::system::{current_hostname, StopToken};

/// Subtimeslice construction and sender daemon.
#[derive(Debug, Parser)]
#[command(name = "tsc_server", version, args_override_self = true)]
struct Options {
    #[command(flatten)]
    common: CommonOpts,

    /// Port to accept timeslice builder connections on.
    #[arg(long, default_value_t = DEFAULT_SENDER_PORT)]
    listen_port: u16,

    /// Timeslice scheduler address (`host[:port]`).
    #[arg(long, value_name = "ADDRESS")]
    tssched_address: String,

    /// Timeslice duration (suffix ns|us|ms|s).
    #[arg(long, default_value = "10ms")]
    timeslice_duration: DurationNs,

    /// Overlap region before the timeslice start.
    #[arg(long, default_value = "0ns")]
    overlap_before: DurationNs,

    /// Overlap region after the timeslice end.
    #[arg(long, default_value = "1ms")]
    overlap_after: DurationNs,

    /// Wait this long for late channels before a timeslice goes out
    /// incomplete.
    #[arg(long, default_value = "10ms")]
    timeout: DurationNs,

    /// Content buffer size per channel (SI or binary suffixes, rounded
    /// down to a power of two).
    #[arg(long, default_value = "128Mi")]
    data_buffer_size: ByteSize,

    /// Descriptor buffer size per channel (rounded down to a power-of-two
    /// entry count).
    #[arg(long, default_value = "4Mi")]
    desc_buffer_size: ByteSize,

    /// Number of pattern generator channels.
    #[arg(long, default_value_t = 1)]
    pgen_channels: u32,

    /// Microslice spacing of the pattern generator.
    #[arg(long, default_value = "1ms")]
    pgen_microslice_duration: DurationNs,

    /// Nominal microslice content size of the pattern generator.
    #[arg(long, default_value_t = 1024)]
    pgen_microslice_size: usize,

    /// Pattern generator flags (bit 0: pattern, bit 1: randomise sizes).
    #[arg(long, default_value_t = 1)]
    pgen_flags: u32,

    /// Name of the shared memory segment holding the channel buffers.
    #[arg(long, default_value = "tsc_server")]
    shm: String,

    /// PCI address (`BB:DD.F`) of the readout device.
    #[arg(long, value_name = "ADDR")]
    pci_addr: Option<PciAddress>,
}

fn main() -> ExitCode {
    let args = match merge_config_file(std::env::args().collect()) {
        Ok(a) => a,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    let opt = match Options::try_parse_from(args) {
        Ok(o) => o,
        Err(e) => {
            let _ = e.print();
            return ExitCode::FAILURE;
        }
    };

    let level = match tsbnet::logging::parse_level(&opt.common.log_level) {
        Some(l) => l,
        None => {
            eprintln!("invalid log level '{}'", opt.common.log_level);
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = tsbnet::logging::init(level, opt.common.log_file.as_deref(), opt.common.log_syslog)
    {
        eprintln!("failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    match run(opt) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(opt: Options) -> Result<(), Box<dyn std::error::Error>> {
    if opt.timeslice_duration.ns() == 0 {
        return Err("timeslice duration must be positive".into());
    }
    if opt.pgen_microslice_duration.ns() == 0 {
        return Err("pattern generator microslice duration must be positive".into());
    }

    let stop = StopToken::new();
    stop.register_signals()?;

    let monitor = match &opt.common.monitor {
        Some(uri) => Some(Arc::new(Monitor::new(uri)?)),
        None => None,
    };

    if let Some(addr) = opt.pci_addr {
        warn!("no device driver backend in this build, ignoring readout device {addr}");
    }
    if opt.pgen_channels == 0 {
        return Err("no input channels configured (use --pgen-channels)".into());
    }

    // Ring sizes must be powers of two.
    let md_size = std::mem::size_of::<MicrosliceDescriptor>();
    let data_bytes = prev_power_of_two(opt.data_buffer_size.bytes() as usize)
        .ok_or("data buffer size too small")?;
    let desc_entries = prev_power_of_two(opt.desc_buffer_size.bytes() as usize / md_size)
        .ok_or("descriptor buffer size too small")?;

    let page = page_size();
    let per_channel = data_bytes + desc_entries * md_size + 2 * page;
    let shm_size = per_channel * opt.pgen_channels as usize + 4096;
    let mut arena = ShmArena::create(&opt.shm, shm_size)?;

    let mut pgens: Vec<PgenChannel> = Vec::new();
    let mut channels: Vec<Channel> = Vec::new();
    for i in 0..opt.pgen_channels {
        let desc_offset = arena
            .allocate_aligned(desc_entries * md_size, page)
            .ok_or("shared memory exhausted while allocating channel buffers")?;
        let data_offset = arena
            .allocate_aligned(data_bytes, page)
            .ok_or("shared memory exhausted while allocating channel buffers")?;

        let desc_ptr = arena.ptr_at(desc_offset) as *mut MicrosliceDescriptor;
        let data_ptr = arena.ptr_at(data_offset);

        let pgen = PgenChannel::new(
            unsafe { RingBufferView::new(desc_ptr, desc_entries) },
            unsafe { RingBufferView::new(data_ptr, data_bytes) },
            i,
            opt.pgen_microslice_duration.ns(),
            opt.pgen_microslice_size,
            opt.pgen_flags,
        );
        channels.push(Channel::new(
            pgen.source(),
            unsafe { RingBufferView::new(desc_ptr, desc_entries) },
            unsafe { RingBufferView::new(data_ptr, data_bytes) },
            desc_offset,
            data_offset,
            opt.overlap_before.ns(),
            opt.overlap_after.ns(),
            format!("pgen-{i}"),
        ));
        pgens.push(pgen);
    }
    info!("{} pattern generator channels enabled", channels.len());

    let sender_info = SenderInfo {
        address: current_hostname(),
        port: opt.listen_port,
    };
    let arena_ref = unsafe { ArenaRef::new(arena.ptr_at(0), ARENA_DATA_START + arena.capacity()) };
    let (st_sender, sender_handle) = StSender::new(
        opt.listen_port,
        sender_info.id(),
        &opt.tssched_address,
        arena_ref,
    )?;
    let sender_stop = stop.clone();
    let sender_thread = thread::spawn(move || st_sender.run(sender_stop));

    let mut builder = StBuilder::new(
        channels,
        sender_handle,
        sender_info,
        monitor,
        opt.timeslice_duration.ns(),
        opt.timeout.ns(),
        opt.overlap_after.ns(),
    );
    let result = builder.run(&stop);

    stop.request_stop();
    let _ = sender_thread.join();
    drop(builder);
    drop(pgens);
    info!("removing shared memory segment '{}'", opt.shm);
    drop(arena);

    result?;
    Ok(())
}

fn prev_power_of_two(n: usize) -> Option<usize> {
    if n == 0 {
        return None;
    }
    Some(1 << (usize::BITS - 1 - n.leading_zeros()))
}
