// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Build node daemon: assembles assigned timeslices from the senders
// into a shared-memory buffer and distributes the finished work items
// to registered workers.

use std::process::ExitCode;
use std::thread;
use std::time::Duration;

use clap::Parser;
use log::error;

use tsbnet::config::{merge_config_file, ByteSize, CommonOpts, DurationNs};
use tsbnet::distributor::ItemDistributor;
use tsbnet::system::StopToken;
use tsbnet::tsbuffer::TsBuffer;
use tsbnet::tsbuild::TsBuilder;

const DEFAULT_WORKER_PORT: u16 = 13140;

/// Timeslice builder daemon.
#[derive(Debug, Parser)]
#[command(name = "tsbuild", version, args_override_self = true)]
struct Options {
    #[command(flatten)]
    common: CommonOpts,

    /// Timeslice scheduler address (`host[:port]`).
    #[arg(long, value_name = "ADDRESS")]
    tssched_address: String,

    /// Name of the shared memory segment holding assembled timeslices.
    #[arg(long, default_value = "tsbuild")]
    shm: String,

    /// Size of the timeslice buffer.
    #[arg(long, default_value = "256Mi")]
    buffer_size: ByteSize,

    /// Port to accept item worker connections on.
    #[arg(long, default_value_t = DEFAULT_WORKER_PORT)]
    worker_port: u16,

    /// Give up on missing subtimeslice components after this long.
    #[arg(long, default_value = "10s")]
    timeout: DurationNs,
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
    let stop = StopToken::new();
    stop.register_signals()?;

    let buffer = TsBuffer::new(&opt.shm, opt.buffer_size.bytes() as usize)?;
    let (distributor, producer) = ItemDistributor::new(opt.worker_port)?;
    let distributor_stop = stop.clone();
    let distributor_thread = thread::spawn(move || distributor.run(distributor_stop));

    let builder = TsBuilder::new(
        buffer,
        producer,
        &opt.tssched_address,
        Duration::from_nanos(opt.timeout.ns()),
    )?;
    let result = builder.run(stop.clone());

    stop.request_stop();
    let _ = distributor_thread.join();

    result?;
    Ok(())
}
