// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Timeslice scheduler daemon: accepts sender and builder registrations
// and assigns every announced timeslice to the least-loaded builder.

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use log::error;

use tsbnet::config::{merge_config_file, CommonOpts, DurationNs};
use tsbnet::sender::DEFAULT_SCHEDULER_PORT;
use tsbnet::system::StopToken;
use tsbnet::tssched::TsScheduler;

/// Timeslice scheduler daemon.
#[derive(Debug, Parser)]
#[command(name = "tssched", version, args_override_self = true)]
struct Options {
    #[command(flatten)]
    common: CommonOpts,

    /// Port to accept sender and builder connections on.
    #[arg(long, default_value_t = DEFAULT_SCHEDULER_PORT)]
    listen_port: u16,

    /// Assign a timeslice even if not every sender announced it after
    /// this long.
    #[arg(long, default_value = "10s")]
    assign_timeout: DurationNs,
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

    let stop = StopToken::new();
    if let Err(e) = stop.register_signals() {
        error!("failed to register signal handlers: {e}");
        return ExitCode::FAILURE;
    }

    let scheduler = match TsScheduler::new(
        opt.listen_port,
        Duration::from_nanos(opt.assign_timeout.ns()),
    ) {
        Ok(s) => s,
        Err(e) => {
            error!("failed to create scheduler: {e}");
            return ExitCode::FAILURE;
        }
    };
    match scheduler.run(stop) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
