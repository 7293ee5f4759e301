// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Log setup on top of the `log` facade. Severity names follow the
// operator-facing convention trace/debug/status/info/warning/error/fatal;
// `status` and `fatal` fold into the nearest facade level.

use std::io;
use std::time::SystemTime;

use log::LevelFilter;

/// Parse an operator-facing severity name.
pub fn parse_level(name: &str) -> Option<LevelFilter> {
    Some(match name.to_ascii_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "status" | "info" => LevelFilter::Info,
        "warning" | "warn" => LevelFilter::Warn,
        "error" | "fatal" => LevelFilter::Error,
        "off" => LevelFilter::Off,
        _ => return None,
    })
}

fn format_record(
    out: fern::FormatCallback<'_>,
    message: &std::fmt::Arguments<'_>,
    record: &log::Record<'_>,
) {
    out.finish(format_args!(
        "[{}] [{}] {}: {}",
        humantime(SystemTime::now()),
        record.level(),
        record.target(),
        message
    ))
}

/// Timestamp as `YYYY-MM-DD HH:MM:SS.mmm` (UTC).
fn humantime(t: SystemTime) -> String {
    let d = t
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default();
    let secs = d.as_secs();
    let millis = d.subsec_millis();
    let days = secs / 86400;
    let (h, m, s) = ((secs / 3600) % 24, (secs / 60) % 60, secs % 60);

    // civil date from the day count
    let mut era_day = days as i64 + 719_468;
    let era = era_day.div_euclid(146_097);
    era_day = era_day.rem_euclid(146_097);
    let yoe = (era_day - era_day / 1460 + era_day / 36524 - era_day / 146_096) / 365;
    let doy = era_day - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe + era * 400 + i64::from(month <= 2);

    format!("{year:04}-{month:02}-{day:02} {h:02}:{m:02}:{s:02}.{millis:03}")
}

/// Install the global logger: stderr, plus an optional log file, plus
/// syslog when requested.
pub fn init(level: LevelFilter, log_file: Option<&str>, syslog: bool) -> io::Result<()> {
    let mut dispatch = fern::Dispatch::new()
        .format(format_record)
        .level(level)
        .chain(std::io::stderr());

    if let Some(path) = log_file {
        dispatch = dispatch.chain(fern::log_file(path)?);
    }
    if syslog {
        dispatch = dispatch.chain(fern::Output::call(|record| {
            let priority = match record.level() {
                log::Level::Error => libc::LOG_ERR,
                log::Level::Warn => libc::LOG_WARNING,
                log::Level::Info => libc::LOG_INFO,
                log::Level::Debug | log::Level::Trace => libc::LOG_DEBUG,
            };
            if let Ok(msg) = std::ffi::CString::new(format!("{}", record.args())) {
                unsafe {
                    libc::syslog(priority, b"%s\0".as_ptr() as *const libc::c_char, msg.as_ptr());
                }
            }
        }));
    }

    dispatch
        .apply()
        .map_err(|e| io::Error::new(io::ErrorKind::AlreadyExists, e))
}
