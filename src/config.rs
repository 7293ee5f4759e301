// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Command-line surface shared by the pipeline binaries: suffixed
// duration and size values, the common logging/monitoring options, and
// the `key = value` config-file loader.

use std::fmt;
use std::fs;

use clap::Args;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid duration '{0}', expected <number><ns|us|µs|ms|s>")]
    InvalidDuration(String),
    #[error("invalid size '{0}', expected <number>[k|M|G|T|ki|Mi|Gi|Ti][B]")]
    InvalidSize(String),
    #[error("invalid PCI address '{0}', expected BB:DD.F")]
    InvalidPciAddress(String),
    #[error("failed to read config file '{path}': {source}")]
    ConfigFile {
        path: String,
        source: std::io::Error,
    },
    #[error("malformed line {line} in config file '{path}'")]
    ConfigLine { path: String, line: usize },
}

// ---------------------------------------------------------------------------
// Durations with ns/us/µs/ms/s suffixes
// ---------------------------------------------------------------------------

/// A duration given in nanoseconds, parsed from `<number><suffix>`.
/// A bare number is taken as nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DurationNs(pub u64);

impl DurationNs {
    pub fn ns(&self) -> u64 {
        self.0
    }
}

impl std::str::FromStr for DurationNs {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let err = || ConfigError::InvalidDuration(s.to_owned());
        let (digits, factor) = if let Some(d) = s.strip_suffix("ns") {
            (d, 1)
        } else if let Some(d) = s.strip_suffix("us") {
            (d, 1_000)
        } else if let Some(d) = s.strip_suffix("µs") {
            (d, 1_000)
        } else if let Some(d) = s.strip_suffix("ms") {
            (d, 1_000_000)
        } else if let Some(d) = s.strip_suffix('s') {
            (d, 1_000_000_000)
        } else {
            (s, 1)
        };
        let value: u64 = digits.trim().parse().map_err(|_| err())?;
        value.checked_mul(factor).map(DurationNs).ok_or_else(err)
    }
}

impl fmt::Display for DurationNs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ns = self.0;
        if ns % 1_000_000_000 == 0 {
            write!(f, "{}s", ns / 1_000_000_000)
        } else if ns % 1_000_000 == 0 {
            write!(f, "{}ms", ns / 1_000_000)
        } else if ns % 1_000 == 0 {
            write!(f, "{}us", ns / 1_000)
        } else {
            write!(f, "{ns}ns")
        }
    }
}

// ---------------------------------------------------------------------------
// Sizes with SI and binary suffixes
// ---------------------------------------------------------------------------

/// A byte count parsed from `<number>[suffix]`, where the suffix is an SI
/// (`k`, `M`, `G`, `T`) or binary (`ki`, `Mi`, `Gi`, `Ti`) unit with an
/// optional trailing `B`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteSize(pub u64);

impl ByteSize {
    pub fn bytes(&self) -> u64 {
        self.0
    }
}

impl std::str::FromStr for ByteSize {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let err = || ConfigError::InvalidSize(s.to_owned());

        let without_b = trimmed.strip_suffix(['B', 'b']).unwrap_or(trimmed);
        let (digits, factor): (&str, u64) = if let Some(d) = without_b.strip_suffix("ki") {
            (d, 1 << 10)
        } else if let Some(d) = without_b.strip_suffix("Ki") {
            (d, 1 << 10)
        } else if let Some(d) = without_b.strip_suffix("Mi") {
            (d, 1 << 20)
        } else if let Some(d) = without_b.strip_suffix("Gi") {
            (d, 1 << 30)
        } else if let Some(d) = without_b.strip_suffix("Ti") {
            (d, 1 << 40)
        } else if let Some(d) = without_b.strip_suffix(['k', 'K']) {
            (d, 1_000)
        } else if let Some(d) = without_b.strip_suffix('M') {
            (d, 1_000_000)
        } else if let Some(d) = without_b.strip_suffix('G') {
            (d, 1_000_000_000)
        } else if let Some(d) = without_b.strip_suffix('T') {
            (d, 1_000_000_000_000)
        } else {
            (without_b, 1)
        };
        let value: u64 = digits.trim().parse().map_err(|_| err())?;
        value.checked_mul(factor).map(ByteSize).ok_or_else(err)
    }
}

// ---------------------------------------------------------------------------
// PCI address
// ---------------------------------------------------------------------------

/// A PCI device address in `BB:DD.F` notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciAddress {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl std::str::FromStr for PciAddress {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ConfigError::InvalidPciAddress(s.to_owned());
        let (bus, rest) = s.split_once(':').ok_or_else(err)?;
        let (dev, func) = rest.split_once('.').ok_or_else(err)?;
        Ok(PciAddress {
            bus: u8::from_str_radix(bus, 16).map_err(|_| err())?,
            device: u8::from_str_radix(dev, 16).map_err(|_| err())?,
            function: u8::from_str_radix(func, 16).map_err(|_| err())?,
        })
    }
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}:{:02x}.{:x}", self.bus, self.device, self.function)
    }
}

// ---------------------------------------------------------------------------
// Common options
// ---------------------------------------------------------------------------

/// Options every pipeline binary accepts.
#[derive(Debug, Clone, Args)]
pub struct CommonOpts {
    /// Read additional `key = value` options from this file.
    #[arg(long, value_name = "FILE")]
    pub config_file: Option<String>,

    /// Log severity: trace|debug|status|info|warning|error|fatal.
    #[arg(long, default_value = "info", value_name = "LEVEL")]
    pub log_level: String,

    /// Also write the log to this file.
    #[arg(long, value_name = "FILE")]
    pub log_file: Option<String>,

    /// Also log to syslog.
    #[arg(long)]
    pub log_syslog: bool,

    /// Telemetry sink URI (`file:PATH` or `influx1:HOST:PORT:DATABASE`).
    #[arg(long, value_name = "URI")]
    pub monitor: Option<String>,
}

/// Expand `--config-file` into extra arguments, keeping command-line
/// precedence. Each non-comment line is `key = value` or a bare `key`
/// (for switches); keys match the long option names.
pub fn merge_config_file(mut args: Vec<String>) -> Result<Vec<String>, ConfigError> {
    let path = {
        let mut found = None;
        let mut it = args.iter();
        while let Some(a) = it.next() {
            if a == "--config-file" {
                found = it.next().cloned();
            } else if let Some(v) = a.strip_prefix("--config-file=") {
                found = Some(v.to_owned());
            }
        }
        match found {
            Some(p) => p,
            None => return Ok(args),
        }
    };

    let text = fs::read_to_string(&path).map_err(|source| ConfigError::ConfigFile {
        path: path.clone(),
        source,
    })?;

    let mut extra = Vec::new();
    for (i, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match line.split_once('=') {
            Some((key, value)) => {
                let key = key.trim();
                if key.is_empty() {
                    return Err(ConfigError::ConfigLine {
                        path: path.clone(),
                        line: i + 1,
                    });
                }
                extra.push(format!("--{key}"));
                extra.push(value.trim().to_owned());
            }
            None => extra.push(format!("--{line}")),
        }
    }

    // File options go first so the command line overrides them.
    let program = args.remove(0);
    let mut merged = vec![program];
    merged.extend(extra);
    merged.extend(args);
    Ok(merged)
}
