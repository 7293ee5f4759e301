// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Process-level helpers: wall clock in nanoseconds, hostname, pid,
// thread naming, and the stop flag wired to SIGINT/SIGTERM.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in nanoseconds since the epoch.
pub fn current_time_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Hostname of this machine.
pub fn current_hostname() -> String {
    let mut buf = [0u8; 256];
    let ret = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if ret != 0 {
        return "localhost".to_owned();
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

/// Pid of this process.
pub fn current_pid() -> u32 {
    std::process::id()
}

/// Name the calling thread (visible in ps/top; truncated to 15 chars).
pub fn set_thread_name(name: &str) {
    let truncated: String = name.chars().take(15).collect();
    if let Ok(c) = std::ffi::CString::new(truncated) {
        #[cfg(target_os = "linux")]
        unsafe {
            libc::pthread_setname_np(libc::pthread_self(), c.as_ptr());
        }
        #[cfg(not(target_os = "linux"))]
        let _ = c;
    }
}

/// Cooperative stop flag shared between the signal handler and all loops.
#[derive(Clone)]
pub struct StopToken {
    flag: Arc<AtomicBool>,
}

impl StopToken {
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Register SIGINT and SIGTERM to raise this token.
    pub fn register_signals(&self) -> io::Result<()> {
        signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&self.flag))?;
        signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&self.flag))?;
        Ok(())
    }

    pub fn stop_requested(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    pub fn request_stop(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }
}

impl Default for StopToken {
    fn default() -> Self {
        Self::new()
    }
}
