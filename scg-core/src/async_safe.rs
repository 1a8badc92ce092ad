//! Primitives usable from signal context: no heap allocation, no locks, no
//! buffered I/O. Grounded in `original_source/mtrace.c`'s use of
//! `dprintf(STDERR_FILENO, …)` for its foreign-free diagnostic, and in the
//! `ErrnoProtector` pattern from the tikv `pprof-rs`-style profiler
//! (`other_examples/9f862962_tikv-rp-prof__src-profiler.rs.rs`).

use std::sync::atomic::{AtomicI32, Ordering};

/// Saves `errno` on construction and restores it on drop. Any libc call
/// made while handling a signal (mmap, write) may clobber `errno`; the
/// interrupted code must not observe that.
pub struct ErrnoGuard(i32);

impl ErrnoGuard {
    pub fn save() -> Self {
        ErrnoGuard(unsafe { *libc::__errno_location() })
    }
}

impl Drop for ErrnoGuard {
    fn drop(&mut self) {
        unsafe {
            *libc::__errno_location() = self.0;
        }
    }
}

/// Writes `msg` to the given file descriptor using the raw `write(2)`
/// syscall, looping on short writes and `EINTR`. Never allocates, never
/// touches `errno` observed by the caller (wraps itself in an
/// [`ErrnoGuard`]).
///
/// Used for diagnostics that may be emitted from signal context or from
/// the allocator interposer while its re-entrancy mutex is held, where
/// `std::io::Stderr` (which can allocate a line buffer) is unsafe to use.
pub fn write_fd(fd: i32, msg: &[u8]) {
    let _errno = ErrnoGuard::save();
    let mut remaining = msg;
    while !remaining.is_empty() {
        let n = unsafe {
            libc::write(fd, remaining.as_ptr().cast(), remaining.len())
        };
        if n < 0 {
            let err = unsafe { *libc::__errno_location() };
            if err == libc::EINTR {
                continue;
            }
            break;
        }
        remaining = &remaining[n as usize..];
    }
}

pub const STDERR_FD: i32 = libc::STDERR_FILENO;

/// Monotonically increasing counter suitable for naming successive
/// `.memlog` reports (spec §4.8) without touching a mutex-protected
/// counter from the allocator's hot path.
pub static REPORT_SEQUENCE: AtomicI32 = AtomicI32::new(0);

/// Returns the next report sequence number, starting at zero.
pub fn next_report_sequence() -> i32 {
    REPORT_SEQUENCE.fetch_add(1, Ordering::Relaxed)
}
