//! Ordinary host program exercising the allocation tracer, scenario E4:
//! `allocate(1024); allocate(2048); free(first); report();` should leave
//! one live stack outstanding at +2048 and `global_bytes == 2048`.
//!
//! ```bash
//! cargo build --release
//! LD_PRELOAD=target/release/libscgmtrace.so target/release/alloc-demo
//! # look for ./alloc-demo-<pid>-0.memlog
//! ```
//!
//! Calls `libc::malloc`/`libc::free` directly rather than going through
//! Rust's global allocator, so the scenario matches the spec's wording
//! exactly regardless of which allocator Rust's own `System` type happens
//! to delegate to on a given target.

use std::ffi::c_void;
use std::time::Duration;

fn main() {
    env_logger::init();

    let first = unsafe { libc::malloc(1024) };
    assert!(!first.is_null());
    let second = unsafe { libc::malloc(2048) };
    assert!(!second.is_null());

    unsafe { libc::free(first) };

    // Give a `kill -USR1 $(pgrep alloc-demo)` a window to request an
    // on-demand .memlog report before the atexit report fires.
    std::thread::sleep(Duration::from_secs(2));

    std::hint::black_box(second as *const c_void);
    unsafe { libc::free(second) };
}
