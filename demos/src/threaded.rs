//! Two threads tight-looping disjoint functions, exercising scenario E3:
//! after the sampler has been running for a second, the profile shows
//! both `busy_a` and `busy_b` with nonzero counts and disjoint callees.
//!
//! ```bash
//! LD_PRELOAD=target/release/libscgprof.so target/release/threaded-demo
//! ```
//!
//! Each new thread must call `scg_thread_initialize()` itself to arm its
//! own `ITIMER_PROF` (per-thread, per spec §4.3) — ordinarily the job of a
//! thread-creation wrapper the host links, out of scope here (spec §1).
//! This demo calls the preload's exported symbol directly via `dlsym` so
//! it still profiles correctly even without that wrapper, and does
//! nothing if the symbol is absent (i.e. run without the preload).

use std::ffi::c_void;
use std::thread;
use std::time::{Duration, Instant};

fn arm_this_thread() {
    let name = b"scg_thread_initialize\0";
    let sym = unsafe { libc_dlsym(name.as_ptr().cast()) };
    if let Some(init) = sym {
        unsafe { init() };
    }
}

type ThreadInit = unsafe extern "C" fn();

unsafe fn libc_dlsym(name: *const std::os::raw::c_char) -> Option<ThreadInit> {
    let ptr = dlsym_default(name);
    if ptr.is_null() {
        None
    } else {
        Some(std::mem::transmute::<*mut c_void, ThreadInit>(ptr))
    }
}

unsafe fn dlsym_default(name: *const std::os::raw::c_char) -> *mut c_void {
    extern "C" {
        fn dlsym(handle: *mut c_void, symbol: *const std::os::raw::c_char) -> *mut c_void;
    }
    const RTLD_DEFAULT: *mut c_void = std::ptr::null_mut();
    dlsym(RTLD_DEFAULT, name)
}

fn main() {
    env_logger::init();
    let budget = Duration::from_secs(2);

    let a = thread::spawn(move || {
        arm_this_thread();
        busy_a(budget);
    });
    let b = thread::spawn(move || {
        arm_this_thread();
        busy_b(budget);
    });

    a.join().unwrap();
    b.join().unwrap();
}

#[inline(never)]
fn busy_a(budget: Duration) {
    let start = Instant::now();
    let mut acc = 0u64;
    while start.elapsed() < budget {
        acc = acc.wrapping_add(helper_a());
    }
    std::hint::black_box(acc);
}

#[inline(never)]
fn helper_a() -> u64 {
    (0..5_000).fold(0u64, |a, b| a.wrapping_add(std::hint::black_box(b)))
}

#[inline(never)]
fn busy_b(budget: Duration) {
    let start = Instant::now();
    let mut acc = 0u64;
    while start.elapsed() < budget {
        acc = acc.wrapping_add(helper_b());
    }
    std::hint::black_box(acc);
}

#[inline(never)]
fn helper_b() -> u64 {
    (0..5_000).fold(0u64, |a, b| a.wrapping_mul(std::hint::black_box(b + 1)))
}
