//! `LD_PRELOAD`-loaded allocation tracer, companion to `scg-profiler`.
//!
//! Loading this library shadows the malloc-family entry points (see
//! [`intercept`]) and tracks live bytes per allocating call stack, reusing
//! `scg-core`'s Trace Index, Node Arena and Resolver — the same ones
//! `scg-profiler` populates from its own `SIGPROF` handler. A `.memlog`
//! report is written at process exit and whenever `SIGUSR1` arrives (spec
//! §4.8 "Report trigger"); this tracer does not react to `SIGPROF` or
//! `SIGUSR2`, which belong to the profiler.
//!
//! Like `scg-profiler`, this crate never calls `env_logger::init()` itself
//! (see SPEC_FULL.md §4.9): it logs through whatever backend the host
//! process already installed, or not at all.

mod intercept;
mod report;

pub use intercept::{
    aligned_alloc, calloc, free, malloc, memalign, posix_memalign, realloc, valloc,
};

/// Runs automatically when this shared object is loaded, mirroring
/// `original_source/automatic.c`'s constructor convention.
#[ctor::ctor]
fn scg_mtrace_auto_start() {
    install_sigusr1();
    unsafe {
        libc::atexit(run_atexit_report);
    }
}

extern "C" fn run_atexit_report() {
    report::emit(&intercept::TABLE);
}

fn install_sigusr1() {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handle_sigusr1 as usize;
        action.sa_flags = libc::SA_RESTART | libc::SA_SIGINFO;
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(libc::SIGUSR1, &action, std::ptr::null_mut());
    }
}

/// User signal 1: requests a `.memlog` report on the next outermost
/// allocator entry (spec §4.8, §6). Async-signal-safe: sets an atomic
/// flag and returns.
extern "C" fn handle_sigusr1(
    _signum: libc::c_int,
    _info: *mut libc::siginfo_t,
    _context: *mut libc::c_void,
) {
    intercept::request_report();
}
