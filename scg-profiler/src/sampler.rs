//! Periodic `SIGPROF` handler: unwinds the interrupted thread's stack and
//! records the chain in the shared Trace Index (spec §4.3).

use scg_core::async_safe::ErrnoGuard;
use scg_core::domain::Address;
use scg_core::trace_index;
use scg_core::unwind;

/// Frames to skip at the top of every capture: the signal trampoline
/// itself and the kernel's signal-return stub (spec §4.3).
const SKIP_FRAMES: usize = 2;

/// Installs the `SIGPROF`, `SIGUSR1` and `SIGUSR2` handlers and arms the
/// process-wide profiling interval timer. Idempotent only in the sense
/// that calling it twice re-registers the same handlers; callers
/// (`scg_initialize`) guard against duplicate work with a `Once`.
pub fn install() {
    install_signal(libc::SIGPROF, handle_sigprof as usize);
    install_signal(libc::SIGUSR1, handle_sigusr1 as usize);
    install_signal(libc::SIGUSR2, handle_sigusr2 as usize);
    arm_timer();
}

/// Arms `ITIMER_PROF` for the calling thread. Per-thread: a host's own
/// thread-creation wrapper is expected to call this again in each new
/// thread (the thread-creation shim is an out-of-scope external
/// collaborator per spec §1); `scg_thread_initialize` below is exposed for
/// that purpose.
pub fn arm_timer() {
    let interval_us = scg_core::config::sample_interval_us();
    let interval = libc::timeval {
        tv_sec: 0,
        tv_usec: interval_us as libc::suseconds_t,
    };
    let timer = libc::itimerval { it_interval: interval, it_value: interval };
    unsafe {
        libc::setitimer(libc::ITIMER_PROF, &timer, std::ptr::null_mut());
    }
}

/// Exported so a host's thread-creation wrapper can propagate the
/// profiling timer to threads it spawns, mirroring
/// `original_source/node.c::scg_thread_initialize`.
#[no_mangle]
pub extern "C" fn scg_thread_initialize() {
    arm_timer();
}

fn install_signal(signum: i32, handler: usize) {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handler;
        action.sa_flags = libc::SA_RESTART | libc::SA_SIGINFO;
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(signum, &action, std::ptr::null_mut());
    }
}

extern "C" fn handle_sigprof(
    _signum: libc::c_int,
    _info: *mut libc::siginfo_t,
    _context: *mut libc::c_void,
) {
    let _errno = ErrnoGuard::save();

    // SAFETY: invoked only as a SIGPROF handler for the interrupted thread.
    let frames = unsafe { unwind::capture_innermost_first(SKIP_FRAMES) };
    if frames.is_empty() {
        return; // zero IP or empty walk: drop the sample (spec §5 "Cancellation")
    }

    let mut parent = None;
    for &ip in frames.iter().rev() {
        match trace_index::intern(parent, Address(ip)) {
            Some(node) => parent = Some(node),
            // Arena exhausted and mapping failed: drop the remainder of
            // this sample (spec §4.1 "Failure mode").
            None => return,
        }
    }

    if let Some(leaf) = parent {
        leaf.increment_counter();
    }
}

/// User signal 1: historically "enable"; a no-op for the profiler, per
/// spec §6 (the allocation tracer installs its own handler for the same
/// signal to trigger an on-demand `.memlog` report).
extern "C" fn handle_sigusr1(
    _signum: libc::c_int,
    _info: *mut libc::siginfo_t,
    _context: *mut libc::c_void,
) {
}

/// User signal 2: profile flush. Calls `scg_output_profile` directly from
/// signal context, matching `original_source/node.c::user2_handler` — this
/// is not async-signal-safe (report rendering allocates and performs I/O)
/// but is the documented, intentional behavior of this signal per spec §6.
extern "C" fn handle_sigusr2(
    _signum: libc::c_int,
    _info: *mut libc::siginfo_t,
    _context: *mut libc::c_void,
) {
    unsafe { crate::scg_output_profile() };
}
