//! `LD_PRELOAD`-loaded statistical call-graph profiler.
//!
//! Loading this library samples every thread's call stack on a periodic
//! timer and writes a text call-graph report at process exit (or on
//! `SIGUSR2`). See `scg-core` for the shared data model and
//! symbolization layer, and SPEC_FULL.md for the full design.
//!
//! Two entry points are exported for a host program that wants explicit
//! control instead of the automatic constructor below: [`scg_initialize`]
//! arms the sampler, [`scg_output_profile`] emits a report on demand.

mod report;
mod sampler;

use std::sync::Once;

static INIT: Once = Once::new();

/// Runs automatically when this shared object is loaded, mirroring
/// `original_source/automatic.c`'s `__attribute__((constructor,weak))`.
/// A host that wants to defer or suppress startup can link its own
/// `scg_auto_start` ahead of this one; see SPEC_FULL.md §6.
#[ctor::ctor]
fn scg_auto_start() {
    unsafe { scg_initialize() };
    unsafe {
        libc::atexit(run_atexit_report);
    }
}

extern "C" fn run_atexit_report() {
    unsafe { scg_output_profile() };
}

/// Arms the sampling timer and installs the profiler's signal handlers.
/// Safe to call more than once; only the first call does anything.
///
/// # Safety
/// Must be called from a context where installing signal handlers and
/// arming `ITIMER_PROF` is appropriate — i.e. not from inside a signal
/// handler itself.
#[no_mangle]
pub unsafe extern "C" fn scg_initialize() {
    INIT.call_once(|| {
        scg_core::ensure_initialized();
        sampler::install();
    });
}

/// Builds the current profile and writes it to `SCG_OUTPUT` (or stderr).
/// Called automatically at process exit and on `SIGUSR2`; may also be
/// called directly by a host program.
///
/// # Safety
/// Performs blocking I/O and allocates; must not be called from signal
/// context other than the `SIGUSR2` path this crate installs itself,
/// which accepts that tradeoff (see `sampler::handle_sigusr2`).
#[no_mangle]
pub unsafe extern "C" fn scg_output_profile() {
    report::emit();
}

pub use sampler::scg_thread_initialize;
