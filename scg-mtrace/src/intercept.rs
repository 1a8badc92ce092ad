//! Malloc-family interposition (spec §4.8).
//!
//! Every exported function here shadows its libc counterpart for any
//! process that preloads this shared object. Each one resolves the real
//! implementation once via `dlsym(RTLD_NEXT, …)` — never linking
//! `__libc_malloc` directly, which would tie this crate to one libc's
//! internal ABI — and delegates the actual memory work to it, recording
//! only at the outermost level of a possibly-reentrant call per
//! `original_source/mtrace.c`'s `enter()`/`leave()`.

use std::cell::Cell;
use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, Ordering};

use once_cell::sync::Lazy;

use scg_core::alloc_table::AllocationTable;
use scg_core::async_safe;
use scg_core::unwind;

/// Frames to skip when capturing the allocating stack: this function's own
/// frame inside `capture_innermost_first`, and the wrapper (`malloc`,
/// `calloc`, …) that called it.
const SKIP_FRAMES: usize = 2;

pub(crate) static TABLE: Lazy<AllocationTable> = Lazy::new(AllocationTable::new);

/// Set by the `SIGUSR1` handler; checked (and cleared) on the next
/// outermost allocator entry, per spec §4.8 "Report trigger".
pub(crate) static NEED_REPORT: AtomicBool = AtomicBool::new(false);

thread_local! {
    static DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Process-wide lock substituting for the real recursive mutex
/// `original_source/mtrace.c` uses (spec §9 "Recursive-mutex + depth
/// counter"). Acquired only on a thread's outermost entry and released on
/// its outermost exit, so a thread that re-enters while already holding it
/// (e.g. the allocator used internally while recording an allocation)
/// never contends with itself.
static LOCK: AtomicBool = AtomicBool::new(false);

/// RAII re-entry guard. `enter()` increments this thread's depth and, only
/// on the 0→1 transition, spins until `LOCK` is acquired; `Drop` mirrors
/// that on the way out.
struct ReentryGuard {
    depth: u32,
}

impl ReentryGuard {
    fn enter() -> Self {
        let depth = DEPTH.with(|d| {
            let next = d.get() + 1;
            d.set(next);
            next
        });
        if depth == 1 {
            while LOCK.compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed).is_err() {
                std::hint::spin_loop();
            }
        }
        ReentryGuard { depth }
    }

    fn is_outermost(&self) -> bool {
        self.depth == 1
    }
}

impl Drop for ReentryGuard {
    fn drop(&mut self) {
        let depth = DEPTH.with(|d| {
            let next = d.get() - 1;
            d.set(next);
            next
        });
        if depth == 0 {
            LOCK.store(false, Ordering::Release);
        }
    }
}

type FnMalloc = unsafe extern "C" fn(usize) -> *mut c_void;
type FnCalloc = unsafe extern "C" fn(usize, usize) -> *mut c_void;
type FnRealloc = unsafe extern "C" fn(*mut c_void, usize) -> *mut c_void;
type FnFree = unsafe extern "C" fn(*mut c_void);
type FnPosixMemalign = unsafe extern "C" fn(*mut *mut c_void, usize, usize) -> i32;
type FnAlignedAlloc = unsafe extern "C" fn(usize, usize) -> *mut c_void;
type FnMemalign = unsafe extern "C" fn(usize, usize) -> *mut c_void;
type FnValloc = unsafe extern "C" fn(usize) -> *mut c_void;

struct RealAllocator {
    malloc: FnMalloc,
    calloc: FnCalloc,
    realloc: FnRealloc,
    free: FnFree,
    posix_memalign: FnPosixMemalign,
    aligned_alloc: FnAlignedAlloc,
    memalign: FnMemalign,
    valloc: FnValloc,
}

/// Resolves a real libc symbol via `dlsym(RTLD_NEXT, …)`. Takes a
/// NUL-terminated byte string literal rather than building a `CString` so
/// this never itself calls the allocator it is in the middle of
/// shadowing. Aborts the process if the symbol can't be found — there is
/// no safe fallback once an override shadows the only allocator a host
/// program would otherwise use.
unsafe fn resolve(name: &'static [u8]) -> usize {
    debug_assert_eq!(*name.last().unwrap(), 0, "symbol name must be NUL-terminated");
    let sym = libc::dlsym(libc::RTLD_NEXT, name.as_ptr().cast());
    if sym.is_null() {
        async_safe::write_fd(
            async_safe::STDERR_FD,
            b"scg-mtrace: dlsym(RTLD_NEXT) could not resolve a real allocator symbol\n",
        );
        std::process::abort();
    }
    sym as usize
}

static REAL: Lazy<RealAllocator> = Lazy::new(|| unsafe {
    RealAllocator {
        malloc: std::mem::transmute::<usize, FnMalloc>(resolve(b"malloc\0")),
        calloc: std::mem::transmute::<usize, FnCalloc>(resolve(b"calloc\0")),
        realloc: std::mem::transmute::<usize, FnRealloc>(resolve(b"realloc\0")),
        free: std::mem::transmute::<usize, FnFree>(resolve(b"free\0")),
        posix_memalign: std::mem::transmute::<usize, FnPosixMemalign>(resolve(b"posix_memalign\0")),
        aligned_alloc: std::mem::transmute::<usize, FnAlignedAlloc>(resolve(b"aligned_alloc\0")),
        memalign: std::mem::transmute::<usize, FnMemalign>(resolve(b"memalign\0")),
        valloc: std::mem::transmute::<usize, FnValloc>(resolve(b"valloc\0")),
    }
});

fn maybe_emit_report() {
    if NEED_REPORT.swap(false, Ordering::AcqRel) {
        crate::report::emit(&TABLE);
    }
}

/// Captures the current stack (skipping the wrapper frames) and records
/// `bytes` against its leaf node. Only ever called from an outermost
/// entry.
fn record_current_allocation(ptr: usize, bytes: usize) {
    // SAFETY: called only from ordinary (non-signal) allocator-wrapper
    // context.
    let frames = unsafe { unwind::capture_innermost_first(SKIP_FRAMES) };
    let Some(node) = unwind::intern_frames(&frames) else { return };
    TABLE.record_allocation(ptr, bytes, node);
}

/// Removes the record for `ptr`, if any; emits the foreign-free diagnostic
/// (spec §7) if this tracer never recorded it.
fn forget_allocation(ptr: usize) {
    if TABLE.record_free(ptr).is_none() {
        async_safe::write_fd(
            async_safe::STDERR_FD,
            b"scg-mtrace: free() of a pointer this tracer never recorded\n",
        );
    }
}

/// # Safety
/// `size` must be a value `malloc(3)` can accept; this is a direct
/// interposer for the libc entry point of the same name.
#[no_mangle]
pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
    let guard = ReentryGuard::enter();
    if guard.is_outermost() {
        maybe_emit_report();
    }
    let ptr = (REAL.malloc)(size);
    if guard.is_outermost() && !ptr.is_null() {
        record_current_allocation(ptr as usize, size);
    }
    ptr
}

/// # Safety
/// Direct interposer for `calloc(3)`.
#[no_mangle]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut c_void {
    let guard = ReentryGuard::enter();
    if guard.is_outermost() {
        maybe_emit_report();
    }
    let ptr = (REAL.calloc)(nmemb, size);
    if guard.is_outermost() && !ptr.is_null() {
        if let Some(total) = nmemb.checked_mul(size) {
            record_current_allocation(ptr as usize, total);
        }
    }
    ptr
}

/// # Safety
/// Direct interposer for `realloc(3)`; treated as free-then-allocate per
/// spec §4.8.
#[no_mangle]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    let guard = ReentryGuard::enter();
    if guard.is_outermost() {
        maybe_emit_report();
    }
    let new_ptr = (REAL.realloc)(ptr, size);
    if guard.is_outermost() {
        if !ptr.is_null() {
            forget_allocation(ptr as usize);
        }
        if !new_ptr.is_null() && size > 0 {
            record_current_allocation(new_ptr as usize, size);
        }
    }
    new_ptr
}

/// # Safety
/// Direct interposer for `free(3)`.
#[no_mangle]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    if ptr.is_null() {
        return;
    }
    let guard = ReentryGuard::enter();
    if guard.is_outermost() {
        forget_allocation(ptr as usize);
    }
    (REAL.free)(ptr);
}

/// # Safety
/// Direct interposer for `posix_memalign(3)`.
#[no_mangle]
pub unsafe extern "C" fn posix_memalign(
    memptr: *mut *mut c_void,
    alignment: usize,
    size: usize,
) -> i32 {
    let guard = ReentryGuard::enter();
    if guard.is_outermost() {
        maybe_emit_report();
    }
    let rc = (REAL.posix_memalign)(memptr, alignment, size);
    if guard.is_outermost() && rc == 0 {
        let ptr = *memptr;
        if !ptr.is_null() {
            record_current_allocation(ptr as usize, size);
        }
    }
    rc
}

/// # Safety
/// Direct interposer for `aligned_alloc(3)`.
#[no_mangle]
pub unsafe extern "C" fn aligned_alloc(alignment: usize, size: usize) -> *mut c_void {
    let guard = ReentryGuard::enter();
    if guard.is_outermost() {
        maybe_emit_report();
    }
    let ptr = (REAL.aligned_alloc)(alignment, size);
    if guard.is_outermost() && !ptr.is_null() {
        record_current_allocation(ptr as usize, size);
    }
    ptr
}

/// # Safety
/// Direct interposer for the legacy `memalign(3)`.
#[no_mangle]
pub unsafe extern "C" fn memalign(alignment: usize, size: usize) -> *mut c_void {
    let guard = ReentryGuard::enter();
    if guard.is_outermost() {
        maybe_emit_report();
    }
    let ptr = (REAL.memalign)(alignment, size);
    if guard.is_outermost() && !ptr.is_null() {
        record_current_allocation(ptr as usize, size);
    }
    ptr
}

/// # Safety
/// Direct interposer for the legacy page-aligned `valloc(3)`.
#[no_mangle]
pub unsafe extern "C" fn valloc(size: usize) -> *mut c_void {
    let guard = ReentryGuard::enter();
    if guard.is_outermost() {
        maybe_emit_report();
    }
    let ptr = (REAL.valloc)(size);
    if guard.is_outermost() && !ptr.is_null() {
        record_current_allocation(ptr as usize, size);
    }
    ptr
}

/// `operator new(size_t)` — spec §4.8 "the obvious language-level
/// `new`/`delete` aliases".
///
/// # Safety
/// Matches the Itanium C++ ABI mangled signature; delegates to [`malloc`].
#[no_mangle]
pub unsafe extern "C" fn _Znwm(size: usize) -> *mut c_void {
    malloc(size)
}

/// `operator new[](size_t)`.
///
/// # Safety
/// See [`_Znwm`].
#[no_mangle]
pub unsafe extern "C" fn _Znam(size: usize) -> *mut c_void {
    malloc(size)
}

/// `operator delete(void*)`.
///
/// # Safety
/// See [`_Znwm`].
#[no_mangle]
pub unsafe extern "C" fn _ZdlPv(ptr: *mut c_void) {
    free(ptr);
}

/// `operator delete[](void*)`.
///
/// # Safety
/// See [`_Znwm`].
#[no_mangle]
pub unsafe extern "C" fn _ZdaPv(ptr: *mut c_void) {
    free(ptr);
}

/// Called by the `SIGUSR1` handler. Async-signal-safe: sets a flag only.
pub(crate) fn request_report() {
    NEED_REPORT.store(true, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reentrant_allocation_is_not_double_recorded() {
        // The outermost malloc call records; any allocator use nested
        // inside record_current_allocation (e.g. the Trace Index's own
        // bookkeeping, which in fact never touches the general-purpose
        // heap) must not re-enter recording. This exercises the guard in
        // isolation, since scg-core's own data structures are
        // allocation-free.
        let outer = ReentryGuard::enter();
        assert!(outer.is_outermost());
        {
            let inner = ReentryGuard::enter();
            assert!(!inner.is_outermost());
        }
        assert!(outer.is_outermost());
    }

    #[test]
    fn real_allocator_resolves_every_symbol() {
        // Forcing Lazy<RealAllocator> must not deadlock or abort in a
        // normal test process where every libc symbol exists.
        Lazy::force(&REAL);
    }
}
