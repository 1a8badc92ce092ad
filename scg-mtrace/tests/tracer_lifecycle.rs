//! Exercises the public allocator-interposer entry points the dynamic
//! linker would otherwise invoke via symbol interposition. Mirrors
//! `scg-profiler`'s `tests/sampler_lifecycle.rs`: the balance and
//! re-entrancy properties themselves (§8.8, §8.9) are unit-tested directly
//! against `scg-core::alloc_table` and `scg-mtrace::intercept`, which is
//! where that bookkeeping actually lives. This suite only confirms the
//! exported wrappers round-trip without panicking or deadlocking.

use std::ptr;

#[test]
fn malloc_then_free_round_trips() {
    unsafe {
        let a = scgmtrace::malloc(1024);
        assert!(!a.is_null());
        let b = scgmtrace::malloc(2048);
        assert!(!b.is_null());
        scgmtrace::free(a);
        scgmtrace::free(b);
    }
}

#[test]
fn calloc_zeroes_and_free_accepts_it() {
    unsafe {
        let ptr = scgmtrace::calloc(16, 8);
        assert!(!ptr.is_null());
        let bytes = std::slice::from_raw_parts(ptr.cast::<u8>(), 128);
        assert!(bytes.iter().all(|&b| b == 0));
        scgmtrace::free(ptr);
    }
}

#[test]
fn realloc_grows_in_place_or_moves() {
    unsafe {
        let a = scgmtrace::malloc(64);
        assert!(!a.is_null());
        let b = scgmtrace::realloc(a, 4096);
        assert!(!b.is_null());
        scgmtrace::free(b);
    }
}

#[test]
fn free_of_null_is_a_no_op() {
    unsafe {
        scgmtrace::free(ptr::null_mut());
    }
}

#[test]
fn posix_memalign_honors_alignment() {
    unsafe {
        let mut out: *mut std::ffi::c_void = ptr::null_mut();
        let rc = scgmtrace::posix_memalign(&mut out, 64, 256);
        assert_eq!(rc, 0);
        assert!(!out.is_null());
        assert_eq!((out as usize) % 64, 0);
        scgmtrace::free(out);
    }
}

#[test]
fn freeing_an_untracked_pointer_does_not_panic() {
    // A pointer this tracer never allocated: exercises the "foreign free"
    // diagnostic path (spec §7), which must not be fatal.
    let mut boxed = Box::new(42u8);
    unsafe {
        scgmtrace::free((&mut *boxed as *mut u8).cast());
    }
    std::mem::forget(boxed);
}
