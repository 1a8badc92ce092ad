//! The unwinder abstraction both the Sampler and the Allocation Tracer
//! depend on (spec §2 "reuses Sampler's unwinder", §9 "Unwinder
//! abstraction"): capture the current machine context and iterate frames
//! yielding instruction pointers. Backed by the `backtrace` crate's
//! unsynchronized tracing entry point, grounded in
//! `other_examples/9f862962_tikv-rp-prof__src-profiler.rs.rs`, which uses
//! the same crate the same way from inside `SIGPROF`.

use smallvec::SmallVec;

/// Frames beyond this depth are silently truncated; recursion in a
/// sampled program is common and unbounded recursion would otherwise make
/// a single sample allocate without limit.
pub const MAX_FRAMES: usize = 128;

pub type FrameBuffer = SmallVec<[usize; MAX_FRAMES]>;

/// Captures the current call stack, skipping `skip` innermost frames.
/// Frames are returned innermost-first, matching `backtrace`'s own
/// iteration order; callers that intern outermost-first (spec §4.3) must
/// reverse the buffer first.
///
/// # Safety
/// Sound to call from signal context (the Sampler's use case) because it
/// performs no allocation of its own beyond the inline `SmallVec` storage,
/// and from ordinary code (the Allocation Tracer's use case) identically.
/// The caller is responsible for passing a `skip` count that accounts for
/// its own call depth above this function.
pub unsafe fn capture_innermost_first(skip: usize) -> FrameBuffer {
    let mut frames = FrameBuffer::new();
    let mut to_skip = skip;
    backtrace::trace_unsynchronized(|frame| {
        if to_skip > 0 {
            to_skip -= 1;
            return true;
        }
        let ip = frame.ip() as usize;
        if ip == 0 {
            return false;
        }
        frames.push(ip);
        frames.len() < MAX_FRAMES
    });
    frames
}

/// Interns a captured stack (innermost-first) into the Trace Index,
/// outermost-first as spec §4.3 requires, returning the leaf node. Shared
/// by the Sampler (which also bumps the leaf's counter) and the
/// Allocation Tracer (which attributes bytes to the leaf instead).
pub fn intern_frames(frames: &[usize]) -> Option<crate::arena::NodeId> {
    let mut parent = None;
    for &ip in frames.iter().rev() {
        parent = Some(crate::trace_index::intern(parent, crate::domain::Address(ip))?);
    }
    parent
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_from_ordinary_context_is_nonempty() {
        let frames = unsafe { capture_innermost_first(0) };
        assert!(!frames.is_empty());
    }

    #[test]
    fn intern_frames_builds_a_chain_rooted_at_the_outermost_frame() {
        crate::trace_index::ensure_initialized();
        let frames = [0x7_0000_3000, 0x7_0000_2000, 0x7_0000_1000]; // innermost-first
        let leaf = intern_frames(&frames).unwrap();
        assert_eq!(leaf.address().0, 0x7_0000_3000);
        let mid = leaf.parent().unwrap();
        assert_eq!(mid.address().0, 0x7_0000_2000);
        let root = mid.parent().unwrap();
        assert_eq!(root.address().0, 0x7_0000_1000);
        assert_eq!(root.parent(), None);
    }
}
