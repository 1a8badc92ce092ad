//! Shared newtypes and process-wide constants.
//!
//! Kept separate from the modules that use them so `scg-profiler` and
//! `scg-mtrace` can agree on layout and sizing without depending on each
//! other.

use std::fmt;

/// A process identifier, as reported by `getpid(2)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pid(pub u32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An opaque machine-word code address, as seen at runtime (i.e. already
/// relocated by the loader).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(pub usize);

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<usize> for Address {
    fn from(value: usize) -> Self {
        Address(value)
    }
}

impl From<*const ()> for Address {
    fn from(value: *const ()) -> Self {
        Address(value as usize)
    }
}

/// A sample count. Always non-negative; accumulated with relaxed atomic
/// adds because sample counts are commutative (see spec §5).
pub type SampleCount = u64;

/// log2 of the Trace Index's bucket count. The table has `2^TRACE_INDEX_HASH_ORDER`
/// buckets.
pub const TRACE_INDEX_HASH_ORDER: u32 = 20;

/// Number of buckets in the Trace Index.
pub const TRACE_INDEX_BUCKETS: usize = 1 << TRACE_INDEX_HASH_ORDER;

/// Size in bytes of each Node Arena chunk (~1 MiB).
pub const ARENA_CHUNK_BYTES: usize = 1 << 20;

/// Multiplier used by the Trace Index hash, chosen for its bit-mixing
/// properties (the fractional part of the golden ratio scaled to a 64-bit
/// odd integer). Matches the constant used throughout the original
/// implementation's hash table.
pub const GOLDEN_PRIME: u64 = 0x9E37_79B9_7F4A_7C15;

/// Minimum size, in bytes, a zero-size ELF symbol is inflated to so that
/// lookups landing exactly on its entry address still resolve.
pub const MIN_SYMBOL_SIZE: u64 = 16;

/// Default statistical sampling interval, matching `ITIMER_PROF` at
/// ~500 Hz. Overridable via `SCG_SAMPLE_INTERVAL_US` for tests.
pub const DEFAULT_SAMPLE_INTERVAL_US: u64 = 2_000;

/// Name printed for the synthetic caller of every outermost sampled frame.
pub const SPONTANEOUS: &str = "<spontaneous>";
