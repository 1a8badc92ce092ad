//! Environment-variable configuration, read identically by `scg-profiler`
//! and `scg-mtrace` so the two preloads never disagree about where a
//! report lands or how fast the sampler ticks.

use crate::domain::{Pid, DEFAULT_SAMPLE_INTERVAL_US};

/// Where the profiler's text report is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputTarget {
    /// `SCG_OUTPUT` unset or empty: write to stderr.
    Stderr,
    /// `SCG_OUTPUT` set; `%` already substituted with the pid.
    Path(String),
}

/// Reads `SCG_OUTPUT`, substituting a literal `%` with the process id.
/// Empty or unset routes to stderr, per spec §6.
pub fn output_target(pid: Pid) -> OutputTarget {
    match std::env::var("SCG_OUTPUT") {
        Ok(value) if !value.is_empty() => {
            OutputTarget::Path(value.replace('%', &pid.to_string()))
        }
        _ => OutputTarget::Stderr,
    }
}

/// Whether the allocation report should include per-frame offsets, per
/// `MTRACE_OFFSETS` (spec §6).
pub fn mtrace_offsets_enabled() -> bool {
    std::env::var("MTRACE_OFFSETS")
        .map(|v| !v.is_empty())
        .unwrap_or(false)
}

/// Sampling interval in microseconds. Defaults to 2000us (~500 Hz); an
/// override exists only so integration tests don't have to wait out a
/// real-time profile (see SPEC_FULL.md §4.11). Anything that fails to
/// parse as a positive integer is treated as unset.
pub fn sample_interval_us() -> u64 {
    std::env::var("SCG_SAMPLE_INTERVAL_US")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(DEFAULT_SAMPLE_INTERVAL_US)
}
