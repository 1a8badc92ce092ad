//! An ordinary, unmodified host program used to exercise the call-graph
//! profiler. It is never linked against `scg-profiler` — the whole point
//! of `LD_PRELOAD` instrumentation is that the host needs no rebuild:
//!
//! ```bash
//! cargo build --release
//! SCG_OUTPUT=/tmp/call-graph-%.prof \
//!   LD_PRELOAD=target/release/libscgprof.so \
//!   target/release/call-graph-demo
//! ```
//!
//! `main` calls `f`, which calls `g` in a tight loop for a few seconds —
//! while the sampler's timer is firing, every sample's innermost frame is
//! `g`, matching scenario E1 (`main → f → g`, `g.terminal_count` equal to
//! the sample count, `main.callers[<spontaneous>]` equal to it too).
//! Afterward it calls a self-recursive function four levels deep,
//! matching E2's `call_count_breakdown`.

use std::time::{Duration, Instant};

use clap::Parser;

/// How long to spend inside `g` before moving on to the recursive phase.
#[derive(Parser)]
struct Args {
    #[arg(long, default_value_t = 3)]
    seconds: u64,

    #[arg(long, default_value_t = 4)]
    recursion_depth: u32,
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    log::info!("call-graph-demo starting: {}s in g(), then depth {}", args.seconds, args.recursion_depth);

    f(Duration::from_secs(args.seconds));
    let mut calls = 0u64;
    for _ in 0..2000 {
        calls += r(args.recursion_depth);
    }
    log::info!("recursive phase complete: {calls} total calls to r()");
}

#[inline(never)]
fn f(budget: Duration) {
    g(budget);
}

#[inline(never)]
fn g(budget: Duration) {
    let start = Instant::now();
    let mut acc = 0u64;
    while start.elapsed() < budget {
        for _ in 0..10_000 {
            acc = acc.wrapping_add(std::hint::black_box(1));
        }
    }
    std::hint::black_box(acc);
}

/// Recurses exactly `depth` levels before returning, so a sample taken
/// anywhere inside it has a call chain of that many `r` frames —
/// `call_count_breakdown[depth - 1]` accumulates.
#[inline(never)]
fn r(depth: u32) -> u64 {
    if depth == 0 {
        std::hint::black_box(0)
    } else {
        1 + r(depth - 1)
    }
}
