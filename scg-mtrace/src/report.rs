//! `.memlog` report writer (spec §4.8, §6 "Report format (allocator)").

use std::sync::atomic::{AtomicI64, Ordering};

use scg_core::alloc_table::AllocationTable;
use scg_core::arena::NodeId;
use scg_core::config;
use scg_core::module_registry::ModuleRegistry;
use scg_core::resolver::{self, Resolved};

/// Running total as of the last report, used to compute the header's
/// `(<delta>)` against the current total.
static PREV_TOTAL: AtomicI64 = AtomicI64::new(0);

fn short_program_name() -> String {
    std::fs::read_to_string("/proc/self/comm")
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Symbolizes one frame for display, honoring `MTRACE_OFFSETS` (spec §6).
fn frame_line(resolved: &Resolved, include_offset: bool) -> String {
    let name = match (&resolved.module_name, &resolved.symbol_name) {
        (_, Some(symbol)) => symbol.clone(),
        (Some(module), None) => module.clone(),
        (None, None) => format!("{:#x}", resolved.offset),
    };
    if include_offset && resolved.symbol_name.is_some() {
        format!("{name}+{:#x}", resolved.offset)
    } else {
        name
    }
}

/// Walks `leaf`'s parent chain (innermost to outermost, the natural order
/// for a stack trace) and renders one line per frame.
fn stack_block(leaf: NodeId, registry: &ModuleRegistry, include_offset: bool) -> String {
    let mut lines = Vec::new();
    let mut current = Some(leaf);
    while let Some(node) = current {
        let resolved = resolver::resolve(registry, node.address().0);
        lines.push(format!("\t{}", frame_line(&resolved, include_offset)));
        current = node.parent();
    }
    lines.join("\n")
}

/// Builds and writes one numbered `.memlog` report for every live
/// allocation tracked in `table`. Called from an outermost allocator
/// entry (so it may allocate and perform I/O freely) and at process exit.
pub fn emit(table: &AllocationTable) {
    let registry = ModuleRegistry::snapshot();
    let include_offset = config::mtrace_offsets_enabled();

    let mut by_stack: std::collections::HashMap<String, i64> = std::collections::HashMap::new();
    for (node, bytes) in table.live_bytes_by_trace() {
        // Negative live_bytes is a transient race window (spec §9); clamp
        // at the presentation layer, the source's own second line of
        // defense.
        let bytes = bytes.max(0);
        if bytes == 0 {
            continue;
        }
        let block = stack_block(node, &registry, include_offset);
        *by_stack.entry(block).or_insert(0) += bytes;
    }

    let total: i64 = by_stack.values().sum();
    let delta = total - PREV_TOTAL.swap(total, Ordering::AcqRel);

    let mut entries: Vec<(String, i64)> = by_stack.into_iter().collect();
    entries.sort_by(|a, b| b.1.cmp(&a.1));

    let mut text = format!("Outstanding bytes: {total} ({delta:+})\n");
    for (block, bytes) in &entries {
        text.push_str(&format!("{bytes:+}\n{block}\n"));
    }

    let program = short_program_name();
    let pid = std::process::id();
    let sequence = scg_core::async_safe::next_report_sequence();
    let path = format!("{program}-{pid}-{sequence}.memlog");

    if let Err(err) = scg_core::report::write_to_path(&path, &text) {
        log::warn!("could not open allocation report {path}: {err}; dropping this report");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scg_core::domain::Address;
    use scg_core::trace_index;

    #[test]
    fn frame_line_falls_back_to_raw_address_when_unresolved() {
        let resolved = Resolved { module_name: None, symbol_name: None, offset: 0x1234 };
        assert_eq!(frame_line(&resolved, false), "0x1234");
    }

    #[test]
    fn stack_block_has_one_line_per_frame() {
        trace_index::ensure_initialized();
        let root = trace_index::intern(None, Address(0x3_0000_1000)).unwrap();
        let leaf = trace_index::intern(Some(root), Address(0x3_0000_2000)).unwrap();
        let registry = ModuleRegistry::snapshot();
        let block = stack_block(leaf, &registry, false);
        assert_eq!(block.lines().count(), 2);
    }
}
