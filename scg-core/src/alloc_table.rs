//! Pointer-keyed live-allocation table shared by the allocation tracer
//! (spec §3 "Allocation Record", §4.8).
//!
//! This module only holds the bookkeeping table itself. The re-entrancy
//! guard around the malloc-family interposer (depth counter + mutex) lives
//! in `scg-mtrace::intercept`, which is the only caller.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use crate::arena::NodeId;

pub struct AllocationRecord {
    pub bytes: usize,
    pub trace: NodeId,
}

pub struct AllocationTable {
    records: Mutex<HashMap<usize, AllocationRecord>>,
    global_bytes: AtomicI64,
}

impl Default for AllocationTable {
    fn default() -> Self {
        AllocationTable { records: Mutex::new(HashMap::new()), global_bytes: AtomicI64::new(0) }
    }
}

impl AllocationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a successful allocation. `trace` is the Trace Node for the
    /// stack that performed the allocation, obtained via the same
    /// interning path used by the profiler (spec §4.8).
    pub fn record_allocation(&self, ptr: usize, bytes: usize, trace: NodeId) {
        trace.incr_refcount();
        trace.add_live_bytes(bytes as i64);
        self.global_bytes.fetch_add(bytes as i64, Ordering::AcqRel);
        self.records.lock().unwrap().insert(ptr, AllocationRecord { bytes, trace });
    }

    /// Removes the record for `ptr`, if any, adjusting both the node's and
    /// the global live-byte totals. Returns `None` for a pointer the table
    /// never recorded (the "foreign free" case, spec §7).
    pub fn record_free(&self, ptr: usize) -> Option<AllocationRecord> {
        let removed = self.records.lock().unwrap().remove(&ptr);
        if let Some(record) = &removed {
            record.trace.add_live_bytes(-(record.bytes as i64));
            record.trace.decr_refcount();
            self.global_bytes.fetch_sub(record.bytes as i64, Ordering::AcqRel);
        }
        removed
    }

    pub fn global_bytes(&self) -> i64 {
        self.global_bytes.load(Ordering::Acquire)
    }

    /// Groups live allocations by trace node, returning `(node, total_bytes)`
    /// pairs for every node with a nonzero live total. Used by the report
    /// writer; takes the table lock for the duration of the scan, which is
    /// why report generation is serialized against allocation/free (spec §9
    /// open question on negative `live_bytes`).
    pub fn live_bytes_by_trace(&self) -> Vec<(NodeId, i64)> {
        let records = self.records.lock().unwrap();
        let mut totals: HashMap<usize, (NodeId, i64)> = HashMap::new();
        for record in records.values() {
            let entry = totals
                .entry(record.trace.as_ptr() as usize)
                .or_insert((record.trace, 0));
            entry.1 += record.bytes as i64;
        }
        drop(records);
        totals.into_values().filter(|(_, bytes)| *bytes != 0).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Address;
    use crate::trace_index;

    #[test]
    fn balanced_alloc_free_returns_to_zero() {
        trace_index::ensure_initialized();
        let table = AllocationTable::new();
        let node = trace_index::intern(None, Address(0x5_0000_0000)).unwrap();

        table.record_allocation(0xdead_0000, 1024, node);
        table.record_allocation(0xdead_1000, 2048, node);
        table.record_free(0xdead_0000);

        assert_eq!(table.global_bytes(), 2048);
        assert_eq!(node.live_bytes(), 2048);

        table.record_free(0xdead_1000);
        assert_eq!(table.global_bytes(), 0);
        assert_eq!(node.live_bytes(), 0);
    }

    #[test]
    fn freeing_an_unknown_pointer_is_reported_as_absent() {
        let table = AllocationTable::new();
        assert!(table.record_free(0x1234).is_none());
    }
}
