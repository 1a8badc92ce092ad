//! Lock-free hash table mapping `(parent, address)` to its unique
//! [`TraceNode`] (spec §4.2).

use std::sync::atomic::{AtomicPtr, Ordering};

use once_cell::sync::Lazy;

use crate::arena::{self, NodeId, TraceNode};
use crate::domain::{Address, GOLDEN_PRIME, TRACE_INDEX_BUCKETS, TRACE_INDEX_HASH_ORDER};

struct Bucket(AtomicPtr<TraceNode>);

static BUCKETS: Lazy<Vec<Bucket>> = Lazy::new(|| {
    let mut v = Vec::with_capacity(TRACE_INDEX_BUCKETS);
    v.resize_with(TRACE_INDEX_BUCKETS, || Bucket(AtomicPtr::new(std::ptr::null_mut())));
    v
});

/// Forces the table's backing storage to be allocated. Must run during
/// library initialization, before the sampling timer is armed — allocating
/// the (multi-megabyte) bucket array itself is not signal-safe, only
/// indexing into it once allocated is.
pub fn ensure_initialized() {
    Lazy::force(&BUCKETS);
}

fn bucket_index(parent: Option<NodeId>, address: Address) -> usize {
    let parent_word = parent.map(|p| p.as_ptr() as u64).unwrap_or(0);
    let h = 5u64
        .wrapping_mul(parent_word)
        .wrapping_add(address.0 as u64)
        .wrapping_mul(GOLDEN_PRIME);
    (h >> (64 - TRACE_INDEX_HASH_ORDER)) as usize
}

/// Returns the unique node for `(parent, address)`, creating and
/// publishing one if absent. Safe to call from signal context and
/// concurrently from multiple threads.
///
/// Returns `None` only when the arena itself is exhausted and cannot map a
/// new chunk; callers must drop the current sample in that case.
pub fn intern(parent: Option<NodeId>, address: Address) -> Option<NodeId> {
    let bucket = &BUCKETS[bucket_index(parent, address)];
    loop {
        let head = bucket.0.load(Ordering::Acquire);
        let mut cursor = head;
        while !cursor.is_null() {
            let node = unsafe { &*cursor };
            if node.parent() == parent && node.address() == address {
                return unsafe { NodeId::from_ptr(cursor) };
            }
            cursor = node.hash_next_ptr();
        }

        let candidate = arena::allocate_node(address, parent)?;
        candidate.hash_next_atomic().store(head, Ordering::Release);
        match bucket.0.compare_exchange(
            head,
            candidate.as_ptr(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => return Some(candidate),
            // Another thread won the race; the candidate is abandoned in
            // the arena (bounded, intentional leak per spec §4.3) and we
            // retry the walk, which will now find the winner's node.
            Err(_) => continue,
        }
    }
}

/// Total number of nodes with a nonzero sample counter, used by the
/// Report Builder to find every sampled chain's leaf.
pub fn for_each_terminal_node(mut visit: impl FnMut(NodeId)) {
    for bucket in BUCKETS.iter() {
        let mut cursor = bucket.0.load(Ordering::Acquire);
        while !cursor.is_null() {
            let node = unsafe { &*cursor };
            if node.counter() > 0 {
                if let Some(id) = unsafe { NodeId::from_ptr(cursor) } {
                    visit(id);
                }
            }
            cursor = node.hash_next_ptr();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intern_is_idempotent() {
        ensure_initialized();
        let a = intern(None, Address(0x1000)).unwrap();
        let b = intern(None, Address(0x1000)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn distinct_addresses_get_distinct_nodes() {
        ensure_initialized();
        let a = intern(None, Address(0x2000)).unwrap();
        let b = intern(None, Address(0x2001)).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn chains_are_acyclic() {
        ensure_initialized();
        let root = intern(None, Address(0x3000)).unwrap();
        let mid = intern(Some(root), Address(0x3001)).unwrap();
        let leaf = intern(Some(mid), Address(0x3002)).unwrap();

        let mut steps = 0;
        let mut cursor = Some(leaf);
        while let Some(node) = cursor {
            cursor = node.parent();
            steps += 1;
            assert!(steps < 10_000, "parent chain did not terminate");
        }
        assert_eq!(steps, 3);
    }

    #[test]
    fn concurrent_interning_converges_on_shared_set() {
        use std::sync::{Arc, Barrier};
        use std::thread;

        ensure_initialized();
        const THREADS: usize = 8;
        const ITERATIONS: usize = 500;
        const SET_SIZE: usize = 16;

        let barrier = Arc::new(Barrier::new(THREADS));
        let mut handles = Vec::new();
        for _ in 0..THREADS {
            let barrier = Arc::clone(&barrier);
            handles.push(thread::spawn(move || {
                barrier.wait();
                let mut seen = Vec::with_capacity(ITERATIONS);
                for i in 0..ITERATIONS {
                    let addr = Address(0x9000_0000 + (i % SET_SIZE));
                    seen.push(intern(None, addr).unwrap());
                }
                seen
            }));
        }

        let mut all_ids = std::collections::HashMap::new();
        for h in handles {
            for node in h.join().unwrap() {
                all_ids
                    .entry(node.address().0)
                    .or_insert(node.as_ptr() as usize);
                assert_eq!(all_ids[&node.address().0], node.as_ptr() as usize);
            }
        }
        assert_eq!(all_ids.len(), SET_SIZE);
    }
}
