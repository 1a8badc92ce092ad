//! Signal-safe fixed-size record allocator (spec §4.1).
//!
//! Nodes are carved out of ~1 MiB chunks obtained directly from anonymous
//! `mmap`, never from the general-purpose heap, so that [`allocate_node`]
//! can be called from a `SIGPROF` handler. A statically allocated bootstrap
//! chunk backs the very first allocations so the call cannot fail even if
//! mapping is momentarily unavailable.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicI64, AtomicPtr, AtomicU64, AtomicUsize, Ordering};

use once_cell::sync::Lazy;

use crate::async_safe::ErrnoGuard;
use crate::domain::{Address, ARENA_CHUNK_BYTES};

/// One stack-frame record in the calling-context tree.
///
/// `address` and `parent` are written exactly once, by the thread that
/// allocated the node, before it is published into the Trace Index via a
/// compare-and-swap on a bucket head or `hash_next` slot (spec §4.2). Every
/// other field is mutated after publication and is therefore atomic.
pub struct TraceNode {
    address: Address,
    parent: Option<NodeId>,
    counter: AtomicU64,
    hash_next: AtomicPtr<TraceNode>,
    live_bytes: AtomicI64,
    refcount: AtomicI64,
}

impl TraceNode {
    const fn blank() -> Self {
        TraceNode {
            address: Address(0),
            parent: None,
            counter: AtomicU64::new(0),
            hash_next: AtomicPtr::new(std::ptr::null_mut()),
            live_bytes: AtomicI64::new(0),
            refcount: AtomicI64::new(0),
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn counter(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }

    /// Relaxed fetch-add: sample counts are commutative (spec §5).
    pub fn increment_counter(&self) {
        self.counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn hash_next_ptr(&self) -> *mut TraceNode {
        self.hash_next.load(Ordering::Acquire)
    }

    pub(crate) fn hash_next_atomic(&self) -> &AtomicPtr<TraceNode> {
        &self.hash_next
    }

    /// Adds `delta` (negative on free) to the node's live-byte total and
    /// returns the new value. May transiently go negative under a racing
    /// free/allocate pair on the same node (spec §9 open question); callers
    /// that print this value clamp at the presentation layer.
    pub fn add_live_bytes(&self, delta: i64) -> i64 {
        self.live_bytes.fetch_add(delta, Ordering::AcqRel) + delta
    }

    pub fn live_bytes(&self) -> i64 {
        self.live_bytes.load(Ordering::Acquire)
    }

    pub fn incr_refcount(&self) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    pub fn decr_refcount(&self) {
        self.refcount.fetch_sub(1, Ordering::AcqRel);
    }

    /// Writes `address`/`parent` on a freshly allocated, not-yet-published
    /// node. Safety: the caller must hold the only reference to this node
    /// (i.e. it has not yet been linked into any hash chain).
    unsafe fn init(ptr: NonNull<TraceNode>, address: Address, parent: Option<NodeId>) {
        let node = ptr.as_ptr();
        (*node).address = address;
        (*node).parent = parent;
    }
}

/// A handle to a [`TraceNode`] living in the arena. Cheap to copy; equality
/// and hashing are by address, matching the "unique per `(parent, address)`"
/// invariant nodes themselves enforce.
#[derive(Clone, Copy)]
pub struct NodeId(NonNull<TraceNode>);

// SAFETY: TraceNode's mutable state is entirely atomic; `address`/`parent`
// are write-once before any NodeId pointing at the node escapes the
// allocating thread (see `TraceNode::init`).
unsafe impl Send for NodeId {}
unsafe impl Sync for NodeId {}

impl NodeId {
    pub fn as_ref(&self) -> &TraceNode {
        unsafe { self.0.as_ref() }
    }

    pub(crate) fn as_ptr(&self) -> *mut TraceNode {
        self.0.as_ptr()
    }

    pub(crate) unsafe fn from_ptr(ptr: *mut TraceNode) -> Option<NodeId> {
        NonNull::new(ptr).map(NodeId)
    }
}

impl PartialEq for NodeId {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl Eq for NodeId {}

impl std::hash::Hash for NodeId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.as_ptr().hash(state);
    }
}

impl std::ops::Deref for NodeId {
    type Target = TraceNode;
    fn deref(&self) -> &TraceNode {
        self.as_ref()
    }
}

struct Chunk {
    nodes: NonNull<TraceNode>,
    capacity: usize,
    next_free: AtomicUsize,
    next: AtomicPtr<Chunk>,
    /// Byte length of the `mmap` backing this chunk (header + nodes in one
    /// mapping); zero for the static bootstrap chunk, which is never
    /// unmapped.
    mapped_bytes: usize,
}

const BOOTSTRAP_CAPACITY: usize = 64;
const BLANK_NODE: TraceNode = TraceNode::blank();
static BOOTSTRAP_NODES: [TraceNode; BOOTSTRAP_CAPACITY] = [BLANK_NODE; BOOTSTRAP_CAPACITY];

static BOOTSTRAP_CHUNK: Lazy<Chunk> = Lazy::new(|| Chunk {
    nodes: NonNull::new(BOOTSTRAP_NODES.as_ptr() as *mut TraceNode)
        .expect("static array base is never null"),
    capacity: BOOTSTRAP_CAPACITY,
    next_free: AtomicUsize::new(0),
    next: AtomicPtr::new(std::ptr::null_mut()),
    mapped_bytes: 0,
});

static CURRENT_CHUNK: Lazy<AtomicPtr<Chunk>> =
    Lazy::new(|| AtomicPtr::new(&*BOOTSTRAP_CHUNK as *const Chunk as *mut Chunk));

/// Maps a new chunk: one `mmap` covering both the `Chunk` header and its
/// node array, so installing a chunk never touches the general-purpose
/// heap. Returns `None` if the mapping fails (signal handlers must treat
/// this as "drop the sample", per spec §4.1).
fn map_chunk() -> Option<NonNull<Chunk>> {
    let _errno = ErrnoGuard::save();

    let header_size = std::mem::size_of::<Chunk>();
    let node_size = std::mem::size_of::<TraceNode>();
    let capacity = (ARENA_CHUNK_BYTES.saturating_sub(header_size)) / node_size;
    if capacity == 0 {
        return None;
    }
    let total = header_size + capacity * node_size;

    let region = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            total,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if region == libc::MAP_FAILED {
        return None;
    }

    let chunk_ptr = region as *mut Chunk;
    let nodes_ptr = unsafe { region.cast::<u8>().add(header_size) } as *mut TraceNode;
    for i in 0..capacity {
        unsafe { nodes_ptr.add(i).write(TraceNode::blank()) };
    }
    unsafe {
        chunk_ptr.write(Chunk {
            nodes: NonNull::new_unchecked(nodes_ptr),
            capacity,
            next_free: AtomicUsize::new(0),
            next: AtomicPtr::new(std::ptr::null_mut()),
            mapped_bytes: total,
        });
    }
    NonNull::new(chunk_ptr)
}

/// Unmaps a chunk that lost the chunk-install race (spec §4.1 step 3:
/// "losers of that race return their chunk to the OS").
unsafe fn unmap_chunk(chunk: NonNull<Chunk>) {
    let _errno = ErrnoGuard::save();
    let bytes = chunk.as_ref().mapped_bytes;
    if bytes == 0 {
        return;
    }
    libc::munmap(chunk.as_ptr().cast(), bytes);
}

/// Allocates a single uninitialized node. Safe to call concurrently from
/// signal context and from ordinary threads. Returns `None` only if a new
/// chunk was needed and mapping failed; callers must drop the current
/// sample in that case (spec §4.1 "Failure mode").
pub fn allocate_node(address: Address, parent: Option<NodeId>) -> Option<NodeId> {
    let _errno = ErrnoGuard::save();
    loop {
        let chunk_ptr = CURRENT_CHUNK.load(Ordering::Acquire);
        // SAFETY: chunk pointers, once installed, are never unmapped while
        // reachable from `CURRENT_CHUNK` or any node's provenance.
        let chunk = unsafe { &*chunk_ptr };
        let idx = chunk.next_free.load(Ordering::Relaxed);
        if idx < chunk.capacity {
            if chunk
                .next_free
                .compare_exchange_weak(idx, idx + 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                let node_ptr = unsafe { chunk.nodes.as_ptr().add(idx) };
                let node = NonNull::new(node_ptr)?;
                unsafe { TraceNode::init(node, address, parent) };
                return Some(NodeId(node));
            }
            continue;
        }

        let Some(new_chunk) = map_chunk() else {
            return None;
        };
        // Link backward to the chunk we observed so the chain of installed
        // chunks can be walked for accounting (see `chunk_count` below);
        // this has no bearing on allocation itself.
        unsafe { (*new_chunk.as_ptr()).next.store(chunk_ptr, Ordering::Relaxed) };
        match CURRENT_CHUNK.compare_exchange(
            chunk_ptr,
            new_chunk.as_ptr(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => continue,
            Err(_) => unsafe {
                unmap_chunk(new_chunk);
                continue;
            },
        }
    }
}

/// Number of chunks currently installed, including the bootstrap chunk.
/// Exposed only for the arena-monotonicity test (spec §8.4).
#[cfg(test)]
pub fn chunk_count() -> usize {
    let mut count = 1; // the chunk CURRENT_CHUNK currently points at
    let mut cursor = unsafe { &*CURRENT_CHUNK.load(Ordering::Acquire) }
        .next
        .load(Ordering::Acquire);
    while !cursor.is_null() {
        count += 1;
        cursor = unsafe { (*cursor).next.load(Ordering::Acquire) };
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_node_never_aliases() {
        let mut seen = std::collections::HashSet::new();
        for i in 0..1000 {
            let node = allocate_node(Address(i), None).expect("bootstrap chunk has headroom");
            assert!(seen.insert(node.as_ptr() as usize), "arena returned an aliased node");
        }
    }

    #[test]
    fn fields_are_visible_after_allocation() {
        let node = allocate_node(Address(0x1234), None).unwrap();
        assert_eq!(node.address(), Address(0x1234));
        assert_eq!(node.parent(), None);
        assert_eq!(node.counter(), 0);
        node.increment_counter();
        node.increment_counter();
        assert_eq!(node.counter(), 2);
    }

    #[test]
    fn concurrent_allocation_produces_distinct_nodes() {
        use std::sync::{Arc, Mutex};
        use std::thread;

        let results: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for t in 0..8u64 {
            let results = Arc::clone(&results);
            handles.push(thread::spawn(move || {
                let mut local = Vec::with_capacity(200);
                for i in 0..200u64 {
                    let node = allocate_node(Address((t << 16) | i), None).unwrap();
                    local.push(node.as_ptr() as usize);
                }
                results.lock().unwrap().extend(local);
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let results = results.lock().unwrap();
        let unique: std::collections::HashSet<_> = results.iter().copied().collect();
        assert_eq!(unique.len(), results.len(), "two threads received the same node");
    }

    #[test]
    fn chunk_count_grows_by_one_per_exhaustion() {
        let before = chunk_count();
        // A real mmap-backed chunk holds far more than 100,000 nodes, but
        // forcing this many allocations guarantees at least one
        // exhaustion/install cycle regardless of how much of the shared,
        // process-wide arena earlier tests already consumed.
        for i in 0..100_000u64 {
            allocate_node(Address(0xA000_0000 + i), None).expect("mmap-backed chunk should succeed");
        }
        let after = chunk_count();
        assert!(after > before, "chunk_count did not grow after forcing exhaustion");
    }
}
