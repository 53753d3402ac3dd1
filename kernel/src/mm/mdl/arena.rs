//! Descriptor arena: the reserve of bookkeeping records and its refill
//! policy.
//!
//! Storage is chunked rather than one flat `Vec<Descriptor>` because each
//! chunk corresponds to exactly one pool allocation (or, for the boot
//! seed, one caller-owned buffer): that's what lets `destroy()` return
//! each pool allocation exactly once, by freeing the chunk whose first
//! descriptor carries `FREEABLE`, without a side list of allocations.

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec::Vec;

use super::descriptor::{Descriptor, DescriptorFlags, NIL};
use super::PoolSource;

/// Descriptors per pool-backed refill batch. Matches `DESCRIPTOR_BATCH`
/// in the original (Minoca OS) implementation this module is ported
/// from.
pub const BATCH_SIZE: usize = 32;

/// A contiguous allocation of descriptor storage: either owned by the
/// arena (a pool refill batch) or borrowed from a caller-supplied buffer
/// (the bootstrap seed).
enum Storage {
    Owned(Box<[Descriptor; BATCH_SIZE]>),
    External(&'static mut [Descriptor]),
}

impl Storage {
    fn len(&self) -> usize {
        match self {
            Storage::Owned(b) => b.len(),
            Storage::External(s) => s.len(),
        }
    }

    fn get(&self, i: usize) -> &Descriptor {
        match self {
            Storage::Owned(b) => &b[i],
            Storage::External(s) => &s[i],
        }
    }

    fn get_mut(&mut self, i: usize) -> &mut Descriptor {
        match self {
            Storage::Owned(b) => &mut b[i],
            Storage::External(s) => &mut s[i],
        }
    }
}

struct Chunk {
    base: u32,
    storage: Storage,
}

/// Backend the arena calls into when its reserve runs dry.
///
/// `pool_free`'s counterpart here is [`PoolBackend::free_batch`], which
/// takes ownership of the whole batch back rather than a bare pointer,
/// since our batches are typed `Box<[Descriptor; BATCH_SIZE]>` rather
/// than raw bytes.
pub trait PoolBackend {
    /// Request a zeroed batch of `BATCH_SIZE` descriptor records. `tag`
    /// identifies the caller for pool-leak diagnostics, mirroring this
    /// kernel's existing pool-tag convention (`mm::pool::PoolTag`).
    fn alloc_batch(&mut self, tag: u32) -> Option<Box<[Descriptor; BATCH_SIZE]>>;

    /// Return a previously allocated batch.
    fn free_batch(&mut self, batch: Box<[Descriptor; BATCH_SIZE]>);
}

const ARENA_TAG: u32 = u32::from_le_bytes(*b"Mdl ");

/// The reserve of unused descriptor records, plus the chunked storage
/// that backs every record ever handed out (in use or not).
pub struct DescriptorArena {
    chunks: Vec<Chunk>,
    /// Head of the unused-reserve intrusive list (`NIL` if empty).
    reserve_head: u32,
    unused_count: u32,
    source: PoolSource,
}

impl DescriptorArena {
    pub const fn new(source: PoolSource) -> Self {
        Self {
            chunks: Vec::new(),
            reserve_head: NIL,
            unused_count: 0,
            source,
        }
    }

    pub fn unused_count(&self) -> u32 {
        self.unused_count
    }

    /// Switch where future refills come from. Used once the pool
    /// allocator comes online, to move a boot-seeded arena
    /// (`PoolSource::None`) over to drawing its own batches.
    pub fn set_source(&mut self, source: PoolSource) {
        self.source = source;
    }

    fn locate(&self, index: u32) -> (usize, usize) {
        // Chunks are appended in increasing `base` order, so a reverse
        // scan finds the owning chunk in O(chunk count), which stays
        // small (refills are batched 32 at a time).
        for (chunk_idx, chunk) in self.chunks.iter().enumerate().rev() {
            if index >= chunk.base {
                return (chunk_idx, (index - chunk.base) as usize);
            }
        }
        panic!("descriptor index {} not owned by this arena", index);
    }

    pub fn get(&self, index: u32) -> &Descriptor {
        let (chunk_idx, slot) = self.locate(index);
        self.chunks[chunk_idx].storage.get(slot)
    }

    pub fn get_mut(&mut self, index: u32) -> &mut Descriptor {
        let (chunk_idx, slot) = self.locate(index);
        self.chunks[chunk_idx].storage.get_mut(slot)
    }

    fn next_base(&self) -> u32 {
        self.chunks
            .last()
            .map(|c| c.base + c.storage.len() as u32)
            .unwrap_or(0)
    }

    /// Push `index` onto the head of the unused-reserve list. The
    /// descriptor must already have `IN_USE` cleared.
    fn reserve_push(&mut self, index: u32) {
        {
            let d = self.get_mut(index);
            d.link_prev = NIL;
            d.link_next = self.reserve_head;
        }
        if self.reserve_head != NIL {
            self.get_mut(self.reserve_head).link_prev = index;
        }
        self.reserve_head = index;
        self.unused_count += 1;
    }

    /// Pop one descriptor index off the unused reserve, refilling from
    /// the pool backend first if the reserve is empty.
    pub fn pop(&mut self, backend: &mut dyn PoolBackend) -> Option<u32> {
        if self.reserve_head == NIL && !self.refill(backend) {
            return None;
        }

        let index = self.reserve_head;
        let next = self.get(index).link_next;
        self.reserve_head = next;
        if next != NIL {
            self.get_mut(next).link_prev = NIL;
        }
        self.unused_count -= 1;

        let d = self.get_mut(index);
        d.link_prev = NIL;
        d.link_next = NIL;
        d.flags.insert(DescriptorFlags::IN_USE);
        Some(index)
    }

    /// Return a descriptor to the unused reserve.
    pub fn push(&mut self, index: u32) {
        let freeable = self.get(index).freeable();
        let d = self.get_mut(index);
        d.flags.remove(DescriptorFlags::IN_USE);
        d.tree_parent = NIL;
        d.tree_left = NIL;
        d.tree_right = NIL;
        if freeable {
            d.flags.insert(DescriptorFlags::FREEABLE);
        }
        self.reserve_push(index);
    }

    fn refill(&mut self, backend: &mut dyn PoolBackend) -> bool {
        if self.source == PoolSource::None {
            return false;
        }
        let Some(mut batch) = backend.alloc_batch(ARENA_TAG) else {
            return false;
        };
        let base = self.next_base();
        for (i, slot) in batch.iter_mut().enumerate() {
            *slot = Descriptor::blank();
            if i == 0 {
                slot.flags.insert(DescriptorFlags::FREEABLE);
            }
        }
        self.chunks.push(Chunk {
            base,
            storage: Storage::Owned(batch),
        });
        for i in 0..BATCH_SIZE as u32 {
            self.reserve_push(base + i);
        }
        true
    }

    /// Seed the reserve from a caller-owned buffer. The arena never
    /// frees this storage; it belongs to the caller for the lifetime of
    /// the program (spec section 4.4.2: "the caller retains ownership").
    pub fn seed(&mut self, storage: &'static mut [Descriptor]) -> u32 {
        let count = storage.len() as u32;
        if count == 0 {
            return 0;
        }
        for slot in storage.iter_mut() {
            *slot = Descriptor::blank();
        }
        let base = self.next_base();
        self.chunks.push(Chunk {
            base,
            storage: Storage::External(storage),
        });
        for i in 0..count {
            self.reserve_push(base + i);
        }
        count
    }

    /// Drop the entry for a chunk whose first descriptor index is
    /// `head_index`, returning it to the pool backend if it owns its
    /// storage. Used only by `destroy()`.
    pub(super) fn release_batch_at(&mut self, head_index: u32, backend: &mut dyn PoolBackend) {
        let (chunk_idx, slot) = self.locate(head_index);
        debug_assert_eq!(slot, 0, "FREEABLE must only be set on a batch head");
        let chunk = self.chunks.remove(chunk_idx);
        if let Storage::Owned(batch) = chunk.storage {
            backend.free_batch(batch);
        }
    }

    /// Every descriptor index currently on the unused reserve, in
    /// traversal order. Used by `destroy()`'s second pass.
    pub(super) fn reserve_indices(&self) -> Vec<u32> {
        let mut out = Vec::new();
        let mut cur = self.reserve_head;
        while cur != NIL {
            out.push(cur);
            cur = self.get(cur).link_next;
        }
        out
    }

    pub(super) fn clear(&mut self) {
        self.chunks.clear();
        self.reserve_head = NIL;
        self.unused_count = 0;
    }
}

impl super::rbtree::TreeHost for DescriptorArena {
    fn node(&self, index: u32) -> &Descriptor {
        self.get(index)
    }

    fn node_mut(&mut self, index: u32) -> &mut Descriptor {
        self.get_mut(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullBackend;
    impl PoolBackend for NullBackend {
        fn alloc_batch(&mut self, _tag: u32) -> Option<Box<[Descriptor; BATCH_SIZE]>> {
            None
        }
        fn free_batch(&mut self, _batch: Box<[Descriptor; BATCH_SIZE]>) {}
    }

    struct CountingBackend {
        allocs: u32,
        frees: u32,
    }
    impl PoolBackend for CountingBackend {
        fn alloc_batch(&mut self, _tag: u32) -> Option<Box<[Descriptor; BATCH_SIZE]>> {
            self.allocs += 1;
            Some(Box::new([Descriptor::blank(); BATCH_SIZE]))
        }
        fn free_batch(&mut self, _batch: Box<[Descriptor; BATCH_SIZE]>) {
            self.frees += 1;
        }
    }

    #[test]
    fn pop_without_source_fails() {
        let mut arena = DescriptorArena::new(PoolSource::None);
        let mut backend = NullBackend;
        assert!(arena.pop(&mut backend).is_none());
    }

    #[test]
    fn refill_marks_only_batch_head_freeable() {
        let mut arena = DescriptorArena::new(PoolSource::NonPagedPool);
        let mut backend = CountingBackend { allocs: 0, frees: 0 };
        let first = arena.pop(&mut backend).unwrap();
        assert_eq!(backend.allocs, 1);
        assert!(arena.get(first).freeable());
        for _ in 0..BATCH_SIZE - 1 {
            let idx = arena.pop(&mut backend).unwrap();
            assert!(!arena.get(idx).freeable());
        }
        // reserve now empty, next pop triggers a second refill
        assert_eq!(backend.allocs, 1);
        let next_batch_head = arena.pop(&mut backend).unwrap();
        assert_eq!(backend.allocs, 2);
        assert!(arena.get(next_batch_head).freeable());
    }

    #[test]
    fn seeded_storage_is_never_freed() {
        static mut SEED: [Descriptor; 4] = [Descriptor::blank(); 4];
        let mut arena = DescriptorArena::new(PoolSource::None);
        let slice: &'static mut [Descriptor] = unsafe { &mut *core::ptr::addr_of_mut!(SEED) };
        let n = arena.seed(slice);
        assert_eq!(n, 4);
        assert_eq!(arena.unused_count(), 4);
        let mut backend = NullBackend;
        let idx = arena.pop(&mut backend).unwrap();
        assert!(!arena.get(idx).freeable());
    }
}
