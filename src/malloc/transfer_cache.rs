//! Transfer cache: per-size-class batched buffer between the per-CPU caches
//! and the central free lists.
//!
//! Each class owns a ring of object pointers indexed by monotonically
//! increasing head/tail counters (packed into one atomic word so `used` can
//! be read without the lock). Two variants share that storage and are
//! dispatched per operation from the `partial_transfer_cache` knob:
//!
//! * **Legacy** — operations at exact batch granularity only; anything else
//!   is a miss and falls through to the central free list.
//! * **Ring** — partial batches in [1, N]; an insert that would overflow
//!   evicts the oldest full batch to the central free list first.
//!
//! Toggling the variant preserves `used`, `capacity` and `max_capacity` by
//! construction. Removal is FIFO (tail side), so plunder and overflow
//! eviction always victimise the oldest objects.

use super::central_free_list::CentralFreeList;
use super::page_heap::PageHeap;
use super::page_map::PageMap;
use super::params::Parameters;
use super::size_class::{self, NUM_CLASSES};
use super::stats;
use crate::sync::SpinLock;
use crate::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::ptr::NonNull;

/// Starting capacity, in batches of the class's num-to-move.
const INITIAL_CAPACITY_IN_BATCHES: usize = 16;

/// Capacity ceiling, in batches.
const MAX_CAPACITY_IN_BATCHES: usize = 64;

/// Misses observed since the last resize check that trigger a capacity
/// grow attempt.
const RESIZE_MISS_THRESHOLD: usize = 1;

#[derive(Clone, Copy, Default, Debug)]
pub struct TransferCacheStats {
    pub insert_hits: usize,
    pub insert_misses: usize,
    pub insert_non_batch_misses: usize,
    pub remove_hits: usize,
    pub remove_misses: usize,
    pub remove_non_batch_misses: usize,
    pub used: usize,
    pub capacity: usize,
    pub max_capacity: usize,
}

struct SlotState {
    /// Ring storage; length is a power of two of at least `max_capacity`
    /// entries, so index masking stays correct across u32 counter wrap.
    ring: Box<[*mut u8]>,
    capacity: u32,
    /// Minimum `used` observed since the last plunder.
    low_water: u32,
}

// Safety: the raw pointers are just cargo; the slot lock serialises access.
unsafe impl Send for SlotState {}

struct Slot {
    state: SpinLock<SlotState>,
    /// head (high 32 bits) | tail (low 32 bits); written under the slot
    /// lock, readable lock-free for stats.
    head_tail: AtomicU64,
    max_capacity: u32,
    batch_size: u32,
    insert_hits: AtomicUsize,
    insert_misses: AtomicUsize,
    insert_non_batch_misses: AtomicUsize,
    remove_hits: AtomicUsize,
    remove_misses: AtomicUsize,
    remove_non_batch_misses: AtomicUsize,
    misses_at_last_resize: AtomicUsize,
}

#[inline]
pub(crate) fn pack(head: u32, tail: u32) -> u64 {
    (u64::from(head) << 32) | u64::from(tail)
}

#[inline]
pub(crate) fn unpack(v: u64) -> (u32, u32) {
    ((v >> 32) as u32, v as u32)
}

impl Slot {
    fn new(size_class: usize) -> Self {
        let (batch, max_cap, initial) = if size_class == 0 {
            (0, 0, 0)
        } else {
            let batch = size_class::num_to_move(size_class);
            let max_cap = batch * MAX_CAPACITY_IN_BATCHES;
            (batch, max_cap, batch * INITIAL_CAPACITY_IN_BATCHES)
        };
        let ring_len = max_cap.next_power_of_two();
        let ring = if max_cap == 0 {
            Vec::new().into_boxed_slice()
        } else {
            stats::METADATA_BYTES.add(ring_len * std::mem::size_of::<*mut u8>());
            vec![std::ptr::null_mut(); ring_len].into_boxed_slice()
        };
        Self {
            state: SpinLock::new(SlotState {
                ring,
                capacity: initial as u32,
                low_water: 0,
            }),
            head_tail: AtomicU64::new(0),
            max_capacity: max_cap as u32,
            batch_size: batch as u32,
            insert_hits: AtomicUsize::new(0),
            insert_misses: AtomicUsize::new(0),
            insert_non_batch_misses: AtomicUsize::new(0),
            remove_hits: AtomicUsize::new(0),
            remove_misses: AtomicUsize::new(0),
            remove_non_batch_misses: AtomicUsize::new(0),
            misses_at_last_resize: AtomicUsize::new(0),
        }
    }

    #[inline]
    fn used(&self) -> usize {
        let (head, tail) = unpack(self.head_tail.load(Ordering::Relaxed));
        head.wrapping_sub(tail) as usize
    }
}

pub(crate) struct TransferCache {
    slots: Box<[Slot]>,
    /// Round-robin cursor for picking capacity-donor classes.
    evict_cursor: AtomicUsize,
}

impl TransferCache {
    pub fn new() -> Self {
        let slots = (0..NUM_CLASSES).map(Slot::new).collect::<Vec<_>>().into_boxed_slice();
        Self {
            slots,
            evict_cursor: AtomicUsize::new(1),
        }
    }

    /// Buffer a batch of freed objects, forwarding to the central free list
    /// on a miss (or to make room, in the ring variant).
    pub fn insert_range(
        &self,
        central: &CentralFreeList,
        heap: &PageHeap,
        map: &PageMap,
        cl: usize,
        batch: &[NonNull<u8>],
    ) {
        let n = batch.len();
        if n == 0 {
            return;
        }
        let slot = &self.slots[cl];
        let partial = Parameters::partial_transfer_cache();
        let mut state = slot.state.lock();
        let (mut head, mut tail) = unpack(slot.head_tail.load(Ordering::Relaxed));
        let used = head.wrapping_sub(tail) as usize;
        let capacity = state.capacity as usize;

        let fits_legacy = n == slot.batch_size as usize && used + n <= capacity;
        let fits_ring = partial && n <= capacity;
        if !(fits_legacy || fits_ring) {
            slot.insert_misses.fetch_add(1, Ordering::Relaxed);
            if n < slot.batch_size as usize {
                slot.insert_non_batch_misses.fetch_add(1, Ordering::Relaxed);
            }
            drop(state);
            central.insert_range(heap, map, batch);
            return;
        }

        if partial && used + n > capacity {
            // Ring overflow: evict the oldest batches until the new items
            // fit.
            let mut evicted = Vec::with_capacity(slot.batch_size as usize);
            while (head.wrapping_sub(tail) as usize) + n > capacity {
                let take =
                    (slot.batch_size as usize).min(head.wrapping_sub(tail) as usize);
                debug_assert!(take > 0);
                evicted.clear();
                let mask = state.ring.len() - 1;
                for _ in 0..take {
                    let obj = state.ring[tail as usize & mask];
                    // Safety: every occupied ring entry holds a non-null
                    // object pointer.
                    evicted.push(unsafe { NonNull::new_unchecked(obj) });
                    tail = tail.wrapping_add(1);
                }
                slot.head_tail.store(pack(head, tail), Ordering::Relaxed);
                central.insert_range(heap, map, &evicted);
            }
            // Eviction lowered `used`; the low-water mark tracks it.
            state.low_water = state.low_water.min(head.wrapping_sub(tail));
        }

        let mask = state.ring.len() - 1;
        for &obj in batch {
            state.ring[head as usize & mask] = obj.as_ptr();
            head = head.wrapping_add(1);
        }
        slot.head_tail.store(pack(head, tail), Ordering::Relaxed);
        slot.insert_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Fetch up to `n` objects, falling through to the central free list on
    /// a miss. Returns the number obtained.
    pub fn remove_range(
        &self,
        central: &CentralFreeList,
        heap: &PageHeap,
        map: &PageMap,
        cl: usize,
        out: &mut Vec<NonNull<u8>>,
        n: usize,
    ) -> usize {
        debug_assert!(n > 0);
        let slot = &self.slots[cl];
        let partial = Parameters::partial_transfer_cache();
        let mut state = slot.state.lock();
        let (head, mut tail) = unpack(slot.head_tail.load(Ordering::Relaxed));
        let used = head.wrapping_sub(tail) as usize;

        let serve = if partial {
            n.min(used)
        } else if n == slot.batch_size as usize && used >= n {
            n
        } else {
            0
        };

        if serve == 0 {
            slot.remove_misses.fetch_add(1, Ordering::Relaxed);
            if n < slot.batch_size as usize {
                slot.remove_non_batch_misses.fetch_add(1, Ordering::Relaxed);
            }
            drop(state);
            return central.remove_range(heap, map, out, n);
        }

        let mask = state.ring.len() - 1;
        for _ in 0..serve {
            let obj = state.ring[tail as usize & mask];
            // Safety: occupied ring entries are non-null.
            out.push(unsafe { NonNull::new_unchecked(obj) });
            tail = tail.wrapping_add(1);
        }
        slot.head_tail.store(pack(head, tail), Ordering::Relaxed);
        state.low_water = state.low_water.min(head.wrapping_sub(tail));
        slot.remove_hits.fetch_add(1, Ordering::Relaxed);
        serve
    }

    /// Release the low-water mark's worth of oldest objects — the portion
    /// of the buffer that sat unused since the previous plunder — to the
    /// central free list, then re-arm the mark at the new length.
    pub fn try_plunder(
        &self,
        central: &CentralFreeList,
        heap: &PageHeap,
        map: &PageMap,
        cl: usize,
    ) {
        let slot = &self.slots[cl];
        let mut state = slot.state.lock();
        let (head, mut tail) = unpack(slot.head_tail.load(Ordering::Relaxed));
        let used = head.wrapping_sub(tail) as usize;
        let mut to_drain = (state.low_water as usize).min(used);

        let mut chunk = Vec::with_capacity(slot.batch_size as usize);
        while to_drain > 0 {
            let take = to_drain.min(slot.batch_size as usize);
            chunk.clear();
            let mask = state.ring.len() - 1;
            for _ in 0..take {
                let obj = state.ring[tail as usize & mask];
                // Safety: occupied ring entries are non-null.
                chunk.push(unsafe { NonNull::new_unchecked(obj) });
                tail = tail.wrapping_add(1);
            }
            slot.head_tail.store(pack(head, tail), Ordering::Relaxed);
            central.insert_range(heap, map, &chunk);
            to_drain -= take;
        }
        state.low_water = head.wrapping_sub(tail);
    }

    /// Grow this class's capacity by one batch if its recent miss count
    /// crosses the threshold, funding the growth by shrinking a donor class
    /// with spare capacity. Capacity is conserved in batch units.
    ///
    /// `centrals` is indexed by size class; the donor's overflow (if any)
    /// drains to the donor's own central list.
    pub fn try_resize(
        &self,
        centrals: &[CentralFreeList],
        heap: &PageHeap,
        map: &PageMap,
        cl: usize,
    ) {
        let slot = &self.slots[cl];
        let misses = slot.insert_misses.load(Ordering::Relaxed)
            + slot.remove_misses.load(Ordering::Relaxed);
        let last = slot.misses_at_last_resize.swap(misses, Ordering::Relaxed);
        if misses.wrapping_sub(last) < RESIZE_MISS_THRESHOLD {
            return;
        }
        if slot.state.lock().capacity + slot.batch_size > slot.max_capacity {
            return;
        }
        let Some(donor) = self.determine_size_class_to_evict(cl) else {
            return;
        };
        if !self.shrink_cache(&centrals[donor], heap, map, donor) {
            return;
        }
        let mut state = slot.state.lock();
        state.capacity = (state.capacity + slot.batch_size).min(slot.max_capacity);
    }

    /// Round-robin scan for a class able to give up one batch of capacity.
    fn determine_size_class_to_evict(&self, requester: usize) -> Option<usize> {
        let start = self.evict_cursor.fetch_add(1, Ordering::Relaxed);
        for i in 0..NUM_CLASSES - 1 {
            let candidate = 1 + (start + i) % (NUM_CLASSES - 1);
            if candidate == requester {
                continue;
            }
            let slot = &self.slots[candidate];
            let capacity = slot.state.lock().capacity;
            if capacity >= slot.batch_size && self.has_spare_capacity(candidate) {
                return Some(candidate);
            }
        }
        None
    }

    /// Reduce a class's capacity by one batch, evicting overflow to the
    /// central free list. Returns false if the class cannot shrink.
    fn shrink_cache(
        &self,
        central: &CentralFreeList,
        heap: &PageHeap,
        map: &PageMap,
        cl: usize,
    ) -> bool {
        let slot = &self.slots[cl];
        let mut state = slot.state.lock();
        if state.capacity < slot.batch_size {
            return false;
        }
        state.capacity -= slot.batch_size;
        let capacity = state.capacity;

        let (head, mut tail) = unpack(slot.head_tail.load(Ordering::Relaxed));
        if head.wrapping_sub(tail) > capacity {
            let excess = (head.wrapping_sub(tail) - capacity) as usize;
            let mut evicted = Vec::with_capacity(excess);
            let mask = state.ring.len() - 1;
            for _ in 0..excess {
                let obj = state.ring[tail as usize & mask];
                // Safety: occupied ring entries are non-null.
                evicted.push(unsafe { NonNull::new_unchecked(obj) });
                tail = tail.wrapping_add(1);
            }
            slot.head_tail.store(pack(head, tail), Ordering::Relaxed);
            state.low_water = state.low_water.min(head.wrapping_sub(tail));
            drop(state);
            central.insert_range(heap, map, &evicted);
        }
        true
    }

    pub fn has_spare_capacity(&self, cl: usize) -> bool {
        let slot = &self.slots[cl];
        let capacity = slot.state.lock().capacity as usize;
        capacity.saturating_sub(slot.used()) >= slot.batch_size as usize
    }

    /// Objects currently buffered for `cl`.
    pub fn tc_length(&self, cl: usize) -> usize {
        self.slots[cl].used()
    }

    #[allow(dead_code)]
    pub fn capacity(&self, cl: usize) -> usize {
        self.slots[cl].state.lock().capacity as usize
    }

    #[allow(dead_code)]
    pub fn max_capacity(&self, cl: usize) -> usize {
        self.slots[cl].max_capacity as usize
    }

    pub fn stats(&self, cl: usize) -> TransferCacheStats {
        let slot = &self.slots[cl];
        TransferCacheStats {
            insert_hits: slot.insert_hits.load(Ordering::Relaxed),
            insert_misses: slot.insert_misses.load(Ordering::Relaxed),
            insert_non_batch_misses: slot.insert_non_batch_misses.load(Ordering::Relaxed),
            remove_hits: slot.remove_hits.load(Ordering::Relaxed),
            remove_misses: slot.remove_misses.load(Ordering::Relaxed),
            remove_non_batch_misses: slot.remove_non_batch_misses.load(Ordering::Relaxed),
            used: slot.used(),
            capacity: slot.state.lock().capacity as usize,
            max_capacity: slot.max_capacity as usize,
        }
    }

    /// Total bytes buffered across all classes.
    pub fn free_bytes(&self) -> usize {
        (1..NUM_CLASSES)
            .map(|cl| self.tc_length(cl) * size_class::class_to_size(cl))
            .sum()
    }
}
