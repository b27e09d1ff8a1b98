//! Per-CPU object cache: the allocator's fast path.
//!
//! One contiguous slab mapping covers all CPUs; each CPU's subregion holds
//! a bounded LIFO of object pointers per size class and is faulted in
//! lazily on first touch. Restartable sequences are modelled by their
//! sanctioned fallback: a per-CPU spinlock over the same per-CPU layout —
//! operations on distinct CPUs never contend, and a critical section is a
//! handful of loads plus one store.
//!
//! Each CPU carries a byte budget (`allocated + unallocated = capacity`).
//! Slot capacities grow on misses, funded from the unallocated pool or by
//! stealing from a sibling class; `shuffle` moves whole budget between cold
//! and hot CPUs (conserving the total); `reclaim` empties CPUs that went
//! idle; the slab itself can be regrown to a bigger or smaller per-CPU
//! footprint when the aggregate miss ratio drifts out of band.

use super::central_free_list::CentralFreeList;
use super::error::MemError;
use super::page_heap::PageHeap;
use super::page_map::PageMap;
use super::params::Parameters;
use super::size_class::{self, NUM_CLASSES};
use super::transfer_cache::TransferCache;
use super::vm::{PlatformVmOps, VmOps};
use crate::sync::SpinLock;
use crate::sync::atomic::{AtomicU64, Ordering};
use fixedbitset::FixedBitSet;
use std::ptr::NonNull;

/// log2 of the default per-CPU slab bytes (256 KiB).
pub(crate) const DEFAULT_PER_CPU_SHIFT: usize = 18;
const MIN_PER_CPU_SHIFT: usize = 16;
const MAX_PER_CPU_SHIFT: usize = 22;

/// A cold CPU is never shuffled below this fraction of the configured
/// per-CPU budget.
const CAPACITY_FLOOR_DENOMINATOR: usize = 10;

/// The miss-rate intervals that keep independent snapshots.
#[derive(Clone, Copy)]
pub(crate) enum MissInterval {
    Shuffle = 0,
    Reclaim = 1,
    Resize = 2,
}

/// Counters for one CPU's cache.
#[derive(Clone, Copy, Default, Debug)]
pub struct CpuCacheStats {
    pub underflows: u64,
    pub overflows: u64,
    pub capacity: usize,
    pub allocated: usize,
    pub unallocated: usize,
    pub cached_bytes: usize,
}

/// Everything below the per-CPU tier, bundled so policy passes can push
/// objects down the stack.
pub(crate) struct BackingTiers<'a> {
    pub tc: &'a TransferCache,
    pub centrals: &'a [CentralFreeList],
    pub heap: &'a PageHeap,
    pub map: &'a PageMap,
}

impl BackingTiers<'_> {
    fn flush(&self, cl: usize, objs: &[NonNull<u8>]) {
        let batch = size_class::num_to_move(cl);
        for chunk in objs.chunks(batch) {
            self.tc
                .insert_range(&self.centrals[cl], self.heap, self.map, cl, chunk);
        }
    }
}

#[derive(Clone, Copy, Default)]
struct SlotMeta {
    len: usize,
    cap: usize,
    /// Minimum `len` since the last plunder pass.
    low_water: usize,
}

struct CpuState {
    /// This CPU's subregion of the slab; null until first use.
    region: *mut u8,
    /// Object-pointer entries available per class in the region.
    entries_per_class: usize,
    slots: Box<[SlotMeta]>,
    /// Byte budget for this CPU.
    capacity: usize,
    /// Bytes committed to slot capacities (Σ cap × object size).
    allocated: usize,
    /// Round-robin cursor for capacity stealing.
    steal_cursor: usize,
}

// Safety: region pointers are only dereferenced under the owning CPU lock.
unsafe impl Send for CpuState {}

impl CpuState {
    #[inline]
    fn slot_array(&self, cl: usize) -> *mut *mut u8 {
        debug_assert!(!self.region.is_null() && cl >= 1);
        // Safety: class areas are laid out contiguously inside the region.
        unsafe {
            self.region
                .add((cl - 1) * self.entries_per_class * std::mem::size_of::<*mut u8>())
                .cast::<*mut u8>()
        }
    }
}

struct CpuSlot {
    state: SpinLock<CpuState>,
    underflows: AtomicU64,
    overflows: AtomicU64,
    requests: AtomicU64,
    /// Miss counts at the last read of each interval kind.
    miss_snapshots: [AtomicU64; 3],
    /// Request count at the last resize interval read.
    requests_at_resize: AtomicU64,
}

struct SlabInfo {
    base: NonNull<u8>,
    shift: usize,
    populated: FixedBitSet,
}

// Safety: guarded by the slab lock.
unsafe impl Send for SlabInfo {}

#[derive(Clone, Copy)]
pub(crate) struct CpuCacheConfig {
    pub num_cpus: usize,
    pub shift: usize,
}

impl Default for CpuCacheConfig {
    fn default() -> Self {
        Self {
            num_cpus: probe_num_cpus(),
            shift: DEFAULT_PER_CPU_SHIFT,
        }
    }
}

pub(crate) struct CpuCache {
    cpus: Box<[CpuSlot]>,
    slab: SpinLock<SlabInfo>,
    num_cpus: usize,
}

#[inline]
fn entries_per_class(shift: usize) -> usize {
    (1usize << shift) / (NUM_CLASSES - 1) / std::mem::size_of::<*mut u8>()
}

fn map_slab(num_cpus: usize, shift: usize) -> Result<NonNull<u8>, MemError> {
    // Safety: plain anonymous mapping; the kernel backs pages on first
    // touch, which is what gives the per-CPU lazy population.
    unsafe { PlatformVmOps::map(num_cpus << shift) }
}

impl CpuCache {
    pub fn new(config: CpuCacheConfig) -> Result<Self, MemError> {
        assert!(config.num_cpus > 0);
        assert!((MIN_PER_CPU_SHIFT..=MAX_PER_CPU_SHIFT).contains(&config.shift));
        let base = map_slab(config.num_cpus, config.shift)?;
        let budget = Parameters::max_per_cpu_cache_size();
        let cpus = (0..config.num_cpus)
            .map(|_| CpuSlot {
                state: SpinLock::new(CpuState {
                    region: std::ptr::null_mut(),
                    entries_per_class: entries_per_class(config.shift),
                    slots: vec![SlotMeta::default(); NUM_CLASSES].into_boxed_slice(),
                    capacity: budget,
                    allocated: 0,
                    steal_cursor: 1,
                }),
                underflows: AtomicU64::new(0),
                overflows: AtomicU64::new(0),
                requests: AtomicU64::new(0),
                miss_snapshots: [AtomicU64::new(0), AtomicU64::new(0), AtomicU64::new(0)],
                requests_at_resize: AtomicU64::new(0),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Ok(Self {
            cpus,
            slab: SpinLock::new(SlabInfo {
                base,
                shift: config.shift,
                populated: FixedBitSet::with_capacity(config.num_cpus),
            }),
            num_cpus: config.num_cpus,
        })
    }

    #[inline]
    pub fn num_cpus(&self) -> usize {
        self.num_cpus
    }

    /// Bind `state` to its slab subregion on first use.
    ///
    /// Lock order: the caller holds this CPU's lock; the slab lock nests
    /// inside every CPU lock.
    fn populate(&self, cpu: usize, state: &mut CpuState) {
        let mut slab = self.slab.lock();
        state.region =
            // Safety: cpu < num_cpus, so the offset stays inside the slab.
            unsafe { slab.base.as_ptr().add(cpu << slab.shift) };
        state.entries_per_class = entries_per_class(slab.shift);
        slab.populated.insert(cpu);
    }

    /// Pop one object from (cpu, cl). Counts the request, and the
    /// underflow when the slot is empty.
    pub fn pop(&self, cpu: usize, cl: usize) -> Option<NonNull<u8>> {
        let slot = &self.cpus[cpu];
        slot.requests.fetch_add(1, Ordering::Relaxed);
        let mut state = slot.state.lock();
        let meta = state.slots[cl];
        if meta.len == 0 {
            slot.underflows.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        let arr = state.slot_array(cl);
        let len = meta.len - 1;
        // Safety: len < cap ≤ entries_per_class; the region is mapped.
        let obj = unsafe { *arr.add(len) };
        let m = &mut state.slots[cl];
        m.len = len;
        m.low_water = m.low_water.min(len);
        // Safety: only live object pointers are stored in slots.
        Some(unsafe { NonNull::new_unchecked(obj) })
    }

    /// Push one object onto (cpu, cl). Returns the object back on
    /// overflow, counting it.
    pub fn push(&self, cpu: usize, cl: usize, obj: NonNull<u8>) -> Result<(), NonNull<u8>> {
        let slot = &self.cpus[cpu];
        slot.requests.fetch_add(1, Ordering::Relaxed);
        let mut state = slot.state.lock();
        if state.region.is_null() {
            self.populate(cpu, &mut state);
        }
        let meta = state.slots[cl];
        if meta.len >= meta.cap {
            slot.overflows.fetch_add(1, Ordering::Relaxed);
            return Err(obj);
        }
        let arr = state.slot_array(cl);
        // Safety: len < cap ≤ entries_per_class; the region is mapped.
        unsafe { *arr.add(meta.len) = obj.as_ptr() };
        state.slots[cl].len += 1;
        Ok(())
    }

    /// Push up to `batch.len()` objects; returns how many fit.
    pub fn insert_batch(&self, cpu: usize, cl: usize, batch: &[NonNull<u8>]) -> usize {
        let slot = &self.cpus[cpu];
        let mut state = slot.state.lock();
        if state.region.is_null() {
            self.populate(cpu, &mut state);
        }
        let meta = state.slots[cl];
        let space = meta.cap - meta.len;
        let take = batch.len().min(space);
        let arr = state.slot_array(cl);
        for (i, obj) in batch.iter().take(take).enumerate() {
            // Safety: len + take ≤ cap ≤ entries_per_class.
            unsafe { *arr.add(meta.len + i) = obj.as_ptr() };
        }
        state.slots[cl].len += take;
        take
    }

    /// Pop up to `n` objects into `out`; returns how many came out.
    pub fn extract_batch(
        &self,
        cpu: usize,
        cl: usize,
        out: &mut Vec<NonNull<u8>>,
        n: usize,
    ) -> usize {
        let slot = &self.cpus[cpu];
        let mut state = slot.state.lock();
        let meta = state.slots[cl];
        let take = n.min(meta.len);
        let arr = state.slot_array(cl);
        for i in 0..take {
            // Safety: indices below len are occupied.
            let obj = unsafe { *arr.add(meta.len - 1 - i) };
            out.push(unsafe { NonNull::new_unchecked(obj) });
        }
        let m = &mut state.slots[cl];
        m.len -= take;
        m.low_water = m.low_water.min(m.len);
        take
    }

    /// Try to grow (cpu, cl)'s capacity by one batch of entries. Funded
    /// from the CPU's unallocated bytes, else by stealing spare capacity
    /// from a sibling class. Returns whether the slot grew.
    pub fn grow_slot(&self, cpu: usize, cl: usize) -> bool {
        let slot = &self.cpus[cpu];
        let mut state = slot.state.lock();
        if state.region.is_null() {
            self.populate(cpu, &mut state);
        }
        let object_size = size_class::class_to_size(cl);
        let batch = size_class::num_to_move(cl);
        let meta = state.slots[cl];
        let grow_entries = batch.min(state.entries_per_class - meta.cap);
        if grow_entries == 0 {
            return false;
        }
        let need = grow_entries * object_size;

        if state.capacity - state.allocated < need
            && !Self::steal_capacity(&mut state, cl, need)
        {
            return false;
        }
        if state.capacity - state.allocated < need {
            return false;
        }
        state.allocated += need;
        state.slots[cl].cap += grow_entries;
        true
    }

    /// Round-robin over sibling classes, releasing spare (unused) slot
    /// capacity until `need` bytes are unallocated. Never evicts objects.
    fn steal_capacity(state: &mut CpuState, requester: usize, need: usize) -> bool {
        let start = state.steal_cursor;
        for i in 0..NUM_CLASSES - 1 {
            if state.capacity - state.allocated >= need {
                break;
            }
            let victim = 1 + (start + i) % (NUM_CLASSES - 1);
            if victim == requester {
                continue;
            }
            let vm = state.slots[victim];
            let spare = vm.cap - vm.len;
            if spare == 0 {
                continue;
            }
            let victim_size = size_class::class_to_size(victim);
            let still_needed = need - (state.capacity - state.allocated);
            let take = spare.min(still_needed.div_ceil(victim_size));
            state.slots[victim].cap -= take;
            state.allocated -= take * victim_size;
            state.steal_cursor = victim;
        }
        state.capacity - state.allocated >= need
    }

    /// Misses (underflows + overflows) recorded for `cpu` so far.
    pub fn misses(&self, cpu: usize) -> u64 {
        let slot = &self.cpus[cpu];
        slot.underflows.load(Ordering::Relaxed) + slot.overflows.load(Ordering::Relaxed)
    }

    pub fn underflows(&self, cpu: usize) -> u64 {
        self.cpus[cpu].underflows.load(Ordering::Relaxed)
    }

    pub fn overflows(&self, cpu: usize) -> u64 {
        self.cpus[cpu].overflows.load(Ordering::Relaxed)
    }

    /// Misses since the last snapshot of `interval` for `cpu`. Reading
    /// does not clear; each interval advances its own snapshot.
    pub fn misses_since(&self, interval: MissInterval, cpu: usize) -> u64 {
        let snap = self.cpus[cpu].miss_snapshots[interval as usize].load(Ordering::Relaxed);
        self.misses(cpu).wrapping_sub(snap)
    }

    pub fn update_snapshot(&self, interval: MissInterval, cpu: usize) {
        self.cpus[cpu].miss_snapshots[interval as usize]
            .store(self.misses(cpu), Ordering::Relaxed);
    }

    fn populated_cpus(&self) -> FixedBitSet {
        self.slab.lock().populated.clone()
    }

    /// Move budget from the coldest CPU (fewest misses this interval) to
    /// the hottest, down to the capacity floor. Total capacity across CPUs
    /// is conserved.
    pub fn shuffle(&self, tiers: &BackingTiers<'_>) {
        if self.num_cpus < 2 {
            return;
        }
        let populated = self.populated_cpus();
        let mut hottest: Option<(usize, u64)> = None;
        let mut coldest: Option<(usize, u64)> = None;
        for cpu in 0..self.num_cpus {
            if !populated.contains(cpu) {
                continue;
            }
            let delta = self.misses_since(MissInterval::Shuffle, cpu);
            if hottest.is_none_or(|(_, d)| delta > d) {
                hottest = Some((cpu, delta));
            }
            if coldest.is_none_or(|(_, d)| delta < d) {
                coldest = Some((cpu, delta));
            }
        }
        let (Some((hot, hot_delta)), Some((cold, _))) = (hottest, coldest) else {
            return;
        };
        if hot == cold || hot_delta == 0 {
            return;
        }

        let floor = Parameters::max_per_cpu_cache_size() / CAPACITY_FLOOR_DENOMINATOR;
        let moved = {
            let mut cold_state = self.cpus[cold].state.lock();
            let movable = cold_state.capacity.saturating_sub(floor);
            if movable == 0 {
                return;
            }
            // Shrink the cold CPU's slots until its allocation fits the
            // reduced budget, spilling cached objects down a tier.
            let new_capacity = cold_state.capacity - movable;
            self.shrink_to_budget(cold, &mut cold_state, new_capacity, tiers);
            cold_state.capacity = new_capacity;
            movable
        };
        self.cpus[hot].state.lock().capacity += moved;

        for cpu in [hot, cold] {
            self.update_snapshot(MissInterval::Shuffle, cpu);
        }
    }

    /// Shrink slot capacities (evicting cached objects) until
    /// `allocated <= budget`.
    fn shrink_to_budget(
        &self,
        _cpu: usize,
        state: &mut CpuState,
        budget: usize,
        tiers: &BackingTiers<'_>,
    ) {
        let mut spill = Vec::new();
        for cl in 1..NUM_CLASSES {
            if state.allocated <= budget {
                break;
            }
            let meta = state.slots[cl];
            if meta.cap == 0 {
                continue;
            }
            let object_size = size_class::class_to_size(cl);
            let excess_bytes = state.allocated - budget;
            let drop_entries = meta.cap.min(excess_bytes.div_ceil(object_size));
            let new_cap = meta.cap - drop_entries;
            if meta.len > new_cap {
                spill.clear();
                let evict = meta.len - new_cap;
                let arr = state.slot_array(cl);
                for i in 0..evict {
                    // Safety: indices below len are occupied.
                    let obj = unsafe { *arr.add(meta.len - 1 - i) };
                    spill.push(unsafe { NonNull::new_unchecked(obj) });
                }
                state.slots[cl].len = new_cap;
                tiers.flush(cl, &spill);
            }
            let m = &mut state.slots[cl];
            m.cap = new_cap;
            m.low_water = m.low_water.min(m.len);
            state.allocated -= drop_entries * object_size;
        }
    }

    /// Drain every slot of `cpu` and return its slot capacities to the
    /// CPU's unallocated pool. The CPU's byte budget is unchanged.
    pub fn reclaim(&self, cpu: usize, tiers: &BackingTiers<'_>) {
        let mut state = self.cpus[cpu].state.lock();
        if state.region.is_null() {
            return;
        }
        let mut spill = Vec::new();
        for cl in 1..NUM_CLASSES {
            let meta = state.slots[cl];
            if meta.len > 0 {
                spill.clear();
                let arr = state.slot_array(cl);
                for i in 0..meta.len {
                    // Safety: indices below len are occupied.
                    let obj = unsafe { *arr.add(meta.len - 1 - i) };
                    spill.push(unsafe { NonNull::new_unchecked(obj) });
                }
                tiers.flush(cl, &spill);
            }
            state.slots[cl] = SlotMeta::default();
        }
        state.allocated = 0;
    }

    /// Reclaim every populated CPU that recorded no misses since the last
    /// reclaim interval.
    pub fn try_reclaiming_caches(&self, tiers: &BackingTiers<'_>) {
        let populated = self.populated_cpus();
        for cpu in 0..self.num_cpus {
            if !populated.contains(cpu) {
                continue;
            }
            if self.misses_since(MissInterval::Reclaim, cpu) == 0 {
                if self.cached_bytes(cpu) > 0 {
                    self.reclaim(cpu, tiers);
                }
            } else {
                self.update_snapshot(MissInterval::Reclaim, cpu);
            }
        }
    }

    /// Shrink any slot whose low-water mark shows it was over-provisioned
    /// since the last pass, returning both the objects and the capacity.
    pub fn plunder(&self, tiers: &BackingTiers<'_>) {
        let populated = self.populated_cpus();
        let mut spill = Vec::new();
        for cpu in 0..self.num_cpus {
            if !populated.contains(cpu) {
                continue;
            }
            let mut state = self.cpus[cpu].state.lock();
            for cl in 1..NUM_CLASSES {
                let meta = state.slots[cl];
                let excess = meta.low_water.min(meta.len);
                if excess > 0 {
                    spill.clear();
                    let arr = state.slot_array(cl);
                    for i in 0..excess {
                        // Safety: indices below len are occupied.
                        let obj = unsafe { *arr.add(meta.len - 1 - i) };
                        spill.push(unsafe { NonNull::new_unchecked(obj) });
                    }
                    let object_size = size_class::class_to_size(cl);
                    let m = &mut state.slots[cl];
                    m.len -= excess;
                    m.cap -= excess;
                    state.allocated -= excess * object_size;
                    tiers.flush(cl, &spill);
                }
                let m = &mut state.slots[cl];
                m.low_water = m.len;
            }
        }
    }

    /// Grow or shrink the slab shift when the aggregate miss ratio since
    /// the last resize interval crosses the configured thresholds. Growing
    /// doubles the slab's virtual size. Returns whether a resize happened.
    pub fn dynamic_slab_resize(&self, tiers: &BackingTiers<'_>) -> bool {
        let mut misses = 0u64;
        let mut requests = 0u64;
        for cpu in 0..self.num_cpus {
            misses += self.misses_since(MissInterval::Resize, cpu);
            let slot = &self.cpus[cpu];
            requests += slot
                .requests
                .load(Ordering::Relaxed)
                .wrapping_sub(slot.requests_at_resize.load(Ordering::Relaxed));
        }
        if requests == 0 {
            return false;
        }
        let ratio = misses as f64 / requests as f64;
        let shift = self.slab.lock().shift;
        let new_shift = if ratio > Parameters::dynamic_slab_grow_threshold() {
            shift + 1
        } else if ratio < Parameters::dynamic_slab_shrink_threshold() {
            shift.wrapping_sub(1)
        } else {
            return false;
        };
        if !(MIN_PER_CPU_SHIFT..=MAX_PER_CPU_SHIFT).contains(&new_shift) {
            return false;
        }

        let Ok(new_base) = map_slab(self.num_cpus, new_shift) else {
            return false;
        };

        // Take every CPU lock in index order, drain everything, then swap
        // the slab underneath. The slab lock nests inside the CPU locks, so
        // no populate can race the unmap.
        let mut guards = Vec::with_capacity(self.num_cpus);
        for cpu in 0..self.num_cpus {
            guards.push(self.cpus[cpu].state.lock());
        }
        let mut spill = Vec::new();
        for state in guards.iter_mut() {
            if state.region.is_null() {
                state.entries_per_class = entries_per_class(new_shift);
                continue;
            }
            for cl in 1..NUM_CLASSES {
                let meta = state.slots[cl];
                if meta.len > 0 {
                    spill.clear();
                    let arr = state.slot_array(cl);
                    for i in 0..meta.len {
                        // Safety: indices below len are occupied.
                        let obj = unsafe { *arr.add(meta.len - 1 - i) };
                        spill.push(unsafe { NonNull::new_unchecked(obj) });
                    }
                    tiers.flush(cl, &spill);
                }
                state.slots[cl] = SlotMeta::default();
            }
            state.allocated = 0;
            state.region = std::ptr::null_mut();
            state.entries_per_class = entries_per_class(new_shift);
        }

        let mut slab = self.slab.lock();
        let old_base = slab.base;
        let old_bytes = self.num_cpus << slab.shift;
        slab.base = new_base;
        slab.shift = new_shift;
        slab.populated.clear();
        drop(slab);
        drop(guards);

        // Safety: every region pointer into the old slab was nulled above.
        unsafe {
            drop(PlatformVmOps::unmap(old_base, old_bytes));
        }

        for cpu in 0..self.num_cpus {
            self.update_snapshot(MissInterval::Resize, cpu);
            let slot = &self.cpus[cpu];
            slot.requests_at_resize
                .store(slot.requests.load(Ordering::Relaxed), Ordering::Relaxed);
        }
        true
    }

    #[allow(dead_code)]
    pub fn capacity(&self, cpu: usize) -> usize {
        self.cpus[cpu].state.lock().capacity
    }

    #[allow(dead_code)]
    pub fn allocated(&self, cpu: usize) -> usize {
        self.cpus[cpu].state.lock().allocated
    }

    #[allow(dead_code)]
    pub fn unallocated(&self, cpu: usize) -> usize {
        let state = self.cpus[cpu].state.lock();
        state.capacity - state.allocated
    }

    /// Bytes of objects cached on `cpu`.
    pub fn cached_bytes(&self, cpu: usize) -> usize {
        let state = self.cpus[cpu].state.lock();
        (1..NUM_CLASSES)
            .map(|cl| state.slots[cl].len * size_class::class_to_size(cl))
            .sum()
    }

    /// Bytes of objects cached across all CPUs.
    pub fn free_bytes(&self) -> usize {
        (0..self.num_cpus).map(|cpu| self.cached_bytes(cpu)).sum()
    }

    pub fn slab_virtual_bytes(&self) -> usize {
        self.num_cpus << self.slab.lock().shift
    }

    #[allow(dead_code)]
    pub fn per_cpu_shift(&self) -> usize {
        self.slab.lock().shift
    }

    pub fn stats(&self, cpu: usize) -> CpuCacheStats {
        let cached_bytes = self.cached_bytes(cpu);
        let state = self.cpus[cpu].state.lock();
        CpuCacheStats {
            underflows: self.underflows(cpu),
            overflows: self.overflows(cpu),
            capacity: state.capacity,
            allocated: state.allocated,
            unallocated: state.capacity - state.allocated,
            cached_bytes,
        }
    }

    /// Debug aid: verify `allocated + unallocated = capacity` and that the
    /// slot capacities sum to `allocated` on every CPU.
    #[allow(dead_code)]
    pub fn check_capacity_invariants(&self) {
        for cpu in 0..self.num_cpus {
            let state = self.cpus[cpu].state.lock();
            let summed: usize = (1..NUM_CLASSES)
                .map(|cl| state.slots[cl].cap * size_class::class_to_size(cl))
                .sum();
            assert_eq!(summed, state.allocated, "cpu {cpu}: slot caps out of sync");
            assert!(
                state.allocated <= state.capacity,
                "cpu {cpu}: allocated {} over capacity {}",
                state.allocated,
                state.capacity
            );
            for cl in 1..NUM_CLASSES {
                let m = state.slots[cl];
                assert!(m.len <= m.cap && m.cap <= state.entries_per_class);
            }
        }
    }
}

impl Drop for CpuCache {
    fn drop(&mut self) {
        let slab = self.slab.lock();
        // Safety: the cache is going away; nothing can touch the slab.
        unsafe {
            drop(PlatformVmOps::unmap(
                slab.base,
                self.num_cpus << slab.shift,
            ));
        }
    }
}

// ---------------------------------------------------------------------------
// Current-CPU detection
// ---------------------------------------------------------------------------

fn probe_num_cpus() -> usize {
    #[cfg(all(unix, not(any(loom, miri))))]
    {
        // Safety: FFI call to sysconf.
        let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_CONF) };
        if n > 0 {
            return n as usize;
        }
    }
    std::thread::available_parallelism().map_or(1, |n| n.get())
}

thread_local! {
    /// Test/pinning override for the current CPU.
    static CPU_OVERRIDE: std::cell::Cell<Option<usize>> = const { std::cell::Cell::new(None) };

    /// Stable per-thread id for the virtual-CPU fallback.
    static VIRTUAL_CPU: u32 = {
        use std::sync::atomic::{AtomicU32, Ordering};
        static NEXT: AtomicU32 = AtomicU32::new(0);
        NEXT.fetch_add(1, Ordering::Relaxed)
    };
}

/// Pin (or unpin, with `None`) the calling thread to a virtual CPU slot.
/// Overrides CPU detection for this thread only; the slot index is taken
/// modulo the configured CPU count.
pub fn set_thread_cpu(cpu: Option<usize>) {
    CPU_OVERRIDE.with(|c| c.set(cpu));
}

/// The calling thread's CPU, clamped to `num_cpus`. Uses `sched_getcpu`
/// where available; elsewhere each thread gets a stable virtual slot.
pub(crate) fn current_cpu(num_cpus: usize) -> usize {
    if let Some(cpu) = CPU_OVERRIDE.with(|c| c.get()) {
        return cpu % num_cpus;
    }
    #[cfg(all(target_os = "linux", not(any(loom, miri))))]
    {
        // Safety: FFI call; sched_getcpu has no preconditions.
        let cpu = unsafe { libc::sched_getcpu() };
        if cpu >= 0 {
            return cpu as usize % num_cpus;
        }
    }
    VIRTUAL_CPU.with(|id| *id as usize % num_cpus)
}
