//! Front end: the tiered allocation pipeline and the process-wide
//! singleton.
//!
//! Every request resolves through the same ladder — per-CPU slot, transfer
//! cache, central free list, page heap, OS — with each tier falling back to
//! the next on a miss and batching objects on the way back up. Sizes above
//! the largest class skip the object tiers entirely and are whole spans.

use super::central_free_list::CentralFreeList;
use super::cpu_cache::{self, BackingTiers, CpuCache, CpuCacheConfig, CpuCacheStats};
use super::error::MemError;
use super::page_heap::PageHeap;
use super::page_map::PageMap;
use super::params::Parameters;
use super::size_class::{self, NUM_CLASSES};
use super::span::{PAGE_SIZE, page_of};
use super::stats;
use super::transfer_cache::{TransferCache, TransferCacheStats};
use crate::sync::atomic::{AtomicUsize, Ordering};
use crate::sync::{Arc, OnceLock};
use std::ptr::NonNull;

/// Minimum alignment of every returned pointer: all size classes are
/// multiples of 16 and spans are page-aligned.
pub(crate) const MIN_ALIGN: usize = 16;

#[derive(Clone, Copy)]
pub struct AllocatorConfig {
    /// Number of per-CPU cache slots; 0 = probe the machine.
    pub num_cpus: usize,
    /// log2 of per-CPU slab bytes; 0 = default.
    pub per_cpu_shift: usize,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            num_cpus: 0,
            per_cpu_shift: 0,
        }
    }
}

/// Byte totals across the cache hierarchy.
#[derive(Clone, Copy, Default, Debug)]
pub struct MallocStats {
    pub system_bytes: usize,
    pub pageheap_free_bytes: usize,
    pub pageheap_unmapped_bytes: usize,
    pub central_cache_free_bytes: usize,
    pub transfer_cache_free_bytes: usize,
    pub cpu_cache_free_bytes: usize,
    pub metadata_bytes: usize,
    pub current_allocated_bytes: usize,
}

pub struct Allocator {
    page_map: Arc<PageMap>,
    page_heap: PageHeap,
    centrals: Box<[CentralFreeList]>,
    transfer: TransferCache,
    cpu: CpuCache,
}

impl Allocator {
    pub fn new(config: AllocatorConfig) -> Result<Self, MemError> {
        let mut cpu_config = CpuCacheConfig::default();
        if config.num_cpus != 0 {
            cpu_config.num_cpus = config.num_cpus;
        }
        if config.per_cpu_shift != 0 {
            cpu_config.shift = config.per_cpu_shift;
        }
        let page_map = Arc::new(PageMap::new());
        Ok(Self {
            page_heap: PageHeap::new(page_map.clone()),
            centrals: (0..NUM_CLASSES).map(CentralFreeList::new).collect(),
            transfer: TransferCache::new(),
            cpu: CpuCache::new(cpu_config)?,
            page_map,
        })
    }

    fn tiers(&self) -> BackingTiers<'_> {
        BackingTiers {
            tc: &self.transfer,
            centrals: &self.centrals,
            heap: &self.page_heap,
            map: &*self.page_map,
        }
    }

    /// Allocate at least `size` bytes at the platform minimum alignment.
    /// Returns null (None) on exhaustion after invoking the OOM handler.
    pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        self.allocate_aligned(size, MIN_ALIGN)
    }

    /// Allocate at least `size` bytes aligned to `align` (a power of two).
    pub fn allocate_aligned(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        debug_assert!(align.is_power_of_two());
        let result = self.try_allocate(size, align);
        if result.is_none() {
            invoke_oom_handler(size);
        }
        result
    }

    fn try_allocate(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let cl = if align <= MIN_ALIGN {
            size_class::classify(size)
        } else if align <= PAGE_SIZE {
            size_class::classify_aligned(size, align)
        } else {
            None
        };
        match cl {
            Some(cl) => self.allocate_small(cl),
            None => self.allocate_span(size, align),
        }
    }

    fn allocate_small(&self, cl: usize) -> Option<NonNull<u8>> {
        if Parameters::per_cpu_caches() {
            let cpu = cpu_cache::current_cpu(self.cpu.num_cpus());
            if let Some(obj) = self.cpu.pop(cpu, cl) {
                return Some(obj);
            }
            self.refill(cpu, cl)
        } else {
            let mut out = Vec::with_capacity(1);
            let got = self.transfer.remove_range(
                &self.centrals[cl],
                &self.page_heap,
                &self.page_map,
                cl,
                &mut out,
                1,
            );
            (got == 1).then(|| out[0])
        }
    }

    /// Underflow path: pull one batch from the transfer cache, keep one
    /// object for the caller and park the rest in the slot (grown if the
    /// budget allows). Whatever doesn't fit goes straight back down.
    fn refill(&self, cpu: usize, cl: usize) -> Option<NonNull<u8>> {
        let batch = size_class::num_to_move(cl);
        let mut objs = Vec::with_capacity(batch);
        let got = self.transfer.remove_range(
            &self.centrals[cl],
            &self.page_heap,
            &self.page_map,
            cl,
            &mut objs,
            batch,
        );
        if got == 0 {
            return None;
        }
        let result = objs.pop();
        self.cpu.grow_slot(cpu, cl);
        let pushed = self.cpu.insert_batch(cpu, cl, &objs);
        if pushed < objs.len() {
            self.transfer.insert_range(
                &self.centrals[cl],
                &self.page_heap,
                &self.page_map,
                cl,
                &objs[pushed..],
            );
        }
        result
    }

    /// Whole-span allocation for sizes beyond the largest class (or
    /// alignments beyond the small-object path).
    fn allocate_span(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let pages = size.max(1).div_ceil(PAGE_SIZE);
        let span = if align > PAGE_SIZE {
            self.page_heap.new_span_aligned(pages, align / PAGE_SIZE)
        } else {
            self.page_heap.new_span(pages)
        }
        .ok()?;
        // Safety: freshly carved IN_USE span.
        let addr = unsafe { span.as_ref() }.start_addr();
        NonNull::new(addr as *mut u8)
    }

    /// Free a pointer previously returned by [`allocate`](Self::allocate).
    ///
    /// # Panics
    /// Panics if `ptr` does not belong to this allocator (caller bug).
    pub fn deallocate(&self, ptr: NonNull<u8>) {
        self.deallocate_hinted(ptr, None);
    }

    /// As [`deallocate`](Self::deallocate), with the owning size class
    /// supplied by the caller to skip the page-map lookup.
    pub fn deallocate_hinted(&self, ptr: NonNull<u8>, class_hint: Option<usize>) {
        let addr = ptr.as_ptr() as usize;
        let cl = match class_hint {
            Some(cl) => cl,
            None => {
                let span = self
                    .page_map
                    .get(page_of(addr))
                    .unwrap_or_else(|| panic!("free of {addr:#x}: not an allocator address"));
                // Safety: live spans are immutable in class while handed out.
                unsafe { span.as_ref() }.size_class
            }
        };

        if cl == 0 {
            let span = self
                .page_map
                .get(page_of(addr))
                .unwrap_or_else(|| panic!("free of {addr:#x}: not an allocator address"));
            // Safety: whole-span allocations are IN_USE until freed here.
            assert_eq!(
                unsafe { span.as_ref() }.start_addr(),
                addr,
                "free of {addr:#x}: not the start of its allocation"
            );
            self.page_heap.delete_span(span);
            return;
        }

        if Parameters::per_cpu_caches() {
            let cpu = cpu_cache::current_cpu(self.cpu.num_cpus());
            match self.cpu.push(cpu, cl, ptr) {
                Ok(()) => {}
                Err(obj) => self.drain_and_push(cpu, cl, obj),
            }
        } else {
            self.transfer.insert_range(
                &self.centrals[cl],
                &self.page_heap,
                &self.page_map,
                cl,
                &[ptr],
            );
        }
    }

    /// Overflow path: move one batch down to the transfer cache, grow the
    /// slot if the budget allows, then retry the push.
    fn drain_and_push(&self, cpu: usize, cl: usize, obj: NonNull<u8>) {
        let batch = size_class::num_to_move(cl);
        let mut spill = Vec::with_capacity(batch + 1);
        self.cpu.extract_batch(cpu, cl, &mut spill, batch);
        self.cpu.grow_slot(cpu, cl);
        if let Err(obj) = self.cpu.push(cpu, cl, obj) {
            spill.push(obj);
        }
        self.transfer.insert_range(
            &self.centrals[cl],
            &self.page_heap,
            &self.page_map,
            cl,
            &spill,
        );
    }

    /// Exact number of usable bytes behind a live allocation.
    pub fn allocated_size(&self, ptr: NonNull<u8>) -> Option<usize> {
        let span = self.page_map.get(page_of(ptr.as_ptr() as usize))?;
        // Safety: live spans are stable while the allocation is live.
        let s = unsafe { span.as_ref() };
        Some(if s.size_class == 0 {
            s.bytes()
        } else {
            size_class::class_to_size(s.size_class)
        })
    }

    /// Release at least `bytes` of idle memory to the OS; returns the
    /// bytes actually released (0 when nothing was idle).
    pub fn release_memory(&self, bytes: usize) -> usize {
        let pages = bytes.div_ceil(PAGE_SIZE);
        self.page_heap.release_at_least(pages) * PAGE_SIZE
    }

    /// One round of background maintenance: capacity shuffling, idle-CPU
    /// reclaim, plunder of over-provisioned caches, transfer-cache
    /// resizing, dynamic slab resize, and rate-driven OS release. Intended
    /// to be called periodically (roughly once a second) from an
    /// embedder-owned thread.
    pub fn background_pass(&self) {
        let tiers = self.tiers();
        if Parameters::shuffle_per_cpu_caches() {
            self.cpu.shuffle(&tiers);
        }
        self.cpu.try_reclaiming_caches(&tiers);
        self.cpu.plunder(&tiers);
        for cl in 1..NUM_CLASSES {
            self.transfer
                .try_plunder(&self.centrals[cl], &self.page_heap, &self.page_map, cl);
            self.transfer
                .try_resize(&self.centrals, &self.page_heap, &self.page_map, cl);
        }
        if Parameters::per_cpu_caches() && Parameters::per_cpu_caches_dynamic_slab_enabled() {
            self.cpu.dynamic_slab_resize(&tiers);
        }
        let rate = Parameters::background_release_rate();
        if rate > 0 {
            self.release_memory(rate);
        }
    }

    /// Per-class transfer cache counters.
    pub fn transfer_cache_stats(&self, size_class: usize) -> TransferCacheStats {
        self.transfer.stats(size_class)
    }

    /// Per-CPU cache counters.
    pub fn cpu_cache_stats(&self, cpu: usize) -> CpuCacheStats {
        self.cpu.stats(cpu)
    }

    pub fn stats(&self) -> MallocStats {
        let backing = self.page_heap.stats();
        let central: usize = (1..NUM_CLASSES).map(|cl| self.centrals[cl].free_bytes()).sum();
        let transfer = self.transfer.free_bytes();
        let cpu = self.cpu.free_bytes();
        let cached = backing.free_bytes + backing.unmapped_bytes + central + transfer + cpu;
        MallocStats {
            system_bytes: backing.system_bytes,
            pageheap_free_bytes: backing.free_bytes,
            pageheap_unmapped_bytes: backing.unmapped_bytes,
            central_cache_free_bytes: central,
            transfer_cache_free_bytes: transfer,
            cpu_cache_free_bytes: cpu,
            metadata_bytes: stats::METADATA_BYTES.get(),
            current_allocated_bytes: backing.system_bytes.saturating_sub(cached),
        }
    }

    /// Numeric properties, keyed by name. Unknown names are not present.
    pub fn property(&self, name: &str) -> Option<usize> {
        let st = self.stats();
        let physical = st.system_bytes - st.pageheap_unmapped_bytes + st.metadata_bytes;
        Some(match name {
            "generic.heap_size" => st.system_bytes,
            "generic.physical_memory_used" => physical,
            "generic.virtual_memory_used" => {
                st.system_bytes + st.metadata_bytes + self.cpu.slab_virtual_bytes()
            }
            "generic.current_allocated_bytes" => st.current_allocated_bytes,
            "tcmalloc.pageheap_free_bytes" => st.pageheap_free_bytes,
            "tcmalloc.pageheap_unmapped_bytes" => st.pageheap_unmapped_bytes,
            "tcmalloc.central_cache_free" => st.central_cache_free_bytes,
            "tcmalloc.transfer_cache_free" => st.transfer_cache_free_bytes,
            "tcmalloc.cpu_free" => st.cpu_cache_free_bytes,
            "tcmalloc.per_cpu_caches_active" => usize::from(Parameters::per_cpu_caches()),
            "tcmalloc.max_total_thread_cache_bytes" => {
                Parameters::max_total_thread_cache_bytes()
            }
            "tcmalloc.current_total_thread_cache_bytes" => st.cpu_cache_free_bytes,
            "tcmalloc.metadata_bytes" => st.metadata_bytes,
            "tcmalloc.external_fragmentation_bytes" => {
                physical.saturating_sub(st.current_allocated_bytes)
            }
            "tcmalloc.required_bytes" => st.current_allocated_bytes + st.metadata_bytes,
            "tcmalloc.slack_bytes" => st.pageheap_free_bytes + st.pageheap_unmapped_bytes,
            "tcmalloc.hard_usage_limit_bytes" => Parameters::heap_size_hard_limit(),
            "tcmalloc.desired_usage_limit_bytes" => Parameters::heap_size_hard_limit(),
            "tcmalloc.page_algorithm" => 0,
            _ => return None,
        })
    }

    #[cfg(test)]
    pub(crate) fn cpu_cache(&self) -> &CpuCache {
        &self.cpu
    }

    #[cfg(test)]
    pub(crate) fn page_heap(&self) -> &PageHeap {
        &self.page_heap
    }

    #[cfg(test)]
    pub(crate) fn transfer_cache(&self) -> &TransferCache {
        &self.transfer
    }
}

// ---------------------------------------------------------------------------
// OOM handler
// ---------------------------------------------------------------------------

/// Called with the failing request size whenever `allocate` is about to
/// return null.
pub type OomHandler = fn(usize);

crate::sync::static_atomic! {
    static OOM_HANDLER: AtomicUsize = AtomicUsize::new(0);
}

pub fn set_oom_handler(handler: Option<OomHandler>) {
    let raw = handler.map_or(0, |f| f as usize);
    OOM_HANDLER.store(raw, Ordering::Relaxed);
}

fn invoke_oom_handler(size: usize) {
    let raw = OOM_HANDLER.load(Ordering::Relaxed);
    if raw != 0 {
        // Safety: only `set_oom_handler` stores here, always a valid
        // `OomHandler` (or 0).
        let handler: OomHandler = unsafe { std::mem::transmute::<usize, OomHandler>(raw) };
        handler(size);
    }
}

// ---------------------------------------------------------------------------
// Global singleton
// ---------------------------------------------------------------------------

static GLOBAL_INSTANCE: OnceLock<Allocator> = OnceLock::new();

/// Process-wide allocator, initialized on first use.
pub struct GlobalAllocator;

impl GlobalAllocator {
    /// # Panics
    /// Panics if the initial slab mapping fails — with no address space
    /// for the cache hierarchy there is nothing useful to run.
    pub fn get() -> &'static Allocator {
        GLOBAL_INSTANCE.get_or_init(|| {
            Allocator::new(AllocatorConfig::default()).expect("allocator initialization failed")
        })
    }

    pub fn allocate(size: usize) -> Option<NonNull<u8>> {
        Self::get().allocate(size)
    }

    pub fn allocate_aligned(size: usize, align: usize) -> Option<NonNull<u8>> {
        Self::get().allocate_aligned(size, align)
    }

    /// # Panics
    /// Panics if `ptr` was not returned by this allocator.
    pub fn deallocate(ptr: NonNull<u8>) {
        Self::get().deallocate(ptr);
    }

    pub fn allocated_size(ptr: NonNull<u8>) -> Option<usize> {
        Self::get().allocated_size(ptr)
    }
}
