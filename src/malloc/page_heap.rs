//! Page-granular span manager with eager coalescing and incremental release.
//!
//! Free spans are segregated by length into exact buckets (1..MAX_PAGES) and
//! one "large" bucket, each split into a `normal` (backed) and a `returned`
//! (memory advised back to the OS) list. A single process-wide spinlock
//! protects all state; the OS syscalls (`mmap`, `madvise`, `mprotect`)
//! happen under it and are the only blocking points in the allocator.
//!
//! Heap growth is permanent: grown regions are never unmapped, only
//! decommitted. The page map records every page of every span so that
//! coalescing and pointer lookups are O(1).

use super::error::MemError;
use super::page_map::PageMap;
use super::params::Parameters;
use super::span::{MAX_PAGES, PAGE_SHIFT, PAGE_SIZE, Span, SpanList, SpanLocation};
use super::stats;
use super::vm::{HUGE_PAGE_SIZE, PlatformVmOps, VmOps};
use crate::sync::{Arc, SpinLock};
use std::ptr::NonNull;

/// Minimum growth, in pages: one huge page's worth, so the kernel can back
/// fresh regions with 2MB pages.
const MIN_SYSTEM_ALLOC_PAGES: usize = HUGE_PAGE_SIZE / PAGE_SIZE;

/// If a release pass found work, scavenge again after this many deallocated
/// pages (2 GiB with 8 KiB pages).
const DEFAULT_RELEASE_DELAY: i64 = 1 << 18;

/// Never delay scavenging for more than this many deallocated pages.
const MAX_RELEASE_DELAY: i64 = 1 << 20;

/// Backed/free/unmapped byte totals, maintained under the heap lock.
#[derive(Clone, Copy, Default, Debug)]
pub(crate) struct BackingStats {
    /// Bytes obtained from the OS (grown address space, backed or returned).
    pub system_bytes: usize,
    /// Bytes sitting on normal free lists.
    pub free_bytes: usize,
    /// Bytes sitting on returned free lists.
    pub unmapped_bytes: usize,
}

/// Per-length counts of free spans below MAX_PAGES.
pub(crate) struct SmallSpanStats {
    pub normal_length: [usize; MAX_PAGES],
    pub returned_length: [usize; MAX_PAGES],
}

impl SmallSpanStats {
    fn new() -> Self {
        Self {
            normal_length: [0; MAX_PAGES],
            returned_length: [0; MAX_PAGES],
        }
    }
}

/// Aggregate stats over the large free lists.
#[derive(Clone, Copy, Default, Debug)]
pub(crate) struct LargeSpanStats {
    pub spans: usize,
    pub normal_pages: usize,
    pub returned_pages: usize,
}

struct SpanListPair {
    normal: SpanList,
    returned: SpanList,
}

impl SpanListPair {
    const fn new() -> Self {
        Self {
            normal: SpanList::new(),
            returned: SpanList::new(),
        }
    }
}

struct PageHeapState {
    /// Index by span length; index 0 is unused.
    free: [SpanListPair; MAX_PAGES],
    large: SpanListPair,
    stats: BackingStats,
    /// Pages still to deallocate before the next incremental release pass.
    scavenge_counter: i64,
    /// Bucket cursor for release passes; MAX_PAGES denotes the large lists.
    release_index: usize,
    /// Monotonic stamp for free-list LRU ordering.
    epoch: u64,
    /// Recycled span records.
    span_pool: Vec<NonNull<Span>>,
}

// Safety: all raw pointers in the state are guarded by the heap spinlock.
unsafe impl Send for PageHeapState {}

pub(crate) struct PageHeap {
    state: SpinLock<PageHeapState>,
    page_map: Arc<PageMap>,
}

impl PageHeap {
    pub fn new(page_map: Arc<PageMap>) -> Self {
        Self {
            state: SpinLock::new(PageHeapState {
                free: [const { SpanListPair::new() }; MAX_PAGES],
                large: SpanListPair::new(),
                stats: BackingStats::default(),
                scavenge_counter: DEFAULT_RELEASE_DELAY,
                release_index: MAX_PAGES,
                epoch: 0,
                span_pool: Vec::new(),
            }),
            page_map,
        }
    }

    /// Allocate a span of exactly `n` backed pages. The span is IN_USE and
    /// its record is registered in the page map.
    pub fn new_span(&self, n: usize) -> Result<NonNull<Span>, MemError> {
        debug_assert!(n > 0);
        let mut state = self.state.lock();
        state.allocate_span(&self.page_map, n)
    }

    /// As [`new_span`](Self::new_span), but the span's first page is aligned
    /// to an `align`-page boundary. `align` must be a power of two.
    pub fn new_span_aligned(&self, n: usize, align: usize) -> Result<NonNull<Span>, MemError> {
        debug_assert!(n > 0 && align.is_power_of_two());
        if align <= 1 {
            return self.new_span(n);
        }
        let mut state = self.state.lock();
        let extra = n + align - 1;
        let span = state.allocate_span(&self.page_map, extra)?;
        // Safety: freshly carved span, exclusively ours under the lock.
        let s = unsafe { &mut *span.as_ptr() };
        let aligned_first = s.first_page.next_multiple_of(align);
        let head = aligned_first - s.first_page;
        let tail = s.num_pages - head - n;

        if head > 0 {
            let head_span = state.new_span_record(s.first_page, head);
            s.first_page = aligned_first;
            s.num_pages -= head;
            self.page_map.set_range(s.first_page, s.num_pages, span);
            state.merge_into_free_list(&self.page_map, head_span, SpanLocation::OnNormalList);
        }
        if tail > 0 {
            let tail_span = state.new_span_record(s.first_page + n, tail);
            s.num_pages = n;
            state.merge_into_free_list(&self.page_map, tail_span, SpanLocation::OnNormalList);
        }
        debug_assert!(s.first_page.is_multiple_of(align) && s.num_pages == n);
        Ok(span)
    }

    /// Return a span to the free lists, coalescing eagerly with free
    /// neighbors, then run the incremental scavenger.
    ///
    /// REQUIRES: `span` was returned by `new_span` and is IN_USE with no
    /// outstanding objects.
    pub fn delete_span(&self, span: NonNull<Span>) {
        let mut state = self.state.lock();
        // Safety: caller transfers ownership; we hold the heap lock.
        let s = unsafe { span.as_ref() };
        assert!(
            s.location == SpanLocation::InUse,
            "delete_span on a span that is already free"
        );
        debug_assert_eq!(s.allocated, 0, "span deleted with live objects");
        debug_assert_eq!(s.size_class, 0, "span deleted while carved for a size class");
        let n = s.num_pages;
        state.merge_into_free_list(&self.page_map, span, SpanLocation::OnNormalList);
        state.incremental_scavenge(&self.page_map, n);
    }

    /// Release at least `n` pages of idle memory back to the OS. Returns the
    /// number of pages actually released: 0 when nothing was free, possibly
    /// more than `n` when a whole span overshot the request.
    pub fn release_at_least(&self, n: usize) -> usize {
        let mut state = self.state.lock();
        state.release_pages(&self.page_map, n)
    }

    pub fn stats(&self) -> BackingStats {
        self.state.lock().stats
    }

    #[allow(dead_code)]
    pub fn small_span_stats(&self) -> SmallSpanStats {
        let state = self.state.lock();
        let mut out = SmallSpanStats::new();
        for len in 1..MAX_PAGES {
            out.normal_length[len] = state.free[len].normal.len();
            out.returned_length[len] = state.free[len].returned.len();
        }
        out
    }

    #[allow(dead_code)]
    pub fn large_span_stats(&self) -> LargeSpanStats {
        let state = self.state.lock();
        let mut out = LargeSpanStats::default();
        state.large.normal.for_each(|s| {
            out.spans += 1;
            out.normal_pages += s.num_pages;
        });
        state.large.returned.for_each(|s| {
            out.spans += 1;
            out.returned_pages += s.num_pages;
        });
        out
    }

    /// Verify the free-list invariant: no two address-adjacent free spans
    /// share a backing state. Panics on violation.
    #[allow(dead_code)]
    pub fn check_invariants(&self) {
        let state = self.state.lock();
        let check = |s: &Span| {
            debug_assert!(s.location != SpanLocation::InUse);
            for neighbor_page in [s.first_page.wrapping_sub(1), s.last_page() + 1] {
                if let Some(other) = self.page_map.get(neighbor_page) {
                    // Safety: heap lock held; free neighbors are immutable.
                    let o = unsafe { other.as_ref() };
                    assert!(
                        o.location == SpanLocation::InUse || o.location != s.location,
                        "adjacent free spans share state at pages {}..{}",
                        s.first_page,
                        o.first_page
                    );
                }
            }
        };
        for len in 1..MAX_PAGES {
            state.free[len].normal.for_each(check);
            state.free[len].returned.for_each(check);
        }
        state.large.normal.for_each(check);
        state.large.returned.for_each(check);
    }
}

impl Drop for PageHeap {
    fn drop(&mut self) {
        // Free span records on the free lists and in the pool. Mapped heap
        // memory itself is process-lifetime and is not unmapped.
        let mut state = self.state.lock();
        let mut records = Vec::new();
        for len in 1..MAX_PAGES {
            while let Some(s) = state.free[len].normal.pop_back() {
                records.push(s);
            }
            while let Some(s) = state.free[len].returned.pop_back() {
                records.push(s);
            }
        }
        while let Some(s) = state.large.normal.pop_back() {
            records.push(s);
        }
        while let Some(s) = state.large.returned.pop_back() {
            records.push(s);
        }
        records.append(&mut state.span_pool);
        for record in records {
            // Safety: records were created by Box::into_raw in
            // new_span_record and are no longer referenced.
            drop(unsafe { Box::from_raw(record.as_ptr()) });
            stats::METADATA_BYTES.sub(std::mem::size_of::<Span>());
        }
    }
}

impl PageHeapState {
    fn new_span_record(&mut self, first_page: usize, num_pages: usize) -> NonNull<Span> {
        if let Some(mut span) = self.span_pool.pop() {
            // Safety: pooled records are unreferenced.
            unsafe {
                *span.as_mut() = Span::new(first_page, num_pages);
            }
            span
        } else {
            stats::METADATA_BYTES.add(std::mem::size_of::<Span>());
            NonNull::from(Box::leak(Box::new(Span::new(first_page, num_pages))))
        }
    }

    fn recycle_span_record(&mut self, span: NonNull<Span>) {
        self.span_pool.push(span);
    }

    fn list_for(&mut self, num_pages: usize, location: SpanLocation) -> &mut SpanList {
        let pair = if num_pages < MAX_PAGES {
            &mut self.free[num_pages]
        } else {
            &mut self.large
        };
        match location {
            SpanLocation::OnNormalList => &mut pair.normal,
            SpanLocation::OnReturnedList => &mut pair.returned,
            SpanLocation::InUse => unreachable!("no free list for IN_USE spans"),
        }
    }

    fn prepend_to_free_list(&mut self, span: NonNull<Span>) {
        // Safety: heap lock held; span is unlinked.
        let (pages, location, bytes) = {
            let s = unsafe { span.as_ref() };
            (s.num_pages, s.location, s.bytes())
        };
        match location {
            SpanLocation::OnNormalList => self.stats.free_bytes += bytes,
            SpanLocation::OnReturnedList => self.stats.unmapped_bytes += bytes,
            SpanLocation::InUse => unreachable!(),
        }
        self.list_for(pages, location).push_front(span);
    }

    fn remove_from_free_list(&mut self, span: NonNull<Span>) {
        // Safety: heap lock held; span is linked in the matching list.
        let (pages, location, bytes) = {
            let s = unsafe { span.as_ref() };
            (s.num_pages, s.location, s.bytes())
        };
        match location {
            SpanLocation::OnNormalList => self.stats.free_bytes -= bytes,
            SpanLocation::OnReturnedList => self.stats.unmapped_bytes -= bytes,
            SpanLocation::InUse => unreachable!(),
        }
        // Safety: span is on this exact list.
        unsafe { self.list_for(pages, location).remove(span) };
    }

    /// Find a free span with at least `n` pages: exact-length buckets in
    /// ascending order (normal before returned within each), then the large
    /// lists best-fit by length, tie-breaking by lowest address.
    fn search_free_lists(&self, n: usize) -> Option<NonNull<Span>> {
        for len in n..MAX_PAGES {
            if let Some(span) = self.free[len].normal.front() {
                return Some(span);
            }
            if let Some(span) = self.free[len].returned.front() {
                return Some(span);
            }
        }
        self.alloc_large(n)
    }

    fn alloc_large(&self, n: usize) -> Option<NonNull<Span>> {
        let mut best: Option<NonNull<Span>> = None;
        let mut consider = |candidate: NonNull<Span>| {
            // Safety: heap lock held.
            let c = unsafe { candidate.as_ref() };
            if c.num_pages < n {
                return;
            }
            let better = match best {
                None => true,
                Some(b) => {
                    let b = unsafe { b.as_ref() };
                    c.num_pages < b.num_pages
                        || (c.num_pages == b.num_pages && c.first_page < b.first_page)
                }
            };
            if better {
                best = Some(candidate);
            }
        };
        self.large.normal.for_each(|s| consider(NonNull::from(s)));
        self.large.returned.for_each(|s| consider(NonNull::from(s)));
        best
    }

    fn allocate_span(&mut self, map: &PageMap, n: usize) -> Result<NonNull<Span>, MemError> {
        let span = match self.search_free_lists(n) {
            Some(span) => span,
            None => {
                self.grow(map, n)?;
                // One retry; grow mapped at least n pages.
                self.search_free_lists(n).ok_or_else(|| {
                    MemError::MapFailed(std::io::Error::other(
                        "grown region not visible on free lists",
                    ))
                })?
            }
        };

        // Pages handed to the caller must be backed; fault the handed-out
        // prefix of a returned span back in before touching the metadata so
        // a failure leaves the heap consistent.
        // Safety: heap lock held.
        let (location, start_addr) = {
            let s = unsafe { span.as_ref() };
            (s.location, s.start_addr())
        };
        if location == SpanLocation::OnReturnedList {
            // Safety: the range is a reserved, decommitted part of the heap.
            unsafe {
                PlatformVmOps::commit(
                    NonNull::new_unchecked(start_addr as *mut u8),
                    n * PAGE_SIZE,
                )?;
            }
        }

        self.remove_from_free_list(span);
        self.carve(map, span, n);
        Ok(span)
    }

    /// Trim `span` (already unlinked) to exactly `n` pages, reinserting any
    /// leftover with its original backing state, and mark it IN_USE.
    fn carve(&mut self, map: &PageMap, span: NonNull<Span>, n: usize) {
        // Safety: heap lock held; span is unlinked and exclusively ours.
        let s = unsafe { &mut *span.as_ptr() };
        debug_assert!(s.num_pages >= n);
        let old_location = s.location;
        s.location = SpanLocation::InUse;

        let extra = s.num_pages - n;
        if extra > 0 {
            let leftover = self.new_span_record(s.first_page + n, extra);
            // Safety: fresh record.
            {
                let l = unsafe { &mut *leftover.as_ptr() };
                l.location = old_location;
                l.freelist_added_epoch = s.freelist_added_epoch;
            }
            map.set_range(s.first_page + n, extra, leftover);
            s.num_pages = n;
            self.prepend_to_free_list(leftover);
        }
        map.set_range(s.first_page, s.num_pages, span);
    }

    /// Map fresh memory from the OS: at least `n` pages, rounded up to huge
    /// page granularity, subject to the configured hard limit.
    fn grow(&mut self, map: &PageMap, n: usize) -> Result<(), MemError> {
        let mut ask = n.max(MIN_SYSTEM_ALLOC_PAGES).next_multiple_of(MIN_SYSTEM_ALLOC_PAGES);

        let limit = Parameters::heap_size_hard_limit();
        if limit > 0 && self.stats.system_bytes + ask * PAGE_SIZE > limit {
            // Retry with the exact request before giving up.
            ask = n;
            if self.stats.system_bytes + ask * PAGE_SIZE > limit {
                return Err(MemError::HardLimitExceeded {
                    requested: n * PAGE_SIZE,
                    limit,
                });
            }
        }

        // Over-map by one page so the usable region can start on a logical
        // page boundary; the slop is never touched and never reclaimed.
        let bytes = ask * PAGE_SIZE;
        // Safety: plain anonymous mapping request.
        let base = unsafe { PlatformVmOps::map(bytes + PAGE_SIZE)? };
        let aligned = (base.as_ptr() as usize).next_multiple_of(PAGE_SIZE);
        let first_page = aligned >> PAGE_SHIFT;
        assert!(first_page > 0);

        self.stats.system_bytes += bytes;

        map.ensure_range(first_page, ask);
        let span = self.new_span_record(first_page, ask);
        map.set_range(first_page, ask, span);
        // Fresh memory enters through the normal merge path so that
        // contiguous growths coalesce.
        self.merge_into_free_list(map, span, SpanLocation::OnNormalList);
        Ok(())
    }

    /// Coalesce `span` with eligible free neighbors and prepend the result
    /// to the matching free list.
    ///
    /// When `target` is normal, any free neighbor is absorbed and the merged
    /// span is normal (a returned neighbor gets faulted back in first).
    /// When `target` is returned, only returned neighbors are absorbed, so a
    /// release never re-commits memory.
    fn merge_into_free_list(
        &mut self,
        map: &PageMap,
        span: NonNull<Span>,
        target: SpanLocation,
    ) {
        debug_assert!(target != SpanLocation::InUse);
        // Safety: heap lock held; span is unlinked and IN_USE.
        let (mut first, mut len) = {
            let s = unsafe { span.as_ref() };
            debug_assert!(s.location == SpanLocation::InUse);
            (s.first_page, s.num_pages)
        };

        let mut absorb = |state: &mut Self, neighbor: NonNull<Span>| -> bool {
            // Safety: heap lock held.
            let n_loc = unsafe { neighbor.as_ref() }.location;
            if n_loc == SpanLocation::InUse {
                return false;
            }
            if target == SpanLocation::OnReturnedList && n_loc != SpanLocation::OnReturnedList {
                return false;
            }
            if target == SpanLocation::OnNormalList && n_loc == SpanLocation::OnReturnedList {
                // normal ∪ returned ⇒ normal: the returned side must be
                // faulted back in. On failure, skip the merge; the states
                // differ, so the adjacency invariant still holds.
                let (addr, bytes) = {
                    let nb = unsafe { neighbor.as_ref() };
                    (nb.start_addr(), nb.bytes())
                };
                // Safety: reserved, decommitted heap range.
                let committed = unsafe {
                    PlatformVmOps::commit(NonNull::new_unchecked(addr as *mut u8), bytes)
                };
                if committed.is_err() {
                    return false;
                }
            }
            state.remove_from_free_list(neighbor);
            true
        };

        if first > 0
            && let Some(prev) = map.get(first - 1)
            && absorb(self, prev)
        {
            // Safety: heap lock held; prev was just unlinked.
            let p = unsafe { prev.as_ref() };
            debug_assert_eq!(p.last_page() + 1, first);
            first = p.first_page;
            len += p.num_pages;
            self.recycle_span_record(prev);
        }
        if let Some(next) = map.get(first + len)
            && absorb(self, next)
        {
            // Safety: heap lock held; next was just unlinked.
            let nx = unsafe { next.as_ref() };
            debug_assert_eq!(nx.first_page, first + len);
            len += nx.num_pages;
            self.recycle_span_record(next);
        }

        // Safety: exclusive access under the heap lock.
        {
            let s = unsafe { &mut *span.as_ptr() };
            s.first_page = first;
            s.num_pages = len;
            s.location = target;
            s.freelist_added_epoch = self.epoch;
        }
        self.epoch += 1;
        map.set_range(first, len, span);
        self.prepend_to_free_list(span);
    }

    fn incremental_scavenge(&mut self, map: &PageMap, n: usize) {
        self.scavenge_counter -= n as i64;
        if self.scavenge_counter >= 0 {
            return;
        }
        let released = self.release_pages(map, 1);
        self.scavenge_counter = if released > 0 {
            DEFAULT_RELEASE_DELAY
        } else {
            MAX_RELEASE_DELAY
        };
    }

    /// Release at least `n` pages, walking buckets from the persistent
    /// cursor and taking each bucket's least-recently-freed normal span.
    fn release_pages(&mut self, map: &PageMap, n: usize) -> usize {
        let mut released = 0;
        let mut empty_scans = 0;
        while released < n && empty_scans <= MAX_PAGES {
            let idx = self.release_index;
            let list = if idx == MAX_PAGES {
                &mut self.large.normal
            } else {
                &mut self.free[idx].normal
            };
            match list.pop_back() {
                Some(span) => {
                    released += self.release_span(map, span);
                    empty_scans = 0;
                }
                None => {
                    self.release_index = (idx + 1) % (MAX_PAGES + 1);
                    empty_scans += 1;
                }
            }
        }
        released
    }

    /// Decommit one normal span (already unlinked) and move it to the
    /// returned lists, merging with adjacent returned spans.
    fn release_span(&mut self, map: &PageMap, span: NonNull<Span>) -> usize {
        // Safety: heap lock held; span was just popped off a normal list.
        let (addr, bytes, pages) = {
            let s = unsafe { &mut *span.as_ptr() };
            debug_assert!(s.location == SpanLocation::OnNormalList);
            s.location = SpanLocation::InUse; // transitional, for the merge
            (s.start_addr(), s.bytes(), s.num_pages)
        };
        self.stats.free_bytes -= bytes;

        // Safety: backed heap range; advisory release.
        let result =
            unsafe { PlatformVmOps::decommit(NonNull::new_unchecked(addr as *mut u8), bytes) };
        if result.is_err() {
            // Counted, not fatal: the span still moves to the returned list
            // and the kernel call recurs next time the range cycles through.
            stats::MADVISE_FAILURES.add(1);
        }

        self.merge_into_free_list(map, span, SpanLocation::OnReturnedList);
        pages
    }
}
