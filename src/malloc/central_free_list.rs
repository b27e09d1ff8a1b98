//! Central free list: per size class, the owner of partially-full spans.
//!
//! Objects flow in and out in batches under a per-class spinlock. Spans are
//! bucketed by their free-object count so that draining can prefer spans
//! with the fewest free objects ("prioritize spans"): nearly-full spans stay
//! in circulation while nearly-empty spans drift toward emptiness and
//! release to the page heap.

use super::page_heap::PageHeap;
use super::page_map::PageMap;
use super::params::Parameters;
use super::size_class;
use super::span::{Span, SpanList, page_of};
use crate::sync::SpinLock;
use std::ptr::NonNull;

/// Partial spans are spread over this many drain-priority buckets.
const NUM_BUCKETS: usize = 8;

struct CentralState {
    /// Bucket 0 drains first. With prioritization on, a span's bucket
    /// scales with its free-object count; with it off, everything sits in
    /// bucket 0 in FIFO order.
    partial: [SpanList; NUM_BUCKETS],
    /// Free objects across all partial spans.
    free_objects: usize,
    /// Spans carved for this class (partial and fully-allocated).
    num_spans: usize,
    /// Pages held by those spans.
    pages: usize,
}

pub(crate) struct CentralFreeList {
    size_class: usize,
    state: SpinLock<CentralState>,
}

impl CentralFreeList {
    /// `size_class` 0 builds an inert placeholder so per-class arrays can
    /// be indexed directly by class.
    pub fn new(size_class: usize) -> Self {
        Self {
            size_class,
            state: SpinLock::new(CentralState {
                partial: [const { SpanList::new() }; NUM_BUCKETS],
                free_objects: 0,
                num_spans: 0,
                pages: 0,
            }),
        }
    }

    fn bucket_for(&self, free_objects: usize) -> usize {
        debug_assert!(free_objects > 0);
        if !Parameters::prioritize_spans() {
            return 0;
        }
        let per_span = size_class::objects_per_span(self.size_class);
        ((free_objects - 1) * NUM_BUCKETS / per_span).min(NUM_BUCKETS - 1)
    }

    /// Return a batch of objects to their owning spans. A span whose last
    /// object comes home goes back to the page heap.
    pub fn insert_range(&self, heap: &PageHeap, map: &PageMap, batch: &[NonNull<u8>]) {
        let mut state = self.state.lock();
        for &obj in batch {
            let addr = obj.as_ptr() as usize;
            let span = map
                .get(page_of(addr))
                .unwrap_or_else(|| panic!("free of {addr:#x}: not an allocator address"));
            // Safety: spans carved for this class are owned by this list;
            // we hold its lock.
            let s = unsafe { &mut *span.as_ptr() };
            assert!(
                s.size_class == self.size_class && s.contains(addr),
                "free of {addr:#x}: span/class mismatch"
            );

            let before = s.free_objects();
            s.push_object(obj);
            state.free_objects += 1;

            if s.allocated == 0 {
                // Empty span: unlink and hand the pages back.
                if before > 0 {
                    // Safety: linked in the recorded bucket.
                    unsafe { state.partial[s.partial_bucket].remove(span) };
                }
                state.free_objects -= s.free_objects();
                state.num_spans -= 1;
                state.pages -= s.num_pages;
                s.clear_objects();
                heap.delete_span(span);
                continue;
            }

            let new_bucket = self.bucket_for(before + 1);
            if before == 0 {
                // Was fully allocated; re-enters the partial set.
                s.partial_bucket = new_bucket;
                state.partial[new_bucket].push_front(span);
            } else if s.partial_bucket != new_bucket {
                // Safety: linked in the recorded bucket.
                unsafe { state.partial[s.partial_bucket].remove(span) };
                s.partial_bucket = new_bucket;
                state.partial[new_bucket].push_front(span);
            }
        }
    }

    /// Harvest up to `n` objects into `out`. Carves a fresh span from the
    /// page heap when no partial span remains. Returns the number obtained;
    /// 0 only if the page heap failed.
    pub fn remove_range(
        &self,
        heap: &PageHeap,
        map: &PageMap,
        out: &mut Vec<NonNull<u8>>,
        n: usize,
    ) -> usize {
        let mut state = self.state.lock();
        let mut got = 0;

        while got < n {
            let span = match state.partial.iter().find_map(|list| list.front()) {
                Some(span) => {
                    // Safety: span is linked in its recorded bucket.
                    let bucket = unsafe { span.as_ref() }.partial_bucket;
                    unsafe { state.partial[bucket].remove(span) };
                    span
                }
                None => match self.grow(heap, &mut state) {
                    Some(span) => span,
                    None => break,
                },
            };

            // Safety: unlinked span owned by this list; lock held.
            let s = unsafe { &mut *span.as_ptr() };
            while got < n {
                match s.pop_object() {
                    Some(obj) => {
                        out.push(obj);
                        state.free_objects -= 1;
                        got += 1;
                    }
                    None => break,
                }
            }
            if s.free_objects() > 0 {
                let bucket = self.bucket_for(s.free_objects());
                s.partial_bucket = bucket;
                state.partial[bucket].push_front(span);
            }
            // A drained span stays reachable through the page map and
            // re-enters the partial set on its first returned object.
        }
        got
    }

    /// Carve one fresh span into objects of this class. The span arrives
    /// unlinked with a fully threaded free list.
    fn grow(&self, heap: &PageHeap, state: &mut CentralState) -> Option<NonNull<Span>> {
        let pages = size_class::class_to_pages(self.size_class);
        let span = heap.new_span(pages).ok()?;
        let count = size_class::objects_per_span(self.size_class);
        // Safety: fresh IN_USE span, exclusively ours.
        unsafe {
            (*span.as_ptr()).init_object_freelist(
                self.size_class,
                size_class::class_to_size(self.size_class),
                count,
            );
        }
        state.free_objects += count;
        state.num_spans += 1;
        state.pages += pages;
        Some(span)
    }

    /// Free objects currently parked in this list.
    pub fn length(&self) -> usize {
        self.state.lock().free_objects
    }

    /// Bytes represented by those objects.
    pub fn free_bytes(&self) -> usize {
        self.length() * size_class::class_to_size(self.size_class)
    }

    #[allow(dead_code)]
    pub fn num_spans(&self) -> usize {
        self.state.lock().num_spans
    }

    /// Pages held by this class's spans.
    #[allow(dead_code)]
    pub fn pages(&self) -> usize {
        self.state.lock().pages
    }
}
