//! Radix map from page id to owning span.
//!
//! Two levels over the 48-bit address space: a root of leaf pointers and
//! 2 GiB-coverage leaves created on demand. Reads are lock-free (Acquire
//! loads of immutable-after-publish pointers); all writes happen under the
//! page-heap lock. The map only locates spans — it never owns them.

use super::span::{PAGE_SHIFT, PageId, Span};
use super::stats;
use crate::sync::atomic::{AtomicPtr, Ordering};
use std::ptr::NonNull;

const ADDRESS_BITS: usize = 48;
const PAGE_ID_BITS: usize = ADDRESS_BITS - PAGE_SHIFT;
const LEAF_BITS: usize = 18;
const LEAF_LEN: usize = 1 << LEAF_BITS;
const ROOT_LEN: usize = 1 << (PAGE_ID_BITS - LEAF_BITS);

struct Leaf {
    spans: Box<[AtomicPtr<Span>]>,
}

impl Leaf {
    fn new() -> Box<Self> {
        let spans = (0..LEAF_LEN)
            .map(|_| AtomicPtr::new(std::ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Box::new(Self { spans })
    }

    const fn footprint() -> usize {
        std::mem::size_of::<Self>() + LEAF_LEN * std::mem::size_of::<AtomicPtr<Span>>()
    }
}

pub(crate) struct PageMap {
    root: Box<[AtomicPtr<Leaf>]>,
}

// Safety: interior mutability is all atomics; leaf publication is
// Release/Acquire ordered.
unsafe impl Send for PageMap {}
// Safety: see above.
unsafe impl Sync for PageMap {}

impl PageMap {
    pub fn new() -> Self {
        let root = (0..ROOT_LEN)
            .map(|_| AtomicPtr::new(std::ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        stats::METADATA_BYTES.add(ROOT_LEN * std::mem::size_of::<AtomicPtr<Leaf>>());
        Self { root }
    }

    #[inline]
    fn split(page: PageId) -> (usize, usize) {
        (page >> LEAF_BITS, page & (LEAF_LEN - 1))
    }

    /// Look up the span owning `page`. Lock-free.
    #[inline]
    pub fn get(&self, page: PageId) -> Option<NonNull<Span>> {
        let (i, j) = Self::split(page);
        if i >= ROOT_LEN {
            return None;
        }
        let leaf = self.root[i].load(Ordering::Acquire);
        if leaf.is_null() {
            return None;
        }
        // Safety: a published leaf pointer is never unpublished or freed
        // while the map is alive.
        let leaf = unsafe { &*leaf };
        NonNull::new(leaf.spans[j].load(Ordering::Acquire))
    }

    /// Create any missing leaves covering `[first, first + len)`.
    ///
    /// REQUIRES: page-heap lock held (writers are serialised by it).
    pub fn ensure_range(&self, first: PageId, len: usize) {
        let last = first + len - 1;
        assert!(
            last >> LEAF_BITS < ROOT_LEN,
            "page {last:#x} beyond the {ADDRESS_BITS}-bit address space"
        );
        for i in (first >> LEAF_BITS)..=(last >> LEAF_BITS) {
            if self.root[i].load(Ordering::Relaxed).is_null() {
                let leaf = Box::into_raw(Leaf::new());
                stats::METADATA_BYTES.add(Leaf::footprint());
                self.root[i].store(leaf, Ordering::Release);
            }
        }
    }

    /// Point every page in `[first, first + len)` at `span`.
    ///
    /// REQUIRES: page-heap lock held; `ensure_range` already called.
    pub fn set_range(&self, first: PageId, len: usize, span: NonNull<Span>) {
        for page in first..first + len {
            let (i, j) = Self::split(page);
            let leaf = self.root[i].load(Ordering::Relaxed);
            debug_assert!(!leaf.is_null(), "set_range without ensure_range");
            // Safety: published leaf, never freed while the map lives.
            unsafe { &*leaf }.spans[j].store(span.as_ptr(), Ordering::Release);
        }
    }

    /// Clear the mapping for `[first, first + len)`.
    ///
    /// REQUIRES: page-heap lock held.
    pub fn clear_range(&self, first: PageId, len: usize) {
        for page in first..first + len {
            let (i, j) = Self::split(page);
            let leaf = self.root[i].load(Ordering::Relaxed);
            if leaf.is_null() {
                continue;
            }
            // Safety: published leaf.
            unsafe { &*leaf }.spans[j].store(std::ptr::null_mut(), Ordering::Release);
        }
    }
}

impl Drop for PageMap {
    fn drop(&mut self) {
        for slot in self.root.iter() {
            let leaf = slot.load(Ordering::Relaxed);
            if !leaf.is_null() {
                // Safety: leaf was created by Box::into_raw in ensure_range.
                drop(unsafe { Box::from_raw(leaf) });
                stats::METADATA_BYTES.sub(Leaf::footprint());
            }
        }
        stats::METADATA_BYTES.sub(ROOT_LEN * std::mem::size_of::<AtomicPtr<Leaf>>());
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_get_unmapped_is_none() {
        let map = PageMap::new();
        assert!(map.get(0).is_none());
        assert!(map.get(12345).is_none());
    }

    #[test]
    fn test_set_get_clear() {
        let map = PageMap::new();
        let mut span = Span::new(100, 4);
        let ptr = NonNull::from(&mut span);

        map.ensure_range(100, 4);
        map.set_range(100, 4, ptr);

        for page in 100..104 {
            assert_eq!(map.get(page), Some(ptr), "page {page}");
        }
        assert!(map.get(99).is_none());
        assert!(map.get(104).is_none());

        map.clear_range(100, 4);
        for page in 100..104 {
            assert!(map.get(page).is_none());
        }
    }

    #[test]
    fn test_range_straddles_leaves() {
        let map = PageMap::new();
        let first = LEAF_LEN - 2;
        let mut span = Span::new(first, 4);
        let ptr = NonNull::from(&mut span);

        map.ensure_range(first, 4);
        map.set_range(first, 4, ptr);

        assert_eq!(map.get(LEAF_LEN - 2), Some(ptr));
        assert_eq!(map.get(LEAF_LEN - 1), Some(ptr));
        assert_eq!(map.get(LEAF_LEN), Some(ptr));
        assert_eq!(map.get(LEAF_LEN + 1), Some(ptr));
        assert!(map.get(LEAF_LEN + 2).is_none());
    }

    #[test]
    fn test_remap_boundary() {
        // Splitting a span rewrites only the affected pages.
        let map = PageMap::new();
        let mut a = Span::new(10, 4);
        let mut b = Span::new(12, 2);
        let pa = NonNull::from(&mut a);
        let pb = NonNull::from(&mut b);

        map.ensure_range(10, 4);
        map.set_range(10, 4, pa);
        map.set_range(12, 2, pb);

        assert_eq!(map.get(10), Some(pa));
        assert_eq!(map.get(11), Some(pa));
        assert_eq!(map.get(12), Some(pb));
        assert_eq!(map.get(13), Some(pb));
    }
}
