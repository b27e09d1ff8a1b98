#[cfg(all(test, not(loom)))]
mod tests {
    use crate::malloc::allocator::{Allocator, AllocatorConfig};
    use crate::malloc::central_free_list::CentralFreeList;
    use crate::malloc::cpu_cache::{self, BackingTiers, CpuCache, CpuCacheConfig};
    use crate::malloc::page_heap::PageHeap;
    use crate::malloc::page_map::PageMap;
    use crate::malloc::params::Parameters;
    use crate::malloc::size_class::{self, NUM_CLASSES};
    use crate::malloc::span::{MAX_PAGES, PAGE_SIZE};
    use crate::malloc::transfer_cache::TransferCache;
    use crate::sync::Arc;
    use crate::sync::barrier::Barrier;
    use crate::sync::thread;
    use std::ptr::NonNull;

    fn test_allocator() -> Allocator {
        Allocator::new(AllocatorConfig {
            num_cpus: 2,
            per_cpu_shift: 16,
        })
        .unwrap()
    }

    #[test]
    fn test_single_cpu_smoke() {
        // X1: Pin one virtual CPU, hammer one size: one underflow to warm
        // the slot, then the fast path carries everything.
        let _guard = crate::malloc::TEST_MUTEX.read().unwrap();
        let alloc = test_allocator();
        cpu_cache::set_thread_cpu(Some(0));

        // Warm-up: the one expected underflow pulls a batch into the slot.
        let p = alloc.allocate(16).unwrap();
        alloc.deallocate(p);

        let heap_free_baseline = alloc.page_heap().stats().free_bytes;
        for _ in 0..100_000 {
            let p = alloc.allocate(16).unwrap();
            // Safety: Test code.
            unsafe { p.as_ptr().write(0x5A) };
            alloc.deallocate(p);
        }

        // The warm-up miss is the only one.
        assert_eq!(alloc.cpu_cache().underflows(0), 1);
        assert_eq!(alloc.cpu_cache().overflows(0), 0);
        // Steady state never went back to the page heap.
        assert_eq!(alloc.page_heap().stats().free_bytes, heap_free_baseline);
        cpu_cache::set_thread_cpu(None);
    }

    #[test]
    fn test_transfer_ring_wraparound_no_central_removes() {
        // X2: Cycle more than the ring's capacity through insert/remove
        // pairs; every object is conserved and no remove ever fell through
        // to the central free list.
        let _guard = crate::malloc::TEST_MUTEX.write().unwrap();
        Parameters::set_partial_transfer_cache(true);

        let map = Arc::new(PageMap::new());
        let heap = PageHeap::new(map.clone());
        let centrals: Vec<CentralFreeList> = (0..NUM_CLASSES).map(CentralFreeList::new).collect();
        let tc = TransferCache::new();
        let cl = size_class::classify(256).unwrap();
        let n = size_class::num_to_move(cl);
        let capacity = tc.capacity(cl);

        let mut objs = Vec::new();
        assert_eq!(
            centrals[cl].remove_range(&heap, &map, &mut objs, capacity + 2 * n),
            capacity + 2 * n
        );
        let total = objs.len();

        let mut in_hand: Vec<NonNull<u8>> = objs.clone();
        let mut inserted_total = 0usize;
        // Alternate overflowing inserts with wrap-producing removes.
        for round in 0..64 {
            let take = (n - 1 + round % 3).min(in_hand.len());
            let batch: Vec<_> = in_hand.drain(..take).collect();
            inserted_total += batch.len();
            tc.insert_range(&centrals[cl], &heap, &map, cl, &batch);

            let mut got = Vec::new();
            tc.remove_range(&centrals[cl], &heap, &map, cl, &mut got, n / 2);
            in_hand.extend(got);
        }
        assert!(inserted_total > capacity);

        // Conservation: in-ring + back-in-central + in-hand covers every
        // object exactly once.
        let accounted = tc.tc_length(cl) + centrals[cl].length() + in_hand.len();
        assert_eq!(accounted, total);
        // Removes were always served from the ring.
        assert_eq!(tc.stats(cl).remove_misses, 0);

        Parameters::set_partial_transfer_cache(false);
    }

    #[test]
    fn test_page_heap_interleaved_coalesce() {
        // X3: Free spans in an interleaved order and watch the heap fold
        // them back into a single large run.
        let _guard = crate::malloc::TEST_MUTEX.read().unwrap();
        let map = Arc::new(PageMap::new());
        let heap = PageHeap::new(map.clone());

        let k = MAX_PAGES / 4;
        let spans = [
            heap.new_span(k - 3).unwrap(),
            heap.new_span(k).unwrap(),
            heap.new_span(k + 1).unwrap(),
            heap.new_span(k + 2).unwrap(),
        ];

        heap.delete_span(spans[1]);
        heap.delete_span(spans[3]);
        heap.check_invariants();
        heap.delete_span(spans[0]);
        heap.delete_span(spans[2]);
        heap.check_invariants();

        let large = heap.large_span_stats();
        assert_eq!(large.spans, 1);
        let small = heap.small_span_stats();
        assert!(small.normal_length.iter().all(|&c| c == 0));
        assert!(small.returned_length.iter().all(|&c| c == 0));
        assert_eq!(heap.stats().free_bytes, large.normal_pages * PAGE_SIZE);
    }

    #[test]
    fn test_two_cpu_shuffle_converges() {
        // X4: Warm CPU 0 hot and CPU 1 cold, shuffle until steady state:
        // the cold CPU bottoms out at the floor and the total budget is
        // conserved.
        let _guard = crate::malloc::TEST_MUTEX.read().unwrap();
        let map = Arc::new(PageMap::new());
        let heap = PageHeap::new(map.clone());
        let centrals: Vec<CentralFreeList> = (0..NUM_CLASSES).map(CentralFreeList::new).collect();
        let tc = TransferCache::new();
        let cache = CpuCache::new(CpuCacheConfig {
            num_cpus: 2,
            shift: 16,
        })
        .unwrap();
        let tiers = BackingTiers {
            tc: &tc,
            centrals: &centrals,
            heap: &heap,
            map: &*map,
        };

        let cl = size_class::classify(64).unwrap();
        let budget = Parameters::max_per_cpu_cache_size();
        let total = cache.capacity(0) + cache.capacity(1);
        assert_eq!(total, 2 * budget);

        // Populate both; CPU 1 holds cached objects (cold but populated),
        // CPU 0 misses continuously.
        let mut objs = Vec::new();
        centrals[cl].remove_range(&heap, &map, &mut objs, 2);
        assert!(cache.grow_slot(1, cl));
        assert_eq!(cache.insert_batch(1, cl, &objs), 2);
        assert!(cache.grow_slot(0, cl));

        let mut steady = 0;
        for _ in 0..32 {
            for _ in 0..8 {
                let _ = cache.pop(0, cl); // keep CPU 0 hot
            }
            let before = (cache.capacity(0), cache.capacity(1));
            cache.shuffle(&tiers);
            if (cache.capacity(0), cache.capacity(1)) == before {
                steady += 1;
                if steady >= 3 {
                    break;
                }
            } else {
                steady = 0;
            }
        }

        let floor = budget / 10;
        assert_eq!(cache.capacity(1), floor);
        assert_eq!(cache.capacity(0), 2 * budget - floor);
        assert_eq!(cache.capacity(0) + cache.capacity(1), total);
        cache.check_capacity_invariants();
    }

    #[test]
    fn test_release_under_ongoing_allocation() {
        // X5: Threads churn random sizes while another thread keeps
        // releasing; nothing crashes, the books stay consistent, and a
        // final drain attributes zero bytes to the application.
        let _guard = crate::malloc::TEST_MUTEX.read().unwrap();
        let alloc = Arc::new(test_allocator());
        let num_threads = 8usize;
        let iters = 400usize;
        let barrier = Arc::new(Barrier::new(num_threads + 1));

        let handles: Vec<_> = (0..num_threads)
            .map(|t| {
                let alloc = alloc.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    cpu_cache::set_thread_cpu(Some(t % 2));
                    barrier.wait();
                    let mut held: Vec<(NonNull<u8>, usize)> = Vec::new();
                    let mut seed = t as u64 + 1;
                    for _ in 0..iters {
                        // xorshift64
                        seed ^= seed << 13;
                        seed ^= seed >> 7;
                        seed ^= seed << 17;
                        let size = 8 + (seed as usize) % 4088;
                        let p = alloc.allocate(size).unwrap();
                        // Safety: Test code.
                        unsafe { p.as_ptr().write(t as u8) };
                        held.push((p, size));
                        if held.len() > 32 {
                            let idx = (seed as usize) % held.len();
                            let (victim, _) = held.swap_remove(idx);
                            alloc.deallocate(victim);
                        }
                    }
                    for (p, _) in held {
                        alloc.deallocate(p);
                    }
                    cpu_cache::set_thread_cpu(None);
                })
            })
            .collect();

        barrier.wait();
        for _ in 0..50 {
            alloc.release_memory(1024 * 1024);
            thread::yield_now();
        }
        for h in handles {
            h.join().unwrap();
        }

        // Books stay consistent under concurrent release.
        let st = alloc.stats();
        assert!(st.pageheap_free_bytes + st.pageheap_unmapped_bytes <= st.system_bytes);

        // Post-drain: nothing is attributed to the application.
        for _ in 0..3 {
            alloc.background_pass();
        }
        let st = alloc.stats();
        assert_eq!(st.current_allocated_bytes, 0);
        assert_eq!(
            st.pageheap_free_bytes + st.pageheap_unmapped_bytes,
            st.system_bytes
        );
        alloc.page_heap().check_invariants();
    }

    #[test]
    fn test_background_release_rate() {
        // X6: A configured release rate drains idle pages via the
        // background pass.
        let _guard = crate::malloc::TEST_MUTEX.write().unwrap();
        let alloc = test_allocator();

        let p = alloc.allocate(512 * 1024).unwrap();
        alloc.deallocate(p);
        assert!(alloc.stats().pageheap_free_bytes > 0);

        Parameters::set_background_release_rate(64 * 1024 * 1024);
        alloc.background_pass();
        Parameters::set_background_release_rate(0);

        let st = alloc.stats();
        assert_eq!(st.pageheap_free_bytes, 0);
        assert_eq!(st.pageheap_unmapped_bytes, st.system_bytes);
    }

    #[test]
    fn test_capacity_conserved_under_variant_toggle() {
        // X7: Toggling the transfer-cache variant mid-traffic changes no
        // class's used/capacity/max_capacity.
        let _guard = crate::malloc::TEST_MUTEX.write().unwrap();
        let alloc = test_allocator();

        let mut held = Vec::new();
        for i in 0..500 {
            held.push(alloc.allocate(32 + (i % 7) * 48).unwrap());
        }
        for p in held.drain(..) {
            alloc.deallocate(p);
        }

        let snapshot: Vec<_> = (1..NUM_CLASSES)
            .map(|cl| {
                let st = alloc.transfer_cache().stats(cl);
                (st.used, st.capacity, st.max_capacity)
            })
            .collect();

        Parameters::set_partial_transfer_cache(true);
        let toggled: Vec<_> = (1..NUM_CLASSES)
            .map(|cl| {
                let st = alloc.transfer_cache().stats(cl);
                (st.used, st.capacity, st.max_capacity)
            })
            .collect();
        Parameters::set_partial_transfer_cache(false);

        assert_eq!(snapshot, toggled);
    }

    #[test]
    fn test_many_threads_distinct_objects() {
        // X8: Concurrent allocators never hand the same address to two
        // live allocations.
        let _guard = crate::malloc::TEST_MUTEX.read().unwrap();
        let alloc = Arc::new(test_allocator());
        let num_threads = 4usize;
        let per_thread = 500usize;
        let barrier = Arc::new(Barrier::new(num_threads));

        let handles: Vec<_> = (0..num_threads)
            .map(|t| {
                let alloc = alloc.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    let mut ptrs = Vec::with_capacity(per_thread);
                    for i in 0..per_thread {
                        let p = alloc.allocate(16 << (i % 4)).unwrap();
                        // Safety: Test code.
                        unsafe { p.as_ptr().write(t as u8) };
                        ptrs.push(p);
                    }
                    // Our writes were not clobbered by another thread.
                    for p in &ptrs {
                        // Safety: Test code.
                        assert_eq!(unsafe { *p.as_ptr() }, t as u8);
                    }
                    // Addresses only: raw pointers don't cross threads.
                    ptrs.iter().map(|p| p.as_ptr() as usize).collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all: Vec<usize> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let count = all.len();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), count, "duplicate live addresses");

        for addr in all {
            alloc.deallocate(NonNull::new(addr as *mut u8).unwrap());
        }
    }
}
