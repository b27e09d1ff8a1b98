//! Runtime-tunable knobs. Every knob is a relaxed atomic with a default;
//! setters take effect on the next operation that consults them. None of
//! these require a lock — policy code reads them at decision points, and a
//! torn read is impossible (single word each).

use crate::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

/// Default per-CPU cache budget: 3 MiB.
pub(crate) const DEFAULT_MAX_PER_CPU_CACHE_SIZE: usize = 3 * 1024 * 1024;

/// Default aggregate budget reported for the legacy thread-cache variant.
pub(crate) const DEFAULT_MAX_TOTAL_THREAD_CACHE_BYTES: usize = 32 * 1024 * 1024;

crate::sync::static_atomic! {
    static MAX_PER_CPU_CACHE_SIZE: AtomicUsize = AtomicUsize::new(DEFAULT_MAX_PER_CPU_CACHE_SIZE);
}
crate::sync::static_atomic! {
    static MAX_TOTAL_THREAD_CACHE_BYTES: AtomicUsize =
        AtomicUsize::new(DEFAULT_MAX_TOTAL_THREAD_CACHE_BYTES);
}
crate::sync::static_atomic! {
    static BACKGROUND_RELEASE_RATE: AtomicUsize = AtomicUsize::new(0);
}
crate::sync::static_atomic! {
    static SKIP_SUBRELEASE_INTERVAL_NS: AtomicU64 = AtomicU64::new(60_000_000_000);
}
crate::sync::static_atomic! {
    static SHUFFLE_PER_CPU_CACHES: AtomicBool = AtomicBool::new(true);
}
crate::sync::static_atomic! {
    static PRIORITIZE_SPANS: AtomicBool = AtomicBool::new(true);
}
crate::sync::static_atomic! {
    static PARTIAL_TRANSFER_CACHE: AtomicBool = AtomicBool::new(false);
}
crate::sync::static_atomic! {
    static PER_CPU_CACHES: AtomicBool = AtomicBool::new(true);
}
crate::sync::static_atomic! {
    static DYNAMIC_SLAB_ENABLED: AtomicBool = AtomicBool::new(false);
}
crate::sync::static_atomic! {
    static DYNAMIC_SLAB_GROW_THRESHOLD: AtomicU64 = AtomicU64::new(f64::to_bits(0.9));
}
crate::sync::static_atomic! {
    static DYNAMIC_SLAB_SHRINK_THRESHOLD: AtomicU64 = AtomicU64::new(f64::to_bits(0.5));
}
crate::sync::static_atomic! {
    static HEAP_SIZE_HARD_LIMIT: AtomicUsize = AtomicUsize::new(0);
}

/// Facade over the knob statics.
pub struct Parameters;

impl Parameters {
    /// Upper bound on bytes cached per CPU (the starting per-CPU budget;
    /// shuffling may move budget between CPUs while conserving the total).
    pub fn max_per_cpu_cache_size() -> usize {
        MAX_PER_CPU_CACHE_SIZE.load(Ordering::Relaxed)
    }

    pub fn set_max_per_cpu_cache_size(v: usize) {
        MAX_PER_CPU_CACHE_SIZE.store(v, Ordering::Relaxed);
    }

    /// Aggregate bound for the legacy per-thread cache variant. Stored and
    /// reported only; this build always runs in per-CPU mode.
    pub fn max_total_thread_cache_bytes() -> usize {
        MAX_TOTAL_THREAD_CACHE_BYTES.load(Ordering::Relaxed)
    }

    pub fn set_max_total_thread_cache_bytes(v: usize) {
        MAX_TOTAL_THREAD_CACHE_BYTES.store(v, Ordering::Relaxed);
    }

    /// Steady-state OS release rate in bytes per second. 0 disables
    /// rate-driven release; `release_at_least` still works on demand.
    pub fn background_release_rate() -> usize {
        BACKGROUND_RELEASE_RATE.load(Ordering::Relaxed)
    }

    pub fn set_background_release_rate(v: usize) {
        BACKGROUND_RELEASE_RATE.store(v, Ordering::Relaxed);
    }

    /// Grace window before a huge-page-aware page heap would subrelease.
    /// Stored knob; the huge-page-aware variant is not part of this build.
    pub fn skip_subrelease_interval_ns() -> u64 {
        SKIP_SUBRELEASE_INTERVAL_NS.load(Ordering::Relaxed)
    }

    pub fn set_skip_subrelease_interval_ns(v: u64) {
        SKIP_SUBRELEASE_INTERVAL_NS.store(v, Ordering::Relaxed);
    }

    pub fn shuffle_per_cpu_caches() -> bool {
        SHUFFLE_PER_CPU_CACHES.load(Ordering::Relaxed)
    }

    pub fn set_shuffle_per_cpu_caches(v: bool) {
        SHUFFLE_PER_CPU_CACHES.store(v, Ordering::Relaxed);
    }

    /// When set, the central free list drains nearly-full spans first so
    /// that nearly-empty spans drift toward release.
    pub fn prioritize_spans() -> bool {
        PRIORITIZE_SPANS.load(Ordering::Relaxed)
    }

    pub fn set_prioritize_spans(v: bool) {
        PRIORITIZE_SPANS.store(v, Ordering::Relaxed);
    }

    /// Selects the ring transfer-cache variant (partial batches allowed).
    pub fn partial_transfer_cache() -> bool {
        PARTIAL_TRANSFER_CACHE.load(Ordering::Relaxed)
    }

    pub fn set_partial_transfer_cache(v: bool) {
        PARTIAL_TRANSFER_CACHE.store(v, Ordering::Relaxed);
    }

    /// Master switch for the per-CPU front end. When off, allocation goes
    /// straight to the transfer cache.
    pub fn per_cpu_caches() -> bool {
        PER_CPU_CACHES.load(Ordering::Relaxed)
    }

    pub fn set_per_cpu_caches(v: bool) {
        PER_CPU_CACHES.store(v, Ordering::Relaxed);
    }

    pub fn per_cpu_caches_dynamic_slab_enabled() -> bool {
        DYNAMIC_SLAB_ENABLED.load(Ordering::Relaxed)
    }

    pub fn set_per_cpu_caches_dynamic_slab_enabled(v: bool) {
        DYNAMIC_SLAB_ENABLED.store(v, Ordering::Relaxed);
    }

    pub fn dynamic_slab_grow_threshold() -> f64 {
        f64::from_bits(DYNAMIC_SLAB_GROW_THRESHOLD.load(Ordering::Relaxed))
    }

    pub fn set_dynamic_slab_grow_threshold(v: f64) {
        DYNAMIC_SLAB_GROW_THRESHOLD.store(v.to_bits(), Ordering::Relaxed);
    }

    pub fn dynamic_slab_shrink_threshold() -> f64 {
        f64::from_bits(DYNAMIC_SLAB_SHRINK_THRESHOLD.load(Ordering::Relaxed))
    }

    pub fn set_dynamic_slab_shrink_threshold(v: f64) {
        DYNAMIC_SLAB_SHRINK_THRESHOLD.store(v.to_bits(), Ordering::Relaxed);
    }

    /// Hard cap on mapped heap bytes. 0 means no limit. Growth past the
    /// limit fails the allocation instead of mapping more memory.
    pub fn heap_size_hard_limit() -> usize {
        HEAP_SIZE_HARD_LIMIT.load(Ordering::Relaxed)
    }

    pub fn set_heap_size_hard_limit(v: usize) {
        HEAP_SIZE_HARD_LIMIT.store(v, Ordering::Relaxed);
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let _guard = crate::malloc::TEST_MUTEX.write().unwrap();
        assert_eq!(
            Parameters::max_per_cpu_cache_size(),
            DEFAULT_MAX_PER_CPU_CACHE_SIZE
        );
        assert!(Parameters::shuffle_per_cpu_caches());
        assert!(Parameters::prioritize_spans());
        assert!(!Parameters::partial_transfer_cache());
        assert!(Parameters::per_cpu_caches());
        assert!(!Parameters::per_cpu_caches_dynamic_slab_enabled());
        assert_eq!(Parameters::heap_size_hard_limit(), 0);
        assert_eq!(Parameters::background_release_rate(), 0);
    }

    #[test]
    fn test_roundtrip_thresholds() {
        let _guard = crate::malloc::TEST_MUTEX.write().unwrap();
        let grow = Parameters::dynamic_slab_grow_threshold();
        let shrink = Parameters::dynamic_slab_shrink_threshold();
        Parameters::set_dynamic_slab_grow_threshold(0.75);
        Parameters::set_dynamic_slab_shrink_threshold(0.25);
        assert_eq!(Parameters::dynamic_slab_grow_threshold(), 0.75);
        assert_eq!(Parameters::dynamic_slab_shrink_threshold(), 0.25);
        Parameters::set_dynamic_slab_grow_threshold(grow);
        Parameters::set_dynamic_slab_shrink_threshold(shrink);
    }
}
