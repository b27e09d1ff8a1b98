//! Static partitioning of object sizes into classes.
//!
//! Class 0 is reserved/invalid. Each class fixes an object size, the number
//! of pages in the spans carved for it, and the batch size ("num to move")
//! used when shuttling objects between cache tiers. The table is immutable;
//! classification is O(1) through a const-built lookup table with two
//! granularity bands: 16-byte quanta up to 1 KiB, 128-byte quanta above.

use super::span::PAGE_SIZE;

/// Largest size served by a size class; anything bigger is a whole-span
/// allocation handled directly by the page heap.
pub(crate) const MAX_SIZE: usize = 256 * 1024;

/// Number of entries in the class table, including the reserved class 0.
pub(crate) const NUM_CLASSES: usize = 58;

/// Hard upper bound on any class's batch size.
pub(crate) const MAX_OBJECTS_TO_MOVE: usize = 32;

#[derive(Clone, Copy)]
pub(crate) struct SizeClassInfo {
    /// Object size in bytes.
    pub size: usize,
    /// Pages per span carved for this class.
    pub pages: usize,
}

const fn cls(size: usize, pages: usize) -> SizeClassInfo {
    SizeClassInfo { size, pages }
}

/// Pages are chosen so that per-span internal fragmentation stays below
/// ~1/8th: either the object size divides the span evenly or the tail waste
/// is bounded.
pub(crate) const SIZE_CLASSES: [SizeClassInfo; NUM_CLASSES] = [
    cls(0, 0), // reserved
    cls(16, 1),
    cls(32, 1),
    cls(48, 1),
    cls(64, 1),
    cls(80, 1),
    cls(96, 1),
    cls(112, 1),
    cls(128, 1),
    cls(160, 1),
    cls(192, 1),
    cls(224, 1),
    cls(256, 1),
    cls(320, 1),
    cls(384, 1),
    cls(448, 1),
    cls(512, 1),
    cls(640, 1),
    cls(768, 1),
    cls(896, 1),
    cls(1024, 1),
    cls(1280, 1),
    cls(1536, 1),
    cls(1792, 1),
    cls(2048, 1),
    cls(2560, 1),
    cls(3072, 3),
    cls(3584, 7),
    cls(4096, 1),
    cls(4608, 9),
    cls(5120, 5),
    cls(6144, 3),
    cls(7168, 7),
    cls(8192, 1),
    cls(9216, 9),
    cls(10240, 5),
    cls(12288, 3),
    cls(14336, 7),
    cls(16384, 2),
    cls(20480, 5),
    cls(24576, 3),
    cls(28672, 7),
    cls(32768, 4),
    cls(40960, 5),
    cls(49152, 6),
    cls(57344, 7),
    cls(65536, 8),
    cls(73728, 9),
    cls(81920, 10),
    cls(98304, 12),
    cls(114688, 14),
    cls(131072, 16),
    cls(147456, 18),
    cls(163840, 20),
    cls(180224, 22),
    cls(204800, 25),
    cls(229376, 28),
    cls(262144, 32),
];

/// LUT index for a size in 1..=MAX_SIZE.
///
/// Sizes <= 1024 index in 16-byte quanta; larger sizes in 128-byte quanta
/// offset past the first band. Every class size lands exactly on a quantum
/// boundary of its band, so the mapping is lossless.
#[inline]
const fn lut_index(size: usize) -> usize {
    if size <= 1024 {
        (size + 15) >> 4
    } else {
        64 + ((size - 1024 + 127) >> 7)
    }
}

const LUT_LEN: usize = 2105; // lut_index(MAX_SIZE) + 1

/// O(1) size-to-class table. Entry q holds the smallest class whose object
/// size covers every size mapping to quantum q.
static CLASS_LUT: [u8; LUT_LEN] = build_class_lut();

const fn build_class_lut() -> [u8; LUT_LEN] {
    let mut table = [0u8; LUT_LEN];
    // table[0] unused (size 0 is classified as size 1)
    let mut idx: usize = 1;
    let mut cl: usize = 1;
    while cl < NUM_CLASSES {
        let top = lut_index(SIZE_CLASSES[cl].size);
        while idx <= top {
            table[idx] = cl as u8;
            idx += 1;
        }
        cl += 1;
    }
    table
}

/// Map a requested size to its size class. Zero is treated as one byte.
/// Returns `None` for sizes above [`MAX_SIZE`].
#[inline]
pub(crate) fn classify(size: usize) -> Option<usize> {
    let size = if size == 0 { 1 } else { size };
    if size > MAX_SIZE {
        return None;
    }
    Some(CLASS_LUT[lut_index(size)] as usize)
}

/// As [`classify`], but bumps to the first class whose object size is a
/// multiple of `align`. Size classes are dense, so the scan is short.
#[inline]
pub(crate) fn classify_aligned(size: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());
    let mut cl = classify(size)?;
    while cl < NUM_CLASSES {
        if SIZE_CLASSES[cl].size.is_multiple_of(align) {
            return Some(cl);
        }
        cl += 1;
    }
    None
}

#[inline]
pub(crate) fn class_to_size(cl: usize) -> usize {
    SIZE_CLASSES[cl].size
}

#[inline]
pub(crate) fn class_to_pages(cl: usize) -> usize {
    SIZE_CLASSES[cl].pages
}

/// Objects a fresh span of this class is carved into.
#[inline]
pub(crate) fn objects_per_span(cl: usize) -> usize {
    debug_assert!(cl != 0);
    SIZE_CLASSES[cl].pages * PAGE_SIZE / SIZE_CLASSES[cl].size
}

/// Batch size moved between cache tiers for this class: one 64 KiB chunk's
/// worth of objects, clamped to [2, 32].
#[inline]
pub(crate) fn num_to_move(cl: usize) -> usize {
    debug_assert!(cl != 0);
    let n = 64 * 1024 / SIZE_CLASSES[cl].size;
    n.clamp(2, MAX_OBJECTS_TO_MOVE)
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_classify_exact_sizes() {
        for cl in 1..NUM_CLASSES {
            let size = class_to_size(cl);
            assert_eq!(classify(size), Some(cl), "size {size}");
        }
    }

    #[test]
    fn test_classify_covers_all_sizes() {
        // Every size in 1..=MAX_SIZE maps to the smallest class that fits.
        let mut expected = 1;
        for size in 1..=MAX_SIZE {
            while class_to_size(expected) < size {
                expected += 1;
            }
            assert_eq!(classify(size), Some(expected), "size {size}");
        }
    }

    #[test]
    fn test_classify_zero_is_size_one() {
        assert_eq!(classify(0), classify(1));
        assert_eq!(classify(0), Some(1));
    }

    #[test]
    fn test_classify_above_max() {
        assert_eq!(classify(MAX_SIZE), Some(NUM_CLASSES - 1));
        assert_eq!(classify(MAX_SIZE + 1), None);
    }

    #[test]
    fn test_classify_aligned() {
        // 24 bytes at 16-byte alignment: class for 32.
        let cl = classify_aligned(24, 16).unwrap();
        assert_eq!(class_to_size(cl), 32);

        // Small size, page alignment: bumps to the first page-multiple class.
        let cl = classify_aligned(100, 4096).unwrap();
        assert_eq!(class_to_size(cl) % 4096, 0);
        assert_eq!(class_to_size(cl), 4096);

        let cl = classify_aligned(5000, 8192).unwrap();
        assert_eq!(class_to_size(cl), 8192);
    }

    #[test]
    fn test_spans_hold_at_least_one_object() {
        for cl in 1..NUM_CLASSES {
            assert!(objects_per_span(cl) >= 1, "class {cl}");
            assert!(class_to_pages(cl) >= 1, "class {cl}");
        }
    }

    #[test]
    fn test_fragmentation_bounded() {
        // Tail waste per span stays below 1/8th of the span.
        for cl in 1..NUM_CLASSES {
            let span_bytes = class_to_pages(cl) * PAGE_SIZE;
            let used = objects_per_span(cl) * class_to_size(cl);
            let waste = span_bytes - used;
            assert!(
                waste * 8 <= span_bytes,
                "class {cl}: waste {waste} of {span_bytes}"
            );
        }
    }

    #[test]
    fn test_num_to_move_bounds() {
        for cl in 1..NUM_CLASSES {
            let n = num_to_move(cl);
            assert!((2..=MAX_OBJECTS_TO_MOVE).contains(&n), "class {cl}: {n}");
        }
        // Spot checks of the 64 KiB rule.
        assert_eq!(num_to_move(classify(16).unwrap()), 32);
        assert_eq!(num_to_move(classify(2048).unwrap()), 32);
        assert_eq!(num_to_move(classify(4096).unwrap()), 16);
        assert_eq!(num_to_move(classify(65536).unwrap()), 2);
    }

    #[test]
    fn test_sizes_strictly_increasing() {
        for cl in 2..NUM_CLASSES {
            assert!(class_to_size(cl) > class_to_size(cl - 1));
        }
    }
}
