use super::error::MemError;
use std::ptr::NonNull;

#[cfg(all(not(unix), not(any(loom, miri))))]
compile_error!("cachalot requires a unix-like VM layer (mmap/madvise/mprotect).");

/// Transparent-huge-page threshold: regions at least this large get
/// `MADV_HUGEPAGE` advice on Linux.
#[allow(dead_code)]
pub(crate) const HUGE_PAGE_SIZE: usize = 2 * 1024 * 1024;

/// Abstract interface for virtual memory operations.
///
/// The allocator's notion of "backed" and "returned" pages maps directly
/// onto this trait: a span on the normal free list is `map`ped (or
/// re-`commit`ted) memory; a span on the returned free list has been
/// `decommit`ted — the address range stays reserved but the physical pages
/// have been advised back to the OS.
pub(crate) trait VmOps {
    /// Map a fresh, readable and writable anonymous region.
    unsafe fn map(size: usize) -> Result<NonNull<u8>, MemError>;

    /// Fault a previously decommitted range back in (backed, zero or stale
    /// content — callers treat it as uninitialised).
    unsafe fn commit(ptr: NonNull<u8>, size: usize) -> Result<(), MemError>;

    /// Advise the range's physical pages back to the OS, keeping the
    /// address range reserved. Access after decommit traps.
    unsafe fn decommit(ptr: NonNull<u8>, size: usize) -> Result<(), MemError>;

    /// Release address space entirely (after which pointers are invalid).
    unsafe fn unmap(ptr: NonNull<u8>, size: usize) -> Result<(), MemError>;

    /// OS page size.
    fn page_size() -> usize;
}

pub(crate) struct PlatformVmOps;

#[cfg(all(unix, not(any(loom, miri))))]
mod unix {
    use super::{MemError, NonNull, PlatformVmOps, VmOps};
    use std::io;

    impl VmOps for PlatformVmOps {
        unsafe fn map(size: usize) -> Result<NonNull<u8>, MemError> {
            // Safety: FFI call to mmap.
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANON,
                    -1,
                    0,
                )
            };

            if ptr == libc::MAP_FAILED {
                return Err(MemError::MapFailed(io::Error::last_os_error()));
            }

            #[cfg(target_os = "linux")]
            {
                // Ask the kernel to back large regions with 2MB pages when
                // possible. Advisory only; failure is irrelevant.
                if size >= super::HUGE_PAGE_SIZE {
                    // Safety: FFI call to madvise on the region just mapped.
                    unsafe {
                        libc::madvise(ptr, size, libc::MADV_HUGEPAGE);
                    }
                }
            }

            match NonNull::new(ptr.cast::<u8>()) {
                Some(p) => Ok(p),
                None => Err(MemError::MapFailed(io::Error::other("mmap returned null"))),
            }
        }

        unsafe fn commit(ptr: NonNull<u8>, size: usize) -> Result<(), MemError> {
            // Safety: FFI call to mprotect.
            if unsafe {
                libc::mprotect(
                    ptr.as_ptr().cast::<libc::c_void>(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                )
            } != 0
            {
                return Err(MemError::CommitFailed(io::Error::last_os_error()));
            }

            #[cfg(target_os = "linux")]
            {
                // Released spans are recommitted right before being handed
                // back out; prefault them to avoid a burst of minor faults
                // on first touch.
                // Safety: FFI call to madvise.
                unsafe {
                    libc::madvise(
                        ptr.as_ptr().cast::<libc::c_void>(),
                        size,
                        libc::MADV_WILLNEED,
                    );
                }
            }

            Ok(())
        }

        unsafe fn decommit(ptr: NonNull<u8>, size: usize) -> Result<(), MemError> {
            // MADV_FREE marks pages for lazy reclamation — the cheapest
            // decommit on both Linux (>= 4.5) and macOS. The kernel reclaims
            // physical pages under pressure; until then old data may persist.
            //
            // mprotect(PROT_NONE) removes access so that a stale pointer into
            // a returned span traps instead of silently reading reused pages.
            // Safety: FFI call to madvise.
            if unsafe { libc::madvise(ptr.as_ptr().cast::<libc::c_void>(), size, libc::MADV_FREE) }
                != 0
            {
                return Err(MemError::ReleaseFailed(io::Error::last_os_error()));
            }
            // Safety: FFI call to mprotect.
            if unsafe { libc::mprotect(ptr.as_ptr().cast::<libc::c_void>(), size, libc::PROT_NONE) }
                != 0
            {
                return Err(MemError::ReleaseFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        unsafe fn unmap(ptr: NonNull<u8>, size: usize) -> Result<(), MemError> {
            // Safety: FFI call to munmap.
            if unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), size) } != 0 {
                return Err(MemError::ReleaseFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        fn page_size() -> usize {
            use crate::sync::OnceLock;
            static CACHED: OnceLock<usize> = OnceLock::new();
            *CACHED.get_or_init(|| {
                // Safety: FFI call to sysconf.
                let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
                assert!(
                    raw > 0,
                    "sysconf(_SC_PAGESIZE) failed: {}",
                    io::Error::last_os_error()
                );
                // This crate supports only 64-bit targets; page size fits in
                // usize there.
                #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
                {
                    raw as usize
                }
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Loom/Miri mock: heap-backed VmOps (no real mmap/madvise)
//
// Under `cfg(loom)` we cannot issue real VM syscalls — loom runs inside a
// single OS process with its own scheduler. Instead we back every mapping
// with a plain heap allocation (via `std::alloc::alloc` / `dealloc`).
//
// `commit` / `decommit` are intentional no-ops: the memory is always
// accessible once mapped. `unmap` frees the heap block.
//
// This is sufficient for testing the *synchronization* logic of the caches
// (loom) and detecting undefined behaviour in unsafe pointer code (Miri);
// actual fault and release behaviour is exercised by the real platform
// implementation in normal builds.
// ---------------------------------------------------------------------------
#[cfg(any(loom, miri))]
impl VmOps for PlatformVmOps {
    unsafe fn map(size: usize) -> Result<NonNull<u8>, MemError> {
        if size == 0 {
            return Err(MemError::MapFailed(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "zero-size mapping",
            )));
        }
        let layout = std::alloc::Layout::from_size_align(size, 4096)
            .map_err(|e| MemError::MapFailed(std::io::Error::other(e)))?;
        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or_else(|| {
            MemError::MapFailed(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                "alloc returned null",
            ))
        })
    }

    unsafe fn commit(_ptr: NonNull<u8>, _size: usize) -> Result<(), MemError> {
        Ok(()) // heap memory is always accessible
    }

    unsafe fn decommit(_ptr: NonNull<u8>, _size: usize) -> Result<(), MemError> {
        Ok(()) // no-op; memory remains accessible
    }

    unsafe fn unmap(ptr: NonNull<u8>, size: usize) -> Result<(), MemError> {
        let layout = std::alloc::Layout::from_size_align(size, 4096)
            .map_err(|e| MemError::ReleaseFailed(std::io::Error::other(e)))?;
        // Safety: ptr was allocated with the same layout via `map`.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        Ok(())
    }

    fn page_size() -> usize {
        4096
    }
}

#[cfg(all(test, not(any(loom, miri))))]
mod tests {
    use super::*;

    #[test]
    fn test_map_write_unmap() {
        let size = PlatformVmOps::page_size();
        // Safety: Test code.
        unsafe {
            let ptr = PlatformVmOps::map(size).expect("map failed");

            let slice = std::slice::from_raw_parts_mut(ptr.as_ptr(), size);
            slice[0] = 42;
            slice[size - 1] = 24;
            assert_eq!(slice[0], 42);
            assert_eq!(slice[size - 1], 24);

            PlatformVmOps::unmap(ptr, size).expect("unmap failed");
        }
    }

    #[test]
    fn test_map_zero_size_fails() {
        // mmap with 0 size fails with EINVAL.
        // Safety: Test code.
        let result = unsafe { PlatformVmOps::map(0) };
        assert!(result.is_err(), "mapping 0 bytes should fail");
    }

    #[test]
    fn test_decommit_then_commit() {
        // Full backed → returned → backed cycle.
        let size = PlatformVmOps::page_size();
        // Safety: Test code.
        unsafe {
            let ptr = PlatformVmOps::map(size).expect("map failed");
            *(ptr.as_ptr()) = 42;

            PlatformVmOps::decommit(ptr, size).expect("decommit failed");

            // Content is undefined after decommit; recommit and write fresh.
            PlatformVmOps::commit(ptr, size).expect("commit failed");
            *(ptr.as_ptr()) = 84;
            assert_eq!(*(ptr.as_ptr().cast_const()), 84);

            PlatformVmOps::unmap(ptr, size).expect("unmap failed");
        }
    }

    #[test]
    fn test_partial_decommit() {
        // Decommit a sub-range of a larger mapping; the rest stays usable.
        let page_size = PlatformVmOps::page_size();
        let total = page_size * 4;

        // Safety: Test code.
        unsafe {
            let ptr = PlatformVmOps::map(total).expect("map failed");
            let middle = NonNull::new(ptr.as_ptr().add(page_size)).unwrap();

            *(ptr.as_ptr()) = 1;
            *(ptr.as_ptr().add(3 * page_size)) = 3;

            PlatformVmOps::decommit(middle, page_size * 2).expect("decommit failed");

            // Outer pages untouched.
            assert_eq!(*(ptr.as_ptr()), 1);
            assert_eq!(*(ptr.as_ptr().add(3 * page_size)), 3);

            PlatformVmOps::unmap(ptr, total).expect("unmap failed");
        }
    }

    #[test]
    fn test_commit_idempotent() {
        let size = PlatformVmOps::page_size();
        // Safety: Test code.
        unsafe {
            let ptr = PlatformVmOps::map(size).expect("map failed");
            PlatformVmOps::commit(ptr, size).expect("first commit failed");
            PlatformVmOps::commit(ptr, size).expect("second commit failed");
            *(ptr.as_ptr()) = 123;
            PlatformVmOps::unmap(ptr, size).expect("unmap failed");
        }
    }

    #[test]
    fn test_page_size_is_power_of_two() {
        let size = PlatformVmOps::page_size();
        assert!(size > 0);
        assert!(size.is_power_of_two(), "page size {size} is not power of two");
    }

    #[test]
    fn test_map_large() {
        // A 1GB anonymous mapping is fine on 64-bit systems.
        let size = 1024 * 1024 * 1024;
        // Safety: Test code.
        unsafe {
            let ptr = PlatformVmOps::map(size).expect("failed to map 1GB");
            PlatformVmOps::unmap(ptr, size).expect("unmap failed");
        }
    }

    #[test]
    fn test_multiple_mappings_independent() {
        let page_size = PlatformVmOps::page_size();
        // Safety: Test code.
        unsafe {
            let ptr1 = PlatformVmOps::map(page_size).expect("map 1 failed");
            let ptr2 = PlatformVmOps::map(page_size).expect("map 2 failed");

            assert_ne!(ptr1, ptr2);

            *(ptr1.as_ptr()) = 1;
            *(ptr2.as_ptr()) = 2;

            PlatformVmOps::unmap(ptr1, page_size).expect("unmap 1 failed");

            // ptr2 should still be valid
            assert_eq!(*(ptr2.as_ptr()), 2);

            PlatformVmOps::unmap(ptr2, page_size).expect("unmap 2 failed");
        }
    }
}
