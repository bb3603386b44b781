use std::ptr::NonNull;

#[derive(Debug, thiserror::Error)]
pub enum VmError {
    #[error("VM mapping failed: {0}")]
    MapFailed(#[source] std::io::Error),
    #[error("VM page protection failed: {0}")]
    ProtectFailed(#[source] std::io::Error),
    #[error("VM unmap failed: {0}")]
    UnmapFailed(#[source] std::io::Error),
}

/// Abstract interface for virtual memory operations.
///
/// Exactly one implementation is selected at build time; the chunk and pool
/// layers never know which backend is active.
pub(crate) trait VmOps {
    /// Map `size` bytes of zero-initialized read/write memory.
    /// Returns a pointer to the start of the mapping.
    unsafe fn map(size: usize) -> Result<NonNull<u8>, VmError>;

    /// Revoke all access to a page-aligned sub-range of a mapping.
    /// Any subsequent read or write of the range raises a hardware fault.
    unsafe fn protect_none(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// Return a mapping to the OS (after which pointers into it are invalid).
    unsafe fn unmap(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// OS page size.
    fn page_size() -> usize;

    /// Whether `protect_none` actually changes page permissions on this
    /// backend. False for the heap-backed fallback, where guard pages are
    /// unavailable.
    fn supports_protection() -> bool;
}

pub(crate) struct PlatformVmOps;

#[cfg(all(unix, not(miri)))]
mod unix {
    use super::{NonNull, PlatformVmOps, VmError, VmOps};
    use std::io;

    impl VmOps for PlatformVmOps {
        unsafe fn map(size: usize) -> Result<NonNull<u8>, VmError> {
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
                return Err(VmError::MapFailed(io::Error::last_os_error()));
            }

            match NonNull::new(ptr.cast::<u8>()) {
                Some(p) => Ok(p),
                None => Err(VmError::MapFailed(io::Error::other("mmap returned null"))),
            }
        }

        unsafe fn protect_none(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to mprotect.
            if unsafe {
                libc::mprotect(ptr.as_ptr().cast::<libc::c_void>(), size, libc::PROT_NONE)
            } != 0
            {
                return Err(VmError::ProtectFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        unsafe fn unmap(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to munmap.
            if unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), size) } != 0 {
                return Err(VmError::UnmapFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        fn page_size() -> usize {
            use std::sync::OnceLock;
            static CACHED: OnceLock<usize> = OnceLock::new();
            *CACHED.get_or_init(|| {
                // Safety: FFI call to sysconf.
                let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
                assert!(
                    raw > 0,
                    "sysconf(_SC_PAGESIZE) failed: {}",
                    io::Error::last_os_error()
                );
                // PORTABILITY: this crate supports only 64-bit targets; page
                // size fits in usize there.
                #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
                {
                    raw as usize
                }
            })
        }

        fn supports_protection() -> bool {
            true
        }
    }
}

#[cfg(all(windows, not(miri)))]
mod windows {
    use super::{NonNull, PlatformVmOps, VmError, VmOps};
    use std::ffi::c_void;
    use std::io;

    const MEM_COMMIT: u32 = 0x1000;
    const MEM_RESERVE: u32 = 0x2000;
    const MEM_RELEASE: u32 = 0x8000;
    const PAGE_NOACCESS: u32 = 0x01;
    const PAGE_READWRITE: u32 = 0x04;

    #[repr(C)]
    struct SystemInfo {
        w_processor_architecture: u16,
        w_reserved: u16,
        dw_page_size: u32,
        lp_minimum_application_address: *mut c_void,
        lp_maximum_application_address: *mut c_void,
        dw_active_processor_mask: usize,
        dw_number_of_processors: u32,
        dw_processor_type: u32,
        dw_allocation_granularity: u32,
        w_processor_level: u16,
        w_processor_revision: u16,
    }

    extern "system" {
        fn VirtualAlloc(
            lp_address: *mut c_void,
            dw_size: usize,
            fl_allocation_type: u32,
            fl_protect: u32,
        ) -> *mut c_void;
        fn VirtualProtect(
            lp_address: *mut c_void,
            dw_size: usize,
            fl_new_protect: u32,
            lpfl_old_protect: *mut u32,
        ) -> i32;
        fn VirtualFree(lp_address: *mut c_void, dw_size: usize, dw_free_type: u32) -> i32;
        fn GetSystemInfo(lp_system_info: *mut SystemInfo);
    }

    impl VmOps for PlatformVmOps {
        unsafe fn map(size: usize) -> Result<NonNull<u8>, VmError> {
            // Safety: FFI call to VirtualAlloc.
            let ptr = unsafe {
                VirtualAlloc(
                    std::ptr::null_mut(),
                    size,
                    MEM_RESERVE | MEM_COMMIT,
                    PAGE_READWRITE,
                )
            };

            match NonNull::new(ptr.cast::<u8>()) {
                Some(p) => Ok(p),
                None => Err(VmError::MapFailed(io::Error::last_os_error())),
            }
        }

        unsafe fn protect_none(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            let mut old = 0u32;
            // Safety: FFI call to VirtualProtect.
            if unsafe {
                VirtualProtect(ptr.as_ptr().cast::<c_void>(), size, PAGE_NOACCESS, &mut old)
            } == 0
            {
                return Err(VmError::ProtectFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        unsafe fn unmap(ptr: NonNull<u8>, _size: usize) -> Result<(), VmError> {
            // VirtualFree with MEM_RELEASE takes size 0 and the region base.
            // Safety: FFI call to VirtualFree.
            if unsafe { VirtualFree(ptr.as_ptr().cast::<c_void>(), 0, MEM_RELEASE) } == 0 {
                return Err(VmError::UnmapFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        fn page_size() -> usize {
            use std::sync::OnceLock;
            static CACHED: OnceLock<usize> = OnceLock::new();
            // Safety: FFI call to GetSystemInfo.
            *CACHED.get_or_init(|| unsafe {
                let mut info: SystemInfo = std::mem::zeroed();
                GetSystemInfo(&mut info);
                info.dw_page_size as usize
            })
        }

        fn supports_protection() -> bool {
            true
        }
    }
}

// ---------------------------------------------------------------------------
// Heap-backed fallback: platforms without page-level primitives, and Miri.
//
// Every "mapping" is a plain zeroed heap allocation. `protect_none` is a
// no-op; `supports_protection()` reports false so the chunk layer skips
// guard pages entirely instead of pretending they exist.
// ---------------------------------------------------------------------------
#[cfg(any(miri, not(any(unix, windows))))]
mod fallback {
    use super::{NonNull, PlatformVmOps, VmError, VmOps};
    use std::alloc::Layout;

    const FALLBACK_ALIGN: usize = 4096;

    fn layout_for(size: usize) -> Result<Layout, VmError> {
        Layout::from_size_align(size, FALLBACK_ALIGN)
            .map_err(|e| VmError::MapFailed(std::io::Error::other(e)))
    }

    impl VmOps for PlatformVmOps {
        unsafe fn map(size: usize) -> Result<NonNull<u8>, VmError> {
            if size == 0 {
                return Err(VmError::MapFailed(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "zero-size mapping",
                )));
            }
            let layout = layout_for(size)?;
            // Safety: layout has non-zero size.
            let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
            NonNull::new(ptr).ok_or_else(|| {
                VmError::MapFailed(std::io::Error::new(
                    std::io::ErrorKind::OutOfMemory,
                    "alloc returned null",
                ))
            })
        }

        unsafe fn protect_none(_ptr: NonNull<u8>, _size: usize) -> Result<(), VmError> {
            Ok(()) // heap memory cannot be protected; see supports_protection
        }

        unsafe fn unmap(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            let layout = layout_for(size)?;
            // Safety: ptr was allocated with the same layout via `map`.
            unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
            Ok(())
        }

        fn page_size() -> usize {
            4096
        }

        fn supports_protection() -> bool {
            false
        }
    }
}
