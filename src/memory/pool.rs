use super::canary::{self, CANARY_LINK_SIZE, CANARY_PATTERN_SIZE};
use super::chunk::{Chunk, CHUNK_SIZE};
use super::vm::VmError;
use std::alloc::Layout;
use std::cell::RefCell;
use std::ptr::NonNull;
use std::rc::Rc;

/// Hard per-request sanity ceiling. This exists to catch runaway or
/// accidental huge allocations, not to be a real limit.
pub const MAX_ALLOC_SIZE: usize = CHUNK_SIZE / 4;

/// Marker written over freshly allocated bytes when scrubbing is enabled,
/// to surface reads of uninitialized memory.
pub(crate) const ALLOC_MARKER: u8 = 0xAB;

/// Marker written over the consumed range at reset time, to distinguish
/// freed memory from never-written memory when debugging.
pub(crate) const FREED_MARKER: u8 = 0xCD;

#[derive(Debug, thiserror::Error)]
pub enum MemError {
    #[error("scope allocation failed: {0}")]
    OutOfMemory(#[source] VmError),
}

/// Configuration for one pool. All switches are read exactly once, at pool
/// construction; nothing re-reads the environment per allocation.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Carve allocations out of large chunks. When false, every allocation
    /// is an individual heap object released one by one at reset (slower,
    /// but lets external heap checkers see each allocation).
    pub use_chunks: bool,

    /// Write a canary record after every allocation and verify the whole
    /// chain at reset.
    pub use_canary: bool,

    /// Bracket each chunk with no-access guard pages.
    pub use_guards: bool,

    /// Scrub memory with [`ALLOC_MARKER`] on allocation and
    /// [`FREED_MARKER`] on reset.
    pub scrub: bool,

    /// Make [`ScopePool::verify_pointer`] actually scan. Off by default
    /// because the scan is linear in the number of chunks.
    pub verify_pointers: bool,

    /// Report chunk-mapping failure as a catchable [`MemError`] instead of
    /// aborting the process.
    pub oom_is_error: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            use_chunks: true,
            use_canary: true,
            use_guards: true,
            scrub: false,
            verify_pointers: false,
            oom_is_error: false,
        }
    }
}

impl PoolConfig {
    /// Read the debug switches from the process environment. Presence of a
    /// variable toggles the switch; values are ignored.
    pub fn from_env() -> Self {
        fn flag(name: &str) -> bool {
            std::env::var_os(name).is_some()
        }
        Self {
            use_chunks: !flag("SCOPEMEM_NO_CHUNKS"),
            use_canary: !flag("SCOPEMEM_NO_CANARY"),
            use_guards: !flag("SCOPEMEM_NO_GUARDS"),
            scrub: flag("SCOPEMEM_SCRUB"),
            verify_pointers: flag("SCOPEMEM_VERIFY_POINTERS"),
            oom_is_error: flag("SCOPEMEM_OOM_IS_ERROR"),
        }
    }
}

/// One heap object in non-chunked mode.
struct RawObject {
    ptr: NonNull<u8>,
    layout: Layout,
}

struct PoolCore {
    name: &'static str,
    cfg: PoolConfig,
    pattern: [u8; CANARY_PATTERN_SIZE],
    /// Chunk currently being bumped.
    current: Option<Chunk>,
    /// Exhausted chunks holding live allocations.
    used: Vec<Chunk>,
    /// Recycled, emptied chunks.
    free: Vec<Chunk>,
    /// Individual heap objects (non-chunked mode only).
    objects: Vec<RawObject>,
}

impl PoolCore {
    fn alloc(&mut self, size: usize) -> Result<NonNull<u8>, MemError> {
        assert!(
            size <= MAX_ALLOC_SIZE,
            "{}: allocation of {size} bytes exceeds the per-request ceiling ({MAX_ALLOC_SIZE})",
            self.name
        );

        if !self.cfg.use_chunks {
            return self.alloc_object(size);
        }

        let padded = if self.cfg.use_canary {
            size + canary::overhead(size)
        } else {
            // Zero-size requests still consume one aligned slot, so every
            // returned pointer is distinct and stays inside the usable range.
            size.next_multiple_of(canary::ALIGN).max(canary::ALIGN)
        };

        if self.current.as_ref().map_or(true, |c| !c.fits(padded)) {
            if let Some(full) = self.current.take() {
                self.used.push(full);
            }
            let next = match self.free.pop() {
                Some(chunk) => chunk,
                None => self.map_chunk()?,
            };
            self.current = Some(next);
        }
        let chunk = match self.current.as_mut() {
            Some(chunk) => chunk,
            None => unreachable!("current chunk installed above"),
        };

        let offset = chunk.bump(padded);
        let ptr = chunk.ptr_at(offset);

        if self.cfg.use_canary {
            let pad = padded - size - CANARY_LINK_SIZE;
            let record_off = offset + size;
            // Safety: the record lies inside the bytes just bumped.
            unsafe {
                canary::write_record(
                    chunk.ptr_at(record_off).as_ptr(),
                    &self.pattern,
                    pad,
                    chunk.last_canary(),
                );
            }
            chunk.set_last_canary(record_off as u64);
        }

        if self.cfg.scrub {
            // Safety: size bytes at ptr were just bumped.
            unsafe {
                std::ptr::write_bytes(ptr.as_ptr(), ALLOC_MARKER, size);
            }
        }

        Ok(ptr)
    }

    fn alloc_object(&mut self, size: usize) -> Result<NonNull<u8>, MemError> {
        let layout = match Layout::from_size_align(size.max(1), canary::ALIGN) {
            Ok(layout) => layout,
            Err(e) => unreachable!("layout for {size} bytes: {e}"),
        };
        // Safety: layout has non-zero size.
        let raw = unsafe { std::alloc::alloc(layout) };
        let Some(ptr) = NonNull::new(raw) else {
            let err = VmError::MapFailed(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                "heap allocation returned null",
            ));
            if self.cfg.oom_is_error {
                return Err(MemError::OutOfMemory(err));
            }
            panic!("{}: {err}", self.name);
        };
        if self.cfg.scrub {
            // Safety: the object was just allocated with at least `size` bytes.
            unsafe {
                std::ptr::write_bytes(ptr.as_ptr(), ALLOC_MARKER, size);
            }
        }
        self.objects.push(RawObject { ptr, layout });
        Ok(ptr)
    }

    fn map_chunk(&self) -> Result<Chunk, MemError> {
        let mapped = if self.cfg.use_guards {
            Chunk::with_guards(CHUNK_SIZE)
        } else {
            Chunk::new(CHUNK_SIZE)
        };
        match mapped {
            Ok(chunk) => {
                tracing::debug!(pool = self.name, bytes = CHUNK_SIZE, "mapped new chunk");
                Ok(chunk)
            }
            Err(e) if self.cfg.oom_is_error => Err(MemError::OutOfMemory(e)),
            Err(e) => panic!("{}: chunk mapping failed: {e}", self.name),
        }
    }

    fn reset_all(&mut self) {
        if !self.cfg.use_chunks {
            for obj in self.objects.drain(..) {
                if self.cfg.scrub {
                    // Safety: the object is live until the dealloc below.
                    unsafe {
                        std::ptr::write_bytes(obj.ptr.as_ptr(), FREED_MARKER, obj.layout.size());
                    }
                }
                // Safety: ptr was allocated with this exact layout.
                unsafe {
                    std::alloc::dealloc(obj.ptr.as_ptr(), obj.layout);
                }
            }
            return;
        }

        let mut retired = std::mem::take(&mut self.used);
        if let Some(current) = self.current.take() {
            retired.push(current);
        }
        for chunk in &mut retired {
            if self.cfg.use_canary {
                if let Err(fault) = chunk.verify_canaries(&self.pattern) {
                    tracing::error!(pool = self.name, %fault, "heap corruption detected");
                    panic!("heap corruption detected in {} scope: {fault}", self.name);
                }
            }
            if self.cfg.scrub {
                chunk.scrub_used(FREED_MARKER);
            }
            chunk.reset();
        }
        self.free.append(&mut retired);
    }

    fn chunks(&self) -> impl Iterator<Item = &Chunk> {
        self.current.iter().chain(&self.used).chain(&self.free)
    }

    fn memory_usage(&self) -> usize {
        if !self.cfg.use_chunks {
            return self.objects.iter().map(|o| o.layout.size()).sum();
        }
        self.chunks().map(Chunk::used).sum()
    }

    fn free_capacity(&self) -> usize {
        self.chunks().map(Chunk::remaining).sum()
    }

    fn verify_pointer(&self, ptr: *const u8) -> bool {
        if !self.cfg.use_chunks {
            return self.objects.iter().any(|o| {
                let start = o.ptr.as_ptr() as usize;
                (ptr as usize) >= start && (ptr as usize) < start + o.layout.size()
            });
        }
        self.chunks().any(|c| c.contains_written(ptr))
    }
}

impl Drop for PoolCore {
    fn drop(&mut self) {
        // Chunks unmap themselves; heap objects need explicit release.
        for obj in self.objects.drain(..) {
            // Safety: ptr was allocated with this exact layout.
            unsafe {
                std::alloc::dealloc(obj.ptr.as_ptr(), obj.layout);
            }
        }
    }
}

/// Handle to one allocation scope (lifetime class).
///
/// Cloning the handle is cheap and shares the underlying pool. The handle is
/// deliberately neither `Send` nor `Sync`: a pool belongs to one thread, and
/// an embedding that wants per-worker arenas creates one pool per worker.
///
/// # Pointer validity
///
/// Every pointer returned by the allocation methods is valid — exclusively
/// owned by the caller — until the next [`reset_all`](Self::reset_all) on
/// this pool, and not one moment longer. The pool never frees individual
/// allocations.
#[derive(Clone)]
pub struct ScopePool {
    inner: Rc<RefCell<PoolCore>>,
}

impl ScopePool {
    pub fn new(name: &'static str, cfg: PoolConfig) -> Self {
        Self {
            inner: Rc::new(RefCell::new(PoolCore {
                name,
                pattern: canary::new_pattern(),
                cfg,
                current: None,
                used: Vec::new(),
                free: Vec::new(),
                objects: Vec::new(),
            })),
        }
    }

    pub fn name(&self) -> &'static str {
        self.inner.borrow().name
    }

    /// Allocate `size` bytes from this scope.
    ///
    /// The returned memory is uninitialized (or filled with
    /// [`ALLOC_MARKER`] when scrubbing is on).
    ///
    /// # Errors
    ///
    /// Returns [`MemError::OutOfMemory`] if the OS declines a chunk mapping
    /// and the pool was configured with `oom_is_error`; otherwise a mapping
    /// failure aborts the process.
    ///
    /// # Panics
    ///
    /// Panics if `size` exceeds [`MAX_ALLOC_SIZE`].
    pub fn alloc(&self, size: usize) -> Result<NonNull<u8>, MemError> {
        self.inner.borrow_mut().alloc(size)
    }

    /// Allocate `size` zeroed bytes from this scope.
    ///
    /// # Errors
    ///
    /// Same as [`alloc`](Self::alloc).
    pub fn alloc_zeroed(&self, size: usize) -> Result<NonNull<u8>, MemError> {
        let ptr = self.alloc(size)?;
        // Safety: size bytes at ptr were just allocated.
        unsafe {
            std::ptr::write_bytes(ptr.as_ptr(), 0, size);
        }
        Ok(ptr)
    }

    /// Invalidate every allocation made from this scope at once.
    ///
    /// Used chunks have their canary chains verified, are scrubbed (debug),
    /// and go back on the free list for reuse; nothing is returned to the
    /// OS. In non-chunked mode each heap object is released individually.
    ///
    /// # Panics
    ///
    /// Panics if canary verification detects heap corruption.
    pub fn reset_all(&self) {
        self.inner.borrow_mut().reset_all();
    }

    /// Bytes currently consumed by allocations (plus canary overhead),
    /// summed over every chunk. O(chunks), not O(allocations).
    pub fn memory_usage(&self) -> usize {
        self.inner.borrow().memory_usage()
    }

    /// Whether `ptr` points into the currently written range of some chunk
    /// of this pool. Requires the `verify_pointers` switch; when it is off,
    /// this always returns true so callers can assert on it unconditionally.
    pub fn verify_pointer(&self, ptr: *const u8) -> bool {
        let core = self.inner.borrow();
        if !core.cfg.verify_pointers {
            return true;
        }
        core.verify_pointer(ptr)
    }

    /// Sum of unconsumed bytes across all chunks.
    pub(crate) fn free_capacity(&self) -> usize {
        self.inner.borrow().free_capacity()
    }
}

impl std::fmt::Debug for ScopePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let core = self.inner.borrow();
        f.debug_struct("ScopePool")
            .field("name", &core.name)
            .field("usage", &core.memory_usage())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet_cfg() -> PoolConfig {
        // Guards stay on (the default); scrubbing off keeps tests fast.
        PoolConfig::default()
    }

    #[test]
    fn test_alloc_basic_read_write() {
        let pool = ScopePool::new("test", quiet_cfg());
        let ptr = pool.alloc(64).unwrap();
        // Safety: Test code.
        unsafe {
            std::ptr::write_bytes(ptr.as_ptr(), 0x7E, 64);
            assert_eq!(*ptr.as_ptr(), 0x7E);
            assert_eq!(*ptr.as_ptr().add(63), 0x7E);
        }
    }

    #[test]
    fn test_outstanding_allocations_do_not_overlap() {
        let pool = ScopePool::new("test", quiet_cfg());
        let sizes = [1usize, 4, 7, 8, 20, 33, 64, 100, 255, 4096];
        let ptrs: Vec<_> = sizes.iter().map(|&s| (pool.alloc(s).unwrap(), s)).collect();

        for (i, &(ptr, size)) in ptrs.iter().enumerate() {
            // Safety: Test code.
            unsafe {
                std::ptr::write_bytes(ptr.as_ptr(), i as u8 + 1, size);
            }
        }
        for (i, &(ptr, size)) in ptrs.iter().enumerate() {
            // Safety: Test code.
            let slice = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), size) };
            assert!(
                slice.iter().all(|&b| b == i as u8 + 1),
                "allocation {i} was clobbered"
            );
        }
    }

    #[test]
    fn test_alloc_zeroed_is_zeroed() {
        let mut cfg = quiet_cfg();
        cfg.scrub = true; // zeroing must win over the alloc marker
        let pool = ScopePool::new("test", cfg);
        let ptr = pool.alloc_zeroed(128).unwrap();
        // Safety: Test code.
        let slice = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), 128) };
        assert!(slice.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_scrub_marks_fresh_allocations() {
        let mut cfg = quiet_cfg();
        cfg.scrub = true;
        let pool = ScopePool::new("test", cfg);
        let ptr = pool.alloc(32).unwrap();
        // Safety: Test code.
        let slice = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), 32) };
        assert!(slice.iter().all(|&b| b == ALLOC_MARKER));
    }

    #[test]
    fn test_scrub_marks_freed_memory() {
        let mut cfg = quiet_cfg();
        cfg.scrub = true;
        let pool = ScopePool::new("test", cfg);
        let ptr = pool.alloc(32).unwrap();
        // Safety: Test code.
        unsafe {
            std::ptr::write_bytes(ptr.as_ptr(), 0x11, 32);
        }
        pool.reset_all();
        // The chunk stays mapped (recycled, not unmapped), so the stale
        // pointer still reads the scrubbed bytes.
        // Safety: Test code.
        let slice = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), 32) };
        assert!(slice.iter().all(|&b| b == FREED_MARKER));
    }

    #[test]
    fn test_reset_recycles_chunk_same_offset() {
        let pool = ScopePool::new("test", quiet_cfg());
        let first = pool.alloc(4).unwrap();
        pool.alloc(8).unwrap();
        pool.alloc(20).unwrap();

        pool.reset_all();

        // The recycled chunk is reused from its start, not freshly mapped.
        let second = pool.alloc(4).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_reset_is_idempotent() {
        let pool = ScopePool::new("test", quiet_cfg());
        pool.alloc(100).unwrap();
        pool.alloc(200).unwrap();

        pool.reset_all();
        let capacity_after_first = pool.free_capacity();
        pool.reset_all();
        assert_eq!(pool.free_capacity(), capacity_after_first);
        assert_eq!(pool.memory_usage(), 0);
    }

    #[test]
    fn test_memory_usage_bounds() {
        let pool = ScopePool::new("test", quiet_cfg());
        let sizes = [4usize, 8, 20];
        for &s in &sizes {
            pool.alloc(s).unwrap();
        }
        let total: usize = sizes.iter().sum();
        let max_overhead = canary::CANARY_LINK_SIZE + canary::ALIGN;
        let usage = pool.memory_usage();
        assert!(usage >= total, "usage {usage} below payload total {total}");
        assert!(
            usage <= total + sizes.len() * max_overhead,
            "usage {usage} above padded maximum"
        );
    }

    #[test]
    fn test_memory_usage_resets_to_zero() {
        let pool = ScopePool::new("test", quiet_cfg());
        pool.alloc(1000).unwrap();
        assert!(pool.memory_usage() > 0);
        pool.reset_all();
        assert_eq!(pool.memory_usage(), 0);
    }

    #[test]
    fn test_ceiling_boundary_ok() {
        let pool = ScopePool::new("test", quiet_cfg());
        pool.alloc(MAX_ALLOC_SIZE - 1).unwrap();
        pool.alloc(MAX_ALLOC_SIZE).unwrap();
    }

    #[test]
    #[should_panic(expected = "exceeds the per-request ceiling")]
    fn test_ceiling_boundary_panics() {
        let pool = ScopePool::new("test", quiet_cfg());
        drop(pool.alloc(MAX_ALLOC_SIZE + 1));
    }

    #[test]
    #[should_panic(expected = "heap corruption detected in test scope")]
    fn test_off_by_one_overrun_is_detected_at_reset() {
        let pool = ScopePool::new("test", quiet_cfg());
        let ptr = pool.alloc(4).unwrap();
        // Simulate an off-by-one overrun: clobber the byte immediately
        // after the allocation, which holds the first canary byte. A zero
        // masquerades as the record terminator, so the walk then misreads
        // the link and still reports corruption.
        // Safety: Test code.
        unsafe {
            *ptr.as_ptr().add(4) = 0;
        }
        pool.reset_all();
    }

    #[test]
    fn test_chunk_rollover() {
        let pool = ScopePool::new("test", quiet_cfg());
        // Each request takes MAX_ALLOC_SIZE plus overhead, so five of them
        // cannot fit one chunk.
        let ptrs: Vec<_> = (0..5).map(|_| pool.alloc(MAX_ALLOC_SIZE).unwrap()).collect();
        for (i, &ptr) in ptrs.iter().enumerate() {
            // Safety: Test code.
            unsafe {
                *ptr.as_ptr() = i as u8;
            }
        }
        for (i, &ptr) in ptrs.iter().enumerate() {
            // Safety: Test code.
            assert_eq!(unsafe { *ptr.as_ptr() }, i as u8);
        }
        pool.reset_all();
        assert_eq!(pool.memory_usage(), 0);
    }

    #[test]
    fn test_canary_disabled_still_aligns() {
        let mut cfg = quiet_cfg();
        cfg.use_canary = false;
        let pool = ScopePool::new("test", cfg);
        for size in [1usize, 3, 8, 13] {
            let ptr = pool.alloc(size).unwrap();
            assert_eq!(ptr.as_ptr() as usize % canary::ALIGN, 0);
        }
    }

    #[test]
    fn test_zero_size_allocs_are_distinct() {
        for use_canary in [true, false] {
            let cfg = PoolConfig { use_canary, ..quiet_cfg() };
            let pool = ScopePool::new("test", cfg);
            let a = pool.alloc(0).unwrap();
            let b = pool.alloc(0).unwrap();
            assert_ne!(a, b, "zero-size allocations alias (canary: {use_canary})");
            assert!(pool.memory_usage() >= 2 * canary::ALIGN);
        }
    }

    #[test]
    fn test_non_chunked_mode_roundtrip() {
        let mut cfg = quiet_cfg();
        cfg.use_chunks = false;
        let pool = ScopePool::new("test", cfg);

        let a = pool.alloc(16).unwrap();
        let b = pool.alloc_zeroed(32).unwrap();
        // Safety: Test code.
        unsafe {
            std::ptr::write_bytes(a.as_ptr(), 0x42, 16);
            assert_eq!(*b.as_ptr(), 0);
        }
        assert_eq!(pool.memory_usage(), 48);

        pool.reset_all();
        assert_eq!(pool.memory_usage(), 0);

        // The pool keeps working after a reset.
        pool.alloc(8).unwrap();
        assert_eq!(pool.memory_usage(), 8);
    }

    #[test]
    fn test_verify_pointer() {
        let mut cfg = quiet_cfg();
        cfg.verify_pointers = true;
        let pool = ScopePool::new("test", cfg);

        let ptr = pool.alloc(16).unwrap();
        assert!(pool.verify_pointer(ptr.as_ptr()));
        // Safety: Test code.
        assert!(pool.verify_pointer(unsafe { ptr.as_ptr().add(15) }));

        let stack_byte = 0u8;
        assert!(!pool.verify_pointer(&stack_byte));

        pool.reset_all();
        // After a reset the written range is empty; provenance is gone.
        assert!(!pool.verify_pointer(ptr.as_ptr()));
    }

    #[test]
    fn test_verify_pointer_disabled_always_true() {
        let pool = ScopePool::new("test", quiet_cfg());
        let stack_byte = 0u8;
        assert!(pool.verify_pointer(&stack_byte));
    }

    #[test]
    fn test_config_from_env_reads_toggles() {
        let _env = crate::memory::test_support::env_lock();
        std::env::set_var("SCOPEMEM_SCRUB", "1");
        std::env::set_var("SCOPEMEM_NO_CANARY", "1");
        let cfg = PoolConfig::from_env();
        std::env::remove_var("SCOPEMEM_SCRUB");
        std::env::remove_var("SCOPEMEM_NO_CANARY");

        assert!(cfg.scrub);
        assert!(!cfg.use_canary);
        assert!(cfg.use_chunks);
        assert!(cfg.use_guards);
        assert!(!cfg.oom_is_error);
    }

    #[test]
    fn test_clone_shares_pool() {
        let pool = ScopePool::new("test", quiet_cfg());
        let other = pool.clone();
        pool.alloc(40).unwrap();
        assert_eq!(other.memory_usage(), pool.memory_usage());
        other.reset_all();
        assert_eq!(pool.memory_usage(), 0);
    }
}
