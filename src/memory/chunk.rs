use super::canary::{self, CanaryFault, CANARY_NONE, CANARY_PATTERN_SIZE};
use super::stats;
use super::vm::{PlatformVmOps, VmError, VmOps};
use std::ptr::NonNull;

/// Size of one pool chunk.
pub const CHUNK_SIZE: usize = 10 * 1024 * 1024;

/// One OS-backed memory region owned by exactly one pool.
///
/// The usable sub-range sits strictly between the two optional guard pages;
/// the bump cursor and remaining counter only ever refer to that sub-range.
pub(crate) struct Chunk {
    base: NonNull<u8>,
    mapped: usize,
    usable_start: usize,
    usable_len: usize,
    /// Next free offset, relative to the usable base.
    cursor: usize,
    remaining: usize,
    /// Offset of the most recently written canary record, relative to the
    /// usable base; [`CANARY_NONE`] when the chunk holds no allocations.
    last_canary: u64,
    guarded: bool,
}

impl Chunk {
    /// Map a plain chunk: the whole region is usable.
    pub(crate) fn new(size: usize) -> Result<Self, VmError> {
        // Safety: FFI call to map memory.
        let base = unsafe { PlatformVmOps::map(size)? };
        stats::TOTAL_MAPPED.add(size);
        stats::CHUNKS_LIVE.add(1);
        Ok(Self {
            base,
            mapped: size,
            usable_start: 0,
            usable_len: size,
            cursor: 0,
            remaining: size,
            last_canary: CANARY_NONE,
            guarded: false,
        })
    }

    /// Map a chunk bracketed with one no-access page at each end.
    ///
    /// The leading page boundary is rounded up and the trailing one down, so
    /// the guards land on real pages even if the backend ever hands back an
    /// unaligned region. Any overrun out of the usable range then raises a
    /// hardware fault instead of silently corrupting neighboring memory.
    ///
    /// On backends without page protection the chunk degrades to a plain
    /// mapping.
    ///
    /// # Panics
    ///
    /// Panics if `size` does not exceed two pages, or (except on Windows,
    /// where the protection call is known to occasionally fail and is
    /// tolerated with a warning) if page protection fails.
    pub(crate) fn with_guards(size: usize) -> Result<Self, VmError> {
        if !PlatformVmOps::supports_protection() {
            return Self::new(size);
        }

        let page = PlatformVmOps::page_size();
        assert!(page.is_power_of_two(), "page size {page} is not a power of two");
        assert!(
            size > 2 * page,
            "chunk size {size} must exceed two pages (page size {page})"
        );

        let mut chunk = Self::new(size)?;
        let addr = chunk.base.as_ptr() as usize;
        let lead = addr.next_multiple_of(page) - addr;
        let trail = ((addr + size) & !(page - 1)) - addr;
        assert!(
            trail - lead > 2 * page,
            "chunk at {addr:#x} has no usable space between guard pages"
        );

        // Safety: both offsets are page-aligned and inside the mapping.
        let (head, tail) = unsafe {
            (
                NonNull::new_unchecked(chunk.base.as_ptr().add(lead)),
                NonNull::new_unchecked(chunk.base.as_ptr().add(trail - page)),
            )
        };
        let guarded = protect_guard(head, page) && protect_guard(tail, page);

        chunk.usable_start = lead + page;
        chunk.usable_len = (trail - page) - (lead + page);
        chunk.remaining = chunk.usable_len;
        chunk.guarded = guarded;
        Ok(chunk)
    }

    #[inline]
    pub(crate) fn usable_base(&self) -> *mut u8 {
        // Safety: usable_start is inside the mapping.
        unsafe { self.base.as_ptr().add(self.usable_start) }
    }

    /// Bytes consumed from the usable range.
    #[inline]
    pub(crate) fn used(&self) -> usize {
        self.cursor
    }

    #[inline]
    pub(crate) fn remaining(&self) -> usize {
        self.remaining
    }

    #[inline]
    pub(crate) fn fits(&self, padded: usize) -> bool {
        padded <= self.remaining
    }

    /// Take the next `padded` bytes; returns their offset from the usable
    /// base. The caller must have checked [`fits`](Self::fits).
    pub(crate) fn bump(&mut self, padded: usize) -> usize {
        debug_assert!(self.fits(padded));
        let offset = self.cursor;
        self.cursor += padded;
        self.remaining -= padded;
        offset
    }

    #[inline]
    pub(crate) fn ptr_at(&self, offset: usize) -> NonNull<u8> {
        debug_assert!(offset < self.usable_len);
        // Safety: offset is inside the usable range of a live mapping.
        unsafe { NonNull::new_unchecked(self.usable_base().add(offset)) }
    }

    #[inline]
    pub(crate) fn last_canary(&self) -> u64 {
        self.last_canary
    }

    #[inline]
    pub(crate) fn set_last_canary(&mut self, offset: u64) {
        self.last_canary = offset;
    }

    /// Whether `ptr` points into the currently written part of this chunk.
    pub(crate) fn contains_written(&self, ptr: *const u8) -> bool {
        let addr = ptr as usize;
        let start = self.usable_base() as usize;
        addr >= start && addr < start + self.cursor
    }

    /// Walk the canary chain over the written range.
    pub(crate) fn verify_canaries(
        &self,
        pattern: &[u8; CANARY_PATTERN_SIZE],
    ) -> Result<(), CanaryFault> {
        // Safety: the written range is readable for this live chunk.
        unsafe { canary::verify_chain(self.usable_base(), self.cursor, self.last_canary, pattern) }
    }

    /// Overwrite the consumed part of the usable range with `marker`.
    pub(crate) fn scrub_used(&mut self, marker: u8) {
        // Safety: cursor bytes past the usable base are writable.
        unsafe {
            std::ptr::write_bytes(self.usable_base(), marker, self.cursor);
        }
    }

    /// Return the chunk to its pristine state. Guard pages are untouched.
    pub(crate) fn reset(&mut self) {
        self.cursor = 0;
        self.remaining = self.usable_len;
        self.last_canary = CANARY_NONE;
    }
}

/// Protect one guard page; returns whether the page is actually guarded.
fn protect_guard(ptr: NonNull<u8>, len: usize) -> bool {
    // Safety: caller passes a page-aligned sub-range of a live mapping.
    match unsafe { PlatformVmOps::protect_none(ptr, len) } {
        Ok(()) => true,
        Err(e) => {
            // VirtualProtect is known to occasionally fail on legacy desktop
            // configurations; degrade with a warning there instead of aborting.
            if cfg!(windows) {
                tracing::warn!("guard page protection failed, continuing unguarded: {e}");
                false
            } else {
                panic!("guard page protection failed: {e}");
            }
        }
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        // Safety: the mapping is owned by this chunk and not referenced
        // after drop.
        unsafe {
            drop(PlatformVmOps::unmap(self.base, self.mapped));
        }
        stats::TOTAL_MAPPED.sub(self.mapped);
        stats::CHUNKS_LIVE.sub(1);
    }
}
