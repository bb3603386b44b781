//! String and buffer helpers layered on the pool allocator.
//!
//! Dissection code deals in C-style NUL-terminated strings handed across an
//! FFI boundary, so the duplication helpers all append a terminating NUL and
//! return raw pointers with the same validity contract as
//! [`ScopePool::alloc`]: good until the next reset, never individually freed.

use super::pool::{MemError, ScopePool};
use std::fmt::{self, Write as _};
use std::ptr::NonNull;

/// Stand-in text duplicated when the input string is absent. Dissectors
/// routinely format field values that may be missing; a visible placeholder
/// beats a crash or an empty cell.
pub const NULL_PLACEHOLDER: &str = "(NULL)";

impl ScopePool {
    /// Copy `bytes` into this scope (no terminator added).
    ///
    /// # Errors
    ///
    /// Same as [`alloc`](Self::alloc).
    pub fn dup_bytes(&self, bytes: &[u8]) -> Result<NonNull<u8>, MemError> {
        let ptr = self.alloc(bytes.len())?;
        // Safety: bytes.len() bytes at ptr were just allocated.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.as_ptr(), bytes.len());
        }
        Ok(ptr)
    }

    /// Copy `s` into this scope as a NUL-terminated string. A missing input
    /// duplicates as [`NULL_PLACEHOLDER`].
    ///
    /// # Errors
    ///
    /// Same as [`alloc`](Self::alloc).
    pub fn dup_str(&self, s: Option<&str>) -> Result<NonNull<u8>, MemError> {
        self.dup_terminated(s.unwrap_or(NULL_PLACEHOLDER).as_bytes())
    }

    /// Copy at most `max` bytes of `s` into this scope, NUL-terminated,
    /// never splitting a multi-byte character.
    ///
    /// # Errors
    ///
    /// Same as [`alloc`](Self::alloc).
    pub fn dup_str_max(&self, s: Option<&str>, max: usize) -> Result<NonNull<u8>, MemError> {
        let s = s.unwrap_or(NULL_PLACEHOLDER);
        self.dup_terminated(s[..char_floor(s, max)].as_bytes())
    }

    /// Format `args` into a fresh NUL-terminated allocation of exactly the
    /// right size: the formatted length is measured with a counting pass
    /// before any memory is taken.
    ///
    /// # Errors
    ///
    /// Same as [`alloc`](Self::alloc).
    pub fn alloc_fmt(&self, args: fmt::Arguments<'_>) -> Result<NonNull<u8>, MemError> {
        let mut counter = CountWriter(0);
        // Infallible: CountWriter never errors.
        let _ = counter.write_fmt(args);
        let len = counter.0;

        let ptr = self.alloc(len + 1)?;
        // Safety: len + 1 bytes at ptr were just allocated.
        let buf = unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), len + 1) };
        let mut writer = SliceWriter { buf, pos: 0 };
        // Infallible: the counting pass sized the buffer for these args.
        let _ = writer.write_fmt(args);
        debug_assert_eq!(writer.pos, len);
        writer.buf[len] = 0;
        Ok(ptr)
    }

    fn dup_terminated(&self, bytes: &[u8]) -> Result<NonNull<u8>, MemError> {
        let ptr = self.alloc(bytes.len() + 1)?;
        // Safety: bytes.len() + 1 bytes at ptr were just allocated.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.as_ptr(), bytes.len());
            ptr.as_ptr().add(bytes.len()).write(0);
        }
        Ok(ptr)
    }
}

/// Largest index `<= max` that is a char boundary of `s`.
fn char_floor(s: &str, max: usize) -> usize {
    let mut end = max.min(s.len());
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    end
}

struct CountWriter(usize);

impl fmt::Write for CountWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0 += s.len();
        Ok(())
    }
}

struct SliceWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl fmt::Write for SliceWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let end = self.pos + s.len();
        if end > self.buf.len() {
            return Err(fmt::Error);
        }
        self.buf[self.pos..end].copy_from_slice(s.as_bytes());
        self.pos = end;
        Ok(())
    }
}

/// Growable text buffer backed by a scope, with a hard size limit.
///
/// Growth takes a fresh, doubled block from the pool and abandons the old
/// one to the arena (the pool has no per-object free). Appends that would
/// push past the maximum are truncated at a character boundary instead of
/// failing, matching how dissectors build display strings of bounded width.
///
/// The buffer follows the pool's validity contract: resetting the pool
/// while a `StrBuf` from it is alive invalidates the buffer.
pub struct StrBuf {
    pool: ScopePool,
    ptr: NonNull<u8>,
    len: usize,
    capacity: usize,
    max: usize,
    truncated: bool,
}

impl StrBuf {
    /// Create a buffer with `initial` bytes of capacity, growable up to
    /// `max` bytes of text.
    ///
    /// # Errors
    ///
    /// Same as [`ScopePool::alloc`].
    ///
    /// # Panics
    ///
    /// Panics if `initial` is zero or exceeds `max`.
    pub fn new(pool: &ScopePool, initial: usize, max: usize) -> Result<Self, MemError> {
        assert!(initial > 0, "StrBuf needs a non-zero initial capacity");
        assert!(initial <= max, "StrBuf initial capacity {initial} exceeds maximum {max}");
        let ptr = pool.alloc(initial)?;
        Ok(Self {
            pool: pool.clone(),
            ptr,
            len: 0,
            capacity: initial,
            max,
            truncated: false,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether any append so far was cut short by the size limit. A
    /// char-boundary cut can drop bytes while leaving the buffer below its
    /// maximum, so this is tracked explicitly rather than inferred from
    /// the length.
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Append `s`, truncating at a character boundary if the buffer would
    /// exceed its maximum.
    ///
    /// # Errors
    ///
    /// Same as [`ScopePool::alloc`] (growth may map a chunk).
    pub fn append(&mut self, s: &str) -> Result<(), MemError> {
        let room = self.max - self.len;
        let take = char_floor(s, room);
        if take < s.len() {
            self.truncated = true;
        }
        if take == 0 {
            return Ok(());
        }
        let bytes = &s.as_bytes()[..take];

        if self.len + bytes.len() > self.capacity {
            self.grow(self.len + bytes.len())?;
        }
        // Safety: capacity >= len + bytes.len() after the growth above.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.ptr.as_ptr().add(self.len),
                bytes.len(),
            );
        }
        self.len += bytes.len();
        Ok(())
    }

    /// Append one character, subject to the same truncation rule.
    ///
    /// # Errors
    ///
    /// Same as [`append`](Self::append).
    pub fn push(&mut self, c: char) -> Result<(), MemError> {
        self.append(c.encode_utf8(&mut [0u8; 4]))
    }

    /// View the accumulated text.
    pub fn as_str(&self) -> &str {
        // Safety: only whole UTF-8 fragments are ever copied in, and the
        // backing allocation outlives self (no reset intervened, per the
        // validity contract).
        unsafe {
            std::str::from_utf8_unchecked(std::slice::from_raw_parts(self.ptr.as_ptr(), self.len))
        }
    }

    fn grow(&mut self, needed: usize) -> Result<(), MemError> {
        let new_cap = (self.capacity * 2).max(needed).min(self.max);
        let new_ptr = self.pool.alloc(new_cap)?;
        // Safety: both blocks are live; the new one has room for len bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.as_ptr(), new_ptr.as_ptr(), self.len);
        }
        // The old block stays behind in the arena until the next reset.
        self.ptr = new_ptr;
        self.capacity = new_cap;
        Ok(())
    }
}

impl fmt::Debug for StrBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StrBuf")
            .field("text", &self.as_str())
            .field("capacity", &self.capacity)
            .field("max", &self.max)
            .finish()
    }
}

impl fmt::Display for StrBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
