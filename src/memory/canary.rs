//! Canary records written between allocations.
//!
//! With canaries enabled, every allocation is followed by a variable-length
//! record: up to [`CANARY_PATTERN_SIZE`] pool-specific pattern bytes, a zero
//! terminator, then the offset (relative to the chunk's usable base) of the
//! previous record. The records form a reverse-ordered singly linked list
//! anchored at the chunk's last-canary field; the pool walks it at reset
//! time and treats any deviation as heap corruption.
//!
//! Links are stored as chunk-relative offsets rather than raw addresses, so
//! an out-of-range or non-decreasing link is itself a corruption signal.

use rand::Rng;

/// Length of a pool's canary pattern.
pub(crate) const CANARY_PATTERN_SIZE: usize = 15;

/// Size of the previous-record link at the tail of each record.
pub(crate) const CANARY_LINK_SIZE: usize = std::mem::size_of::<u64>();

/// Link value terminating the chain.
pub(crate) const CANARY_NONE: u64 = u64::MAX;

/// Natural alignment kept by the bump allocator, with or without canaries.
pub(crate) const ALIGN: usize = 8;

/// Why a canary walk failed.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub(crate) enum CanaryFault {
    #[error("canary pattern mismatch at offset {offset}")]
    PatternMismatch { offset: usize },
    #[error("canary record at offset {offset} has no terminator")]
    Unterminated { offset: usize },
    #[error("canary link offset {offset} is invalid (used bytes: {used})")]
    BadLink { offset: u64, used: usize },
}

/// Fill a fresh pool pattern with non-zero random bytes.
///
/// Randomness is cosmetic (it varies the pattern between pools and runs so
/// that a stray write is unlikely to reproduce it), not cryptographic.
pub(crate) fn new_pattern() -> [u8; CANARY_PATTERN_SIZE] {
    let mut rng = rand::rng();
    let mut pattern = [0u8; CANARY_PATTERN_SIZE];
    for byte in &mut pattern {
        *byte = loop {
            let v: u8 = rng.random();
            if v != 0 {
                break v;
            }
        };
    }
    pattern
}

/// Pattern-plus-terminator bytes needed after an allocation of `size` bytes.
/// Always 1..=8, chosen so the next allocation start stays 8-aligned.
#[inline]
pub(crate) fn pad_for(size: usize) -> usize {
    ALIGN - (size % ALIGN)
}

/// Total record overhead appended to an allocation of `size` bytes.
/// Always 9..=16 bytes.
#[inline]
pub(crate) fn overhead(size: usize) -> usize {
    pad_for(size) + CANARY_LINK_SIZE
}

/// Write one canary record at `record`.
///
/// `pad` must come from [`pad_for`] for the preceding allocation; `prev` is
/// the chunk-relative offset of the previous record, or [`CANARY_NONE`].
///
/// # Safety
///
/// `record` must point to at least `pad + CANARY_LINK_SIZE` writable bytes.
pub(crate) unsafe fn write_record(
    record: *mut u8,
    pattern: &[u8; CANARY_PATTERN_SIZE],
    pad: usize,
    prev: u64,
) {
    debug_assert!((1..=ALIGN).contains(&pad), "canary pad {pad} out of range");
    // Safety: caller guarantees pad + CANARY_LINK_SIZE writable bytes.
    unsafe {
        for i in 0..pad - 1 {
            record.add(i).write(pattern[i]);
        }
        record.add(pad - 1).write(0);
        std::ptr::copy_nonoverlapping(
            prev.to_le_bytes().as_ptr(),
            record.add(pad),
            CANARY_LINK_SIZE,
        );
    }
}

/// Walk the record chain from `last` back to its head, verifying every
/// record against `pattern`. `used` is the number of written bytes after
/// the chunk's usable base.
///
/// Links must strictly decrease, which both matches the reverse write order
/// and guarantees the walk terminates on corrupted input.
///
/// # Safety
///
/// `base..base + used` must be readable.
pub(crate) unsafe fn verify_chain(
    base: *const u8,
    used: usize,
    last: u64,
    pattern: &[u8; CANARY_PATTERN_SIZE],
) -> Result<(), CanaryFault> {
    let mut cur = last;
    while cur != CANARY_NONE {
        if cur >= used as u64 {
            return Err(CanaryFault::BadLink { offset: cur, used });
        }
        let off = cur as usize;

        // Pattern bytes up to the zero terminator.
        let mut i = 0;
        let term = loop {
            if i >= CANARY_PATTERN_SIZE || off + i >= used {
                return Err(CanaryFault::Unterminated { offset: off });
            }
            // Safety: off + i < used, and the caller guarantees readability.
            let byte = unsafe { *base.add(off + i) };
            if byte == 0 {
                break i;
            }
            if byte != pattern[i] {
                return Err(CanaryFault::PatternMismatch { offset: off + i });
            }
            i += 1;
        };

        let link_off = off + term + 1;
        if link_off + CANARY_LINK_SIZE > used {
            return Err(CanaryFault::Unterminated { offset: off });
        }
        let mut raw = [0u8; CANARY_LINK_SIZE];
        // Safety: link_off + CANARY_LINK_SIZE <= used.
        unsafe {
            std::ptr::copy_nonoverlapping(base.add(link_off), raw.as_mut_ptr(), CANARY_LINK_SIZE);
        }
        let prev = u64::from_le_bytes(raw);
        if prev != CANARY_NONE && prev >= cur {
            return Err(CanaryFault::BadLink { offset: prev, used });
        }
        cur = prev;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PATTERN: [u8; CANARY_PATTERN_SIZE] = [0xA5; CANARY_PATTERN_SIZE];

    // Build a buffer holding `sizes` fake allocations with canary records,
    // returning (buffer, used bytes, last record offset).
    fn build_chain(sizes: &[usize]) -> (Vec<u8>, usize, u64) {
        let mut buf = vec![0u8; 4096];
        let mut cursor = 0usize;
        let mut last = CANARY_NONE;
        for &size in sizes {
            let pad = pad_for(size);
            let record_off = cursor + size;
            // Safety: record fits in the buffer.
            unsafe {
                write_record(buf.as_mut_ptr().add(record_off), &PATTERN, pad, last);
            }
            last = record_off as u64;
            cursor += size + pad + CANARY_LINK_SIZE;
        }
        (buf, cursor, last)
    }

    #[test]
    fn test_pattern_has_no_zero_bytes() {
        let pattern = new_pattern();
        assert!(pattern.iter().all(|&b| b != 0));
    }

    #[test]
    fn test_patterns_differ_between_pools() {
        // 15 random non-zero bytes colliding is astronomically unlikely.
        assert_ne!(new_pattern(), new_pattern());
    }

    #[test]
    fn test_overhead_bounds_and_alignment() {
        for size in 0..64usize {
            let oh = overhead(size);
            assert!((CANARY_LINK_SIZE + 1..=CANARY_LINK_SIZE + ALIGN).contains(&oh));
            assert_eq!((size + oh) % ALIGN, 0, "size {size} not padded to 8");
        }
    }

    #[test]
    fn test_verify_empty_chain() {
        let buf = [0u8; 16];
        // Safety: Test code.
        let res = unsafe { verify_chain(buf.as_ptr(), 0, CANARY_NONE, &PATTERN) };
        assert_eq!(res, Ok(()));
    }

    #[test]
    fn test_verify_intact_chain() {
        let (buf, used, last) = build_chain(&[4, 8, 20, 1]);
        // Safety: Test code.
        let res = unsafe { verify_chain(buf.as_ptr(), used, last, &PATTERN) };
        assert_eq!(res, Ok(()));
    }

    #[test]
    fn test_detects_pattern_overwrite() {
        let (mut buf, used, last) = build_chain(&[4, 8]);
        // Clobber the first pattern byte of the first record (offset 4).
        buf[4] = 0x5A;
        // Safety: Test code.
        let res = unsafe { verify_chain(buf.as_ptr(), used, last, &PATTERN) };
        assert_eq!(res, Err(CanaryFault::PatternMismatch { offset: 4 }));
    }

    #[test]
    fn test_detects_out_of_range_link() {
        let (buf, used, _) = build_chain(&[4]);
        // Safety: Test code.
        let res = unsafe { verify_chain(buf.as_ptr(), used, used as u64 + 100, &PATTERN) };
        assert!(matches!(res, Err(CanaryFault::BadLink { .. })));
    }

    #[test]
    fn test_detects_non_decreasing_link() {
        let (mut buf, used, last) = build_chain(&[4, 8]);
        // Rewrite the second record's link to point at itself.
        let second = last as usize;
        let pad = pad_for(8);
        buf[second + pad..second + pad + CANARY_LINK_SIZE]
            .copy_from_slice(&last.to_le_bytes());
        // Safety: Test code.
        let res = unsafe { verify_chain(buf.as_ptr(), used, last, &PATTERN) };
        assert!(matches!(res, Err(CanaryFault::BadLink { .. })));
    }

    #[test]
    fn test_detects_missing_terminator() {
        let mut buf = vec![0u8; 64];
        // A record that is all pattern bytes with no terminator in range.
        for b in buf.iter_mut() {
            *b = 0xA5;
        }
        // Safety: Test code.
        let res = unsafe { verify_chain(buf.as_ptr(), 64, 0, &PATTERN) };
        assert_eq!(res, Err(CanaryFault::Unterminated { offset: 0 }));
    }
}
