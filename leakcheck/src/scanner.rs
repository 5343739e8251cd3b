//! Conservative reference scanning.
//!
//! Any word-sized value at any byte offset of a root range is treated as a
//! potential payload pointer. A value that lands exactly on the payload of a
//! tracked node marks that node referenced.

use std::{mem, ops::RangeInclusive, ptr};

use log::trace;

use crate::{HEADER_SIZE, HashIndex, Heap, WORD_SIZE};

/// Byte range `[start, end)` of readable memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemRange {
    pub start: usize,
    pub end: usize,
}

impl MemRange {
    #[inline]
    pub const fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// Range covering the bytes of `slice`.
    pub fn from_slice<T>(slice: &[T]) -> Self {
        let start = slice.as_ptr() as usize;
        Self::new(start, start + mem::size_of_val(slice))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Reads the word starting `offset` bytes into `range`, at any alignment.
///
/// Returns `None` when the word would extend past the end of the range.
///
/// # Safety
/// `range` must be readable.
#[inline]
pub unsafe fn probe_word_as_pointer(range: MemRange, offset: usize) -> Option<usize> {
    let end = offset.checked_add(WORD_SIZE)?;
    if end > range.len() {
        return None;
    }
    let src = (range.start + offset) as *const usize;
    // SAFETY: the whole word lies inside `range`, readable by contract
    Some(unsafe { ptr::read_unaligned(src) })
}

/// Confirms tracked nodes that are still pointed at from scanned memory.
///
/// Starts with every tracked node counted as a leak; each first-time
/// confirmation takes one off the count.
#[derive(Debug)]
pub struct ReferenceScanner<'a, 'h> {
    index: &'a mut HashIndex<'h>,
    /// Checking task's stack, skipped while scanning heaps.
    exclude: RangeInclusive<usize>,
    remaining: usize,
}

impl<'a, 'h> ReferenceScanner<'a, 'h> {
    pub fn new(index: &'a mut HashIndex<'h>, exclude: RangeInclusive<usize>) -> Self {
        let remaining = index.len();
        Self {
            index,
            exclude,
            remaining,
        }
    }

    /// Tracked nodes not confirmed so far.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    /// Scans a static root range.
    ///
    /// # Safety
    /// `range` must be readable for the duration of the call.
    pub unsafe fn scan_range(&mut self, range: MemRange) {
        trace!("scan: [{:#x}, {:#x})", range.start, range.end);
        // SAFETY: forwarded contract
        unsafe { self.scan_words(range, false) };
    }

    /// Scans every allocated node of `heap`, broken or not.
    ///
    /// Runs without the heap lock, so the result is a best-effort snapshot
    /// when other tasks keep allocating. The detector's own index buffers
    /// and the checking task's stack are skipped.
    pub fn scan_heap(&mut self, heap: &Heap) {
        trace!("scan: heap {}", heap.name());
        for mut cursor in heap.cursors() {
            let region = cursor.region();
            // leading guard
            cursor.next();

            for node in cursor {
                if self.remaining == 0 {
                    return;
                }
                if !node.is_allocated() || self.index.owns_payload(node.payload()) {
                    continue;
                }
                let end = node.addr().saturating_add(node.size()).min(region.end());
                // SAFETY: clamped to the region, whose mapping `heap` keeps alive
                unsafe { self.scan_words(MemRange::new(node.addr(), end), true) };
            }
        }
    }

    /// # Safety
    /// `range` must be readable.
    unsafe fn scan_words(&mut self, range: MemRange, skip_stack: bool) {
        let Some(last) = range.len().checked_sub(WORD_SIZE) else {
            return;
        };
        for offset in 0..=last {
            if self.remaining == 0 {
                return;
            }
            if skip_stack && self.exclude.contains(&(range.start + offset)) {
                continue;
            }
            // SAFETY: readable by contract, bounds checked by the probe
            let Some(word) = (unsafe { probe_word_as_pointer(range, offset) }) else {
                break;
            };
            if self.index.find_and_mark_used(word.wrapping_sub(HEADER_SIZE)) {
                self.remaining -= 1;
            }
        }
    }
}
