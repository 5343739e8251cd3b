//! Region-based first-fit heap whose chunks carry [`AllocNode`] headers.
//!
//! Every region starts with a guard node of [`HEADER_SIZE`] bytes that is
//! permanently marked allocated, followed by the chunks, and ends with a
//! zero-sized trailing guard. The trailing guard's address is the region's
//! `end`, so walking `addr += size` from the leading guard lands exactly on
//! it. Allocation and free run under the heap lock; the lock is also handed
//! out to inspectors through [`Heap::lock`].

use std::{
    fmt, mem,
    ops::{Deref, DerefMut},
    ptr::NonNull,
    slice,
};

use log::warn;
use parking_lot::{Mutex, MutexGuard};

use crate::{
    ALLOC_BIT, AllocNode, HEADER_SIZE, NodePtr, NodeStatus, Owner,
    RegionCursor, system,
};

/// Chunk granularity. Chunk sizes and payload addresses are multiples of it.
pub const MM_ALIGN: usize = 16;

/// Smallest chunk worth splitting off: a header plus one granule.
pub const MIN_CHUNK: usize = HEADER_SIZE + MM_ALIGN;

/// Smallest region: both guards plus one minimal chunk.
pub const MIN_REGION_SIZE: usize = 2 * HEADER_SIZE + MIN_CHUNK;

/// Contiguous node range `[start, end)` of one heap region.
///
/// `start` is the leading guard node, `end` the trailing guard node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapRegion {
    start: usize,
    end: usize,
}

impl HeapRegion {
    #[inline]
    pub fn start(&self) -> usize {
        self.start
    }

    #[inline]
    pub fn end(&self) -> usize {
        self.end
    }

    /// Bytes covered by the region's chunks, leading guard included.
    #[inline]
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }

    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        (self.start..self.end).contains(&addr)
    }

    /// End of the region's memory, trailing guard included.
    #[inline]
    pub fn limit(&self) -> usize {
        self.end + HEADER_SIZE
    }
}

#[derive(Debug)]
struct Mapping {
    base: NonNull<u8>,
    len: usize,
}

/// An allocator-managed heap made of one or more regions.
pub struct Heap {
    name: String,
    regions: Vec<HeapRegion>,
    mappings: Vec<Mapping>,
    lock: Mutex<()>,
}

// SAFETY: node headers are only rewritten under `lock`, apart from the
// status byte which the allocator never reads.
unsafe impl Send for Heap {}
// SAFETY: see above
unsafe impl Sync for Heap {}

impl fmt::Debug for Heap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("name", &self.name)
            .field("regions", &self.regions)
            .finish_non_exhaustive()
    }
}

impl Heap {
    /// Maps one region per entry of `region_sizes` and formats each one.
    pub fn new(
        name: impl Into<String>,
        region_sizes: &[usize],
    ) -> Result<Self, &'static str> {
        if region_sizes.is_empty() {
            return Err("a heap needs at least one region");
        }
        if region_sizes
            .iter()
            .any(|&size| align_down(size, MM_ALIGN) < MIN_REGION_SIZE)
        {
            return Err("heap region too small");
        }

        let mut heap = Self {
            name: name.into(),
            regions: Vec::with_capacity(region_sizes.len()),
            mappings: Vec::with_capacity(region_sizes.len()),
            lock: Mutex::new(()),
        };

        for &size in region_sizes {
            let len = align_down(size, MM_ALIGN);
            // on failure `heap` drops and unmaps the regions mapped so far
            let base =
                system::map_memory(len).ok_or("failed to map heap region")?;
            heap.mappings.push(Mapping { base, len });
            // SAFETY: fresh mapping of `len` bytes, page aligned
            let region = unsafe { format_region(base, len) };
            heap.regions.push(region);
        }

        Ok(heap)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn regions(&self) -> &[HeapRegion] {
        &self.regions
    }

    /// Acquires the heap lock. Allocation and free block while it is held.
    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock()
    }

    /// Whether `addr` falls inside one of the heap's regions.
    pub fn contains(&self, addr: usize) -> bool {
        self.regions.iter().any(|region| region.contains(addr))
    }

    pub(crate) fn cursors(&self) -> impl Iterator<Item = RegionCursor<'_>> {
        self.regions
            .iter()
            .map(move |&region| RegionCursor::new(self, region))
    }

    /// Every node of every region in address order, guards excluded.
    ///
    /// Does not take the lock.
    pub fn nodes(&self) -> impl Iterator<Item = NodePtr<'_>> {
        self.cursors().flat_map(|cursor| cursor.skip(1))
    }

    /// Header of the allocation whose payload starts at `payload`.
    pub fn node_of(&self, payload: NonNull<u8>) -> Option<NodePtr<'_>> {
        let payload = payload.as_ptr() as usize;
        self.nodes().find(|node| node.payload() == payload)
    }

    /// First-fit allocation of `size` payload bytes.
    pub fn malloc(&self, size: usize, owner: Owner) -> Option<NonNull<u8>> {
        let needed = chunk_size(size)?;
        let _lock = self.lock.lock();

        for mut cursor in self.cursors() {
            // leading guard
            cursor.next();
            let found = cursor
                .find(|node| !node.is_allocated() && node.size() >= needed);
            if let Some(node) = found {
                claim(node, needed, owner);
                return NonNull::new(node.payload() as *mut u8);
            }
        }
        None
    }

    /// Returns an allocation to the heap, coalescing with free neighbours.
    ///
    /// # Safety
    /// `ptr` must come from [`Heap::malloc`] on this heap and must not have
    /// been freed already.
    pub unsafe fn free(&self, ptr: NonNull<u8>) {
        let addr = (ptr.as_ptr() as usize).wrapping_sub(HEADER_SIZE);
        let _lock = self.lock.lock();

        let Some(region) = self.regions.iter().find(|r| r.contains(addr))
        else {
            warn!("{}: free of foreign pointer {:p}", self.name, ptr);
            return;
        };

        // SAFETY: payload came from `malloc`, so its header precedes it
        let node: NodePtr<'_> = unsafe { NodePtr::from_addr(addr) };
        debug_assert!(node.is_allocated(), "double free at {:p}", ptr);
        node.set_allocated(false);
        node.set_status(NodeStatus::Used);

        // SAFETY: the successor of a region node is at worst the trailing guard
        let next: NodePtr<'_> =
            unsafe { NodePtr::from_addr(addr + node.size()) };
        if next.addr() < region.end && !next.is_allocated() {
            let merged = node.size() + next.size();
            node.set_size(merged);
            // SAFETY: as above
            unsafe { NodePtr::from_addr(addr + merged) }
                .set_preceding_size(merged);
        }

        let prev_addr = addr - node.preceding_size();
        if prev_addr != region.start {
            // SAFETY: preceding sizes of a consistent region point at headers
            let prev: NodePtr<'_> = unsafe { NodePtr::from_addr(prev_addr) };
            if !prev.is_allocated() {
                let merged = prev.size() + node.size();
                prev.set_size(merged);
                // SAFETY: as above
                unsafe { NodePtr::from_addr(prev_addr + merged) }
                    .set_preceding_size(merged);
            }
        }
    }

    /// Allocates `len` elements filled with `fill`, released on drop.
    pub fn allocate_buffer<T: Copy>(
        &self,
        len: usize,
        fill: T,
        owner: Owner,
    ) -> Option<HeapBuffer<'_, T>> {
        debug_assert!(mem::align_of::<T>() <= MM_ALIGN);
        let bytes = mem::size_of::<T>().checked_mul(len)?;
        let ptr = self.malloc(bytes, owner)?.cast::<T>();
        for idx in 0..len {
            // SAFETY: payload holds `len` elements and is MM_ALIGN aligned
            unsafe { ptr.as_ptr().add(idx).write(fill) };
        }
        Some(HeapBuffer {
            heap: self,
            ptr,
            len,
        })
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        for mapping in self.mappings.drain(..) {
            system::unmap_memory(mapping.base, mapping.len);
        }
    }
}

/// Writes the two guards and one free chunk spanning the rest.
///
/// # Safety
/// `base` must point at `len` writable bytes, aligned to `MM_ALIGN`, with
/// `len >= MIN_REGION_SIZE`.
unsafe fn format_region(base: NonNull<u8>, len: usize) -> HeapRegion {
    let start = base.as_ptr() as usize;
    let end = start + len - HEADER_SIZE;
    let free_size = len - 2 * HEADER_SIZE;

    // SAFETY: all three headers lie inside the mapping
    let (guard, first, tail): (NodePtr<'_>, NodePtr<'_>, NodePtr<'_>) = unsafe {
        (
            NodePtr::from_addr(start),
            NodePtr::from_addr(start + HEADER_SIZE),
            NodePtr::from_addr(end),
        )
    };
    guard.write(AllocNode::new(HEADER_SIZE, ALLOC_BIT, Owner::NONE));
    first.write(AllocNode::new(free_size, HEADER_SIZE, Owner::NONE));
    tail.write(AllocNode::new(0, free_size | ALLOC_BIT, Owner::NONE));

    HeapRegion { start, end }
}

/// Marks a free chunk allocated, splitting off the tail when it is large
/// enough to stand alone.
fn claim(node: NodePtr<'_>, needed: usize, owner: Owner) {
    let size = node.size();
    let preceding = node.preceding_size();
    let remainder = size - needed;

    if remainder >= MIN_CHUNK {
        // SAFETY: split point and successor lie inside the free chunk's region
        let (rest, after): (NodePtr<'_>, NodePtr<'_>) = unsafe {
            (
                NodePtr::from_addr(node.addr() + needed),
                NodePtr::from_addr(node.addr() + size),
            )
        };
        rest.write(AllocNode::new(remainder, needed, Owner::NONE));
        after.set_preceding_size(remainder);
        node.write(AllocNode::new(needed, preceding | ALLOC_BIT, owner));
    } else {
        node.write(AllocNode::new(size, preceding | ALLOC_BIT, owner));
    }
}

/// Chunk size for a payload of `size` bytes, header included.
#[inline]
fn chunk_size(size: usize) -> Option<usize> {
    let raw = size.max(1).checked_add(HEADER_SIZE)?;
    raw.checked_add(MM_ALIGN - 1).map(|v| v & !(MM_ALIGN - 1))
}

#[inline]
fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

/// Fixed-length array living in a [`Heap`] allocation.
pub struct HeapBuffer<'h, T: Copy> {
    heap: &'h Heap,
    ptr: NonNull<T>,
    len: usize,
}

impl<T: Copy> HeapBuffer<'_, T> {
    /// Payload address of the backing allocation.
    #[inline]
    pub fn payload(&self) -> usize {
        self.ptr.as_ptr() as usize
    }
}

impl<T: Copy> Deref for HeapBuffer<'_, T> {
    type Target = [T];
    fn deref(&self) -> &[T] {
        // SAFETY: `len` initialised elements owned by this buffer
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl<T: Copy> DerefMut for HeapBuffer<'_, T> {
    fn deref_mut(&mut self) -> &mut [T] {
        // SAFETY: `len` initialised elements owned by this buffer
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl<T: Copy> Drop for HeapBuffer<'_, T> {
    fn drop(&mut self) {
        // SAFETY: allocated by `allocate_buffer` on this heap, freed once
        unsafe { self.heap.free(self.ptr.cast()) };
    }
}

impl<T: Copy + fmt::Debug> fmt::Debug for HeapBuffer<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapBuffer")
            .field("heap", &self.heap.name)
            .field("payload", &format_args!("{:#x}", self.payload()))
            .field("len", &self.len)
            .finish()
    }
}
