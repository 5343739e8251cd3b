//! In-place view of allocator node headers.
//!
//! Every chunk in a heap region starts with an [`AllocNode`] header. The
//! detector never owns these headers; it reads them where the allocator put
//! them and writes exactly one field, the `reserved` status byte, through
//! [`NodePtr::set_status`].

use std::{
    marker::PhantomData,
    mem,
    ptr::{self, NonNull, addr_of, addr_of_mut},
};

/// Flag packed into the top bit of `preceding`: the node is allocated.
pub const ALLOC_BIT: usize = 1 << (usize::BITS - 1);

/// Size of a node header. Payload pointers point this far past the header.
pub const HEADER_SIZE: usize = mem::size_of::<AllocNode>();

/// Width of one probed value during reference scanning.
pub const WORD_SIZE: usize = mem::size_of::<usize>();

pub type Pid = i32;

/// Detector-owned scratch status stored in each node header.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Used = 0,
    Leak = 1,
    Broken = 2,
}

impl From<u8> for NodeStatus {
    fn from(val: u8) -> Self {
        match val {
            1 => NodeStatus::Leak,
            2 => NodeStatus::Broken,
            _ => NodeStatus::Used,
        }
    }
}

/// Header layout shared by allocated and free chunks.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct AllocNode {
    /// Total chunk size including this header.
    pub size: usize,
    /// Size of the preceding chunk, or'ed with [`ALLOC_BIT`] when this chunk is allocated.
    pub preceding: usize,
    /// Return address of the allocating call.
    pub call_addr: usize,
    /// Owning task. Negative for chunks attributed to a stack frame.
    pub pid: Pid,
    pub reserved: u8,
    _pad: [u8; 3],
}

impl AllocNode {
    pub const fn new(size: usize, preceding: usize, owner: Owner) -> Self {
        Self {
            size,
            preceding,
            call_addr: owner.call_addr,
            pid: owner.pid,
            reserved: NodeStatus::Used as u8,
            _pad: [0; 3],
        }
    }
}

/// Provenance recorded by the allocator at allocation time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Owner {
    pub call_addr: usize,
    pub pid: Pid,
}

impl Owner {
    pub const NONE: Owner = Owner {
        call_addr: 0,
        pid: 0,
    };

    pub const fn new(call_addr: usize, pid: Pid) -> Self {
        Self { call_addr, pid }
    }

    /// PID with stack-frame attribution folded back to the task's id.
    #[inline]
    pub fn display_pid(&self) -> u32 {
        self.pid.unsigned_abs()
    }
}

/// Pointer to a node header inside a heap that outlives `'h`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodePtr<'h> {
    ptr: NonNull<AllocNode>,
    _heap: PhantomData<&'h ()>,
}

impl<'h> NodePtr<'h> {
    /// # Safety
    /// `addr` must be non-null, aligned for [`AllocNode`] and point at
    /// [`HEADER_SIZE`] readable and writable bytes that stay mapped for `'h`.
    #[inline]
    pub unsafe fn from_addr(addr: usize) -> Self {
        debug_assert!(addr.is_multiple_of(mem::align_of::<AllocNode>()));
        Self {
            // SAFETY: non-null by contract
            ptr: unsafe { NonNull::new_unchecked(addr as *mut AllocNode) },
            _heap: PhantomData,
        }
    }

    #[inline]
    pub fn addr(self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// Address handed out to the allocation's user.
    #[inline]
    pub fn payload(self) -> usize {
        self.addr() + HEADER_SIZE
    }

    #[inline]
    pub fn size(self) -> usize {
        // SAFETY: header is valid for 'h (constructor contract)
        unsafe { ptr::read_volatile(addr_of!((*self.ptr.as_ptr()).size)) }
    }

    #[inline]
    fn preceding(self) -> usize {
        // SAFETY: header is valid for 'h
        unsafe { ptr::read_volatile(addr_of!((*self.ptr.as_ptr()).preceding)) }
    }

    /// Recorded size of the previous chunk, alloc bit stripped.
    #[inline]
    pub fn preceding_size(self) -> usize {
        self.preceding() & !ALLOC_BIT
    }

    #[inline]
    pub fn is_allocated(self) -> bool {
        self.preceding() & ALLOC_BIT != 0
    }

    pub fn owner(self) -> Owner {
        let raw = self.ptr.as_ptr();
        // SAFETY: header is valid for 'h
        unsafe {
            Owner {
                call_addr: ptr::read_volatile(addr_of!((*raw).call_addr)),
                pid: ptr::read_volatile(addr_of!((*raw).pid)),
            }
        }
    }

    #[inline]
    pub fn status(self) -> NodeStatus {
        // SAFETY: header is valid for 'h
        let raw = unsafe {
            ptr::read_volatile(addr_of!((*self.ptr.as_ptr()).reserved))
        };
        NodeStatus::from(raw)
    }

    /// Writes the scratch status byte.
    ///
    /// This is the only allocator-owned field the detector may modify. The
    /// allocator ignores it, so writing it never changes heap behaviour.
    #[inline]
    pub fn set_status(self, status: NodeStatus) {
        // SAFETY: header is valid and writable for 'h
        unsafe {
            ptr::write_volatile(
                addr_of_mut!((*self.ptr.as_ptr()).reserved),
                status as u8,
            )
        }
    }

    /// Overwrites the recorded preceding size, keeping the alloc bit.
    ///
    /// Fault injection for exercising broken-link detection.
    ///
    /// # Safety
    /// The owning heap's link invariant no longer holds afterwards; the heap
    /// must not be allocated from or freed into again.
    pub unsafe fn poison_preceding(self, size: usize) {
        self.set_preceding_size(size);
    }

    // ── allocator-side mutation ───────────────────────────────────────

    pub(crate) fn write(self, node: AllocNode) {
        // SAFETY: header is valid and writable for 'h
        unsafe { ptr::write_volatile(self.ptr.as_ptr(), node) }
    }

    pub(crate) fn set_size(self, size: usize) {
        // SAFETY: header is valid and writable for 'h
        unsafe {
            ptr::write_volatile(addr_of_mut!((*self.ptr.as_ptr()).size), size)
        }
    }

    pub(crate) fn set_preceding_size(self, size: usize) {
        let alloc = self.preceding() & ALLOC_BIT;
        // SAFETY: header is valid and writable for 'h
        unsafe {
            ptr::write_volatile(
                addr_of_mut!((*self.ptr.as_ptr()).preceding),
                (size & !ALLOC_BIT) | alloc,
            )
        }
    }

    pub(crate) fn set_allocated(self, allocated: bool) {
        let size = self.preceding_size();
        let bits = if allocated { size | ALLOC_BIT } else { size };
        // SAFETY: header is valid and writable for 'h
        unsafe {
            ptr::write_volatile(addr_of_mut!((*self.ptr.as_ptr()).preceding), bits)
        }
    }
}
