//! Fixed-capacity hash index over the allocated nodes of one run.
//!
//! Both backing arrays are allocated from the kernel heap when a run starts
//! and released when it ends, so the index never grows while the target heap
//! is being inspected.

use log::trace;

use crate::{CheckError, CheckerSettings, Heap, HeapBuffer, NodePtr, NodeStatus, Owner};

/// End-of-chain marker for bucket heads and record links.
pub const NIL: u32 = u32::MAX;

/// One chain entry: a tracked node and the next record in its bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackingRecord {
    pub node: usize,
    pub next: u32,
}

impl TrackingRecord {
    pub const EMPTY: Self = Self { node: 0, next: NIL };
}

/// Chained hash table keyed by node address.
#[derive(Debug)]
pub struct HashIndex<'h> {
    buckets: HeapBuffer<'h, u32>,
    records: HeapBuffer<'h, TrackingRecord>,
    len: usize,
}

impl<'h> HashIndex<'h> {
    /// Allocates the bucket and record arrays from `kernel_heap`.
    ///
    /// Nothing stays allocated when either allocation fails.
    pub fn allocate(
        kernel_heap: &'h Heap,
        settings: &CheckerSettings,
    ) -> Result<Self, CheckError> {
        settings.validate().map_err(CheckError::InvalidSettings)?;

        let buckets = kernel_heap
            .allocate_buffer(settings.hash_size, NIL, Owner::NONE)
            .ok_or(CheckError::AllocationFailed)?;
        let records = kernel_heap
            .allocate_buffer(
                settings.max_alloc_count,
                TrackingRecord::EMPTY,
                Owner::NONE,
            )
            .ok_or(CheckError::AllocationFailed)?;

        trace!(
            "index: buckets at {:#x}, {} records at {:#x}",
            buckets.payload(),
            records.len(),
            records.payload()
        );
        Ok(Self {
            buckets,
            records,
            len: 0,
        })
    }

    #[inline]
    fn bucket_of(&self, addr: usize) -> usize {
        addr % self.buckets.len()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.records.len()
    }

    /// Whether `payload` is one of the index's own backing allocations.
    #[inline]
    pub fn owns_payload(&self, payload: usize) -> bool {
        payload == self.buckets.payload() || payload == self.records.payload()
    }

    /// Appends `node` to the tail of its bucket's chain.
    ///
    /// Duplicates are not detected.
    pub fn insert(&mut self, node: NodePtr<'h>) -> Result<(), CheckError> {
        if self.len == self.capacity() {
            return Err(CheckError::CapacityExceeded {
                capacity: self.capacity(),
                required: self.len + 1,
            });
        }

        let slot = self.len as u32;
        self.records[self.len] = TrackingRecord {
            node: node.addr(),
            next: NIL,
        };
        self.len += 1;

        let key = self.bucket_of(node.addr());
        let mut cur = self.buckets[key];
        if cur == NIL {
            self.buckets[key] = slot;
            return Ok(());
        }
        while self.records[cur as usize].next != NIL {
            cur = self.records[cur as usize].next;
        }
        self.records[cur as usize].next = slot;
        Ok(())
    }

    /// Marks the tracked node at `candidate` as referenced.
    ///
    /// Returns true only for the first confirmation of a node; untracked
    /// addresses and nodes already marked return false.
    pub fn find_and_mark_used(&mut self, candidate: usize) -> bool {
        let mut cur = self.buckets[self.bucket_of(candidate)];
        while cur != NIL {
            let record = self.records[cur as usize];
            if record.node == candidate {
                // SAFETY: only nodes of a heap borrowed for 'h are inserted
                let node: NodePtr<'h> = unsafe { NodePtr::from_addr(record.node) };
                if node.status() == NodeStatus::Used {
                    return false;
                }
                node.set_status(NodeStatus::Used);
                return true;
            }
            cur = record.next;
        }
        false
    }

    /// Tracked node addresses in insertion order.
    pub fn tracked(&self) -> impl Iterator<Item = usize> + '_ {
        self.records[..self.len].iter().map(|record| record.node)
    }
}
