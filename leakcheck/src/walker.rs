//! Address-ordered traversal of heap regions.
//!
//! One traversal serves every pass of a run. Passes differ only in the
//! [`NodeVisitor`] they hand to [`HeapWalker::walk`].

use std::{marker::PhantomData, mem};

use log::warn;

use crate::{AllocNode, Heap, HeapRegion, NodePtr};

/// Classification of one node by the link check and its alloc bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeClass {
    Allocated,
    Free,
    /// Recorded preceding size disagrees with the previous node's size.
    Broken,
}

/// Cursor over the nodes of one region, leading guard included.
///
/// All address arithmetic over allocator metadata goes through here: a node
/// is only handed out while its header lies inside the region's mapping.
#[derive(Debug)]
pub struct RegionCursor<'h> {
    region: HeapRegion,
    current: usize,
    _heap: PhantomData<&'h Heap>,
}

impl<'h> RegionCursor<'h> {
    pub(crate) fn new(_heap: &'h Heap, region: HeapRegion) -> Self {
        Self {
            region,
            current: region.start(),
            _heap: PhantomData,
        }
    }

    #[inline]
    pub fn region(&self) -> HeapRegion {
        self.region
    }

    #[inline]
    pub fn at_end(&self) -> bool {
        self.current >= self.region.end()
    }

    /// Node under the cursor.
    ///
    /// # Panics
    /// On a zero-sized node. The heap is corrupted and following its links
    /// any further could touch arbitrary memory.
    pub fn current(&self) -> Option<NodePtr<'h>> {
        if self.at_end() {
            return None;
        }
        // SAFETY: current < end, and the trailing guard occupies
        // [end, end + HEADER_SIZE), so the header is inside the mapping.
        // Alignment is maintained by `advance`.
        let node = unsafe { NodePtr::from_addr(self.current) };
        assert!(
            node.size() != 0,
            "heap corruption: zero-sized node at {:#x}",
            node.addr()
        );
        Some(node)
    }

    /// Moves to the next node using the current node's own size.
    ///
    /// Returns `false` when that size cannot lead to a header: the next
    /// address is misaligned, overflows, or lies past the region's trailing
    /// guard. The cursor then gives up on the rest of the region.
    pub fn advance(&mut self) -> bool {
        let Some(node) = self.current() else {
            return true;
        };
        match node.addr().checked_add(node.size()) {
            Some(next)
                if next.is_multiple_of(mem::align_of::<AllocNode>())
                    && next <= self.region.end() =>
            {
                self.current = next;
                true
            }
            _ => {
                warn!(
                    "heap walk: node at {:#x} has unusable size {:#x}, skipping rest of region",
                    node.addr(),
                    node.size()
                );
                self.current = self.region.end();
                false
            }
        }
    }
}

impl<'h> Iterator for RegionCursor<'h> {
    type Item = NodePtr<'h>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.current()?;
        let _ = self.advance();
        Some(node)
    }
}

/// Per-node action of one walker pass.
pub trait NodeVisitor<'h> {
    /// Called before the first node of each region.
    fn enter_region(&mut self, region: HeapRegion) {
        let _ = region;
    }

    fn visit(&mut self, node: NodePtr<'h>, class: NodeClass);
}

/// Walks every region of a heap, checking links and classifying nodes.
#[derive(Debug, Clone, Copy)]
pub struct HeapWalker<'h> {
    heap: &'h Heap,
}

impl<'h> HeapWalker<'h> {
    pub fn new(heap: &'h Heap) -> Self {
        Self { heap }
    }

    pub fn heap(&self) -> &'h Heap {
        self.heap
    }

    /// Visits every non-guard node in address order.
    ///
    /// A broken link does not stop the walk: the cursor still advances by the
    /// node's own size and the expected preceding size resynchronises to it.
    /// A node whose size leads nowhere is broken as well and ends its region.
    pub fn walk<V: NodeVisitor<'h> + ?Sized>(&self, visitor: &mut V) {
        for mut cursor in self.heap.cursors() {
            visitor.enter_region(cursor.region());

            // the leading guard is the link check's starting point
            let Some(guard) = cursor.next() else {
                continue;
            };
            let mut expected = guard.size();

            while let Some(node) = cursor.current() {
                let linked = cursor.advance();
                let class = if !linked || node.preceding_size() != expected {
                    NodeClass::Broken
                } else if node.is_allocated() {
                    NodeClass::Allocated
                } else {
                    NodeClass::Free
                };
                // resync on broken nodes too, so one bad header is one row
                expected = node.size();
                visitor.visit(node, class);
            }
        }
    }

    /// Read-only counting pass.
    pub fn census(&self) -> WalkCensus {
        let mut census = WalkCensus::default();
        self.walk(&mut census);
        census
    }
}

/// Node counts from a read-only pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WalkCensus {
    pub allocated: usize,
    pub free: usize,
    pub broken: usize,
    pub allocated_bytes: usize,
    pub free_bytes: usize,
}

impl NodeVisitor<'_> for WalkCensus {
    fn visit(&mut self, node: NodePtr<'_>, class: NodeClass) {
        match class {
            NodeClass::Allocated => {
                self.allocated += 1;
                self.allocated_bytes += node.size();
            }
            NodeClass::Free => {
                self.free += 1;
                self.free_bytes += node.size();
            }
            NodeClass::Broken => self.broken += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{HEADER_SIZE, Owner};

    const OWNER: Owner = Owner::new(0x4000_2000, 1);

    #[derive(Default)]
    struct Collect {
        regions: usize,
        nodes: Vec<(usize, NodeClass)>,
    }

    impl NodeVisitor<'_> for Collect {
        fn enter_region(&mut self, _region: HeapRegion) {
            self.regions += 1;
        }

        fn visit(&mut self, node: NodePtr<'_>, class: NodeClass) {
            self.nodes.push((node.addr(), class));
        }
    }

    #[test]
    fn classifies_allocated_and_free() {
        let heap = Heap::new("walk", &[4096]).unwrap();
        let a = heap.malloc(64, OWNER).unwrap();
        let b = heap.malloc(64, OWNER).unwrap();
        unsafe { heap.free(a) };

        let mut collect = Collect::default();
        HeapWalker::new(&heap).walk(&mut collect);

        let classes: Vec<_> = collect.nodes.iter().map(|(_, c)| *c).collect();
        assert_eq!(
            classes,
            vec![NodeClass::Free, NodeClass::Allocated, NodeClass::Free]
        );
        assert_eq!(collect.nodes[1].0, heap.node_of(b).unwrap().addr());
    }

    #[test]
    fn guard_nodes_are_not_visited() {
        let heap = Heap::new("walk", &[1024, 1024]).unwrap();
        let mut collect = Collect::default();
        HeapWalker::new(&heap).walk(&mut collect);

        assert_eq!(collect.regions, 2);
        assert_eq!(collect.nodes.len(), 2);
        for (region, (addr, _)) in heap.regions().iter().zip(&collect.nodes) {
            assert_eq!(*addr, region.start() + HEADER_SIZE);
        }
    }

    #[test]
    fn corrupted_link_is_broken_and_walk_continues() {
        let heap = Heap::new("walk", &[4096]).unwrap();
        let ptrs: Vec<_> =
            (0..4).map(|_| heap.malloc(48, OWNER).unwrap()).collect();
        let victim = heap.node_of(ptrs[1]).unwrap();
        unsafe { victim.poison_preceding(0x7770) };

        let census = HeapWalker::new(&heap).census();
        assert_eq!(census.broken, 1, "only the poisoned node is broken");
        assert_eq!(census.allocated, 3);
        assert_eq!(census.free, 1);
    }

    #[test]
    fn broken_allocated_node_is_not_counted_as_allocated() {
        let heap = Heap::new("walk", &[4096]).unwrap();
        let a = heap.malloc(48, OWNER).unwrap();
        let node = heap.node_of(a).unwrap();
        assert!(node.is_allocated());
        unsafe { node.poison_preceding(HEADER_SIZE + 16) };

        let census = HeapWalker::new(&heap).census();
        assert_eq!(census.allocated, 0);
        assert_eq!(census.broken, 1);
    }

    #[test]
    fn census_accounts_every_byte() {
        let heap = Heap::new("walk", &[4096]).unwrap();
        for size in [10, 200, 64] {
            heap.malloc(size, OWNER).unwrap();
        }
        let census = HeapWalker::new(&heap).census();
        let region = heap.regions()[0];
        assert_eq!(
            census.allocated_bytes + census.free_bytes + HEADER_SIZE,
            region.len()
        );
    }

    #[test]
    #[should_panic(expected = "zero-sized node")]
    fn zero_sized_node_is_fatal() {
        let heap = Heap::new("walk", &[4096]).unwrap();
        let a = heap.malloc(48, OWNER).unwrap();
        heap.node_of(a).unwrap().set_size(0);
        HeapWalker::new(&heap).census();
    }

    #[test]
    fn misaligned_size_is_broken_and_ends_region() {
        let heap = Heap::new("walk", &[4096, 1024]).unwrap();
        let a = heap.malloc(48, OWNER).unwrap();
        heap.malloc(48, OWNER).unwrap();
        let node = heap.node_of(a).unwrap();
        node.set_size(81);

        let mut collect = Collect::default();
        HeapWalker::new(&heap).walk(&mut collect);
        assert_eq!(
            collect.nodes,
            vec![
                (node.addr(), NodeClass::Broken),
                (heap.regions()[1].start() + HEADER_SIZE, NodeClass::Free),
            ]
        );
    }

    #[test]
    fn size_past_region_end_is_broken() {
        let heap = Heap::new("walk", &[4096]).unwrap();
        let a = heap.malloc(48, OWNER).unwrap();
        let node = heap.node_of(a).unwrap();
        node.set_size(8192);

        let census = HeapWalker::new(&heap).census();
        assert_eq!(census.broken, 1);
        assert_eq!(census.allocated, 0);
        assert_eq!(census.free, 0);
    }
}
