use std::fmt;

use crate::{HEADER_SIZE, HeapWalker, NodeClass, NodePtr, NodeStatus, NodeVisitor};

const TABLE_HEADER: &str = "Type   |    Addr    | Size(byte) |    Owner   | PID ";
const TABLE_RULE: &str = "---------------------------------------------------";

/// One unreferenced allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeakEntry {
    /// Payload address as seen by the allocation's user.
    pub addr: usize,
    /// Payload size, header excluded.
    pub size: usize,
    /// Return address of the allocating call.
    pub owner: usize,
    pub pid: u32,
}

impl LeakEntry {
    fn from_node(node: NodePtr<'_>) -> Self {
        let owner = node.owner();
        Self {
            addr: node.payload(),
            size: node.size().saturating_sub(HEADER_SIZE),
            owner: owner.call_addr,
            pid: owner.display_pid(),
        }
    }
}

/// Outcome of one leak-check run over one heap.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeakReport {
    /// Leaked allocations in address order.
    pub leaks: Vec<LeakEntry>,
    /// Header addresses of nodes with a broken link, in address order.
    pub broken: Vec<usize>,
    pub leak_count: usize,
    pub broken_count: usize,
}

impl LeakReport {
    /// Reads back the statuses left by a run.
    ///
    /// The caller must hold the heap lock.
    pub fn collect(walker: HeapWalker<'_>, leak_count: usize, broken_count: usize) -> Self {
        let mut report = Self {
            leak_count,
            broken_count,
            ..Self::default()
        };
        walker.walk(&mut report);
        report
    }

    #[inline]
    pub fn is_clean(&self) -> bool {
        self.leak_count == 0 && self.broken_count == 0
    }
}

impl NodeVisitor<'_> for LeakReport {
    fn visit(&mut self, node: NodePtr<'_>, _class: NodeClass) {
        match node.status() {
            NodeStatus::Leak => self.leaks.push(LeakEntry::from_node(node)),
            NodeStatus::Broken => self.broken.push(node.addr()),
            NodeStatus::Used => {}
        }
    }
}

impl fmt::Display for LeakEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "LEAK   | {:>10} |  {:>8}  | {:>10} | {}",
            format!("{:#x}", self.addr),
            self.size,
            format!("{:#x}", self.owner),
            self.pid
        )
    }
}

impl fmt::Display for LeakReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_clean() {
            return writeln!(f, "*** NO MEMORY LEAK.");
        }

        writeln!(f, "{TABLE_HEADER}")?;
        writeln!(f, "{TABLE_RULE}")?;

        // merge both lists back into address order
        let mut leaks = self.leaks.iter().peekable();
        let mut broken = self.broken.iter().peekable();
        loop {
            let take_leak = match (leaks.peek(), broken.peek()) {
                (Some(leak), Some(&&node)) => leak.addr < node,
                (Some(_), None) => true,
                (None, Some(_)) => false,
                (None, None) => break,
            };
            if take_leak {
                if let Some(leak) = leaks.next() {
                    writeln!(f, "{leak}")?;
                }
            } else if let Some(node) = broken.next() {
                writeln!(f, "BROKEN | {node:#x}")?;
            }
        }

        writeln!(
            f,
            "*** {} LEAKS, {} BROKENS.",
            self.leak_count, self.broken_count
        )
    }
}
