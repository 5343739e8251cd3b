//! Narrow read-only views of the system the detector runs inside.
//!
//! The detector never reaches for globals. Everything it needs about the
//! board (heaps, loaded binaries, static data, the calling task) comes in
//! through these traits, bundled as [`Platform`].

use std::ops::RangeInclusive;

use crate::{Heap, MemRange, Pid};

/// Binary name that selects the kernel heap.
pub const KERNEL_NAME: &str = "kernel";

/// Registry slot of the common binary shared by all applications.
pub const COMMON_BINARY_INDEX: usize = 0;

/// Load layout of one binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryInfo {
    pub name: String,
    pub text_addr: usize,
    pub text_size: usize,
    pub data_addr: usize,
    pub data_size: usize,
    pub bss_addr: usize,
    pub bss_size: usize,
}

impl BinaryInfo {
    /// A registry slot counts as loaded once its text has an address.
    #[inline]
    pub fn is_loaded(&self) -> bool {
        self.text_addr != 0
    }

    #[inline]
    pub fn data_range(&self) -> MemRange {
        MemRange::new(self.data_addr, self.data_addr + self.data_size)
    }

    #[inline]
    pub fn bss_range(&self) -> MemRange {
        MemRange::new(self.bss_addr, self.bss_addr + self.bss_size)
    }
}

/// Stack placement of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskInfo {
    /// Highest address of the stack. Stacks grow down from here.
    pub stack_top: usize,
    pub stack_size: usize,
}

impl TaskInfo {
    /// Addresses the scanner must not read while this task is checking.
    ///
    /// Both ends are included: the word at `stack_top` is skipped too.
    pub fn stack_exclusion(&self) -> RangeInclusive<usize> {
        self.stack_top.saturating_sub(self.stack_size)..=self.stack_top
    }
}

/// Looks up heaps by binary name.
pub trait HeapResolver {
    fn kernel_heap(&self) -> &Heap;

    /// Heap of the loaded application `name`, if any.
    fn app_heap(&self, name: &str) -> Option<&Heap>;
}

/// Loaded binaries, with the common binary at [`COMMON_BINARY_INDEX`].
///
/// # Safety
/// Every data and bss range of a loaded binary must be readable for as long
/// as the registry is borrowed.
pub unsafe trait BinaryRegistry {
    fn binaries(&self) -> &[BinaryInfo];

    fn binary(&self, name: &str) -> Option<&BinaryInfo> {
        self.binaries().iter().find(|bin| bin.name == name)
    }
}

/// Kernel static variable regions (data and bss).
///
/// # Safety
/// Every returned range must be readable for as long as the map is borrowed.
pub unsafe trait MemoryMap {
    fn variable_regions(&self) -> Vec<MemRange>;
}

pub trait Scheduler {
    fn task_info(&self, pid: Pid) -> Option<TaskInfo>;
}

/// Everything a leak-check run consults.
pub trait Platform: HeapResolver + BinaryRegistry + MemoryMap + Scheduler {}

impl<T> Platform for T where
    T: HeapResolver + BinaryRegistry + MemoryMap + Scheduler + ?Sized
{
}
