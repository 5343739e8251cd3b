//! A simulated board for running the detector off target.
//!
//! The board owns a kernel heap, one heap per loaded application, static
//! data and bss for the kernel and every binary, and a task table in kernel
//! bss that keeps each task's heap-resident stack reachable, the way a real
//! scheduler's TCB list does.

use std::{ptr::NonNull, slice};

use crate::{
    BinaryInfo, BinaryRegistry, COMMON_BINARY_INDEX, HeapResolver, Heap, KERNEL_NAME,
    MemRange, MemoryMap, Owner, Pid, Scheduler, TaskInfo, WORD_SIZE,
};

/// Fake text base used as the call address of kernel allocations.
pub const KERNEL_TEXT_BASE: usize = 0x0400_0000;

const KERNEL_DATA_WORDS: usize = 32;
const TASK_TABLE_WORDS: usize = 32;
const TEXT_SIZE: usize = 0x400;
const COMMON_NAME: &str = "common";
const COMMON_DATA_WORDS: usize = 8;

/// Backing memory of one binary's sections.
#[derive(Debug)]
struct Image {
    // kept alive for the text address it provides
    _text: Box<[u8]>,
    data: Box<[usize]>,
    bss: Box<[usize]>,
}

impl Image {
    fn new(name: &str, loaded: bool, data_words: usize) -> (BinaryInfo, Self) {
        let text = vec![0u8; if loaded { TEXT_SIZE } else { 0 }].into_boxed_slice();
        let data = vec![0usize; data_words].into_boxed_slice();
        let bss = vec![0usize; data_words].into_boxed_slice();
        let data_range = MemRange::from_slice(&data);
        let bss_range = MemRange::from_slice(&bss);
        let info = BinaryInfo {
            name: name.to_owned(),
            text_addr: if loaded { text.as_ptr() as usize } else { 0 },
            text_size: text.len(),
            data_addr: data_range.start,
            data_size: data_range.len(),
            bss_addr: bss_range.start,
            bss_size: bss_range.len(),
        };
        (
            info,
            Self {
                _text: text,
                data,
                bss,
            },
        )
    }
}

#[derive(Debug)]
struct SimTask {
    pid: Pid,
    stack: NonNull<u8>,
    stack_size: usize,
}

/// Board with a kernel, a common binary slot and loadable applications.
#[derive(Debug)]
pub struct SimBoard {
    kernel_heap: Heap,
    kernel_data: Box<[usize]>,
    /// Task table: stack payload address per slot.
    kernel_bss: Box<[usize]>,
    binaries: Vec<BinaryInfo>,
    images: Vec<Image>,
    /// Parallel to `binaries`; the common binary has no heap.
    heaps: Vec<Option<Heap>>,
    tasks: Vec<SimTask>,
    next_pid: Pid,
}

impl SimBoard {
    /// Board with a kernel heap made of `kernel_regions` and no apps.
    ///
    /// The common binary occupies registry slot 0 and counts as loaded only
    /// when common-binary support is compiled in.
    pub fn new(kernel_regions: &[usize]) -> Result<Self, &'static str> {
        let kernel_heap = Heap::new(KERNEL_NAME, kernel_regions)?;
        let (common, image) = Image::new(
            COMMON_NAME,
            cfg!(feature = "common-binary"),
            COMMON_DATA_WORDS,
        );
        debug_assert_eq!(COMMON_BINARY_INDEX, 0);

        Ok(Self {
            kernel_heap,
            kernel_data: vec![0; KERNEL_DATA_WORDS].into_boxed_slice(),
            kernel_bss: vec![0; TASK_TABLE_WORDS].into_boxed_slice(),
            binaries: vec![common],
            images: vec![image],
            heaps: vec![None],
            tasks: Vec::new(),
            next_pid: 1,
        })
    }

    /// Loads an application with its own heap and `global_words` words each
    /// of data and bss.
    pub fn add_app(
        &mut self,
        name: &str,
        heap_regions: &[usize],
        global_words: usize,
    ) -> Result<(), &'static str> {
        if name == KERNEL_NAME || self.binary(name).is_some() {
            return Err("binary name already taken");
        }
        let heap = Heap::new(name, heap_regions)?;
        let (info, image) = Image::new(name, true, global_words);
        self.binaries.push(info);
        self.images.push(image);
        self.heaps.push(Some(heap));
        Ok(())
    }

    /// Creates a task whose stack is allocated from the kernel heap.
    ///
    /// The stack is attributed to the task with a negative pid.
    pub fn spawn_task(&mut self, stack_size: usize) -> Result<Pid, &'static str> {
        let slot = self.tasks.len();
        if slot == self.kernel_bss.len() {
            return Err("task table full");
        }
        let pid = self.next_pid;
        let stack = self
            .kernel_heap
            .malloc(stack_size, Owner::new(KERNEL_TEXT_BASE + 0x80, -pid))
            .ok_or("kernel heap exhausted")?;

        self.kernel_bss[slot] = stack.as_ptr() as usize;
        self.tasks.push(SimTask {
            pid,
            stack,
            stack_size,
        });
        self.next_pid += 1;
        Ok(pid)
    }

    pub fn kernel_heap(&self) -> &Heap {
        &self.kernel_heap
    }

    pub fn app_heap(&self, name: &str) -> Option<&Heap> {
        let idx = self.binaries.iter().position(|bin| bin.name == name)?;
        self.heaps[idx].as_ref()
    }

    /// Allocates from the heap of `name` on behalf of `pid`.
    ///
    /// The call address is an offset into the binary's text.
    pub fn malloc(&self, name: &str, size: usize, pid: Pid) -> Option<NonNull<u8>> {
        if name == KERNEL_NAME {
            let owner = Owner::new(KERNEL_TEXT_BASE + 0x100, pid);
            return self.kernel_heap.malloc(size, owner);
        }
        let idx = self.binaries.iter().position(|bin| bin.name == name)?;
        let owner = Owner::new(self.binaries[idx].text_addr + 0x40, pid);
        self.heaps[idx].as_ref()?.malloc(size, owner)
    }

    /// Initialised data of `name`: the kernel, the common binary or an app.
    pub fn globals_mut(&mut self, name: &str) -> Option<&mut [usize]> {
        if name == KERNEL_NAME {
            return Some(&mut self.kernel_data[..]);
        }
        let idx = self.binaries.iter().position(|bin| bin.name == name)?;
        Some(&mut self.images[idx].data[..])
    }

    /// Zero-initialised data of an app or the common binary.
    pub fn bss_mut(&mut self, name: &str) -> Option<&mut [usize]> {
        let idx = self.binaries.iter().position(|bin| bin.name == name)?;
        Some(&mut self.images[idx].bss[..])
    }

    /// Stack memory of a task, viewed as words.
    pub fn stack_mut(&mut self, pid: Pid) -> Option<&mut [usize]> {
        let task = self.tasks.iter().find(|task| task.pid == pid)?;
        // SAFETY: the stack is a live kernel-heap allocation of `stack_size`
        // bytes, MM_ALIGN aligned, and `&mut self` makes this view unique.
        Some(unsafe {
            slice::from_raw_parts_mut(
                task.stack.as_ptr().cast::<usize>(),
                task.stack_size / WORD_SIZE,
            )
        })
    }
}

impl HeapResolver for SimBoard {
    fn kernel_heap(&self) -> &Heap {
        SimBoard::kernel_heap(self)
    }

    fn app_heap(&self, name: &str) -> Option<&Heap> {
        SimBoard::app_heap(self, name)
    }
}

// SAFETY: every data and bss range points into a boxed slice owned by the
// board, which lives at least as long as the borrow.
unsafe impl BinaryRegistry for SimBoard {
    fn binaries(&self) -> &[BinaryInfo] {
        &self.binaries
    }
}

// SAFETY: both ranges are boxed slices owned by the board.
unsafe impl MemoryMap for SimBoard {
    fn variable_regions(&self) -> Vec<MemRange> {
        vec![
            MemRange::from_slice(&self.kernel_data),
            MemRange::from_slice(&self.kernel_bss),
        ]
    }
}

impl Scheduler for SimBoard {
    fn task_info(&self, pid: Pid) -> Option<TaskInfo> {
        self.tasks.iter().find(|task| task.pid == pid).map(|task| TaskInfo {
            stack_top: task.stack.as_ptr() as usize + task.stack_size,
            stack_size: task.stack_size,
        })
    }
}
