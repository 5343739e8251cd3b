//! Leak-check orchestration.
//!
//! A run goes through four phases on one [`LeakDetector`]:
//!
//! 1. sizing: count allocated nodes without the lock and refuse the run
//!    before anything is allocated when the index would overflow,
//! 2. indexing: allocate the index from the kernel heap, then walk the
//!    target heap under its lock, stamping every node's status and
//!    indexing the allocated ones,
//! 3. scanning: look for payload pointers in every root range, lock free,
//! 4. reporting: read the statuses back under the lock.
//!
//! Only one run may be active per detector. The state lives in a single
//! atomic and a drop guard puts it back to idle however the run ends.

use std::{
    io::Write,
    sync::atomic::{AtomicU8, Ordering},
};

use log::{debug, error, info, warn};

use crate::{
    BinaryInfo, CheckError, CheckerSettings, HashIndex, Heap, HeapWalker, KERNEL_NAME,
    LeakReport, NodeClass, NodePtr, NodeStatus, NodeVisitor, Pid, Platform,
    ReferenceScanner,
};

#[cfg(feature = "common-binary")]
use crate::COMMON_BINARY_INDEX;

// ── Detector state ────────────────────────────────────────────────────

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorState {
    Idle = 0,
    Sizing = 1,
    Indexing = 2,
    Scanning = 3,
    Reporting = 4,
}

impl From<u8> for DetectorState {
    fn from(val: u8) -> Self {
        match val {
            1 => DetectorState::Sizing,
            2 => DetectorState::Indexing,
            3 => DetectorState::Scanning,
            4 => DetectorState::Reporting,
            _ => DetectorState::Idle,
        }
    }
}

/// Marks a run as active; returns the detector to idle when dropped.
#[derive(Debug)]
pub struct RunGuard<'d> {
    state: &'d AtomicU8,
}

impl RunGuard<'_> {
    #[inline]
    fn enter(&self, next: DetectorState) {
        debug!("leak check: {:?}", next);
        self.state.store(next as u8, Ordering::Release);
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.state.store(DetectorState::Idle as u8, Ordering::Release);
    }
}

/// Result of one run inside a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryReport {
    pub name: String,
    pub report: LeakReport,
}

/// Shared handle that runs leak checks one at a time.
#[derive(Debug)]
pub struct LeakDetector {
    settings: CheckerSettings,
    state: AtomicU8,
}

impl Default for LeakDetector {
    fn default() -> Self {
        Self::new(CheckerSettings::DEFAULT)
    }
}

impl LeakDetector {
    pub const fn new(settings: CheckerSettings) -> Self {
        Self {
            settings,
            state: AtomicU8::new(DetectorState::Idle as u8),
        }
    }

    pub fn settings(&self) -> &CheckerSettings {
        &self.settings
    }

    pub fn state(&self) -> DetectorState {
        DetectorState::from(self.state.load(Ordering::Acquire))
    }

    /// Claims the detector for one run.
    pub fn begin(&self) -> Result<RunGuard<'_>, CheckError> {
        self.state
            .compare_exchange(
                DetectorState::Idle as u8,
                DetectorState::Sizing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| CheckError::AlreadyRunning)?;
        debug!("leak check: {:?}", DetectorState::Sizing);
        Ok(RunGuard { state: &self.state })
    }

    /// Checks the heap of `name` (`"kernel"` or a loaded application) and
    /// writes the leak table to `out`.
    ///
    /// `caller` is the task running the check; its stack is not scanned.
    /// Failures are written to `out` as well as returned.
    pub fn run_leak_check<P, W>(
        &self,
        platform: &P,
        caller: Pid,
        name: &str,
        out: &mut W,
    ) -> Result<LeakReport, CheckError>
    where
        P: Platform + ?Sized,
        W: Write + ?Sized,
    {
        let result = self.check(platform, caller, name, out);
        if let Err(err) = &result {
            error!("leak check of {name} failed: {err}");
            if !matches!(err, CheckError::Output(_)) {
                if let Err(write_err) = writeln!(out, "{err}") {
                    warn!("leak check of {name}: could not write error: {write_err}");
                }
            }
        }
        result
    }

    /// Checks the kernel and then every loaded application, stopping at
    /// the first failure.
    pub fn run_all_leak_checks<P, W>(
        &self,
        platform: &P,
        caller: Pid,
        out: &mut W,
    ) -> Result<Vec<BinaryReport>, CheckError>
    where
        P: Platform + ?Sized,
        W: Write + ?Sized,
    {
        let mut reports = Vec::new();

        writeln!(out, "\nKernel :")?;
        let report = self.run_leak_check(platform, caller, KERNEL_NAME, out)?;
        reports.push(BinaryReport {
            name: KERNEL_NAME.to_owned(),
            report,
        });

        #[cfg(feature = "binary-separation")]
        {
            write_text_layout(platform.binaries(), out)?;

            // slot 0 is the common binary, which has no heap of its own
            for bin in platform.binaries().iter().skip(1) {
                if !bin.is_loaded() {
                    continue;
                }
                writeln!(out, "{} :", bin.name)?;
                let report = self.run_leak_check(platform, caller, &bin.name, out)?;
                reports.push(BinaryReport {
                    name: bin.name.clone(),
                    report,
                });
            }
        }

        Ok(reports)
    }

    fn check<P, W>(
        &self,
        platform: &P,
        caller: Pid,
        name: &str,
        out: &mut W,
    ) -> Result<LeakReport, CheckError>
    where
        P: Platform + ?Sized,
        W: Write + ?Sized,
    {
        let guard = self.begin()?;

        let heap = resolve_heap(platform, name)?;
        let binary = resolve_binary(platform, name)?;
        let task = platform
            .task_info(caller)
            .ok_or(CheckError::UnknownTask(caller))?;
        self.settings
            .validate()
            .map_err(CheckError::InvalidSettings)?;

        let census = HeapWalker::new(heap).census();
        debug!("{name}: {:?}", census);
        if census.allocated > self.settings.max_alloc_count {
            return Err(CheckError::CapacityExceeded {
                capacity: self.settings.max_alloc_count,
                required: census.allocated,
            });
        }

        guard.enter(DetectorState::Indexing);
        let kernel_heap = platform.kernel_heap();
        let mut ctx = DetectorContext::allocate(kernel_heap, &self.settings)?;
        ctx.populate(heap)?;
        debug!(
            "{name}: {} candidates, {} broken",
            ctx.index.len(),
            ctx.broken_count
        );

        guard.enter(DetectorState::Scanning);
        let mut scanner = ReferenceScanner::new(&mut ctx.index, task.stack_exclusion());
        for range in platform.variable_regions() {
            // SAFETY: `MemoryMap` guarantees the range is readable
            unsafe { scanner.scan_range(range) };
        }
        if let Some(bin) = binary {
            #[cfg(feature = "common-binary")]
            if let Some(common) = platform.binaries().get(COMMON_BINARY_INDEX) {
                // SAFETY: `BinaryRegistry` guarantees the ranges are readable
                unsafe {
                    scanner.scan_range(common.data_range());
                    scanner.scan_range(common.bss_range());
                }
            }
            // SAFETY: as above
            unsafe {
                scanner.scan_range(bin.data_range());
                scanner.scan_range(bin.bss_range());
            }
            scanner.scan_heap(kernel_heap);
        }
        scanner.scan_heap(heap);
        let leak_count = scanner.remaining();

        guard.enter(DetectorState::Reporting);
        let report = {
            let _lock = heap.lock();
            LeakReport::collect(HeapWalker::new(heap), leak_count, ctx.broken_count)
        };
        if report.leaks.len() != leak_count {
            warn!(
                "{name}: {} leak rows but {leak_count} counted, heap changed during the check",
                report.leaks.len()
            );
        }
        drop(ctx);

        write!(out, "{report}")?;
        info!(
            "{name}: {} leaks, {} broken",
            report.leak_count, report.broken_count
        );
        Ok(report)
    }
}

fn resolve_heap<'p, P>(platform: &'p P, name: &str) -> Result<&'p Heap, CheckError>
where
    P: Platform + ?Sized,
{
    if name == KERNEL_NAME {
        return Ok(platform.kernel_heap());
    }
    #[cfg(feature = "binary-separation")]
    if let Some(heap) = platform.app_heap(name) {
        return Ok(heap);
    }
    Err(CheckError::HeapNotFound(name.to_owned()))
}

/// Registry entry of the application being checked, `None` for the kernel.
fn resolve_binary<'p, P>(
    platform: &'p P,
    name: &str,
) -> Result<Option<&'p BinaryInfo>, CheckError>
where
    P: Platform + ?Sized,
{
    if name == KERNEL_NAME || cfg!(not(feature = "binary-separation")) {
        return Ok(None);
    }
    platform
        .binary(name)
        .map(Some)
        .ok_or_else(|| CheckError::BinaryNotFound(name.to_owned()))
}

#[cfg(feature = "binary-separation")]
fn write_text_layout<W: Write + ?Sized>(
    binaries: &[BinaryInfo],
    out: &mut W,
) -> std::io::Result<()> {
    writeln!(
        out,
        "\nBelow are text addresses of loadable apps (and common binary if enabled) :"
    )?;
    writeln!(
        out,
        "The pc value of the allocation can be obtained by subtracting the text start address of the appropriate binary\n"
    )?;
    for bin in binaries.iter().filter(|bin| bin.is_loaded()) {
        writeln!(
            out,
            "[{}] Text Addr : {:#x}, Text Size : {}",
            bin.name, bin.text_addr, bin.text_size
        )?;
    }
    writeln!(out)
}

// ── Per-run context ───────────────────────────────────────────────────

/// Everything one run owns. Dropping it releases the index buffers.
struct DetectorContext<'h> {
    index: HashIndex<'h>,
    broken_count: usize,
}

impl<'h> DetectorContext<'h> {
    fn allocate(kernel_heap: &'h Heap, settings: &CheckerSettings) -> Result<Self, CheckError> {
        Ok(Self {
            index: HashIndex::allocate(kernel_heap, settings)?,
            broken_count: 0,
        })
    }

    /// Stamps a status on every node of `heap` and indexes leak candidates.
    fn populate(&mut self, heap: &'h Heap) -> Result<(), CheckError> {
        let mut pass = PopulatePass {
            index: &mut self.index,
            broken: 0,
            overflow: None,
        };
        {
            let _lock = heap.lock();
            HeapWalker::new(heap).walk(&mut pass);
        }
        self.broken_count = pass.broken;
        match pass.overflow {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

struct PopulatePass<'a, 'h> {
    index: &'a mut HashIndex<'h>,
    broken: usize,
    overflow: Option<CheckError>,
}

impl<'h> NodeVisitor<'h> for PopulatePass<'_, 'h> {
    fn visit(&mut self, node: NodePtr<'h>, class: NodeClass) {
        match class {
            NodeClass::Broken => {
                node.set_status(NodeStatus::Broken);
                self.broken += 1;
            }
            NodeClass::Allocated
                if self.overflow.is_none() && !self.index.owns_payload(node.payload()) =>
            {
                node.set_status(NodeStatus::Leak);
                if let Err(err) = self.index.insert(node) {
                    node.set_status(NodeStatus::Used);
                    self.overflow = Some(err);
                }
            }
            NodeClass::Allocated | NodeClass::Free => node.set_status(NodeStatus::Used),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{panic, ptr::NonNull};

    use super::*;
    use crate::{HEADER_SIZE, sim::SimBoard};

    const KERNEL_REGIONS: &[usize] = &[64 * 1024, 32 * 1024];
    const APP_REGIONS: &[usize] = &[16 * 1024];
    const STACK_SIZE: usize = 1024;

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn board_with_app() -> (SimBoard, Pid) {
        init_logger();
        let mut board = SimBoard::new(KERNEL_REGIONS).unwrap();
        board.add_app("app", APP_REGIONS, 8).unwrap();
        let checker = board.spawn_task(STACK_SIZE).unwrap();
        (board, checker)
    }

    fn addr(ptr: NonNull<u8>) -> usize {
        ptr.as_ptr() as usize
    }

    fn run(
        detector: &LeakDetector,
        board: &SimBoard,
        caller: Pid,
        name: &str,
    ) -> (Result<LeakReport, CheckError>, String) {
        let mut out = Vec::new();
        let result = detector.run_leak_check(board, caller, name, &mut out);
        (result, String::from_utf8(out).unwrap())
    }

    fn statuses(heap: &Heap) -> Vec<NodeStatus> {
        heap.nodes().map(|node| node.status()).collect()
    }

    #[test]
    fn kernel_with_reachable_stacks_is_clean() {
        let (board, checker) = board_with_app();
        let detector = LeakDetector::default();

        let (result, text) = run(&detector, &board, checker, KERNEL_NAME);
        let report = result.unwrap();
        assert!(report.is_clean());
        assert_eq!(text, "*** NO MEMORY LEAK.\n");
        assert_eq!(detector.state(), DetectorState::Idle);
    }

    #[test]
    fn only_unreferenced_node_leaks() {
        let (mut board, checker) = board_with_app();
        let x = board.malloc("app", 48, 2).unwrap();
        let y = board.malloc("app", 48, 2).unwrap();
        let z = board.malloc("app", 48, -2).unwrap();
        board.globals_mut("app").unwrap()[0] = addr(x);
        unsafe { x.cast::<usize>().write(addr(y)) };

        let detector = LeakDetector::default();
        let (result, text) = run(&detector, &board, checker, "app");
        let report = result.unwrap();

        assert_eq!(report.leak_count, 1);
        assert_eq!(report.leaks.len(), 1);
        let leak = report.leaks[0];
        assert_eq!(leak.addr, addr(z));
        assert_eq!(leak.pid, 2);
        assert!(leak.size >= 48);
        assert!(text.ends_with("*** 1 LEAKS, 0 BROKENS.\n"));
        assert!(text.contains(&format!("{:#x}", addr(z))));
    }

    #[test]
    fn leak_count_is_allocated_minus_referenced() {
        let (mut board, checker) = board_with_app();
        let ptrs: Vec<_> = (0..10)
            .map(|i| board.malloc("app", 16 + i * 8, 4).unwrap())
            .collect();
        {
            let globals = board.globals_mut("app").unwrap();
            globals[0] = addr(ptrs[1]);
            globals[1] = addr(ptrs[3]);
            globals[2] = addr(ptrs[3]);
        }
        board.bss_mut("app").unwrap()[5] = addr(ptrs[8]);
        board.globals_mut(KERNEL_NAME).unwrap()[7] = addr(ptrs[9]);

        let detector = LeakDetector::default();
        let report = run(&detector, &board, checker, "app").0.unwrap();
        assert_eq!(report.leak_count, 10 - 4);
        assert_eq!(report.leaks.len(), 6);
        assert!(report.leaks.windows(2).all(|w| w[0].addr < w[1].addr));
    }

    #[test]
    fn references_from_kernel_heap_keep_app_nodes_alive() {
        let (mut board, checker) = board_with_app();
        let app_node = board.malloc("app", 32, 3).unwrap();
        let holder = board.malloc(KERNEL_NAME, 32, 3).unwrap();
        unsafe { holder.cast::<usize>().write(addr(app_node)) };
        board.globals_mut(KERNEL_NAME).unwrap()[0] = addr(holder);

        let detector = LeakDetector::default();
        let report = run(&detector, &board, checker, "app").0.unwrap();
        assert!(report.is_clean());
    }

    #[cfg(feature = "common-binary")]
    #[test]
    fn common_binary_data_is_a_root_for_apps() {
        let (mut board, checker) = board_with_app();
        let ptr = board.malloc("app", 32, 3).unwrap();
        board.globals_mut("common").unwrap()[2] = addr(ptr);

        let detector = LeakDetector::default();
        let report = run(&detector, &board, checker, "app").0.unwrap();
        assert!(report.is_clean());
    }

    #[test]
    fn checker_stack_is_not_a_root() {
        let (mut board, checker) = board_with_app();
        let other = board.spawn_task(STACK_SIZE).unwrap();
        let kept = board.malloc("app", 32, other).unwrap();
        let dropped = board.malloc("app", 32, checker).unwrap();
        board.stack_mut(other).unwrap()[10] = addr(kept);
        board.stack_mut(checker).unwrap()[10] = addr(dropped);

        let detector = LeakDetector::default();
        let report = run(&detector, &board, checker, "app").0.unwrap();
        assert_eq!(report.leak_count, 1);
        assert_eq!(report.leaks[0].addr, addr(dropped));
    }

    #[test]
    fn corrupted_link_gives_one_broken_row() {
        let (mut board, checker) = board_with_app();
        let ptrs: Vec<_> = (0..3).map(|_| board.malloc("app", 64, 5).unwrap()).collect();
        for (slot, &ptr) in ptrs.iter().enumerate() {
            board.globals_mut("app").unwrap()[slot] = addr(ptr);
        }
        let heap = board.app_heap("app").unwrap();
        let victim = heap.node_of(ptrs[1]).unwrap();
        unsafe { victim.poison_preceding(0x1230) };

        let detector = LeakDetector::default();
        let (result, text) = run(&detector, &board, checker, "app");
        let report = result.unwrap();

        assert_eq!(report.broken_count, 1);
        assert_eq!(report.broken, vec![victim.addr()]);
        assert_eq!(report.leak_count, 0);
        assert!(text.contains(&format!("BROKEN | {:#x}\n", victim.addr())));
        assert!(text.ends_with("*** 0 LEAKS, 1 BROKENS.\n"));
    }

    #[test]
    fn unusable_size_is_reported_broken() {
        let (mut board, checker) = board_with_app();
        let ptrs: Vec<_> = (0..4).map(|_| board.malloc("app", 48, 5).unwrap()).collect();
        board.globals_mut("app").unwrap()[0] = addr(ptrs[0]);
        let victim = board.app_heap("app").unwrap().node_of(ptrs[0]).unwrap();
        victim.set_size(81);

        let detector = LeakDetector::default();
        let (result, text) = run(&detector, &board, checker, "app");
        let report = result.unwrap();

        assert_eq!(report.broken_count, 1);
        assert_eq!(report.broken, vec![victim.addr()]);
        assert!(!report.is_clean());
        assert!(text.contains(&format!("BROKEN | {:#x}\n", victim.addr())));
        assert!(!text.contains("NO MEMORY LEAK"));
    }

    #[test]
    fn broken_node_is_never_a_leak() {
        let (board, checker) = board_with_app();
        let lost = board.malloc("app", 64, 5).unwrap();
        let heap = board.app_heap("app").unwrap();
        let node = heap.node_of(lost).unwrap();
        unsafe { node.poison_preceding(HEADER_SIZE * 3) };
        assert!(node.is_allocated());

        let detector = LeakDetector::default();
        let report = run(&detector, &board, checker, "app").0.unwrap();
        assert_eq!(report.leak_count, 0);
        assert!(report.leaks.is_empty());
        assert_eq!(report.broken_count, 1);
    }

    #[test]
    fn detector_buffers_are_excluded() {
        let (board, checker) = board_with_app();
        let detector = LeakDetector::default();

        let report = run(&detector, &board, checker, KERNEL_NAME).0.unwrap();
        assert!(report.leaks.is_empty());

        // buffers are gone again once the run is over
        let allocated = HeapWalker::new(board.kernel_heap()).census().allocated;
        assert_eq!(allocated, 1, "only the checker's stack remains");
    }

    #[test]
    fn repeated_runs_agree() {
        let (mut board, checker) = board_with_app();
        let keep = board.malloc("app", 40, 1).unwrap();
        board.malloc("app", 40, 1).unwrap();
        board.malloc(KERNEL_NAME, 40, 1).unwrap();
        board.globals_mut("app").unwrap()[3] = addr(keep);

        let detector = LeakDetector::default();
        for name in [KERNEL_NAME, "app"] {
            let (first, first_text) = run(&detector, &board, checker, name);
            let (second, second_text) = run(&detector, &board, checker, name);
            assert_eq!(first.unwrap(), second.unwrap());
            assert_eq!(first_text, second_text);
        }
    }

    #[test]
    fn over_capacity_heap_is_refused_untouched() {
        let (board, checker) = board_with_app();
        let settings = CheckerSettings {
            max_alloc_count: 4,
            ..CheckerSettings::DEFAULT
        };
        for _ in 0..5 {
            board.malloc("app", 32, 1).unwrap();
        }
        let heap = board.app_heap("app").unwrap();
        let before = statuses(heap);
        let kernel_before = HeapWalker::new(board.kernel_heap()).census();

        let detector = LeakDetector::new(settings);
        let (result, text) = run(&detector, &board, checker, "app");
        assert!(matches!(
            result,
            Err(CheckError::CapacityExceeded {
                capacity: 4,
                required: 5
            })
        ));
        assert!(text.contains("capacity is 4"));
        assert_eq!(statuses(heap), before);
        assert_eq!(HeapWalker::new(board.kernel_heap()).census(), kernel_before);
        assert_eq!(detector.state(), DetectorState::Idle);
    }

    #[test]
    fn second_run_is_rejected_while_active() {
        let (board, checker) = board_with_app();
        let detector = LeakDetector::default();

        let guard = detector.begin().unwrap();
        let (result, text) = run(&detector, &board, checker, KERNEL_NAME);
        assert!(matches!(result, Err(CheckError::AlreadyRunning)));
        assert!(text.contains("already running"));
        assert_eq!(detector.state(), DetectorState::Sizing);

        drop(guard);
        assert_eq!(detector.state(), DetectorState::Idle);
        assert!(run(&detector, &board, checker, KERNEL_NAME).0.is_ok());
    }

    #[test]
    fn lookup_failures_are_reported() {
        let (board, checker) = board_with_app();
        let detector = LeakDetector::default();

        let (result, text) = run(&detector, &board, checker, "nope");
        assert!(matches!(result, Err(CheckError::HeapNotFound(ref n)) if n == "nope"));
        assert!(text.contains("nope"));

        let (result, _) = run(&detector, &board, 99, KERNEL_NAME);
        assert!(matches!(result, Err(CheckError::UnknownTask(99))));

        let detector = LeakDetector::new(CheckerSettings {
            hash_size: 0,
            ..CheckerSettings::DEFAULT
        });
        let (result, _) = run(&detector, &board, checker, KERNEL_NAME);
        assert!(matches!(result, Err(CheckError::InvalidSettings(_))));
        assert_eq!(detector.state(), DetectorState::Idle);
    }

    struct ClosedSink;

    impl Write for ClosedSink {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::ErrorKind::BrokenPipe.into())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn failed_error_line_keeps_original_error() {
        let (board, checker) = board_with_app();
        let detector = LeakDetector::default();

        let result = detector.run_leak_check(&board, checker, "nope", &mut ClosedSink);
        assert!(matches!(result, Err(CheckError::HeapNotFound(ref n)) if n == "nope"));
        assert_eq!(detector.state(), DetectorState::Idle);
    }

    #[test]
    fn oversized_index_fails_allocation() {
        let (board, checker) = board_with_app();
        let detector = LeakDetector::new(CheckerSettings {
            max_alloc_count: 1 << 20,
            ..CheckerSettings::DEFAULT
        });
        let before = HeapWalker::new(board.kernel_heap()).census();

        let (result, _) = run(&detector, &board, checker, "app");
        assert!(matches!(result, Err(CheckError::AllocationFailed)));
        assert_eq!(HeapWalker::new(board.kernel_heap()).census(), before);
    }

    #[test]
    fn state_resets_after_panic() {
        let (board, checker) = board_with_app();
        let ptr = board.malloc("app", 32, 1).unwrap();
        board.app_heap("app").unwrap().node_of(ptr).unwrap().set_size(0);

        let detector = LeakDetector::default();
        let outcome = panic::catch_unwind(panic::AssertUnwindSafe(|| {
            run(&detector, &board, checker, "app")
        }));
        assert!(outcome.is_err());
        assert_eq!(detector.state(), DetectorState::Idle);
    }

    #[test]
    fn batch_covers_kernel_and_loaded_apps() {
        let (mut board, checker) = board_with_app();
        board.add_app("second", APP_REGIONS, 4).unwrap();
        board.malloc("second", 24, 7).unwrap();

        let detector = LeakDetector::default();
        let mut out = Vec::new();
        let reports = detector
            .run_all_leak_checks(&board, checker, &mut out)
            .unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(text.starts_with("\nKernel :\n"));
        #[cfg(feature = "binary-separation")]
        {
            let names: Vec<_> = reports.iter().map(|r| r.name.as_str()).collect();
            assert_eq!(names, vec![KERNEL_NAME, "app", "second"]);
            assert_eq!(reports[2].report.leak_count, 1);
            assert!(text.contains("[app] Text Addr : 0x"));
            assert!(text.contains("\nsecond :\n"));
            assert_eq!(
                text.contains("[common] Text Addr"),
                cfg!(feature = "common-binary")
            );
        }
        #[cfg(not(feature = "binary-separation"))]
        assert_eq!(reports.len(), 1);
    }

    #[cfg(feature = "binary-separation")]
    #[test]
    fn batch_stops_at_first_failing_binary() {
        let (mut board, checker) = board_with_app();
        board.add_app("second", APP_REGIONS, 4).unwrap();
        board.malloc("second", 24, 7).unwrap();
        for _ in 0..5 {
            board.malloc("app", 32, 1).unwrap();
        }

        let detector = LeakDetector::new(CheckerSettings {
            max_alloc_count: 4,
            ..CheckerSettings::DEFAULT
        });
        let mut out = Vec::new();
        let result = detector.run_all_leak_checks(&board, checker, &mut out);
        let text = String::from_utf8(out).unwrap();

        assert!(matches!(
            result,
            Err(CheckError::CapacityExceeded {
                capacity: 4,
                required: 5
            })
        ));
        assert!(text.contains("\napp :\n"));
        assert!(text.contains("capacity is 4"));
        assert!(!text.contains("second :"));
        assert_eq!(detector.state(), DetectorState::Idle);
    }
}
