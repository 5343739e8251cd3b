use clap::Parser as ClapParser;
use std::{
    io::{self, Write},
    process,
    ptr::NonNull,
};

use leakcheck::{
    CheckError, CheckerSettings, DEFAULT_HASH_SIZE, DEFAULT_MAX_ALLOC_COUNT, KERNEL_NAME,
    LeakDetector, Pid, sim::SimBoard,
};

const KERNEL_REGIONS: &[usize] = &[256 * 1024, 64 * 1024];
const APP_REGIONS: &[usize] = &[64 * 1024];
const CHECKER_STACK_SIZE: usize = 4096;
const KERNEL_ALLOCS: usize = 8;

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Binary to check; every loaded binary when omitted
    #[arg(long, help = "Check only this binary (\"kernel\" or an app name)")]
    bin: Option<String>,

    #[arg(long, default_value_t = 2, help = "Number of simulated applications")]
    apps: usize,

    #[arg(long, default_value_t = 16, help = "Allocations made by each application")]
    allocs: usize,

    #[arg(long, default_value_t = 3, help = "Allocations per application left unreferenced")]
    leaks: usize,

    /// Overwrite one header's preceding size in the first application
    #[arg(long, help = "Corrupt a heap link in the first application")]
    corrupt: bool,

    #[arg(long, env = "LEAKCHECK_MAX_ALLOC_COUNT", default_value_t = DEFAULT_MAX_ALLOC_COUNT)]
    max_alloc_count: usize,

    #[arg(long, env = "LEAKCHECK_HASH_SIZE", default_value_t = DEFAULT_HASH_SIZE)]
    hash_size: usize,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    let settings = CheckerSettings {
        max_alloc_count: cli.max_alloc_count,
        hash_size: cli.hash_size,
    };
    if let Err(reason) = settings.validate() {
        eprintln!("Invalid settings: {reason}");
        process::exit(2);
    }

    let (board, checker) = match build_board(&cli) {
        Ok(built) => built,
        Err(reason) => {
            eprintln!("Error setting up board: {reason}");
            process::exit(1);
        }
    };

    let detector = LeakDetector::new(settings);
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let result: Result<(), CheckError> = match &cli.bin {
        Some(name) => detector
            .run_leak_check(&board, checker, name, &mut out)
            .map(drop),
        None => detector
            .run_all_leak_checks(&board, checker, &mut out)
            .map(drop),
    };
    let _ = out.flush();

    if result.is_err() {
        process::exit(1);
    }
}

/// Seeds a board: every app keeps all but `leaks` of its allocations
/// reachable from its data section, and the kernel keeps all of its own.
fn build_board(cli: &Cli) -> Result<(SimBoard, Pid), &'static str> {
    let mut board = SimBoard::new(KERNEL_REGIONS)?;
    let checker = board.spawn_task(CHECKER_STACK_SIZE)?;

    let kernel_ptrs = allocate(&board, KERNEL_NAME, KERNEL_ALLOCS, checker)?;
    keep(&mut board, KERNEL_NAME, &kernel_ptrs)?;

    for app in 0..cli.apps {
        let name = format!("app{app}");
        board.add_app(&name, APP_REGIONS, cli.allocs.max(1))?;
        let worker = board.spawn_task(CHECKER_STACK_SIZE)?;

        let ptrs = allocate(&board, &name, cli.allocs, worker)?;
        let kept = cli.allocs.saturating_sub(cli.leaks);
        keep(&mut board, &name, &ptrs[..kept])?;

        if cli.corrupt && app == 0 {
            if let Some(&victim) = ptrs.get(1) {
                let node = board
                    .app_heap(&name)
                    .and_then(|heap| heap.node_of(victim))
                    .ok_or("lost track of an allocation")?;
                // SAFETY: the board only reads this heap from here on
                unsafe { node.poison_preceding(0xdead0) };
            }
        }
    }

    Ok((board, checker))
}

fn allocate(
    board: &SimBoard,
    name: &str,
    count: usize,
    pid: Pid,
) -> Result<Vec<NonNull<u8>>, &'static str> {
    (0..count)
        .map(|n| {
            board
                .malloc(name, 16 + (n * 24) % 200, pid)
                .ok_or("simulated heap exhausted")
        })
        .collect()
}

fn keep(board: &mut SimBoard, name: &str, ptrs: &[NonNull<u8>]) -> Result<(), &'static str> {
    let globals = board.globals_mut(name).ok_or("unknown binary")?;
    if ptrs.len() > globals.len() {
        return Err("not enough global slots");
    }
    for (slot, ptr) in globals.iter_mut().zip(ptrs) {
        *slot = ptr.as_ptr() as usize;
    }
    Ok(())
}
