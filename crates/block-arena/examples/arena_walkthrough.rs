use std::process;

use argh::FromArgs;
use block_arena::{Arena, BlockId, BlockKind, PushFlags, kib};
use snafu::ResultExt as _;
use snafu_utils::{GenericError, Report};

/// Push a sequence of sizes into an arena and print its block chain.
#[derive(Debug, FromArgs)]
struct Args {
    /// sizes in bytes to push, in order
    #[argh(positional)]
    sizes: Vec<usize>,
    /// size of the first block in KiB (0 defers allocation to the first push)
    #[argh(option, default = "0")]
    initial_kib: usize,
    /// use a fixed arena instead of a growable one
    #[argh(switch)]
    fixed: bool,
    /// alignment of every push
    #[argh(option, default = "1")]
    align: usize,
    /// zero-fill pushed memory
    #[argh(switch)]
    clear: bool,
    /// reserve the remaining space as a temporary and fill half of it
    #[argh(switch)]
    temporary: bool,
}

fn main() {
    let args: Args = argh::from_env();

    if let Err(err) = run(&args) {
        let report = Report::new(err);
        eprintln!("{report}");
        process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), GenericError> {
    let kind = if args.fixed {
        BlockKind::Fixed
    } else {
        BlockKind::Growable
    };
    let flags = if args.clear {
        PushFlags::CLEAR
    } else {
        PushFlags::empty()
    };

    let mut arena = Arena::new();
    let mem = arena
        .init(kind, kib(args.initial_kib))
        .with_whatever_context(|_| format!("failed to initialize {kind:?} arena"))?;

    for &size in &args.sizes {
        let ptr = arena
            .push_aligned(mem, size, args.align, flags)
            .with_whatever_context(|_| format!("failed to push, size={size}"))?;
        println!("push {size:>10} -> {ptr:p}");
    }
    print_chain(&arena, mem, "arena")?;

    if args.temporary {
        arena
            .with_temporary(mem, |arena, tmp| -> Result<(), GenericError> {
                let half = arena
                    .remaining_size(tmp)
                    .whatever_context("failed to query temporary")?
                    / 2;
                if half > 0 {
                    arena
                        .push(tmp, half, flags)
                        .whatever_context("failed to push into temporary")?;
                }
                print_chain(arena, tmp, "temporary")?;
                print_chain(arena, mem, "arena (locked)")
            })
            .whatever_context("failed to reserve temporary")??;
        print_chain(&arena, mem, "arena (restored)")?;
    }

    arena.destroy(mem).whatever_context("failed to destroy arena")?;
    Ok(())
}

fn print_chain(arena: &Arena, id: BlockId, label: &str) -> Result<(), GenericError> {
    let total = arena.total_size(id).whatever_context("failed to query size")?;
    let remaining = arena
        .remaining_size(id)
        .whatever_context("failed to query remaining size")?;
    println!("{label}: {id} total={total} remaining={remaining}");
    for (index, info) in arena
        .blocks(id)
        .whatever_context("failed to walk blocks")?
        .enumerate()
    {
        println!(
            "  [{index}] {:?} size={} used={} owned={}",
            info.kind, info.size, info.used, info.owns_memory
        );
    }
    Ok(())
}
