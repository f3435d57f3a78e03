//! Heap memory used like a stack.
//!
//! This crate manages heap memory as chains of stack-discipline blocks. Each
//! block is one contiguous heap allocation with a `used` offset; pushing
//! bumps that offset and hands out the bytes in between. Nothing is freed
//! individually: an arena is reset or freed as a whole.
//!
//! # Arena Kinds
//!
//! ## [`BlockKind::Growable`]
//!
//! The default discipline. When no block in the chain can hold a request, a
//! new block (a multiple of [`MIN_BLOCK_SIZE`]) is allocated and appended to
//! the tail of the chain. A growable arena may start out empty and
//! materialize its first block on the first push.
//!
//! ## [`BlockKind::Fixed`]
//!
//! A single block whose capacity is set at initialization, either allocated
//! from the heap or wrapped around caller-owned memory. Pushing past its
//! capacity fails with [`ErrorKind::OutOfSpace`].
//!
//! ## [`BlockKind::Temporary`]
//!
//! A scoped arena that reserves every byte still free in a source arena.
//! While it is active the source is locked; ending it gives the reserved
//! span back to the source in one piece.
//!
//! # Block Selection
//!
//! Pushing scans the chain in append order and picks, among the blocks that
//! can hold the request, the one with the **most space left over** after the
//! write (best fit by maximum remaining). Small requests therefore spread
//! across the blocks with the most slack instead of piling into one block
//! until it is exhausted.
//!
//! ```text
//! head                      tail
//! ┌────────────┐   ┌──────────────────────────┐
//! │used│ free  │──▶│   used    │     free     │
//! └────────────┘   └──────────────────────────┘
//!   leftover: 10     leftover: 40  <- chosen for a request that fits both
//! ```
//!
//! # Usage Examples
//!
//! ## Growable Memory
//!
//! ```rust
//! use block_arena::{Arena, BlockKind, PushFlags, mib};
//!
//! let mut arena = Arena::new();
//! let mem = arena.init(BlockKind::Growable, 0).unwrap();
//!
//! // Materializes the first block
//! let small = arena.push(mem, mib(3), PushFlags::empty()).unwrap();
//!
//! // Does not fit into the first block, a second one is appended
//! let big = arena.push(mem, mib(64), PushFlags::CLEAR).unwrap();
//! assert_ne!(small, big);
//! assert_eq!(arena.block_count(mem).unwrap(), 2);
//!
//! // Releases every block of the chain
//! arena.free(mem).unwrap();
//! ```
//!
//! ## Fixed Memory
//!
//! ```rust
//! use block_arena::{Arena, BlockKind, ErrorKind, PushFlags, kib};
//!
//! let mut arena = Arena::new();
//! let mem = arena.init(BlockKind::Fixed, kib(16)).unwrap();
//!
//! let data = arena.push(mem, size_of::<u32>() * 10, PushFlags::CLEAR).unwrap();
//! unsafe { data.cast::<u32>().write(1) };
//!
//! // Does not fit, and a fixed arena never grows
//! let err = arena.push(mem, kib(32), PushFlags::empty()).unwrap_err();
//! assert_eq!(err.kind(), ErrorKind::OutOfSpace);
//! ```
//!
//! ## Temporary Memory
//!
//! ```rust
//! use block_arena::{Arena, BlockKind, PushFlags, mib};
//!
//! let mut arena = Arena::new();
//! let mem = arena.init(BlockKind::Growable, mib(16)).unwrap();
//! arena.push(mem, mib(4), PushFlags::empty()).unwrap();
//!
//! // Reserves the remaining 12 MiB, `mem` is locked until the end
//! let temp = arena.begin_temporary(mem).unwrap();
//! assert!(arena.push(mem, 1, PushFlags::empty()).is_err());
//! arena.push(temp, mib(1), PushFlags::empty()).unwrap();
//! arena.end_temporary(temp).unwrap();
//!
//! // Source memory is restored and unlocked
//! assert_eq!(arena.remaining_size(mem).unwrap(), mib(12));
//! arena.push(mem, mib(2), PushFlags::empty()).unwrap();
//! ```
//!
//! # Design Considerations
//!
//! ## Handles
//!
//! Every block descriptor lives in a table owned by the [`Arena`]; callers
//! hold [`BlockId`] handles. A handle becomes stale once its descriptor is
//! retired and is then rejected with [`ErrorKind::InvalidArgument`].
//!
//! ## Memory Safety
//!
//! Pushes return raw [`NonNull<u8>`](core::ptr::NonNull) pointers. A pointer
//! stays valid until the arena it came from is reset, freed, destroyed or
//! dropped. Blocks are never moved or resized, so growing a chain never
//! invalidates earlier pointers.
//!
//! ## Thread Safety
//!
//! [`Arena`] is `Send` but not `Sync`. Sharing one between threads requires
//! external synchronization around every operation.

#![no_std]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

extern crate alloc;

use core::alloc::Layout;

use bitflags::bitflags;
use snafu::Snafu;
use snafu_utils::{ErrorLocation, Location};

pub use self::{
    arena::{Arena, Blocks},
    backing::{BackingAllocator, Global},
    block::{BlockInfo, BlockKind},
    table::BlockId,
};

mod arena;
pub mod backing;
mod block;
mod table;
mod temporary;

/// Granularity of blocks appended to a growable chain.
///
/// Grown blocks are the smallest multiple of this size that holds the
/// request.
pub const MIN_BLOCK_SIZE: usize = 4096;

/// Minimum alignment of every block allocated from the backing heap.
pub const BLOCK_ALIGN: usize = 16;

const _: () = assert!(MIN_BLOCK_SIZE.is_power_of_two());
const _: () = assert!(BLOCK_ALIGN.is_power_of_two() && MIN_BLOCK_SIZE >= BLOCK_ALIGN);

/// Returns the number of bytes in `value` kibibytes.
#[must_use]
pub const fn kib(value: usize) -> usize {
    value.saturating_mul(1024)
}

/// Returns the number of bytes in `value` mebibytes.
#[must_use]
pub const fn mib(value: usize) -> usize {
    kib(kib(value))
}

/// Returns the number of bytes in `value` gibibytes.
#[must_use]
pub const fn gib(value: usize) -> usize {
    kib(mib(value))
}

/// Returns the number of bytes in `value` tebibytes.
#[must_use]
pub const fn tib(value: usize) -> usize {
    kib(gib(value))
}

bitflags! {
    /// Per-push options.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PushFlags: u32 {
        /// Zero-fill the returned region.
        const CLEAR = 1 << 0;
    }
}

/// Errors returned by [`Arena`] operations.
#[derive(Debug, Snafu)]
#[snafu(module)]
#[non_exhaustive]
pub enum ArenaError {
    #[snafu(display("unknown or retired block handle {id}"))]
    InvalidHandle {
        id: BlockId,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("size must be greater than zero"))]
    ZeroSize {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("fixed arena requires a non-zero capacity"))]
    ZeroCapacity {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("operation is not supported for {kind:?} blocks"))]
    InvalidKind {
        kind: BlockKind,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("external buffer pointer is null"))]
    NullBuffer {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("alignment {align} is not a power of two"))]
    InvalidAlignment {
        align: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("block size overflows for request of {size} bytes aligned to {align}"))]
    SizeOverflow {
        size: usize,
        align: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("out of space: requested {requested} bytes, {remaining} bytes remaining"))]
    OutOfSpace {
        requested: usize,
        remaining: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("arena {id} has no remaining capacity to reserve"))]
    Exhausted {
        id: BlockId,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("backing allocator refused block, layout: {layout:?}"))]
    AllocationFailure {
        layout: Layout,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("arena {id} is locked by an active temporary"))]
    Locked {
        id: BlockId,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("arena {id} has no storage yet"))]
    NotMaterialized {
        id: BlockId,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("block {id} is not an active temporary"))]
    NotTemporary {
        id: BlockId,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("temporary {id} does not match the reservation held by its source"))]
    TemporaryMismatch {
        id: BlockId,
        #[snafu(implicit)]
        location: Location,
    },
}

/// Broad classification of an [`ArenaError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A handle, size, alignment or buffer was unusable.
    InvalidArgument,
    /// The request does not fit and the arena may not grow.
    OutOfSpace,
    /// The backing allocator returned no memory.
    AllocationFailure,
    /// The arena has an outstanding temporary.
    Locked,
    /// Temporary bookkeeping does not match the call.
    InvalidState,
}

impl ArenaError {
    /// Broad classification of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidHandle { .. }
            | Self::ZeroSize { .. }
            | Self::ZeroCapacity { .. }
            | Self::InvalidKind { .. }
            | Self::NullBuffer { .. }
            | Self::InvalidAlignment { .. }
            | Self::SizeOverflow { .. } => ErrorKind::InvalidArgument,
            Self::OutOfSpace { .. } | Self::Exhausted { .. } => ErrorKind::OutOfSpace,
            Self::AllocationFailure { .. } => ErrorKind::AllocationFailure,
            Self::Locked { .. } => ErrorKind::Locked,
            Self::NotMaterialized { .. }
            | Self::NotTemporary { .. }
            | Self::TemporaryMismatch { .. } => ErrorKind::InvalidState,
        }
    }
}

impl ErrorLocation for ArenaError {
    fn location(&self) -> Option<Location> {
        match self {
            Self::InvalidHandle { location, .. }
            | Self::ZeroSize { location }
            | Self::ZeroCapacity { location }
            | Self::InvalidKind { location, .. }
            | Self::NullBuffer { location }
            | Self::InvalidAlignment { location, .. }
            | Self::SizeOverflow { location, .. }
            | Self::OutOfSpace { location, .. }
            | Self::Exhausted { location, .. }
            | Self::AllocationFailure { location, .. }
            | Self::Locked { location, .. }
            | Self::NotMaterialized { location, .. }
            | Self::NotTemporary { location, .. }
            | Self::TemporaryMismatch { location, .. } => Some(*location),
        }
    }
}
