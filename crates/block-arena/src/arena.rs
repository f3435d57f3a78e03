//! Arena of block chains.
//!
//! An [`Arena`] owns a table of block descriptors and the heap blocks they
//! point to. Each chain in the table is an independent arena addressed by
//! the [`BlockId`] of its head block; chain extensions, sub-blocks and
//! temporaries are descriptors in the same table.
//!
//! # Algorithm
//!
//! Pushing walks the chain from the head and picks the block that leaves
//! the most bytes free after the write. Fixed chains only ever consider the
//! head. When nothing fits, a growable chain allocates a new block from the
//! backing allocator, either as the head's first storage or appended at the
//! tail, and serves the request from it.

use alloc::vec::Vec;
use core::ptr::NonNull;

use snafu::{OptionExt as _, ensure};
use tracing::{debug, trace, warn};

use crate::{
    ArenaError, PushFlags,
    arena_error::{
        AllocationFailureSnafu, InvalidAlignmentSnafu, InvalidHandleSnafu, InvalidKindSnafu,
        LockedSnafu, NullBufferSnafu, OutOfSpaceSnafu, SizeOverflowSnafu, ZeroCapacitySnafu,
        ZeroSizeSnafu,
    },
    backing::{BackingAllocator, Global},
    block::{self, BlockInfo, BlockKind, BlockSource, Fit, MemoryBlock},
    table::{BlockId, BlockTable, Chain},
};

/// A set of stack-discipline arenas sharing one backing allocator.
///
/// # Thread Safety
///
/// This arena is `Send` but not `Sync`. Concurrent use requires external
/// synchronization around every operation.
pub struct Arena<B = Global>
where
    B: BackingAllocator,
{
    pub(crate) table: BlockTable,
    backing: B,
}

unsafe impl<B> Send for Arena<B> where B: BackingAllocator + Send {}

impl Default for Arena<Global> {
    fn default() -> Self {
        Self::new()
    }
}

impl Arena<Global> {
    /// Creates an empty [`Arena`] backed by the global heap.
    #[must_use]
    pub const fn new() -> Self {
        Self::with_backing(Global)
    }
}

impl<B> Arena<B>
where
    B: BackingAllocator,
{
    /// Creates an empty [`Arena`] drawing its blocks from `backing`.
    pub const fn with_backing(backing: B) -> Self {
        Self {
            table: BlockTable::new(),
            backing,
        }
    }

    /// The allocator blocks are drawn from.
    #[must_use]
    pub fn backing(&self) -> &B {
        &self.backing
    }

    /// Number of live block descriptors across every chain.
    #[must_use]
    pub fn descriptor_count(&self) -> usize {
        self.table.len()
    }

    /// Creates a new arena of the given kind.
    ///
    /// When `initial_size` is greater than zero, a first block of exactly
    /// that many bytes is allocated up front. A growable arena may start
    /// empty and materializes on the first push; a fixed arena needs a
    /// non-zero capacity.
    ///
    /// On failure nothing is left behind in the table.
    pub fn init(&mut self, kind: BlockKind, initial_size: usize) -> Result<BlockId, ArenaError> {
        ensure!(kind != BlockKind::Temporary, InvalidKindSnafu { kind });
        ensure!(
            kind != BlockKind::Fixed || initial_size > 0,
            ZeroCapacitySnafu
        );

        let mut block = MemoryBlock::empty(kind);
        if initial_size > 0 {
            let layout = block::initial_layout(initial_size).context(SizeOverflowSnafu {
                size: initial_size,
                align: crate::BLOCK_ALIGN,
            })?;
            let base = self.allocate_block(layout)?;
            block.install(base, layout);
        }

        let id = self.table.insert(block);
        debug!(%id, ?kind, initial_size, "initialized arena");
        Ok(id)
    }

    /// Creates a fixed arena over caller-owned memory.
    ///
    /// The buffer is never handed to the backing allocator; freeing the
    /// arena leaves it untouched.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// - `buffer..buffer + size` is valid for reads and writes
    /// - the buffer is not used by anything else while the arena exists
    /// - the buffer outlives every pointer pushed from the arena
    pub unsafe fn init_from_external(
        &mut self,
        buffer: *mut u8,
        size: usize,
    ) -> Result<BlockId, ArenaError> {
        let base = NonNull::new(buffer).context(NullBufferSnafu)?;
        ensure!(size > 0, ZeroSizeSnafu);

        let block = MemoryBlock::borrowed(base, size, BlockKind::Fixed, BlockSource::External);
        let id = self.table.insert(block);
        debug!(%id, size, "initialized arena over external memory");
        Ok(id)
    }

    /// Creates a fixed arena over a buffer that lives forever.
    pub fn init_from_static(&mut self, buffer: &'static mut [u8]) -> Result<BlockId, ArenaError> {
        unsafe { self.init_from_external(buffer.as_mut_ptr(), buffer.len()) }
    }

    /// Pushes `size` bytes onto the arena and returns their address.
    pub fn push(
        &mut self,
        id: BlockId,
        size: usize,
        flags: PushFlags,
    ) -> Result<NonNull<u8>, ArenaError> {
        self.push_aligned(id, size, 1, flags)
    }

    /// Pushes `size` bytes whose address is a multiple of `align`.
    ///
    /// Padding needed to reach the boundary is consumed from the block the
    /// request lands in and counts against its fit.
    ///
    /// # Errors
    ///
    /// - [`ErrorKind::InvalidArgument`](crate::ErrorKind::InvalidArgument)
    ///   for a zero `size`, a non power-of-two `align` or a stale handle
    /// - [`ErrorKind::Locked`](crate::ErrorKind::Locked) while a temporary
    ///   is active on the arena
    /// - [`ErrorKind::OutOfSpace`](crate::ErrorKind::OutOfSpace) when
    ///   nothing fits and the arena may not grow
    /// - [`ErrorKind::AllocationFailure`](crate::ErrorKind::AllocationFailure)
    ///   when growing fails
    ///
    /// A failed push leaves every block unchanged.
    pub fn push_aligned(
        &mut self,
        id: BlockId,
        size: usize,
        align: usize,
        flags: PushFlags,
    ) -> Result<NonNull<u8>, ArenaError> {
        self.push_into(id, size, align, flags).map(|(_, ptr)| ptr)
    }

    /// Pushes onto the chain at `id` and reports the block the bytes came
    /// from.
    fn push_into(
        &mut self,
        id: BlockId,
        size: usize,
        align: usize,
        flags: PushFlags,
    ) -> Result<(BlockId, NonNull<u8>), ArenaError> {
        ensure!(size > 0, ZeroSizeSnafu);
        ensure!(align.is_power_of_two(), InvalidAlignmentSnafu { align });
        let head = self.block(id)?;
        ensure!(head.temporary.is_none(), LockedSnafu { id });
        let kind = head.kind;

        let (target, fit) = if let Some(found) = self.best_fit(id, size, align) {
            found
        } else {
            ensure!(
                kind == BlockKind::Growable,
                OutOfSpaceSnafu {
                    requested: size,
                    remaining: self.remaining_size(id)?,
                }
            );
            self.grow(id, size, align)?
        };

        let ptr = self
            .block_mut(target)?
            .bump(fit, size)
            .context(InvalidHandleSnafu { id: target })?;
        if flags.contains(PushFlags::CLEAR) {
            unsafe { ptr.as_ptr().write_bytes(0, size) };
        }
        Ok((target, ptr))
    }

    /// Carves `size` bytes out of `source` as a new, independent fixed
    /// arena.
    ///
    /// The new arena keeps its own `used` offset. Its memory belongs to
    /// `source` and is never freed through the new handle.
    pub fn push_block(
        &mut self,
        source: BlockId,
        size: usize,
        flags: PushFlags,
    ) -> Result<BlockId, ArenaError> {
        let (parent, base) = self.push_into(source, size, 1, flags)?;
        let block = MemoryBlock::borrowed(base, size, BlockKind::Fixed, BlockSource::Block(parent));
        let id = self.table.insert(block);
        trace!(%id, %source, block = %parent, size, "carved sub-block");
        Ok(id)
    }

    /// Bytes still free across the chain starting at `id`.
    pub fn remaining_size(&self, id: BlockId) -> Result<usize, ArenaError> {
        Ok(self.chain(id)?.map(|(_, block)| block.remaining()).sum())
    }

    /// Capacity of the chain starting at `id`.
    pub fn total_size(&self, id: BlockId) -> Result<usize, ArenaError> {
        Ok(self.chain(id)?.map(|(_, block)| block.size).sum())
    }

    /// Bytes used in the head block of `id`.
    pub fn used(&self, id: BlockId) -> Result<usize, ArenaError> {
        Ok(self.block(id)?.used)
    }

    /// Allocation discipline of the arena at `id`.
    pub fn kind(&self, id: BlockId) -> Result<BlockKind, ArenaError> {
        Ok(self.block(id)?.kind)
    }

    /// Whether a temporary currently holds the free space of `id`.
    pub fn is_locked(&self, id: BlockId) -> Result<bool, ArenaError> {
        Ok(self.block(id)?.temporary.is_some())
    }

    /// Number of materialized blocks in the chain starting at `id`.
    pub fn block_count(&self, id: BlockId) -> Result<usize, ArenaError> {
        Ok(self.chain(id)?.count())
    }

    /// Iterates the blocks of the chain starting at `id` in append order.
    pub fn blocks(&self, id: BlockId) -> Result<Blocks<'_>, ArenaError> {
        Ok(Blocks {
            chain: self.chain(id)?,
        })
    }

    /// Sets the head block's `used` back to zero.
    ///
    /// No memory is released and chained blocks keep their usage. Pointers
    /// previously pushed from the head block must no longer be used, and
    /// sub-blocks carved from it are retired.
    pub fn reset(&mut self, id: BlockId) -> Result<(), ArenaError> {
        let block = self.block(id)?;
        ensure!(block.temporary.is_none(), LockedSnafu { id });
        self.retire_dependents(&[id]);
        self.block_mut(id)?.used = 0;
        Ok(())
    }

    /// Releases every heap block of the chain starting at `id`.
    ///
    /// Blocks whose memory is borrowed (sub-blocks, external buffers) are
    /// not deallocated. Descriptors carved from the released memory are
    /// retired. Afterwards `id` describes an empty growable arena.
    pub fn free(&mut self, id: BlockId) -> Result<(), ArenaError> {
        let block = self.block(id)?;
        ensure!(
            block.kind != BlockKind::Temporary,
            InvalidKindSnafu { kind: block.kind }
        );
        ensure!(block.temporary.is_none(), LockedSnafu { id });
        ensure!(block.is_head(), InvalidHandleSnafu { id });

        self.release_chain(id);
        *self.block_mut(id)? = MemoryBlock::empty(BlockKind::Growable);
        debug!(%id, "freed arena");
        Ok(())
    }

    /// Frees the arena and retires its handle.
    pub fn destroy(&mut self, id: BlockId) -> Result<(), ArenaError> {
        self.free(id)?;
        self.table.remove(id);
        Ok(())
    }

    pub(crate) fn block(&self, id: BlockId) -> Result<&MemoryBlock, ArenaError> {
        self.table.get(id).context(InvalidHandleSnafu { id })
    }

    pub(crate) fn block_mut(&mut self, id: BlockId) -> Result<&mut MemoryBlock, ArenaError> {
        self.table.get_mut(id).context(InvalidHandleSnafu { id })
    }

    pub(crate) fn chain(&self, id: BlockId) -> Result<Chain<'_>, ArenaError> {
        self.block(id)?;
        Ok(self.table.chain(id))
    }

    /// Finds the block that leaves the most bytes free after the write.
    fn best_fit(&self, head: BlockId, size: usize, align: usize) -> Option<(BlockId, Fit)> {
        let mut best: Option<(BlockId, Fit)> = None;
        for (id, block) in self.table.chain(head) {
            if let Some(fit) = block.fit(size, align) {
                if best.is_none_or(|(_, best_fit)| fit.leftover > best_fit.leftover) {
                    best = Some((id, fit));
                }
            }
            if block.kind == BlockKind::Fixed {
                break;
            }
        }
        if let Some((id, fit)) = best {
            trace!(%head, block = %id, offset = fit.offset, leftover = fit.leftover, "best fit");
        }
        best
    }

    /// Allocates a block for `size` bytes and links it into the chain.
    fn grow(
        &mut self,
        head: BlockId,
        size: usize,
        align: usize,
    ) -> Result<(BlockId, Fit), ArenaError> {
        let layout = block::grown_layout(size, align).context(SizeOverflowSnafu { size, align })?;
        let tail = self
            .block(head)?
            .is_materialized()
            .then(|| self.table.chain_tail(head));
        let base = self.allocate_block(layout)?;
        let fit = Fit {
            offset: 0,
            leftover: layout.size() - size,
        };

        let Some(tail) = tail else {
            self.block_mut(head)?.install(base, layout);
            return Ok((head, fit));
        };

        let mut block = MemoryBlock::owned(base, layout, BlockKind::Growable);
        block.link.prev = Some(tail);
        let id = self.table.insert(block);
        self.block_mut(tail)?.link.next = Some(id);
        debug!(%head, block = %id, "appended block to chain");
        Ok((id, fit))
    }

    fn allocate_block(&mut self, layout: core::alloc::Layout) -> Result<NonNull<u8>, ArenaError> {
        let Some(base) = self.backing.allocate(layout) else {
            warn!(size = layout.size(), align = layout.align(), "backing allocator refused block");
            return AllocationFailureSnafu { layout }.fail();
        };
        debug!(size = layout.size(), align = layout.align(), "allocated block");
        Ok(base)
    }

    /// Deallocates owned memory of the chain at `head`, retires its chain
    /// extensions and every descriptor carved from it.
    ///
    /// The head descriptor itself stays in the table.
    pub(crate) fn release_chain(&mut self, head: BlockId) {
        let chain: Vec<BlockId> = self.table.chain(head).map(|(id, _)| id).collect();
        self.retire_dependents(&chain);

        for (index, &id) in chain.iter().enumerate() {
            let block = if index == 0 {
                self.table.get_mut(head).map(|block| {
                    let allocation = block.allocation.take();
                    (block.base, allocation)
                })
            } else {
                self.table
                    .remove(id)
                    .map(|block| (block.base, block.allocation))
            };
            if let Some((Some(base), Some(layout))) = block {
                unsafe { self.backing.deallocate(base, layout) };
                debug!(size = layout.size(), "released block");
            }
        }
    }

    /// Retires every descriptor whose memory was carved out of one of
    /// `chain`'s blocks, together with its own dependents.
    fn retire_dependents(&mut self, chain: &[BlockId]) {
        let dependents: Vec<BlockId> = self
            .table
            .iter()
            .filter(|(_, block)| block.is_head())
            .filter(|(_, block)| {
                matches!(block.source, Some(BlockSource::Block(source)) if chain.contains(&source))
            })
            .map(|(id, _)| id)
            .collect();

        for id in dependents {
            trace!(%id, "retiring dependent descriptor");
            self.release_chain(id);
            self.table.remove(id);
        }
    }
}

impl<B> Drop for Arena<B>
where
    B: BackingAllocator,
{
    fn drop(&mut self) {
        let Self { table, backing } = self;
        for block in table.blocks_mut() {
            if let (Some(base), Some(layout)) = (block.base, block.allocation.take()) {
                unsafe { backing.deallocate(base, layout) };
            }
        }
    }
}

/// Iterator over the blocks of one chain, see [`Arena::blocks`].
pub struct Blocks<'a> {
    chain: Chain<'a>,
}

impl Iterator for Blocks<'_> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<Self::Item> {
        self.chain.next().map(|(_, block)| block.info())
    }
}
