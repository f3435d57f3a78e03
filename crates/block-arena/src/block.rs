//! Memory block descriptors.
//!
//! A [`MemoryBlock`] describes one contiguous span of memory and the stack
//! offset (`used`) inside it. Descriptors never live inside the memory they
//! describe: the chain links (`prev`/`next`) are kept next to the
//! descriptor in the [`BlockTable`](crate::table::BlockTable), so no byte of
//! a block is spent on bookkeeping.
//!
//! ```text
//! Descriptor                              Block memory
//! ┌───────────────────────────┐           ┌──────────────┬───────────────┐
//! │ base ─────────────────────┼──────────▶│ used         │ free          │
//! │ size, used, kind          │           └──────────────┴───────────────┘
//! │ source, temporary         │           ^              ^               ^
//! │ link { prev, next }       │           base           base + used     base + size
//! └───────────────────────────┘
//! ```

use core::{alloc::Layout, ptr::NonNull};

use crate::{BLOCK_ALIGN, MIN_BLOCK_SIZE, table::BlockId};

/// Allocation discipline of a block.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockKind {
    /// The chain is extended with new blocks when a push does not fit.
    #[default]
    Growable,
    /// Capacity is capped at initialization.
    Fixed,
    /// Exclusive reservation of another arena's free space.
    Temporary,
}

/// Where the memory of a block comes from when the block does not own it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlockSource {
    /// Caller-owned buffer.
    External,
    /// Carved out of the block with this handle.
    Block(BlockId),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ChainLink {
    pub(crate) prev: Option<BlockId>,
    pub(crate) next: Option<BlockId>,
}

/// Placement of a request inside a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Fit {
    /// Offset of the first byte handed out, after alignment padding.
    pub(crate) offset: usize,
    /// Bytes still free in the block after the write.
    pub(crate) leftover: usize,
}

#[derive(Debug)]
pub(crate) struct MemoryBlock {
    pub(crate) base: Option<NonNull<u8>>,
    pub(crate) size: usize,
    pub(crate) used: usize,
    pub(crate) kind: BlockKind,
    /// Set when the memory is borrowed. Such a block is never deallocated.
    pub(crate) source: Option<BlockSource>,
    /// Active temporary holding this block's free space.
    pub(crate) temporary: Option<BlockId>,
    pub(crate) link: ChainLink,
    /// Layout the memory was obtained with, for blocks that own it.
    pub(crate) allocation: Option<Layout>,
}

impl MemoryBlock {
    /// A descriptor with no storage. A growable one materializes on the
    /// first push.
    pub(crate) const fn empty(kind: BlockKind) -> Self {
        Self {
            base: None,
            size: 0,
            used: 0,
            kind,
            source: None,
            temporary: None,
            link: ChainLink {
                prev: None,
                next: None,
            },
            allocation: None,
        }
    }

    pub(crate) fn owned(base: NonNull<u8>, layout: Layout, kind: BlockKind) -> Self {
        let mut block = Self::empty(kind);
        block.install(base, layout);
        block
    }

    pub(crate) const fn borrowed(
        base: NonNull<u8>,
        size: usize,
        kind: BlockKind,
        source: BlockSource,
    ) -> Self {
        let mut block = Self::empty(kind);
        block.base = Some(base);
        block.size = size;
        block.source = Some(source);
        block
    }

    /// Gives an unmaterialized descriptor its own heap storage.
    pub(crate) fn install(&mut self, base: NonNull<u8>, layout: Layout) {
        self.base = Some(base);
        self.size = layout.size();
        self.used = 0;
        self.source = None;
        self.allocation = Some(layout);
    }

    pub(crate) fn is_materialized(&self) -> bool {
        self.base.is_some() && self.size > 0
    }

    pub(crate) fn is_head(&self) -> bool {
        self.link.prev.is_none()
    }

    pub(crate) fn remaining(&self) -> usize {
        debug_assert!(self.used <= self.size, "Block used exceeds its size");
        if self.is_materialized() {
            self.size - self.used
        } else {
            0
        }
    }

    /// Current write position.
    pub(crate) fn cursor(&self) -> Option<NonNull<u8>> {
        self.base.map(|base| unsafe { base.add(self.used) })
    }

    /// Checks whether `size` bytes aligned to `align` fit behind `used`.
    pub(crate) fn fit(&self, size: usize, align: usize) -> Option<Fit> {
        debug_assert!(align.is_power_of_two());
        if !self.is_materialized() {
            return None;
        }
        let padding = self.cursor()?.align_offset(align);
        let offset = self.used.checked_add(padding)?;
        let end = offset.checked_add(size)?;
        (end <= self.size).then(|| Fit {
            offset,
            leftover: self.size - end,
        })
    }

    /// Moves the stack pointer past a placement found by [`Self::fit`].
    pub(crate) fn bump(&mut self, fit: Fit, size: usize) -> Option<NonNull<u8>> {
        let base = self.base?;
        let end = fit.offset + size;
        debug_assert!(end <= self.size, "Bump past the end of the block");
        self.used = end;
        Some(unsafe { base.add(fit.offset) })
    }

    pub(crate) fn info(&self) -> BlockInfo {
        BlockInfo {
            kind: self.kind,
            size: self.size,
            used: self.used,
            owns_memory: self.allocation.is_some(),
        }
    }
}

/// Layout of the first block of an arena, exactly `size` bytes.
pub(crate) fn initial_layout(size: usize) -> Option<Layout> {
    Layout::from_size_align(size, BLOCK_ALIGN).ok()
}

/// Layout of a block appended to a growable chain for `size` bytes aligned
/// to `align`.
///
/// The size is the smallest multiple of [`MIN_BLOCK_SIZE`] that holds the
/// request. The block itself is aligned to `align`, so the request always
/// lands at offset zero.
pub(crate) fn grown_layout(size: usize, align: usize) -> Option<Layout> {
    let block_size = size.checked_next_multiple_of(MIN_BLOCK_SIZE)?.max(MIN_BLOCK_SIZE);
    Layout::from_size_align(block_size, align.max(BLOCK_ALIGN)).ok()
}

/// Snapshot of one block in a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub kind: BlockKind,
    pub size: usize,
    pub used: usize,
    /// `false` for blocks whose memory belongs to a caller buffer or to
    /// another block.
    pub owns_memory: bool,
}

impl BlockInfo {
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.size - self.used
    }
}
