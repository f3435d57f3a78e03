//! Temporary reservations.
//!
//! A temporary takes every byte still free in a source arena and exposes it
//! as an arena of its own. While the temporary is active the source is
//! locked: pushes, resets and frees on it fail with
//! [`ErrorKind::Locked`](crate::ErrorKind::Locked). Ending the temporary
//! gives the whole reserved span back, however much of it was used.
//!
//! When the source is a chain of several blocks, the free tail of each block
//! becomes one segment of the temporary:
//!
//! ```text
//! source   ┌──────┬────────┐   ┌───────────┬──────────────┐
//!          │ used │ tail 0 │──▶│   used    │    tail 1    │
//!          └──────┴────────┘   └───────────┴──────────────┘
//!                     │                           │
//! temporary       ┌────────┐              ┌──────────────┐
//!                 │ seg 0  │─────────────▶│    seg 1     │
//!                 └────────┘              └──────────────┘
//! ```

use alloc::vec::Vec;

use snafu::{OptionExt as _, ensure};
use tracing::trace;

use crate::{
    ArenaError,
    arena::Arena,
    arena_error::{
        ExhaustedSnafu, LockedSnafu, NotMaterializedSnafu, NotTemporarySnafu,
        TemporaryMismatchSnafu,
    },
    backing::BackingAllocator,
    block::{BlockKind, BlockSource, MemoryBlock},
    table::BlockId,
};

impl<B> Arena<B>
where
    B: BackingAllocator,
{
    /// Reserves all remaining capacity of `source` as a new temporary arena.
    ///
    /// Afterwards `source` reports no remaining space and is locked until
    /// [`end_temporary`](Self::end_temporary) is called with the returned
    /// handle. The temporary never grows. A temporary may itself be the
    /// source of a nested temporary.
    pub fn begin_temporary(&mut self, source: BlockId) -> Result<BlockId, ArenaError> {
        let head = self.block(source)?;
        ensure!(head.temporary.is_none(), LockedSnafu { id: source });
        ensure!(
            head.is_materialized(),
            NotMaterializedSnafu { id: source }
        );

        let tails: Vec<_> = self
            .table
            .chain(source)
            .filter(|(_, block)| block.remaining() > 0)
            .filter_map(|(id, block)| Some((id, block.cursor()?, block.remaining())))
            .collect();
        ensure!(!tails.is_empty(), ExhaustedSnafu { id: source });

        let mut segments: Vec<BlockId> = Vec::with_capacity(tails.len());
        for &(block_id, cursor, remaining) in &tails {
            let mut segment = MemoryBlock::borrowed(
                cursor,
                remaining,
                BlockKind::Temporary,
                BlockSource::Block(block_id),
            );
            segment.link.prev = segments.last().copied();
            let id = self.table.insert(segment);
            if let Some(&prev) = segments.last() {
                self.block_mut(prev)?.link.next = Some(id);
            }
            segments.push(id);
        }

        for &(block_id, _, _) in &tails {
            let block = self.block_mut(block_id)?;
            block.used = block.size;
        }
        let temporary = segments[0];
        self.block_mut(source)?.temporary = Some(temporary);

        let reserved: usize = tails.iter().map(|&(_, _, remaining)| remaining).sum();
        trace!(%source, %temporary, reserved, segments = segments.len(), "began temporary");
        Ok(temporary)
    }

    /// Ends a temporary and returns its reserved span to the source.
    ///
    /// Each source block gets back exactly the bytes that were reserved
    /// from it, regardless of how much the temporary used. Sub-blocks
    /// carved out of the temporary are retired, and the handle becomes
    /// stale.
    ///
    /// Nothing changes when the call fails.
    pub fn end_temporary(&mut self, temporary: BlockId) -> Result<(), ArenaError> {
        let head = self.block(temporary)?;
        ensure!(
            head.kind == BlockKind::Temporary && head.is_head(),
            NotTemporarySnafu { id: temporary }
        );
        ensure!(head.temporary.is_none(), LockedSnafu { id: temporary });
        let Some(BlockSource::Block(first_source)) = head.source else {
            return NotTemporarySnafu { id: temporary }.fail();
        };

        let owner = self.table.chain_head(first_source);
        let locked_by = self
            .table
            .get(owner)
            .context(TemporaryMismatchSnafu { id: temporary })?
            .temporary;
        ensure!(
            locked_by == Some(temporary),
            TemporaryMismatchSnafu { id: temporary }
        );

        let mut returns = Vec::new();
        for (_, segment) in self.table.chain(temporary) {
            let Some(BlockSource::Block(source)) = segment.source else {
                return TemporaryMismatchSnafu { id: temporary }.fail();
            };
            let reserved_from = self
                .table
                .get(source)
                .context(TemporaryMismatchSnafu { id: temporary })?;
            ensure!(
                reserved_from.used == reserved_from.size && segment.size <= reserved_from.size,
                TemporaryMismatchSnafu { id: temporary }
            );
            returns.push((source, segment.size));
        }

        self.release_chain(temporary);
        self.table.remove(temporary);
        for (source, size) in returns {
            let block = self.block_mut(source)?;
            block.used -= size;
        }
        self.block_mut(owner)?.temporary = None;

        trace!(%owner, %temporary, "ended temporary");
        Ok(())
    }

    /// Runs `f` with a temporary reserved from `source`, ending it
    /// afterwards.
    ///
    /// Temporaries that `f` began on the given temporary and left open are
    /// ended first, innermost first.
    pub fn with_temporary<T, F>(&mut self, source: BlockId, f: F) -> Result<T, ArenaError>
    where
        F: FnOnce(&mut Self, BlockId) -> T,
    {
        let temporary = self.begin_temporary(source)?;
        let value = f(self, temporary);

        let mut nested = Vec::new();
        let mut current = temporary;
        while let Some(inner) = self.block(current)?.temporary {
            nested.push(inner);
            current = inner;
        }
        for &inner in nested.iter().rev() {
            trace!(%temporary, %inner, "ending nested temporary left open");
            self.end_temporary(inner)?;
        }

        self.end_temporary(temporary)?;
        Ok(value)
    }
}
