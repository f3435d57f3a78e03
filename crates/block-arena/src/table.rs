//! Generational slot table holding every block descriptor of an arena.

use alloc::vec::Vec;
use core::fmt;

use crate::block::MemoryBlock;

/// Handle to a block descriptor stored in an [`Arena`](crate::Arena).
///
/// Handles are cheap to copy. Once the descriptor is retired its slot may
/// be reused, but the generation changes, so an old handle never aliases
/// the new descriptor.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId {
    index: usize,
    generation: u32,
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockId({}v{})", self.index, self.generation)
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}v{}", self.index, self.generation)
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    block: Option<MemoryBlock>,
}

#[derive(Debug, Default)]
pub(crate) struct BlockTable {
    slots: Vec<Slot>,
    vacant: Vec<usize>,
}

impl BlockTable {
    pub(crate) const fn new() -> Self {
        Self {
            slots: Vec::new(),
            vacant: Vec::new(),
        }
    }

    pub(crate) fn insert(&mut self, block: MemoryBlock) -> BlockId {
        if let Some(index) = self.vacant.pop() {
            let slot = &mut self.slots[index];
            debug_assert!(slot.block.is_none(), "Vacant slot must be empty");
            slot.block = Some(block);
            return BlockId {
                index,
                generation: slot.generation,
            };
        }

        let index = self.slots.len();
        self.slots.push(Slot {
            generation: 0,
            block: Some(block),
        });
        BlockId {
            index,
            generation: 0,
        }
    }

    pub(crate) fn get(&self, id: BlockId) -> Option<&MemoryBlock> {
        self.slots
            .get(id.index)
            .filter(|slot| slot.generation == id.generation)?
            .block
            .as_ref()
    }

    pub(crate) fn get_mut(&mut self, id: BlockId) -> Option<&mut MemoryBlock> {
        self.slots
            .get_mut(id.index)
            .filter(|slot| slot.generation == id.generation)?
            .block
            .as_mut()
    }

    /// Retires a descriptor. The handle is stale afterwards.
    pub(crate) fn remove(&mut self, id: BlockId) -> Option<MemoryBlock> {
        let slot = self
            .slots
            .get_mut(id.index)
            .filter(|slot| slot.generation == id.generation)?;
        let block = slot.block.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.vacant.push(id.index);
        Some(block)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (BlockId, &MemoryBlock)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            let block = slot.block.as_ref()?;
            let id = BlockId {
                index,
                generation: slot.generation,
            };
            Some((id, block))
        })
    }

    pub(crate) fn blocks_mut(&mut self) -> impl Iterator<Item = &mut MemoryBlock> {
        self.slots.iter_mut().filter_map(|slot| slot.block.as_mut())
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len() - self.vacant.len()
    }

    /// Walks the chain starting at `head` in append order, stopping at the
    /// first block without storage.
    pub(crate) fn chain(&self, head: BlockId) -> Chain<'_> {
        Chain {
            table: self,
            next: Some(head),
        }
    }

    /// Follows `prev` links back to the head of the chain containing `id`.
    pub(crate) fn chain_head(&self, mut id: BlockId) -> BlockId {
        while let Some(prev) = self.get(id).and_then(|block| block.link.prev) {
            id = prev;
        }
        id
    }

    pub(crate) fn chain_tail(&self, head: BlockId) -> BlockId {
        let mut id = head;
        while let Some(next) = self.get(id).and_then(|block| block.link.next) {
            id = next;
        }
        id
    }
}

pub(crate) struct Chain<'a> {
    table: &'a BlockTable,
    next: Option<BlockId>,
}

impl<'a> Iterator for Chain<'a> {
    type Item = (BlockId, &'a MemoryBlock);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.next.take()?;
        let block = self.table.get(id)?;
        if !block.is_materialized() {
            return None;
        }
        self.next = block.link.next;
        Some((id, block))
    }
}
