//! Extent/Segment Map types (L2): the vocabulary used to answer "which block
//! addresses belong to segment S" and to grow a segment on demand. The
//! directory itself — the mapping from a segment name to its extent list —
//! is bootstrapped through the catalog's SystemTable segment (see
//! `storage::catalog`), since that is the only storage the engine can use
//! before any other segment exists.

use bincode::{Decode, Encode};

/// A block address is a non-negative integer, unique in the file.
pub type BlockAddr = u32;

/// Intra-block tuple id — the index into that block's tuple dictionary.
pub type SlotId = u16;

/// A stable row-position identifier: (block_address, tuple_dict_index).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Encode, Decode)]
pub struct TuplePointer {
    pub block_addr: BlockAddr,
    pub slot_id: SlotId,
}

impl TuplePointer {
    pub fn new(block_addr: BlockAddr, slot_id: SlotId) -> Self {
        TuplePointer { block_addr, slot_id }
    }
}

/// Segment kinds (§3). `SystemTable` segments bootstrap everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Encode, Decode)]
pub enum SegmentKind {
    SystemTable,
    Table,
    Index,
    Transaction,
    Temp,
}

impl SegmentKind {
    pub fn growth_factor(self, config: &crate::config::Config) -> f64 {
        config.growth_factor(self)
    }
}

/// A contiguous, half-open range of block addresses assigned to one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct Extent {
    pub from: BlockAddr,
    pub to: BlockAddr,
}

impl Extent {
    pub fn new(from: BlockAddr, to: BlockAddr) -> Self {
        debug_assert!(from < to, "extent must be non-empty");
        Extent { from, to }
    }

    pub fn len(&self) -> u32 {
        self.to - self.from
    }

    pub fn is_empty(&self) -> bool {
        self.from >= self.to
    }

    pub fn contains(&self, addr: BlockAddr) -> bool {
        addr >= self.from && addr < self.to
    }

    pub fn overlaps(&self, other: &Extent) -> bool {
        self.from < other.to && other.from < self.to
    }

    pub fn addresses(&self) -> impl Iterator<Item = BlockAddr> {
        self.from..self.to
    }
}
