//! Record layout (L3): within one block, a header, a tuple dictionary, and a
//! data heap that grows backward from the end. This is the only layer that
//! knows how bytes are arranged inside a single block; everything above it
//! deals in slot addresses.

use crate::error::{Error, Result};

/// Fixed block size. The spec treats this as a compile-time constant; the
/// `block_size` config key documents the value but does not change it at
/// runtime (see DESIGN.md).
pub const BLOCK_SIZE: usize = 64 * 1024;

const BLOCK_HEADER_SIZE: usize = 16;
const SLOT_ENTRY_SIZE: usize = 6;

/// Slot sentinel marking a deleted/free slot, distinct from "never allocated"
/// (which is anything past `slot_count`).
const FREE_SENTINEL: u16 = u16::MAX;

/// Closed tagged union over block kinds (§9 design notes: "variant dispatch
/// over block kinds... become a closed tagged union").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockKind {
    Free = 0,
    ExtentHead = 1,
    Data = 2,
    IndexInfo = 3,
    IndexMain = 4,
    IndexHash = 5,
}

impl BlockKind {
    pub fn from_u8(tag: u8) -> Result<BlockKind> {
        match tag {
            0 => Ok(BlockKind::Free),
            1 => Ok(BlockKind::ExtentHead),
            2 => Ok(BlockKind::Data),
            3 => Ok(BlockKind::IndexInfo),
            4 => Ok(BlockKind::IndexMain),
            5 => Ok(BlockKind::IndexHash),
            other => Err(Error::CorruptState(format!("unknown block kind tag {}", other))),
        }
    }
}

/// Slot directory entry: (offset, size, type_code) per §3.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SlotEntry {
    pub offset: u16,
    pub length: u16,
    pub type_code: u16,
}

impl SlotEntry {
    fn free() -> Self {
        SlotEntry { offset: 0, length: FREE_SENTINEL, type_code: 0 }
    }

    pub fn is_free(&self) -> bool {
        self.length == FREE_SENTINEL
    }
}

/// Fixed 16-byte block header.
#[repr(C)]
pub struct BlockHeader {
    pub kind: u8,
    pub _reserved0: u8,
    pub slot_count: u16,
    pub free_start: u16,
    pub free_end: u16,
    pub flags: u16,
    pub _reserved: [u8; 6],
}

impl BlockHeader {
    fn new(kind: BlockKind) -> Self {
        BlockHeader {
            kind: kind as u8,
            _reserved0: 0,
            slot_count: 0,
            free_start: BLOCK_HEADER_SIZE as u16,
            free_end: BLOCK_SIZE as u16,
            flags: 0,
            _reserved: [0; 6],
        }
    }

    pub fn free_space(&self) -> usize {
        (self.free_end - self.free_start) as usize
    }

    pub fn block_kind(&self) -> Result<BlockKind> {
        BlockKind::from_u8(self.kind)
    }
}

/// In-memory representation of one on-disk block.
#[derive(Clone)]
pub struct Block {
    pub data: Vec<u8>,
}

impl Block {
    pub fn new(kind: BlockKind) -> Self {
        let mut data = vec![0u8; BLOCK_SIZE];
        let header = BlockHeader::new(kind);
        unsafe {
            std::ptr::copy_nonoverlapping(
                &header as *const BlockHeader as *const u8,
                data.as_mut_ptr(),
                BLOCK_HEADER_SIZE,
            );
        }
        Block { data }
    }

    pub fn from_bytes(data: Vec<u8>) -> Result<Block> {
        if data.len() != BLOCK_SIZE {
            return Err(Error::CorruptState(format!(
                "block has {} bytes, expected {}",
                data.len(),
                BLOCK_SIZE
            )));
        }
        let block = Block { data };
        block.header().block_kind()?;
        Ok(block)
    }

    pub fn header(&self) -> &BlockHeader {
        unsafe { &*(self.data.as_ptr() as *const BlockHeader) }
    }

    pub fn header_mut(&mut self) -> &mut BlockHeader {
        unsafe { &mut *(self.data.as_mut_ptr() as *mut BlockHeader) }
    }

    fn slot_offset(slot_id: u16) -> usize {
        BLOCK_HEADER_SIZE + slot_id as usize * SLOT_ENTRY_SIZE
    }

    pub fn slot(&self, slot_id: u16) -> &SlotEntry {
        let offset = Self::slot_offset(slot_id);
        unsafe { &*(self.data.as_ptr().add(offset) as *const SlotEntry) }
    }

    pub fn slot_mut(&mut self, slot_id: u16) -> &mut SlotEntry {
        let offset = Self::slot_offset(slot_id);
        unsafe { &mut *(self.data.as_mut_ptr().add(offset) as *mut SlotEntry) }
    }

    pub fn slot_count(&self) -> u16 {
        self.header().slot_count
    }

    /// Reads the bytes stored at `slot_id`, or `None` if the slot is free or
    /// was never allocated.
    pub fn read_tuple(&self, slot_id: u16) -> Option<&[u8]> {
        if slot_id >= self.slot_count() {
            return None;
        }
        let slot = self.slot(slot_id);
        if slot.is_free() {
            return None;
        }
        let start = slot.offset as usize;
        let end = start + slot.length as usize;
        Some(&self.data[start..end])
    }

    /// Appends one tuple, allocating a new slot at the end of the directory.
    /// Returns `None` if there isn't room for the slot entry plus the data.
    pub fn append_tuple(&mut self, bytes: &[u8], type_code: u8) -> Option<u16> {
        let slot_id = self.header().slot_count;
        let free_end = self.header().free_end;
        let free_space = self.header().free_space();

        let needed = SLOT_ENTRY_SIZE + bytes.len();
        if free_space < needed {
            return None;
        }

        let new_free_end = free_end - bytes.len() as u16;
        self.data[new_free_end as usize..free_end as usize].copy_from_slice(bytes);

        *self.slot_mut(slot_id) = SlotEntry { offset: new_free_end, length: bytes.len() as u16, type_code: type_code as u16 };

        let header = self.header_mut();
        header.slot_count += 1;
        header.free_start += SLOT_ENTRY_SIZE as u16;
        header.free_end = new_free_end;

        Some(slot_id)
    }

    /// Overwrites the bytes stored at `slot_id` in place, without touching
    /// the slot dictionary. Only valid when `bytes.len()` equals the slot's
    /// current length — callers with fixed-size encodings (e.g. the hash
    /// index's buckets) rely on this to update a tuple without relocating it.
    pub fn overwrite_tuple(&mut self, slot_id: u16, bytes: &[u8]) -> Result<()> {
        if slot_id >= self.slot_count() {
            return Err(Error::BadAddress(slot_id as u32));
        }
        let slot = *self.slot(slot_id);
        if slot.is_free() {
            return Err(Error::CorruptState(format!("slot {} is free", slot_id)));
        }
        if slot.length as usize != bytes.len() {
            return Err(Error::CorruptState(format!(
                "overwrite_tuple size mismatch at slot {}: had {}, got {}",
                slot_id,
                slot.length,
                bytes.len()
            )));
        }
        let start = slot.offset as usize;
        self.data[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Marks a slot free (§4.4: "deletion sets slot.size to Free sentinel").
    /// The heap bytes become reclaimable at the next compaction.
    pub fn delete_slot(&mut self, slot_id: u16) {
        if slot_id < self.slot_count() {
            *self.slot_mut(slot_id) = SlotEntry::free();
        }
    }

    /// Rebuilds the heap from the currently-live slots, reclaiming the space
    /// held by deleted slots. Invoked when free_space accounting shows ≥ B/4
    /// of reclaimable holes relative to the declared capacity (§4.4).
    pub fn compact(&mut self) {
        let count = self.slot_count();
        let mut live: Vec<(u16, Vec<u8>, u16)> = Vec::new();
        for id in 0..count {
            if let Some(bytes) = self.read_tuple(id) {
                let type_code = self.slot(id).type_code;
                live.push((id, bytes.to_vec(), type_code));
            }
        }

        let mut cursor = BLOCK_SIZE as u16;
        for (id, bytes, type_code) in &live {
            cursor -= bytes.len() as u16;
            self.data[cursor as usize..cursor as usize + bytes.len()].copy_from_slice(bytes);
            *self.slot_mut(*id) = SlotEntry { offset: cursor, length: bytes.len() as u16, type_code: *type_code };
        }

        self.header_mut().free_end = cursor;
    }

    /// Bytes of reclaimable space: the gap between what compaction would
    /// yield and the current free_end, used to decide whether compaction is
    /// worthwhile (§4.4's "free_space ≥ B/4 of reclaimable holes").
    pub fn reclaimable(&self) -> usize {
        let live_bytes: usize = (0..self.slot_count())
            .filter_map(|id| self.read_tuple(id))
            .map(|b| b.len())
            .sum();
        let occupied = BLOCK_SIZE - self.header().free_end as usize;
        occupied.saturating_sub(live_bytes)
    }

    pub fn should_compact(&self) -> bool {
        self.reclaimable() >= BLOCK_SIZE / 4
    }

    /// Verifies I1/I2 for this block: no slot overlaps, and free_space
    /// matches the declared accounting. Used by tests and by corruption
    /// detection on load.
    pub fn check_invariants(&self) -> Result<()> {
        let mut ranges: Vec<(u16, u16)> = Vec::new();
        let mut used = 0usize;
        for id in 0..self.slot_count() {
            let slot = self.slot(id);
            if slot.is_free() {
                continue;
            }
            let start = slot.offset;
            let end = start + slot.length;
            if end as usize > BLOCK_SIZE {
                return Err(Error::CorruptState(format!("slot {} out of bounds", id)));
            }
            for (rs, re) in &ranges {
                if start < *re && *rs < end {
                    return Err(Error::CorruptState(format!("slot {} overlaps another slot", id)));
                }
            }
            ranges.push((start, end));
            used += slot.length as usize;
        }
        if self.header().free_space() != BLOCK_SIZE - self.header().free_start as usize - used {
            return Err(Error::CorruptState("free_space accounting mismatch".to_string()));
        }
        Ok(())
    }
}
