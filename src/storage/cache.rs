//! Block Cache (L1): a fixed-capacity associative buffer over the disk
//! manager with a replacement policy and dirty tracking.
//!
//! Rust's ownership rules make the "borrow a cache slot, mutate it in place"
//! style from the source awkward to express safely across two calls, so the
//! contract here is explicit instead: `get` returns an owned copy for
//! reading, and a caller that wants to mutate a block calls `put` with the
//! modified copy to write it back into the cache (marking it dirty). Both
//! still go through the same slot/replacement machinery.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::error::Result;
use crate::storage::block::Block;
use crate::storage::disk::DiskManager;
use crate::storage::extent::BlockAddr;

struct Slot {
    addr: BlockAddr,
    block: Block,
    dirty: bool,
    last_access: u64,
}

struct CacheState {
    slots: Vec<Slot>,
    index: HashMap<BlockAddr, usize>,
    clock: u64,
}

impl CacheState {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Picks an eviction victim per §4.2: oldest last-read timestamp among
    /// unpinned clean slots; if every clean slot is fresher than every dirty
    /// slot, the oldest dirty slot is chosen (and must be flushed first).
    /// Ties broken by lowest slot index.
    fn pick_victim(&self) -> usize {
        let mut best_clean: Option<usize> = None;
        let mut best_dirty: Option<usize> = None;
        for (i, slot) in self.slots.iter().enumerate() {
            if slot.dirty {
                if best_dirty.is_none_or(|b: usize| slot.last_access < self.slots[b].last_access) {
                    best_dirty = Some(i);
                }
            } else if best_clean.is_none_or(|b: usize| slot.last_access < self.slots[b].last_access) {
                best_clean = Some(i);
            }
        }
        best_clean.or(best_dirty).expect("cache is non-empty when eviction runs")
    }
}

pub struct BlockCache {
    disk: std::sync::Arc<DiskManager>,
    capacity: usize,
    state: Mutex<CacheState>,
}

impl BlockCache {
    pub fn new(disk: std::sync::Arc<DiskManager>, capacity: usize) -> Self {
        BlockCache {
            disk,
            capacity,
            state: Mutex::new(CacheState { slots: Vec::with_capacity(capacity), index: HashMap::new(), clock: 0 }),
        }
    }

    /// Reads `addr`, hitting the cache if present, otherwise loading from
    /// disk and evicting per the replacement policy if the cache is full.
    pub fn get(&self, addr: BlockAddr) -> Result<Block> {
        let mut state = self.state.lock();
        if let Some(&slot_idx) = state.index.get(&addr) {
            let tick = state.tick();
            state.slots[slot_idx].last_access = tick;
            return Ok(state.slots[slot_idx].block.clone());
        }

        let block = self.disk.read_block(addr)?;
        let tick = state.tick();
        let new_slot = Slot { addr, block: block.clone(), dirty: false, last_access: tick };

        if state.slots.len() < self.capacity {
            let idx = state.slots.len();
            state.slots.push(new_slot);
            state.index.insert(addr, idx);
        } else {
            let victim_idx = state.pick_victim();
            if state.slots[victim_idx].dirty {
                self.disk.write_block(state.slots[victim_idx].addr, &state.slots[victim_idx].block)?;
                tracing::debug!(evicted = state.slots[victim_idx].addr, "flushed dirty victim on eviction");
            }
            state.index.remove(&state.slots[victim_idx].addr);
            state.slots[victim_idx] = new_slot;
            state.index.insert(addr, victim_idx);
        }

        Ok(block)
    }

    /// Writes `block` into the cache at `addr`, marking it dirty. Loads the
    /// slot via the same path as `get` if `addr` is not already cached, so
    /// the replacement policy is identical for reads and writes.
    pub fn put(&self, addr: BlockAddr, block: Block) -> Result<()> {
        // Ensure a slot exists for addr (may evict), then overwrite it.
        let _ = self.get(addr)?;
        let mut state = self.state.lock();
        let idx = *state.index.get(&addr).expect("slot was just populated by get");
        let tick = state.tick();
        state.slots[idx].block = block;
        state.slots[idx].dirty = true;
        state.slots[idx].last_access = tick;
        Ok(())
    }

    /// Flags an already-cached block dirty without changing its payload,
    /// bumping its last-change timestamp.
    pub fn mark_dirty(&self, addr: BlockAddr) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(&idx) = state.index.get(&addr) {
            let tick = state.tick();
            state.slots[idx].dirty = true;
            state.slots[idx].last_access = tick;
        }
        Ok(())
    }

    /// Writes every dirty slot back to disk and clears dirty flags. Called
    /// before shutdown and at redo-log commit boundaries.
    pub fn flush(&self) -> Result<()> {
        let mut state = self.state.lock();
        for slot in state.slots.iter_mut() {
            if slot.dirty {
                self.disk.write_block(slot.addr, &slot.block)?;
                slot.dirty = false;
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.state.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::block::BlockKind;
    use crate::storage::extent::SegmentKind;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn temp_disk(name: &str, capacity: u32) -> Arc<DiskManager> {
        let path = std::env::temp_dir().join(format!("flintbase-cache-test-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_file(&path);
        Arc::new(DiskManager::init(&path, capacity, 1).unwrap())
    }

    #[test]
    fn hit_returns_same_contents_without_disk_roundtrip() {
        let disk = temp_disk("hit", 16);
        let extent = disk.allocate_extent(2, SegmentKind::Table).unwrap();
        let cache = BlockCache::new(disk.clone(), 4);
        let mut block = Block::new(BlockKind::Data);
        block.append_tuple(b"x", 0).unwrap();
        cache.put(extent.from, block).unwrap();
        let got = cache.get(extent.from).unwrap();
        assert_eq!(got.read_tuple(0), Some(&b"x"[..]));
    }

    #[test]
    fn flush_writes_dirty_slots_to_disk() {
        let disk = temp_disk("flush", 16);
        let extent = disk.allocate_extent(1, SegmentKind::Table).unwrap();
        let cache = BlockCache::new(disk.clone(), 4);
        let mut block = Block::new(BlockKind::Data);
        block.append_tuple(b"persisted", 0).unwrap();
        cache.put(extent.from, block).unwrap();
        cache.flush().unwrap();
        let from_disk = disk.read_block(extent.from).unwrap();
        assert_eq!(from_disk.read_tuple(0), Some(&b"persisted"[..]));
    }

    #[test]
    fn eviction_respects_capacity() {
        let disk = temp_disk("evict", 16);
        let extent = disk.allocate_extent(8, SegmentKind::Table).unwrap();
        let cache = BlockCache::new(disk.clone(), 2);
        for addr in extent.addresses() {
            cache.get(addr).unwrap();
        }
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn dirty_victim_is_flushed_before_eviction() {
        let disk = temp_disk("dirty-evict", 16);
        let extent = disk.allocate_extent(3, SegmentKind::Table).unwrap();
        let cache = BlockCache::new(disk.clone(), 2);
        let addrs: Vec<_> = extent.addresses().collect();

        let mut b0 = Block::new(BlockKind::Data);
        b0.append_tuple(b"zero", 0).unwrap();
        cache.put(addrs[0], b0).unwrap();

        cache.get(addrs[1]).unwrap();
        // Forces eviction of one of the two resident slots.
        cache.get(addrs[2]).unwrap();

        let from_disk = disk.read_block(addrs[0]).unwrap();
        // Whether or not addrs[0] itself was evicted, if it was, it must
        // have been flushed first — read straight from disk to confirm.
        if !cache.state.lock().index.contains_key(&addrs[0]) {
            assert_eq!(from_disk.read_tuple(0), Some(&b"zero"[..]));
        }
    }
}
