//! Disk Manager (L0): persistent block-addressed storage with a bitmap of
//! allocated blocks. Owns the database file exclusively; every other layer
//! reaches the file only through this one.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::storage::block::{Block, BlockKind, BLOCK_SIZE};
use crate::storage::extent::{BlockAddr, Extent, SegmentKind};

const DISK_MAGIC: u32 = 0x464C4248; // "FLBH" — flintbase header
const HEADER_LEN: usize = 16;

/// Default block capacity for a freshly-created database file: 4096 blocks
/// of 64KiB each (256MiB addressable before the file needs to be recreated
/// with a larger capacity — this engine does not grow the bitmap region).
pub const DEFAULT_CAPACITY_BLOCKS: u32 = 4096;

struct Bitmap {
    bits: Vec<u64>,
    capacity: u32,
}

impl Bitmap {
    fn new(capacity: u32) -> Self {
        let words = (capacity as usize).div_ceil(64);
        Bitmap { bits: vec![0u64; words], capacity }
    }

    fn from_bytes(capacity: u32, bytes: &[u8]) -> Self {
        let words = (capacity as usize).div_ceil(64);
        let mut bits = vec![0u64; words];
        for (i, word) in bits.iter_mut().enumerate() {
            let start = i * 8;
            if start + 8 <= bytes.len() {
                *word = u64::from_le_bytes(bytes[start..start + 8].try_into().unwrap());
            }
        }
        Bitmap { bits, capacity }
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.bits.len() * 8);
        for word in &self.bits {
            out.extend_from_slice(&word.to_le_bytes());
        }
        out
    }

    fn byte_len(&self) -> usize {
        self.bits.len() * 8
    }

    fn is_used(&self, addr: BlockAddr) -> bool {
        let word = self.bits[(addr / 64) as usize];
        (word & (1 << (addr % 64))) != 0
    }

    fn set_used(&mut self, addr: BlockAddr, used: bool) {
        let word = &mut self.bits[(addr / 64) as usize];
        if used {
            *word |= 1 << (addr % 64);
        } else {
            *word &= !(1 << (addr % 64));
        }
    }

    /// First-fit scan: the lowest-address contiguous run of `len` free
    /// blocks (§4.1's fairness/tie-break rule).
    fn find_free_run(&self, len: u32) -> Option<BlockAddr> {
        if len == 0 {
            return None;
        }
        let mut run_start = 0u32;
        let mut run_len = 0u32;
        for addr in 0..self.capacity {
            if self.is_used(addr) {
                run_len = 0;
            } else {
                if run_len == 0 {
                    run_start = addr;
                }
                run_len += 1;
                if run_len == len {
                    return Some(run_start);
                }
            }
        }
        None
    }
}

pub struct DiskManager {
    file: Mutex<File>,
    path: PathBuf,
    capacity: u32,
    bitmap: Mutex<Bitmap>,
    data_region_offset: u64,
}

impl DiskManager {
    /// Opens an existing database file, or creates one with the given block
    /// capacity if none exists. On creation, blocks `[0, reserved_blocks)`
    /// are marked used up front and left zeroed — the catalog claims that
    /// range directly for its dual-segment root (§4.5) rather than going
    /// through `allocate_extent`.
    pub fn init(path: &Path, capacity_blocks: u32, reserved_blocks: u32) -> Result<DiskManager> {
        let is_fresh = !path.exists();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let (capacity, bitmap) = if is_fresh {
            tracing::debug!(path = %path.display(), capacity_blocks, reserved_blocks, "creating fresh database file");
            let mut bitmap = Bitmap::new(capacity_blocks);
            for addr in 0..reserved_blocks {
                bitmap.set_used(addr, true);
            }
            let mut header = Vec::with_capacity(HEADER_LEN);
            header.extend_from_slice(&DISK_MAGIC.to_le_bytes());
            header.extend_from_slice(&capacity_blocks.to_le_bytes());
            header.extend_from_slice(&[0u8; HEADER_LEN - 8]);
            file.write_all_at(&header, 0)?;
            file.write_all_at(&bitmap.to_bytes(), HEADER_LEN as u64)?;
            (capacity_blocks, bitmap)
        } else {
            let mut header = [0u8; HEADER_LEN];
            file.read_exact_at(&mut header, 0)?;
            let magic = u32::from_le_bytes(header[0..4].try_into().unwrap());
            if magic != DISK_MAGIC {
                return Err(Error::CorruptState("database file header magic mismatch".to_string()));
            }
            let capacity = u32::from_le_bytes(header[4..8].try_into().unwrap());
            let mut bitmap_bytes = vec![0u8; (capacity as usize).div_ceil(64) * 8];
            file.read_exact_at(&mut bitmap_bytes, HEADER_LEN as u64)?;
            (capacity, Bitmap::from_bytes(capacity, &bitmap_bytes))
        };

        let data_region_offset = HEADER_LEN as u64 + bitmap.byte_len() as u64;

        Ok(DiskManager {
            file: Mutex::new(file),
            path: path.to_path_buf(),
            capacity,
            bitmap: Mutex::new(bitmap),
            data_region_offset,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    fn block_offset(&self, addr: BlockAddr) -> u64 {
        self.data_region_offset + addr as u64 * BLOCK_SIZE as u64
    }

    fn check_address(&self, addr: BlockAddr) -> Result<()> {
        if addr >= self.capacity {
            return Err(Error::BadAddress(addr));
        }
        Ok(())
    }

    pub fn read_block(&self, addr: BlockAddr) -> Result<Block> {
        self.check_address(addr)?;
        let mut bytes = vec![0u8; BLOCK_SIZE];
        self.file.lock().read_exact_at(&mut bytes, self.block_offset(addr))?;
        tracing::trace!(addr, "read_block");
        Block::from_bytes(bytes)
    }

    pub fn write_block(&self, addr: BlockAddr, block: &Block) -> Result<()> {
        self.check_address(addr)?;
        self.file.lock().write_all_at(&block.data, self.block_offset(addr))?;
        tracing::trace!(addr, "write_block");
        Ok(())
    }

    /// Raw, unvalidated block access for the catalog's reserved bootstrap
    /// region (§4.5): those blocks are not formatted as slotted pages, so
    /// going through `Block::from_bytes`'s `BlockKind` check would reject
    /// them. Only the catalog uses these.
    pub fn read_raw(&self, addr: BlockAddr) -> Result<Vec<u8>> {
        self.check_address(addr)?;
        let mut bytes = vec![0u8; BLOCK_SIZE];
        self.file.lock().read_exact_at(&mut bytes, self.block_offset(addr))?;
        Ok(bytes)
    }

    pub fn write_raw(&self, addr: BlockAddr, bytes: &[u8]) -> Result<()> {
        self.check_address(addr)?;
        debug_assert_eq!(bytes.len(), BLOCK_SIZE);
        self.file.lock().write_all_at(bytes, self.block_offset(addr))?;
        Ok(())
    }

    fn persist_bitmap(&self, bitmap: &Bitmap) -> Result<()> {
        self.file.lock().write_all_at(&bitmap.to_bytes(), HEADER_LEN as u64)?;
        Ok(())
    }

    /// Scans the bitmap for a contiguous run of `preferred_size` free
    /// blocks, marks them used, and returns the extent. The blocks
    /// themselves are left untouched — the caller writes `BlockKind` into
    /// each block's header the first time it is used (§4.3).
    pub fn allocate_extent(&self, preferred_size: u32, _kind: SegmentKind) -> Result<Extent> {
        let mut bitmap = self.bitmap.lock();
        let start = bitmap.find_free_run(preferred_size).ok_or(Error::NoSpace)?;
        for addr in start..start + preferred_size {
            bitmap.set_used(addr, true);
        }
        self.persist_bitmap(&bitmap)?;
        tracing::debug!(start, len = preferred_size, "allocate_extent");
        Ok(Extent::new(start, start + preferred_size))
    }

    /// Unsets the bitmap bits for `extent` and zeroes the kind of every
    /// block it covered (§4.1).
    pub fn free_extent(&self, extent: &Extent) -> Result<()> {
        for addr in extent.addresses() {
            self.check_address(addr)?;
            self.write_block(addr, &Block::new(BlockKind::Free))?;
        }
        let mut bitmap = self.bitmap.lock();
        for addr in extent.addresses() {
            bitmap.set_used(addr, false);
        }
        self.persist_bitmap(&bitmap)?;
        tracing::debug!(from = extent.from, to = extent.to, "free_extent");
        Ok(())
    }

    pub fn is_allocated(&self, addr: BlockAddr) -> bool {
        if addr >= self.capacity {
            return false;
        }
        self.bitmap.lock().is_used(addr)
    }

    pub fn flush(&self) -> Result<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("flintbase-disk-test-{}-{}", name, std::process::id()))
    }

    #[test]
    fn fresh_file_reserves_block_zero() {
        let path = temp_path("fresh");
        let _ = std::fs::remove_file(&path);
        let disk = DiskManager::init(&path, 64, 1).unwrap();
        assert!(disk.is_allocated(0));
        assert!(!disk.is_allocated(1));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn allocate_and_free_round_trips_bitmap() {
        let path = temp_path("alloc");
        let _ = std::fs::remove_file(&path);
        let disk = DiskManager::init(&path, 64, 1).unwrap();
        let extent = disk.allocate_extent(4, SegmentKind::Table).unwrap();
        assert_eq!(extent.len(), 4);
        for addr in extent.addresses() {
            assert!(disk.is_allocated(addr));
        }
        disk.free_extent(&extent).unwrap();
        for addr in extent.addresses() {
            assert!(!disk.is_allocated(addr));
        }
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn write_then_read_block_round_trips() {
        let path = temp_path("rw");
        let _ = std::fs::remove_file(&path);
        let disk = DiskManager::init(&path, 64, 1).unwrap();
        let extent = disk.allocate_extent(1, SegmentKind::Table).unwrap();
        let mut block = Block::new(BlockKind::Data);
        block.append_tuple(b"payload", 0).unwrap();
        disk.write_block(extent.from, &block).unwrap();
        let read_back = disk.read_block(extent.from).unwrap();
        assert_eq!(read_back.read_tuple(0), Some(&b"payload"[..]));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn out_of_range_address_is_bad_address() {
        let path = temp_path("oob");
        let _ = std::fs::remove_file(&path);
        let disk = DiskManager::init(&path, 8, 1).unwrap();
        assert!(matches!(disk.read_block(999), Err(Error::BadAddress(999))));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn reopen_recovers_bitmap_state() {
        let path = temp_path("reopen");
        let _ = std::fs::remove_file(&path);
        {
            let disk = DiskManager::init(&path, 32, 1).unwrap();
            disk.allocate_extent(3, SegmentKind::Table).unwrap();
        }
        let disk = DiskManager::init(&path, 32, 1).unwrap();
        assert!(disk.is_allocated(0));
        assert!(disk.is_allocated(1));
        assert!(disk.is_allocated(2));
        assert!(disk.is_allocated(3));
        let _ = std::fs::remove_file(&path);
    }
}
