//! Catalog (L4): the system segments whose rows describe every other
//! segment, attribute, constraint, index, and reference. Bootstrapped from a
//! reserved block range at the start of the file using the same
//! dual-segment atomic-flip durability pattern the rest of the engine uses
//! for small, frequently-rewritten metadata (§4.5, §9).

use bincode::{Decode, Encode};

use crate::error::{Error, Result};
use crate::storage::disk::DiskManager;
use crate::storage::extent::{Extent, SegmentKind};
use crate::types::Schema;

/// The catalog bootstraps out of block 0 alone, split into two half-block
/// halves (primary at byte 0, alternate at byte `BLOCK_SIZE / 2`), each with
/// its own length-prefixed, checksummed payload (§9's pinned-down decision).
pub const CATALOG_RESERVED_BLOCKS: u32 = 1;
const CATALOG_HEAD_BLOCK: u32 = 0;
const HALF_SIZE: usize = crate::storage::block::BLOCK_SIZE / 2;

pub type ObjId = u64;

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct Relation {
    pub obj_id: ObjId,
    pub name: String,
    pub kind: SegmentKind,
    pub extents: Vec<Extent>,
    pub schema: Schema,
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct IndexEntry {
    pub obj_id: ObjId,
    pub name: String,
    pub table_ref: ObjId,
    pub columns: Vec<String>,
    pub head_block: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Encode, Decode)]
pub enum ReferentialAction {
    Restrict,
    Cascade,
    SetNull,
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct ConstraintNotNull {
    pub obj_id: ObjId,
    pub table: ObjId,
    pub attr: String,
    pub constraint_name: String,
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct ConstraintUnique {
    pub obj_id: ObjId,
    pub table: ObjId,
    pub attrs: Vec<String>,
    pub constraint_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Encode, Decode)]
pub enum CheckOp {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct ConstraintCheck {
    pub obj_id: ObjId,
    pub table: ObjId,
    pub constraint_name: String,
    pub attr: String,
    pub op: CheckOp,
    pub value: crate::types::Value,
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct ConstraintBetween {
    pub obj_id: ObjId,
    pub table: ObjId,
    pub constraint_name: String,
    pub attr: String,
    pub lo: crate::types::Value,
    pub hi: crate::types::Value,
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct Reference {
    pub obj_id: ObjId,
    pub table: ObjId,
    pub attr: String,
    pub referenced_table: ObjId,
    pub referenced_attr: String,
    pub action: ReferentialAction,
}

/// The whole catalog, persisted as one bincode blob (mirroring the source's
/// dual-segment metadata manager, generalized to every entity kind §3
/// enumerates instead of just table metadata).
#[derive(Debug, Clone, Default, PartialEq, Encode, Decode)]
pub struct CatalogData {
    pub next_obj_id: ObjId,
    pub relations: Vec<Relation>,
    pub indexes: Vec<IndexEntry>,
    pub not_null: Vec<ConstraintNotNull>,
    pub unique: Vec<ConstraintUnique>,
    pub check: Vec<ConstraintCheck>,
    pub between: Vec<ConstraintBetween>,
    pub references: Vec<Reference>,
}

impl CatalogData {
    fn allocate_obj_id(&mut self) -> ObjId {
        let id = self.next_obj_id;
        self.next_obj_id += 1;
        id
    }

    pub fn find_relation(&self, name: &str) -> Option<&Relation> {
        self.relations.iter().find(|r| r.name.eq_ignore_ascii_case(name))
    }

    pub fn find_relation_mut(&mut self, name: &str) -> Option<&mut Relation> {
        self.relations.iter_mut().find(|r| r.name.eq_ignore_ascii_case(name))
    }

    pub fn find_relation_by_id(&self, obj_id: ObjId) -> Option<&Relation> {
        self.relations.iter().find(|r| r.obj_id == obj_id)
    }

    pub fn constraint_name_taken(&self, name: &str) -> bool {
        self.not_null.iter().any(|c| c.constraint_name == name)
            || self.unique.iter().any(|c| c.constraint_name == name)
            || self.check.iter().any(|c| c.constraint_name == name)
            || self.between.iter().any(|c| c.constraint_name == name)
    }
}

fn compute_checksum(bytes: &[u8]) -> u32 {
    // Simple additive checksum in the spirit of the source's own checksum
    // helper; it only needs to distinguish "valid" from "torn write", not
    // resist tampering.
    let mut sum: u32 = 0;
    for &b in bytes {
        sum = sum.wrapping_mul(31).wrapping_add(b as u32);
    }
    sum
}

const HALF_CONFIG: bincode::config::Configuration = bincode::config::standard();

/// Reads/writes the catalog through its two reserved halves, preferring
/// whichever half's checksum validates, falling back to the other.
pub struct Catalog {
    data: parking_lot::RwLock<CatalogData>,
    active_half: std::sync::atomic::AtomicU8,
}

impl Catalog {
    /// Opens (or bootstraps) the catalog out of block 0. `disk` must have
    /// been created with at least `CATALOG_RESERVED_BLOCKS` reserved blocks.
    pub fn open(disk: &DiskManager) -> Result<Catalog> {
        let raw = disk.read_raw(CATALOG_HEAD_BLOCK)?;
        let primary = Self::try_read_half(&raw[0..HALF_SIZE]);
        let alternate = Self::try_read_half(&raw[HALF_SIZE..2 * HALF_SIZE]);

        let (data, active_half) = match (primary, alternate) {
            (Some(p), _) => (p, 0u8),
            (None, Some(a)) => (a, 1u8),
            (None, None) => {
                tracing::debug!("bootstrapping empty catalog");
                let fresh = CatalogData::default();
                Self::write_half(disk, 0, &fresh)?;
                (fresh, 0u8)
            }
        };

        Ok(Catalog { data: parking_lot::RwLock::new(data), active_half: std::sync::atomic::AtomicU8::new(active_half) })
    }

    fn try_read_half(half_bytes: &[u8]) -> Option<CatalogData> {
        // Layout: [u32 len][u32 checksum][payload...]
        if half_bytes.len() < 8 {
            return None;
        }
        let len = u32::from_le_bytes(half_bytes[0..4].try_into().unwrap()) as usize;
        let checksum = u32::from_le_bytes(half_bytes[4..8].try_into().unwrap());
        if 8 + len > half_bytes.len() {
            return None;
        }
        let payload = &half_bytes[8..8 + len];
        if compute_checksum(payload) != checksum {
            return None;
        }
        bincode::decode_from_slice(payload, HALF_CONFIG).ok().map(|(data, _)| data)
    }

    fn write_half(disk: &DiskManager, half: u8, data: &CatalogData) -> Result<()> {
        let payload = bincode::encode_to_vec(data, HALF_CONFIG)?;
        if payload.len() + 8 > HALF_SIZE {
            return Err(Error::NoSpace);
        }
        let mut half_bytes = vec![0u8; HALF_SIZE];
        half_bytes[0..4].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        half_bytes[4..8].copy_from_slice(&compute_checksum(&payload).to_le_bytes());
        half_bytes[8..8 + payload.len()].copy_from_slice(&payload);

        let mut raw = disk.read_raw(CATALOG_HEAD_BLOCK).unwrap_or_else(|_| vec![0u8; crate::storage::block::BLOCK_SIZE]);
        let offset = half as usize * HALF_SIZE;
        raw[offset..offset + HALF_SIZE].copy_from_slice(&half_bytes);
        disk.write_raw(CATALOG_HEAD_BLOCK, &raw)
    }

    /// Persists the current in-memory catalog to the inactive half, then
    /// flips — so a crash mid-write still leaves the previously-active half
    /// intact and checksummed.
    pub fn save(&self, disk: &DiskManager) -> Result<()> {
        let data = self.data.read().clone();
        let current = self.active_half.load(std::sync::atomic::Ordering::SeqCst);
        let inactive = 1 - current;
        Self::write_half(disk, inactive, &data)?;
        self.active_half.store(inactive, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    pub fn with_data<T>(&self, f: impl FnOnce(&CatalogData) -> T) -> T {
        f(&self.data.read())
    }

    /// Mutates the catalog and persists it immediately — catalog DDL paths
    /// hold the critical section for the full duration per §5, so there is
    /// no separate "dirty" catalog state to track between calls.
    pub fn mutate(&self, disk: &DiskManager, f: impl FnOnce(&mut CatalogData) -> Result<()>) -> Result<()> {
        {
            let mut data = self.data.write();
            f(&mut data)?;
        }
        self.save(disk)
    }

    pub fn next_obj_id(&self) -> ObjId {
        self.data.read().next_obj_id
    }

    pub fn allocate_obj_id(&self) -> ObjId {
        self.data.write().allocate_obj_id()
    }
}
