//! Engine Facade (L9): the single entry point callers construct once and
//! hold for the database's lifetime. Wires the disk manager, block cache,
//! catalog, and redo log together and implements the row-level operations —
//! DDL, insert/select/update/delete, and constraint installation — in terms
//! of the layers underneath (§4.1-§4.9, §5, §6).
//!
//! Concurrency follows §5's single-threaded cooperative model: there is no
//! locking between callers, only a reentrancy counter that asserts a second
//! call never starts while a first is still on the stack. A `Cell<u32>`
//! rather than an atomic, since a `DatabaseEngine` is not meant to be shared
//! across threads — the counter only catches a caller re-entering through a
//! callback or a bug in this module itself.

use std::cell::Cell;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::Config;
use crate::constraints::{self, CascadeEffect};
use crate::error::{Error, Result};
use crate::ops::expr::{self, Evaluator, PostfixToken};
use crate::ops::operators;
use crate::storage::block::{Block, BlockKind};
use crate::storage::cache::BlockCache;
use crate::storage::catalog::{
    Catalog, CheckOp, ConstraintBetween, ConstraintCheck, ConstraintNotNull, ConstraintUnique, IndexEntry,
    ObjId, Reference, ReferentialAction, Relation, CATALOG_RESERVED_BLOCKS,
};
use crate::storage::disk::{DiskManager, DEFAULT_CAPACITY_BLOCKS};
use crate::storage::index::hash::HashIndex;
use crate::storage::extent::{SegmentKind, TuplePointer};
use crate::storage::wal::{self, MutationOp, RedoLog, SelectResult};
use crate::types::{Row, Schema, Value};

const VALUE_CONFIG: bincode::config::Configuration = bincode::config::standard();

fn encode_value(value: &Value) -> Result<Vec<u8>> {
    Ok(bincode::encode_to_vec(value, VALUE_CONFIG)?)
}

fn decode_value(bytes: &[u8]) -> Result<Value> {
    let (value, _) = bincode::decode_from_slice(bytes, VALUE_CONFIG)?;
    Ok(value)
}

/// RAII reentrancy guard for §5's critical section. Increments on entry,
/// decrements on drop, and asserts the count never exceeds one.
struct CriticalSectionGuard<'a> {
    counter: &'a Cell<u32>,
}

impl<'a> CriticalSectionGuard<'a> {
    fn enter(counter: &'a Cell<u32>) -> Self {
        let depth = counter.get() + 1;
        counter.set(depth);
        debug_assert!(depth <= 1, "critical section re-entered at depth {}", depth);
        CriticalSectionGuard { counter }
    }
}

impl Drop for CriticalSectionGuard<'_> {
    fn drop(&mut self) {
        self.counter.set(self.counter.get() - 1);
    }
}

/// The database engine. One instance owns the database file exclusively for
/// its lifetime; `Drop` flushes and archives so a caller that forgets to call
/// `archive_and_flush` explicitly still leaves a consistent file on disk.
pub struct DatabaseEngine {
    config: Config,
    disk: Arc<DiskManager>,
    cache: BlockCache,
    catalog: Catalog,
    redo_log: Mutex<RedoLog>,
    critical_section: Cell<u32>,
}

impl DatabaseEngine {
    /// Opens (or creates) the database file named by `config.database_file_path`
    /// and bootstraps the catalog, cache, and redo log on top of it.
    pub fn open(config: Config) -> Result<Self> {
        let path = Path::new(&config.database_file_path);
        let disk = Arc::new(DiskManager::init(path, DEFAULT_CAPACITY_BLOCKS, CATALOG_RESERVED_BLOCKS)?);
        let catalog = Catalog::open(&disk)?;
        let cache = BlockCache::new(disk.clone(), config.cache_capacity);
        let redo_log = Mutex::new(RedoLog::new(config.max_redo_log_entries, &config.archivelog_directory));
        tracing::info!(path = %disk.path().display(), "database engine opened");
        Ok(DatabaseEngine { config, disk, cache, catalog, redo_log, critical_section: Cell::new(0) })
    }

    fn enter_critical_section(&self) -> CriticalSectionGuard<'_> {
        CriticalSectionGuard::enter(&self.critical_section)
    }

    fn find_relation(&self, name: &str) -> Result<Relation> {
        self.catalog.with_data(|d| d.find_relation(name).cloned()).ok_or_else(|| Error::NotFound(format!("table {}", name)))
    }

    /// Iterates every extent of `relation` in catalog order and groups
    /// consecutive non-free slots into rows of `schema.len()` width — the
    /// row-boundary discipline recorded in §4.4 (a row occupies the slot
    /// positions `[base, base+k)` it was inserted with; there is no row
    /// header, so deletion always frees all `k` slots of a row together).
    fn scan_table(&self, relation: &Relation) -> Result<Vec<(TuplePointer, Row)>> {
        let k = relation.schema.len() as u16;
        let mut out = Vec::new();
        for extent in &relation.extents {
            for addr in extent.addresses() {
                let block = self.cache.get(addr)?;
                let mut slot_id: u16 = 0;
                while slot_id < block.slot_count() {
                    if block.read_tuple(slot_id).is_some() {
                        let mut values = Vec::with_capacity(k as usize);
                        for i in 0..k {
                            let bytes = block.read_tuple(slot_id + i).ok_or_else(|| {
                                Error::CorruptState(format!(
                                    "row at block {} slot {} is missing attribute slot {}",
                                    addr,
                                    slot_id,
                                    i
                                ))
                            })?;
                            values.push(decode_value(bytes)?);
                        }
                        out.push((TuplePointer::new(addr, slot_id), Row::new(values)));
                    }
                    slot_id += k;
                }
            }
        }
        Ok(out)
    }

    /// Tries to fit every attribute of a row into a clone of `block`, so a
    /// row that doesn't fully fit never leaves a partial write behind.
    /// Returns the committed block and the first attribute's slot id on
    /// success.
    fn try_append_row(block: &Block, encoded: &[(Vec<u8>, u8)]) -> Option<(Block, u16)> {
        let mut trial = block.clone();
        let mut first_slot = None;
        for (bytes, type_code) in encoded {
            match trial.append_tuple(bytes, *type_code) {
                Some(slot) => {
                    if first_slot.is_none() {
                        first_slot = Some(slot);
                    }
                }
                None => return None,
            }
        }
        first_slot.map(|slot| (trial, slot))
    }

    /// Locates the tail block of `relation` with room for the whole row,
    /// scanning back-to-front; extends the segment with a freshly
    /// initialized block if none has room (§4.3, §4.4).
    fn append_row(&self, relation: &Relation, row: &Row) -> Result<TuplePointer> {
        let encoded: Vec<(Vec<u8>, u8)> = row
            .values
            .iter()
            .zip(&relation.schema.columns)
            .map(|(v, c)| encode_value(v).map(|bytes| (bytes, c.data_type.type_code())))
            .collect::<Result<_>>()?;

        for extent in relation.extents.iter().rev() {
            for addr in extent.addresses().rev() {
                let block = self.cache.get(addr)?;
                if let Some((written, slot)) = Self::try_append_row(&block, &encoded) {
                    self.cache.put(addr, written)?;
                    return Ok(TuplePointer::new(addr, slot));
                }
            }
        }

        let growth = relation.kind.growth_factor(&self.config);
        let last_len = relation.extents.last().map(|e| e.len()).unwrap_or(1);
        let new_len = ((last_len as f64) * growth).ceil().max(1.0) as u32;
        let new_extent = self.disk.allocate_extent(new_len, relation.kind)?;

        // A freshly allocated extent's blocks are untouched on disk — every
        // block in it is formatted here, before anything else reads it
        // (§4.3's "caller writes BlockKind the first time it is used"), so a
        // later append into the extent's later blocks never reads raw disk
        // garbage through `Block::from_bytes`.
        for addr in new_extent.addresses() {
            self.cache.put(addr, Block::new(BlockKind::Data))?;
        }

        let fresh = self.cache.get(new_extent.from)?;
        let (written, slot) = Self::try_append_row(&fresh, &encoded)
            .ok_or_else(|| Error::SchemaViolation("row does not fit in an empty block".to_string()))?;
        self.cache.put(new_extent.from, written)?;

        self.catalog.mutate(&self.disk, |data| {
            let rel = data
                .find_relation_mut(&relation.name)
                .ok_or_else(|| Error::NotFound(format!("table {}", relation.name)))?;
            rel.extents.push(new_extent);
            Ok(())
        })?;

        Ok(TuplePointer::new(new_extent.from, slot))
    }

    fn free_row_slots(&self, relation: &Relation, ptr: TuplePointer) -> Result<()> {
        let k = relation.schema.len() as u16;
        let mut block = self.cache.get(ptr.block_addr)?;
        for i in 0..k {
            block.delete_slot(ptr.slot_id + i);
        }
        if block.should_compact() {
            block.compact();
        }
        self.cache.put(ptr.block_addr, block)
    }

    /// Updates never rewrite in place — a changed string column can change
    /// length, and `Block::overwrite_tuple` only accepts an exact-length
    /// replacement — so a row is freed and reappended instead, possibly
    /// landing on a different block. Any hash index over this table is kept
    /// in step: the old row's key is removed and the new row's key inserted.
    fn replace_row(&self, relation: &Relation, old_ptr: TuplePointer, old_row: &Row, new_row: &Row) -> Result<TuplePointer> {
        self.index_delete_row(relation, old_row, old_ptr)?;
        self.free_row_slots(relation, old_ptr)?;
        let new_ptr = self.append_row(relation, new_row)?;
        self.index_insert_row(relation, new_row, new_ptr)?;
        Ok(new_ptr)
    }

    fn table_indexes(&self, table_id: ObjId) -> Vec<IndexEntry> {
        self.catalog.with_data(|d| d.indexes.iter().filter(|i| i.table_ref == table_id).cloned().collect())
    }

    fn index_key(schema: &Schema, row: &Row, columns: &[String]) -> Result<i64> {
        let mut key = 0i64;
        for col in columns {
            let idx = schema
                .position_of(col)
                .ok_or_else(|| Error::SchemaViolation(format!("unknown attribute: {}", col)))?;
            key = key.wrapping_add(row.values[idx].hash_contribution());
        }
        Ok(key)
    }

    fn index_insert_row(&self, relation: &Relation, row: &Row, ptr: TuplePointer) -> Result<()> {
        for entry in self.table_indexes(relation.obj_id) {
            let key = Self::index_key(&relation.schema, row, &entry.columns)?;
            let index = HashIndex::new(entry.head_block);
            index.insert(&self.cache, &self.disk, &mut Vec::new(), key, ptr)?;
        }
        Ok(())
    }

    fn index_delete_row(&self, relation: &Relation, row: &Row, ptr: TuplePointer) -> Result<()> {
        for entry in self.table_indexes(relation.obj_id) {
            let key = Self::index_key(&relation.schema, row, &entry.columns)?;
            let index = HashIndex::new(entry.head_block);
            index.delete(&self.cache, key, ptr)?;
        }
        Ok(())
    }

    fn gather_referenced_tables(&self, relation: &Relation) -> Result<HashMap<String, (Schema, Vec<Row>)>> {
        let refs: Vec<Reference> =
            self.catalog.with_data(|d| d.references.iter().filter(|r| r.table == relation.obj_id).cloned().collect());

        let mut out = HashMap::new();
        for r in refs {
            let name = self
                .catalog
                .with_data(|d| d.find_relation_by_id(r.referenced_table).map(|rel| rel.name.clone()))
                .ok_or_else(|| Error::CorruptState("reference points at unknown table".to_string()))?;
            if out.contains_key(&name) {
                continue;
            }
            let rel = self.find_relation(&name)?;
            let rows = self.scan_table(&rel)?.into_iter().map(|(_, row)| row).collect();
            out.insert(name, (rel.schema.clone(), rows));
        }
        Ok(out)
    }

    /// Creates an empty table with one initial extent. The segment name
    /// collision check runs before any allocation, so a duplicate name never
    /// leaks an unreferenced extent.
    pub fn create_table(&self, name: &str, schema: Schema) -> Result<()> {
        let _cs = self.enter_critical_section();
        if name.is_empty() {
            return Err(Error::InvalidArgument("table name must not be empty".to_string()));
        }
        if self.catalog.with_data(|d| d.find_relation(name).is_some()) {
            return Err(Error::DuplicateName(name.to_string()));
        }

        let initial = self.disk.allocate_extent(1, SegmentKind::Table)?;
        self.cache.put(initial.from, Block::new(BlockKind::Data))?;

        self.catalog.mutate(&self.disk, |data| {
            let obj_id = data.next_obj_id;
            data.next_obj_id += 1;
            data.relations.push(Relation {
                obj_id,
                name: name.to_string(),
                kind: SegmentKind::Table,
                extents: vec![initial],
                schema: schema.clone(),
            });
            Ok(())
        })?;
        tracing::info!(table = name, "created table");
        Ok(())
    }

    /// Validates and inserts one row, recording the mutation in the redo log.
    pub fn insert(&self, table: &str, values: Vec<Value>) -> Result<TuplePointer> {
        let _cs = self.enter_critical_section();
        let relation = self.find_relation(table)?;
        let row = Row::new(values);
        if row.len() != relation.schema.len() {
            return Err(Error::SchemaViolation(format!(
                "table {} expects {} values, got {}",
                table,
                relation.schema.len(),
                row.len()
            )));
        }

        let existing: Vec<Row> = self.scan_table(&relation)?.into_iter().map(|(_, r)| r).collect();
        self.catalog.with_data(|data| constraints::check_row(data, table, &relation.schema, &row, &existing))?;

        let referenced = self.gather_referenced_tables(&relation)?;
        self.catalog
            .with_data(|data| constraints::check_references(data, table, &relation.schema, &row, &referenced))?;

        let ptr = self.append_row(&relation, &row)?;
        self.index_insert_row(&relation, &row, ptr)?;
        self.redo_log.lock().record_mutation(MutationOp::Insert, table, row)?;
        tracing::debug!(table, block = ptr.block_addr, slot = ptr.slot_id, "inserted row");
        Ok(ptr)
    }

    /// Runs a SELECT, consulting the redo log's result cache first (R2:
    /// a cached entry is honored only if it is no older than the table's
    /// last recorded mutation) and populating it afterward on a miss.
    pub fn select(&self, table: &str, projection: &[String], tokens: &[PostfixToken]) -> Result<(Schema, Vec<Row>)> {
        let _cs = self.enter_critical_section();
        let relation = self.find_relation(table)?;

        let predicate_tokens: Vec<String> = tokens.iter().map(|t| format!("{:?}", t)).collect();
        let query_id = wal::query_identifier(table, projection, &predicate_tokens);

        if let Some(cached) = self.redo_log.lock().lookup_select(&query_id, table) {
            tracing::debug!(table, "select cache hit");
            return Ok((cached.schema, cached.rows));
        }

        let rows: Vec<Row> = self.scan_table(&relation)?.into_iter().map(|(_, r)| r).collect();
        let selected = if tokens.is_empty() {
            rows
        } else {
            let evaluator = Evaluator::compile(tokens)?;
            operators::select(&relation.schema, &rows, &evaluator)?
        };
        let (out_schema, out_rows) = if projection.is_empty() {
            (relation.schema.clone(), selected)
        } else {
            operators::project(&relation.schema, &selected, projection)?
        };

        self.redo_log.lock().cache_select(
            query_id,
            table,
            SelectResult { schema: out_schema.clone(), rows: out_rows.clone() },
        )?;
        Ok((out_schema, out_rows))
    }

    /// Applies `assignments` to every row matching `tokens`, re-checking
    /// every constraint (including referential ones) against the changed
    /// row before committing it.
    pub fn update(&self, table: &str, tokens: &[PostfixToken], assignments: &[(String, Value)]) -> Result<usize> {
        let _cs = self.enter_critical_section();
        let relation = self.find_relation(table)?;
        let evaluator = if tokens.is_empty() { None } else { Some(Evaluator::compile(tokens)?) };
        let rows_with_ptrs = self.scan_table(&relation)?;
        let existing_rows: Vec<Row> = rows_with_ptrs.iter().map(|(_, r)| r.clone()).collect();
        let referenced = self.gather_referenced_tables(&relation)?;

        let mut updated = 0usize;
        for (ptr, row) in &rows_with_ptrs {
            let matches = match &evaluator {
                Some(e) => e.eval_predicate(row, &relation.schema)?,
                None => true,
            };
            if !matches {
                continue;
            }
            let mut new_values = row.values.clone();
            for (attr, value) in assignments {
                let idx = relation
                    .schema
                    .position_of(attr)
                    .ok_or_else(|| Error::SchemaViolation(format!("unknown attribute: {}", attr)))?;
                new_values[idx] = value.clone();
            }
            let new_row = Row::new(new_values);

            let others: Vec<Row> = existing_rows.iter().filter(|r| *r != row).cloned().collect();
            self.catalog.with_data(|data| constraints::check_row(data, table, &relation.schema, &new_row, &others))?;
            self.catalog
                .with_data(|data| constraints::check_references(data, table, &relation.schema, &new_row, &referenced))?;

            self.replace_row(&relation, *ptr, row, &new_row)?;
            self.redo_log.lock().record_mutation(MutationOp::Update, table, new_row)?;
            updated += 1;
        }
        tracing::debug!(table, updated, "update complete");
        Ok(updated)
    }

    /// Deletes every row matching `tokens`, applying the referential action
    /// (`RESTRICT`/`CASCADE`/`SET NULL`) of any foreign key that points at
    /// this table before freeing the row's own slots.
    pub fn delete(&self, table: &str, tokens: &[PostfixToken]) -> Result<usize> {
        let _cs = self.enter_critical_section();
        let relation = self.find_relation(table)?;
        let evaluator = if tokens.is_empty() { None } else { Some(Evaluator::compile(tokens)?) };
        let rows_with_ptrs = self.scan_table(&relation)?;

        let mut to_delete = Vec::new();
        for (ptr, row) in &rows_with_ptrs {
            let matches = match &evaluator {
                Some(e) => e.eval_predicate(row, &relation.schema)?,
                None => true,
            };
            if matches {
                to_delete.push((*ptr, row.clone()));
            }
        }

        for (_, row) in &to_delete {
            self.apply_referential_delete_effects(&relation, row)?;
        }
        for (ptr, row) in &to_delete {
            self.index_delete_row(&relation, row, *ptr)?;
            self.free_row_slots(&relation, *ptr)?;
            self.redo_log.lock().record_mutation(MutationOp::Delete, table, row.clone())?;
        }

        tracing::debug!(table, deleted = to_delete.len(), "delete complete");
        Ok(to_delete.len())
    }

    fn apply_referential_delete_effects(&self, relation: &Relation, row: &Row) -> Result<()> {
        let refs: Vec<Reference> = self
            .catalog
            .with_data(|d| d.references.iter().filter(|r| r.referenced_table == relation.obj_id).cloned().collect());

        for r in refs {
            let idx = relation
                .schema
                .position_of(&r.referenced_attr)
                .ok_or_else(|| Error::SchemaViolation(format!("unknown attribute: {}", r.referenced_attr)))?;
            let referenced_value = row.values[idx].clone();
            if referenced_value.is_null() {
                continue;
            }

            let dep_table = self
                .catalog
                .with_data(|d| d.find_relation_by_id(r.table).map(|rel| rel.name.clone()))
                .ok_or_else(|| Error::CorruptState("reference points at unknown table".to_string()))?;
            let dep_relation = self.find_relation(&dep_table)?;
            let dependents = self.scan_table(&dep_relation)?;

            let effect = self.catalog.with_data(|data| {
                constraints::referential_delete_effect(
                    data,
                    &relation.name,
                    &r.referenced_attr,
                    &referenced_value,
                    &dep_relation.schema,
                    &dependents,
                )
            })?;

            match effect {
                CascadeEffect::None => {}
                CascadeEffect::Restrict => {
                    return Err(Error::ConstraintViolation(format!(
                        "cannot delete from {}: referenced by {}",
                        relation.name, dep_table
                    )));
                }
                CascadeEffect::Cascade(ptrs) => {
                    for ptr in ptrs {
                        let (_, dep_row) = dependents
                            .iter()
                            .find(|(p, _)| *p == ptr)
                            .ok_or_else(|| Error::CorruptState("cascade pointer not found among dependents".to_string()))?;
                        self.index_delete_row(&dep_relation, dep_row, ptr)?;
                        self.free_row_slots(&dep_relation, ptr)?;
                    }
                }
                CascadeEffect::SetNull(ptrs) => {
                    let fk_idx = dep_relation
                        .schema
                        .position_of(&r.attr)
                        .ok_or_else(|| Error::SchemaViolation(format!("unknown attribute: {}", r.attr)))?;
                    for ptr in ptrs {
                        let (_, dep_row) = dependents
                            .iter()
                            .find(|(p, _)| *p == ptr)
                            .ok_or_else(|| Error::CorruptState("cascade pointer not found among dependents".to_string()))?;
                        let mut new_values = dep_row.values.clone();
                        new_values[fk_idx] = Value::Null;
                        self.replace_row(&dep_relation, ptr, dep_row, &Row::new(new_values))?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Installs a NOT NULL constraint, rejecting it if any existing row
    /// already has a null in `attr` (§4.9's installation rule).
    pub fn add_not_null_constraint(&self, table: &str, attr: &str, constraint_name: &str) -> Result<()> {
        let _cs = self.enter_critical_section();
        let relation = self.find_relation(table)?;
        let rows: Vec<Row> = self.scan_table(&relation)?.into_iter().map(|(_, r)| r).collect();
        if !constraints::can_install_not_null(&relation.schema, &rows, attr)? {
            return Err(Error::ConstraintViolation(format!(
                "cannot add NOT NULL to {}.{}: existing null values present",
                table, attr
            )));
        }
        self.catalog.mutate(&self.disk, |data| {
            if data.constraint_name_taken(constraint_name) {
                return Err(Error::DuplicateName(constraint_name.to_string()));
            }
            let obj_id = data.next_obj_id;
            data.next_obj_id += 1;
            data.not_null.push(ConstraintNotNull {
                obj_id,
                table: relation.obj_id,
                attr: attr.to_string(),
                constraint_name: constraint_name.to_string(),
            });
            Ok(())
        })
    }

    /// Installs a UNIQUE constraint, rejecting it if any two existing rows
    /// already share a non-null key on `attrs`.
    pub fn add_unique_constraint(&self, table: &str, attrs: &[String], constraint_name: &str) -> Result<()> {
        let _cs = self.enter_critical_section();
        let relation = self.find_relation(table)?;
        let rows: Vec<Row> = self.scan_table(&relation)?.into_iter().map(|(_, r)| r).collect();
        if !constraints::can_install_unique(&relation.schema, &rows, attrs)? {
            return Err(Error::ConstraintViolation(format!(
                "cannot add UNIQUE to {}.{:?}: existing duplicate values present",
                table, attrs
            )));
        }
        self.catalog.mutate(&self.disk, |data| {
            if data.constraint_name_taken(constraint_name) {
                return Err(Error::DuplicateName(constraint_name.to_string()));
            }
            let obj_id = data.next_obj_id;
            data.next_obj_id += 1;
            data.unique.push(ConstraintUnique {
                obj_id,
                table: relation.obj_id,
                attrs: attrs.to_vec(),
                constraint_name: constraint_name.to_string(),
            });
            Ok(())
        })
    }

    /// Installs a CHECK constraint, rejecting it if any existing non-null
    /// value already violates `op value`.
    pub fn add_check_constraint(&self, table: &str, attr: &str, op: CheckOp, value: Value, constraint_name: &str) -> Result<()> {
        let _cs = self.enter_critical_section();
        let relation = self.find_relation(table)?;
        let idx = relation
            .schema
            .position_of(attr)
            .ok_or_else(|| Error::SchemaViolation(format!("unknown attribute: {}", attr)))?;
        let rows: Vec<Row> = self.scan_table(&relation)?.into_iter().map(|(_, r)| r).collect();

        for row in &rows {
            let cell = &row.values[idx];
            if cell.is_null() {
                continue;
            }
            let ordering = expr::compare(cell, &value)?;
            let satisfies = match op {
                CheckOp::Eq => ordering == std::cmp::Ordering::Equal,
                CheckOp::Ne => ordering != std::cmp::Ordering::Equal,
                CheckOp::Lt => ordering == std::cmp::Ordering::Less,
                CheckOp::Gt => ordering == std::cmp::Ordering::Greater,
                CheckOp::Le => ordering != std::cmp::Ordering::Greater,
                CheckOp::Ge => ordering != std::cmp::Ordering::Less,
            };
            if !satisfies {
                return Err(Error::ConstraintViolation(format!(
                    "cannot add CHECK to {}.{}: existing value violates it",
                    table, attr
                )));
            }
        }

        self.catalog.mutate(&self.disk, |data| {
            if data.constraint_name_taken(constraint_name) {
                return Err(Error::DuplicateName(constraint_name.to_string()));
            }
            let obj_id = data.next_obj_id;
            data.next_obj_id += 1;
            data.check.push(ConstraintCheck {
                obj_id,
                table: relation.obj_id,
                constraint_name: constraint_name.to_string(),
                attr: attr.to_string(),
                op,
                value,
            });
            Ok(())
        })
    }

    /// Installs a BETWEEN constraint, rejecting it if any existing value is
    /// null or falls outside `[lo, hi]`.
    pub fn add_between_constraint(&self, table: &str, attr: &str, lo: Value, hi: Value, constraint_name: &str) -> Result<()> {
        let _cs = self.enter_critical_section();
        let relation = self.find_relation(table)?;
        let idx = relation
            .schema
            .position_of(attr)
            .ok_or_else(|| Error::SchemaViolation(format!("unknown attribute: {}", attr)))?;
        let rows: Vec<Row> = self.scan_table(&relation)?.into_iter().map(|(_, r)| r).collect();

        for row in &rows {
            let cell = &row.values[idx];
            if cell.is_null() {
                return Err(Error::ConstraintViolation(format!(
                    "cannot add BETWEEN to {}.{}: existing null value",
                    table, attr
                )));
            }
            let ge_lo = expr::compare(cell, &lo)? != std::cmp::Ordering::Less;
            let le_hi = expr::compare(cell, &hi)? != std::cmp::Ordering::Greater;
            if !(ge_lo && le_hi) {
                return Err(Error::ConstraintViolation(format!(
                    "cannot add BETWEEN to {}.{}: existing value out of range",
                    table, attr
                )));
            }
        }

        self.catalog.mutate(&self.disk, |data| {
            if data.constraint_name_taken(constraint_name) {
                return Err(Error::DuplicateName(constraint_name.to_string()));
            }
            let obj_id = data.next_obj_id;
            data.next_obj_id += 1;
            data.between.push(ConstraintBetween {
                obj_id,
                table: relation.obj_id,
                constraint_name: constraint_name.to_string(),
                attr: attr.to_string(),
                lo,
                hi,
            });
            Ok(())
        })
    }

    /// Installs a foreign key from `table.attr` to `referenced_table.referenced_attr`,
    /// rejecting it if any existing non-null value in `table.attr` has no match.
    pub fn add_reference(
        &self,
        table: &str,
        attr: &str,
        referenced_table: &str,
        referenced_attr: &str,
        action: ReferentialAction,
    ) -> Result<()> {
        let _cs = self.enter_critical_section();
        let relation = self.find_relation(table)?;
        let ref_relation = self.find_relation(referenced_table)?;
        let idx = relation
            .schema
            .position_of(attr)
            .ok_or_else(|| Error::SchemaViolation(format!("unknown attribute: {}", attr)))?;
        let ref_idx = ref_relation
            .schema
            .position_of(referenced_attr)
            .ok_or_else(|| Error::SchemaViolation(format!("unknown attribute: {}", referenced_attr)))?;

        let rows: Vec<Row> = self.scan_table(&relation)?.into_iter().map(|(_, r)| r).collect();
        let ref_rows: Vec<Row> = self.scan_table(&ref_relation)?.into_iter().map(|(_, r)| r).collect();

        for row in &rows {
            let value = &row.values[idx];
            if value.is_null() {
                continue;
            }
            let found = ref_rows.iter().any(|rr| {
                let rv = &rr.values[ref_idx];
                !rv.is_null() && expr::compare(rv, value).map(|o| o == std::cmp::Ordering::Equal).unwrap_or(false)
            });
            if !found {
                return Err(Error::ConstraintViolation(format!(
                    "cannot add reference {}.{} -> {}.{}: existing value has no match",
                    table, attr, referenced_table, referenced_attr
                )));
            }
        }

        self.catalog.mutate(&self.disk, |data| {
            let obj_id = data.next_obj_id;
            data.next_obj_id += 1;
            data.references.push(Reference {
                obj_id,
                table: relation.obj_id,
                attr: attr.to_string(),
                referenced_table: ref_relation.obj_id,
                referenced_attr: referenced_attr.to_string(),
                action,
            });
            Ok(())
        })
    }

    /// Builds a hash index over `columns` of an existing table, indexing
    /// every row already present (§4.6). Subsequent `insert`/`update`/
    /// `delete` calls keep the index in step automatically.
    pub fn create_index(&self, table: &str, name: &str, columns: &[String]) -> Result<()> {
        let _cs = self.enter_critical_section();
        let relation = self.find_relation(table)?;
        for col in columns {
            relation
                .schema
                .position_of(col)
                .ok_or_else(|| Error::SchemaViolation(format!("unknown attribute: {}", col)))?;
        }
        if self.catalog.with_data(|d| d.indexes.iter().any(|i| i.name.eq_ignore_ascii_case(name))) {
            return Err(Error::DuplicateName(name.to_string()));
        }

        let head_extent = self.disk.allocate_extent(1, SegmentKind::Index)?;
        HashIndex::init(&self.cache, head_extent.from)?;
        let index = HashIndex::new(head_extent.from);

        for (ptr, row) in self.scan_table(&relation)? {
            let key = Self::index_key(&relation.schema, &row, columns)?;
            index.insert(&self.cache, &self.disk, &mut Vec::new(), key, ptr)?;
        }

        self.catalog.mutate(&self.disk, |data| {
            let obj_id = data.next_obj_id;
            data.next_obj_id += 1;
            data.indexes.push(IndexEntry {
                obj_id,
                name: name.to_string(),
                table_ref: relation.obj_id,
                columns: columns.to_vec(),
                head_block: head_extent.from,
            });
            Ok(())
        })?;
        tracing::info!(table, index = name, "created index");
        Ok(())
    }

    /// Point lookup by index name: computes the same combined hash key
    /// `create_index` would from `values` (in the same column order the
    /// index was built over), follows the bucket chain for candidates, then
    /// reads each candidate row back and keeps only the ones that actually
    /// match (hash collisions are expected and must be filtered, §4.6).
    pub fn index_lookup(&self, index_name: &str, values: &[Value]) -> Result<Vec<Row>> {
        let _cs = self.enter_critical_section();
        let entry = self
            .catalog
            .with_data(|d| d.indexes.iter().find(|i| i.name.eq_ignore_ascii_case(index_name)).cloned())
            .ok_or_else(|| Error::NotFound(format!("index {}", index_name)))?;
        let relation = self
            .catalog
            .with_data(|d| d.find_relation_by_id(entry.table_ref).cloned())
            .ok_or_else(|| Error::CorruptState("index points at unknown table".to_string()))?;

        let mut key = 0i64;
        for value in values {
            key = key.wrapping_add(value.hash_contribution());
        }

        let index = HashIndex::new(entry.head_block);
        let candidates = index.lookup(&self.cache, key)?;

        let mut out = Vec::new();
        for ptr in candidates {
            let k = relation.schema.len() as u16;
            let block = self.cache.get(ptr.block_addr)?;
            let mut row_values = Vec::with_capacity(k as usize);
            for i in 0..k {
                let Some(bytes) = block.read_tuple(ptr.slot_id + i) else {
                    // Row was deleted after this candidate was recorded; the
                    // index is cleaned up by `delete`/`replace_row`, but a
                    // stale pointer here just means no match, not corruption.
                    row_values.clear();
                    break;
                };
                row_values.push(decode_value(bytes)?);
            }
            if row_values.len() != k as usize {
                continue;
            }
            let row = Row::new(row_values);
            let matches = entry
                .columns
                .iter()
                .zip(values)
                .all(|(col, expected)| {
                    relation.schema.position_of(col).map(|idx| &row.values[idx] == expected).unwrap_or(false)
                });
            if matches {
                out.push(row);
            }
        }
        Ok(out)
    }

    /// Flushes every dirty cached block to disk, commits and archives the
    /// redo log. The CLI collaborator calls this from its own SIGINT
    /// handler; `Drop` calls it too so a caller that skips it explicitly
    /// still leaves a consistent file (§6).
    pub fn archive_and_flush(&self) -> Result<()> {
        let _cs = self.enter_critical_section();
        self.cache.flush()?;
        let mut log = self.redo_log.lock();
        log.commit();
        log.archive()?;
        drop(log);
        self.disk.flush()?;
        tracing::info!("archived and flushed database engine");
        Ok(())
    }
}

impl Drop for DatabaseEngine {
    fn drop(&mut self) {
        if let Err(e) = self.archive_and_flush() {
            tracing::warn!(error = %e, "failed to flush database engine on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::expr::Operator;
    use crate::types::{Column, DataType};

    fn temp_config(name: &str) -> Config {
        let dir = std::env::temp_dir().join(format!("flintbase-engine-test-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        Config {
            database_file_path: dir.join("data.db").to_string_lossy().into_owned(),
            archivelog_directory: dir.join("archivelog").to_string_lossy().into_owned(),
            cache_capacity: 16,
            max_redo_log_entries: 32,
            ..Config::default()
        }
    }

    fn student_schema() -> Schema {
        Schema::new(vec![
            Column { name: "id".to_string(), data_type: DataType::Int },
            Column { name: "name".to_string(), data_type: DataType::String },
            Column { name: "age".to_string(), data_type: DataType::Int },
        ])
    }

    #[test]
    fn create_insert_and_select_round_trips() {
        let engine = DatabaseEngine::open(temp_config("roundtrip")).unwrap();
        engine.create_table("student", student_schema()).unwrap();
        engine.insert("student", vec![Value::Int(1), Value::String("alice".to_string()), Value::Int(20)]).unwrap();
        engine.insert("student", vec![Value::Int(2), Value::String("bob".to_string()), Value::Int(22)]).unwrap();

        let tokens = vec![
            PostfixToken::AttributeRef("age".to_string()),
            PostfixToken::Literal(Value::Int(21)),
            PostfixToken::Operator(Operator::Gt),
        ];
        let (schema, rows) = engine.select("student", &[], &tokens).unwrap();
        assert_eq!(schema.len(), 3);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].values[1], Value::String("bob".to_string()));
    }

    #[test]
    fn insert_spanning_many_rows_extends_the_segment() {
        let engine = DatabaseEngine::open(temp_config("extend")).unwrap();
        engine.create_table("student", student_schema()).unwrap();
        for i in 0..500 {
            engine
                .insert("student", vec![Value::Int(i), Value::String(format!("student-{}", i)), Value::Int(18)])
                .unwrap();
        }
        let (_, rows) = engine.select("student", &[], &[]).unwrap();
        assert_eq!(rows.len(), 500);
    }

    #[test]
    fn unique_constraint_blocks_duplicate_insert() {
        let engine = DatabaseEngine::open(temp_config("unique")).unwrap();
        engine.create_table("student", student_schema()).unwrap();
        engine.add_unique_constraint("student", &["id".to_string()], "uq_student_id").unwrap();
        engine.insert("student", vec![Value::Int(1), Value::String("alice".to_string()), Value::Int(20)]).unwrap();
        let err = engine
            .insert("student", vec![Value::Int(1), Value::String("bob".to_string()), Value::Int(21)])
            .unwrap_err();
        assert!(matches!(err, Error::ConstraintViolation(_)));
    }

    #[test]
    fn update_changes_matching_rows_and_invalidates_select_cache() {
        let engine = DatabaseEngine::open(temp_config("update")).unwrap();
        engine.create_table("student", student_schema()).unwrap();
        engine.insert("student", vec![Value::Int(1), Value::String("alice".to_string()), Value::Int(20)]).unwrap();

        let (_, before) = engine.select("student", &[], &[]).unwrap();
        assert_eq!(before[0].values[2], Value::Int(20));

        let tokens = vec![
            PostfixToken::AttributeRef("id".to_string()),
            PostfixToken::Literal(Value::Int(1)),
            PostfixToken::Operator(Operator::Eq),
        ];
        let updated = engine.update("student", &tokens, &[("age".to_string(), Value::Int(21))]).unwrap();
        assert_eq!(updated, 1);

        let (_, after) = engine.select("student", &[], &[]).unwrap();
        assert_eq!(after[0].values[2], Value::Int(21));
    }

    #[test]
    fn cascade_delete_removes_dependent_rows() {
        let engine = DatabaseEngine::open(temp_config("cascade")).unwrap();
        engine.create_table("student", student_schema()).unwrap();
        let enrollment_schema = Schema::new(vec![
            Column { name: "student_id".to_string(), data_type: DataType::Int },
            Column { name: "course".to_string(), data_type: DataType::String },
        ]);
        engine.create_table("enrollment", enrollment_schema).unwrap();
        engine.add_reference("enrollment", "student_id", "student", "id", ReferentialAction::Cascade).unwrap();

        engine.insert("student", vec![Value::Int(1), Value::String("alice".to_string()), Value::Int(20)]).unwrap();
        engine.insert("enrollment", vec![Value::Int(1), Value::String("math".to_string())]).unwrap();

        let tokens = vec![
            PostfixToken::AttributeRef("id".to_string()),
            PostfixToken::Literal(Value::Int(1)),
            PostfixToken::Operator(Operator::Eq),
        ];
        let deleted = engine.delete("student", &tokens).unwrap();
        assert_eq!(deleted, 1);

        let (_, remaining) = engine.select("enrollment", &[], &[]).unwrap();
        assert!(remaining.is_empty());
    }

    #[test]
    fn restrict_reference_blocks_delete_of_referenced_row() {
        let engine = DatabaseEngine::open(temp_config("restrict")).unwrap();
        engine.create_table("student", student_schema()).unwrap();
        let enrollment_schema = Schema::new(vec![Column { name: "student_id".to_string(), data_type: DataType::Int }]);
        engine.create_table("enrollment", enrollment_schema).unwrap();
        engine.add_reference("enrollment", "student_id", "student", "id", ReferentialAction::Restrict).unwrap();

        engine.insert("student", vec![Value::Int(1), Value::String("alice".to_string()), Value::Int(20)]).unwrap();
        engine.insert("enrollment", vec![Value::Int(1)]).unwrap();

        let tokens = vec![
            PostfixToken::AttributeRef("id".to_string()),
            PostfixToken::Literal(Value::Int(1)),
            PostfixToken::Operator(Operator::Eq),
        ];
        let err = engine.delete("student", &tokens).unwrap_err();
        assert!(matches!(err, Error::ConstraintViolation(_)));
    }

    #[test]
    fn archive_and_flush_persists_across_reopen() {
        let config = temp_config("reopen");
        {
            let engine = DatabaseEngine::open(config.clone()).unwrap();
            engine.create_table("student", student_schema()).unwrap();
            engine.insert("student", vec![Value::Int(1), Value::String("alice".to_string()), Value::Int(20)]).unwrap();
            engine.archive_and_flush().unwrap();
        }
        let engine = DatabaseEngine::open(config).unwrap();
        let (_, rows) = engine.select("student", &[], &[]).unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn hash_index_build_and_point_lookup() {
        let engine = DatabaseEngine::open(temp_config("hash-index")).unwrap();
        let schema = Schema::new(vec![
            Column { name: "firstname".to_string(), data_type: DataType::String },
            Column { name: "year".to_string(), data_type: DataType::Int },
        ]);
        engine.create_table("student", schema).unwrap();
        engine.insert("student", vec![Value::String("Dino".to_string()), Value::Int(2010)]).unwrap();
        engine.insert("student", vec![Value::String("Mirko".to_string()), Value::Int(2001)]).unwrap();
        engine.insert("student", vec![Value::String("Ivan".to_string()), Value::Int(2000)]).unwrap();

        engine
            .create_index("student", "student_idx", &["firstname".to_string(), "year".to_string()])
            .unwrap();

        let found = engine.index_lookup("student_idx", &[Value::String("Dino".to_string()), Value::Int(2010)]).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].values[1], Value::Int(2010));

        let missing = engine.index_lookup("student_idx", &[Value::String("Ivan".to_string()), Value::Int(1999)]).unwrap();
        assert!(missing.is_empty());
    }

    #[test]
    fn insert_after_index_creation_stays_findable() {
        let engine = DatabaseEngine::open(temp_config("hash-index-live")).unwrap();
        let schema = Schema::new(vec![
            Column { name: "firstname".to_string(), data_type: DataType::String },
            Column { name: "year".to_string(), data_type: DataType::Int },
        ]);
        engine.create_table("student", schema).unwrap();
        engine.create_index("student", "student_idx", &["firstname".to_string()]).unwrap();
        engine.insert("student", vec![Value::String("Ana".to_string()), Value::Int(2012)]).unwrap();

        let found = engine.index_lookup("student_idx", &[Value::String("Ana".to_string())]).unwrap();
        assert_eq!(found.len(), 1);
    }
}
