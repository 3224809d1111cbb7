//! Constraint engine (L8, §4.9). Every function here is pure: it looks at
//! already-fetched rows and catalog state and returns either `Ok(())`/an
//! action to take, or a `ConstraintViolation`. None of it touches the disk —
//! the engine facade (L9) is responsible for fetching the rows these
//! functions need and for carrying out whatever they decide (deleting a
//! dependent row, nulling out a column), mirroring how `ops::operators`
//! works over already-materialized rows rather than doing its own I/O.

use crate::error::{Error, Result};
use crate::ops::expr;
use crate::storage::catalog::{CatalogData, CheckOp, ReferentialAction};
use crate::storage::extent::TuplePointer;
use crate::types::{Row, Schema, Value};

/// Runs every NOT NULL / UNIQUE / CHECK / BETWEEN check the catalog has
/// registered for `table` against a row about to be inserted. Referential
/// checks are separate (`check_references`) since they need the referenced
/// table's rows rather than `table`'s own.
pub fn check_row(catalog: &CatalogData, table: &str, schema: &Schema, row: &Row, existing_rows: &[Row]) -> Result<()> {
    check_not_null(catalog, table, schema, row)?;
    check_unique(catalog, table, schema, row, existing_rows)?;
    check_check(catalog, table, schema, row)?;
    check_between(catalog, table, schema, row)?;
    Ok(())
}

fn attr_value<'a>(schema: &Schema, row: &'a Row, attr: &str) -> Result<&'a Value> {
    let idx = schema
        .position_of(attr)
        .ok_or_else(|| Error::SchemaViolation(format!("unknown attribute: {}", attr)))?;
    row.get(idx).ok_or_else(|| Error::SchemaViolation(format!("row is missing attribute: {}", attr)))
}

pub fn check_not_null(catalog: &CatalogData, table: &str, schema: &Schema, row: &Row) -> Result<()> {
    for c in catalog.not_null.iter().filter(|c| table_name(catalog, c.table) == Some(table)) {
        if attr_value(schema, row, &c.attr)?.is_null() {
            return Err(Error::ConstraintViolation(format!(
                "{} violates NOT NULL constraint {} on {}.{}",
                table, c.constraint_name, table, c.attr
            )));
        }
    }
    Ok(())
}

pub fn check_unique(catalog: &CatalogData, table: &str, schema: &Schema, row: &Row, existing_rows: &[Row]) -> Result<()> {
    for c in catalog.unique.iter().filter(|c| table_name(catalog, c.table) == Some(table)) {
        let new_key = row_key(schema, row, &c.attrs)?;
        for existing in existing_rows {
            let existing_key = row_key(schema, existing, &c.attrs)?;
            if new_key == existing_key && !new_key.iter().any(|v| v.is_null()) {
                return Err(Error::ConstraintViolation(format!(
                    "{} violates UNIQUE constraint {} on {}.{:?}",
                    table, c.constraint_name, table, c.attrs
                )));
            }
        }
    }
    Ok(())
}

fn row_key(schema: &Schema, row: &Row, attrs: &[String]) -> Result<Vec<Value>> {
    attrs.iter().map(|a| attr_value(schema, row, a).cloned()).collect()
}

fn eval_check_op(op: CheckOp, lhs: &Value, rhs: &Value) -> Result<bool> {
    use std::cmp::Ordering;
    if lhs.is_null() || rhs.is_null() {
        return Ok(false);
    }
    let ordering = expr::compare(lhs, rhs)?;
    Ok(match op {
        CheckOp::Eq => ordering == Ordering::Equal,
        CheckOp::Ne => ordering != Ordering::Equal,
        CheckOp::Lt => ordering == Ordering::Less,
        CheckOp::Gt => ordering == Ordering::Greater,
        CheckOp::Le => ordering != Ordering::Greater,
        CheckOp::Ge => ordering != Ordering::Less,
    })
}

pub fn check_check(catalog: &CatalogData, table: &str, schema: &Schema, row: &Row) -> Result<()> {
    for c in catalog.check.iter().filter(|c| table_name(catalog, c.table) == Some(table)) {
        let value = attr_value(schema, row, &c.attr)?;
        if !eval_check_op(c.op, value, &c.value)? {
            return Err(Error::ConstraintViolation(format!(
                "{} violates CHECK constraint {} on {}.{}",
                table, c.constraint_name, table, c.attr
            )));
        }
    }
    Ok(())
}

pub fn check_between(catalog: &CatalogData, table: &str, schema: &Schema, row: &Row) -> Result<()> {
    for c in catalog.between.iter().filter(|c| table_name(catalog, c.table) == Some(table)) {
        let value = attr_value(schema, row, &c.attr)?;
        if value.is_null() {
            return Err(Error::ConstraintViolation(format!(
                "{} violates BETWEEN constraint {} on {}.{}",
                table, c.constraint_name, table, c.attr
            )));
        }
        let ge_lo = expr::compare(value, &c.lo)? != std::cmp::Ordering::Less;
        let le_hi = expr::compare(value, &c.hi)? != std::cmp::Ordering::Greater;
        if !(ge_lo && le_hi) {
            return Err(Error::ConstraintViolation(format!(
                "{} violates BETWEEN constraint {} on {}.{}",
                table, c.constraint_name, table, c.attr
            )));
        }
    }
    Ok(())
}

/// Checks every foreign key on `table` against the referenced table's
/// already-fetched rows. `referenced` maps a referenced table name to its
/// schema and rows, since one insert may need to check several FKs against
/// several different tables.
pub fn check_references(
    catalog: &CatalogData,
    table: &str,
    schema: &Schema,
    row: &Row,
    referenced: &std::collections::HashMap<String, (Schema, Vec<Row>)>,
) -> Result<()> {
    for r in catalog.references.iter().filter(|r| table_name(catalog, r.table) == Some(table)) {
        let value = attr_value(schema, row, &r.attr)?;
        if value.is_null() {
            continue;
        }
        let referenced_table = table_name(catalog, r.referenced_table).ok_or_else(|| {
            Error::CorruptState(format!("reference points at unknown table id {}", r.referenced_table))
        })?;
        let (ref_schema, ref_rows) = referenced.get(referenced_table).ok_or_else(|| {
            Error::InvalidArgument(format!("referenced table {} was not supplied for FK check", referenced_table))
        })?;
        let found = ref_rows
            .iter()
            .map(|rr| attr_value(ref_schema, rr, &r.referenced_attr))
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .any(|v| !v.is_null() && expr::compare(v, value).map(|o| o == std::cmp::Ordering::Equal).unwrap_or(false));
        if !found {
            return Err(Error::ConstraintViolation(format!(
                "{}.{} references {}.{} but no matching row exists",
                table, r.attr, referenced_table, r.referenced_attr
            )));
        }
    }
    Ok(())
}

fn table_name(catalog: &CatalogData, obj_id: u64) -> Option<&str> {
    catalog.find_relation_by_id(obj_id).map(|r| r.name.as_str())
}

/// Installation-time check for adding a NOT NULL constraint: every existing
/// row must already be non-null on the target attribute.
pub fn can_install_not_null(schema: &Schema, rows: &[Row], attr: &str) -> Result<bool> {
    let idx = schema
        .position_of(attr)
        .ok_or_else(|| Error::SchemaViolation(format!("unknown attribute: {}", attr)))?;
    Ok(rows.iter().all(|r| !r.values[idx].is_null()))
}

/// Installation-time check for adding a UNIQUE constraint: no two existing
/// rows may already share a key on the target attributes.
pub fn can_install_unique(schema: &Schema, rows: &[Row], attrs: &[String]) -> Result<bool> {
    let mut seen: Vec<Vec<Value>> = Vec::new();
    for row in rows {
        let key = row_key(schema, row, attrs)?;
        if key.iter().any(|v| v.is_null()) {
            continue;
        }
        if seen.contains(&key) {
            return Ok(false);
        }
        seen.push(key);
    }
    Ok(true)
}

/// What the engine facade must do to a dependent table after a referenced
/// row is deleted or has its key updated, decided by the FK's
/// `ReferentialAction`. The constraint engine only decides; the caller
/// performs the delete/update.
pub enum CascadeEffect {
    /// No dependents referenced the deleted value; nothing to do.
    None,
    /// `RESTRICT`: at least one dependent exists, so the delete must fail.
    Restrict,
    /// `CASCADE`: delete these dependent rows too.
    Cascade(Vec<TuplePointer>),
    /// `SET NULL`: null out the FK column on these dependent rows.
    SetNull(Vec<TuplePointer>),
}

/// Decides the cascade effect of deleting `referenced_value` from
/// `referenced_table.referenced_attr`, given the dependent table's
/// already-fetched rows (each paired with its `TuplePointer` so the caller
/// can act on the decision).
pub fn referential_delete_effect(
    catalog: &CatalogData,
    referenced_table: &str,
    referenced_attr: &str,
    referenced_value: &Value,
    dependent_schema: &Schema,
    dependents: &[(TuplePointer, Row)],
) -> Result<CascadeEffect> {
    let Some(reference) = catalog.references.iter().find(|r| {
        table_name(catalog, r.referenced_table) == Some(referenced_table) && r.referenced_attr == referenced_attr
    }) else {
        return Ok(CascadeEffect::None);
    };

    let mut matching = Vec::new();
    for (ptr, row) in dependents {
        let value = attr_value(dependent_schema, row, &reference.attr)?;
        if !value.is_null() && expr::compare(value, referenced_value)? == std::cmp::Ordering::Equal {
            matching.push(*ptr);
        }
    }
    if matching.is_empty() {
        return Ok(CascadeEffect::None);
    }

    Ok(match reference.action {
        ReferentialAction::Restrict => CascadeEffect::Restrict,
        ReferentialAction::Cascade => CascadeEffect::Cascade(matching),
        ReferentialAction::SetNull => CascadeEffect::SetNull(matching),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::catalog::{ConstraintBetween, ConstraintCheck, ConstraintNotNull, ConstraintUnique, Reference, Relation};
    use crate::storage::extent::{Extent, SegmentKind};
    use crate::types::{Column, DataType};

    fn student_schema() -> Schema {
        Schema::new(vec![
            Column { name: "id".to_string(), data_type: DataType::Int },
            Column { name: "name".to_string(), data_type: DataType::String },
            Column { name: "age".to_string(), data_type: DataType::Int },
        ])
    }

    fn catalog_with_relation(name: &str, schema: Schema) -> (CatalogData, u64) {
        let mut catalog = CatalogData::default();
        let obj_id = 1;
        catalog.relations.push(Relation {
            obj_id,
            name: name.to_string(),
            kind: SegmentKind::Table,
            extents: vec![Extent::new(1, 2)],
            schema,
        });
        catalog.next_obj_id = 2;
        (catalog, obj_id)
    }

    #[test]
    fn not_null_violation_is_detected() {
        let (mut catalog, obj_id) = catalog_with_relation("student", student_schema());
        catalog.not_null.push(ConstraintNotNull {
            obj_id: 10,
            table: obj_id,
            attr: "name".to_string(),
            constraint_name: "nn_name".to_string(),
        });
        let row = Row::new(vec![Value::Int(1), Value::Null, Value::Int(20)]);
        let err = check_row(&catalog, "student", &student_schema(), &row, &[]).unwrap_err();
        assert!(matches!(err, Error::ConstraintViolation(_)));
    }

    #[test]
    fn unique_violation_is_detected_against_existing_rows() {
        let (mut catalog, obj_id) = catalog_with_relation("student", student_schema());
        catalog.unique.push(ConstraintUnique {
            obj_id: 10,
            table: obj_id,
            attrs: vec!["id".to_string()],
            constraint_name: "uq_id".to_string(),
        });
        let existing = vec![Row::new(vec![Value::Int(1), Value::String("alice".to_string()), Value::Int(20)])];
        let new_row = Row::new(vec![Value::Int(1), Value::String("bob".to_string()), Value::Int(21)]);
        let err = check_row(&catalog, "student", &student_schema(), &new_row, &existing).unwrap_err();
        assert!(matches!(err, Error::ConstraintViolation(_)));
    }

    #[test]
    fn check_constraint_rejects_out_of_range_value() {
        let (mut catalog, obj_id) = catalog_with_relation("student", student_schema());
        catalog.check.push(ConstraintCheck {
            obj_id: 10,
            table: obj_id,
            constraint_name: "chk_age".to_string(),
            attr: "age".to_string(),
            op: CheckOp::Ge,
            value: Value::Int(0),
        });
        let row = Row::new(vec![Value::Int(1), Value::String("alice".to_string()), Value::Int(-1)]);
        let err = check_row(&catalog, "student", &student_schema(), &row, &[]).unwrap_err();
        assert!(matches!(err, Error::ConstraintViolation(_)));
    }

    #[test]
    fn between_constraint_rejects_value_outside_range() {
        let (mut catalog, obj_id) = catalog_with_relation("student", student_schema());
        catalog.between.push(ConstraintBetween {
            obj_id: 10,
            table: obj_id,
            constraint_name: "btw_age".to_string(),
            attr: "age".to_string(),
            lo: Value::Int(0),
            hi: Value::Int(120),
        });
        let row = Row::new(vec![Value::Int(1), Value::String("alice".to_string()), Value::Int(200)]);
        let err = check_row(&catalog, "student", &student_schema(), &row, &[]).unwrap_err();
        assert!(matches!(err, Error::ConstraintViolation(_)));
    }

    #[test]
    fn reference_check_rejects_value_with_no_match_in_referenced_table() {
        let (mut catalog, student_id) = catalog_with_relation("student", student_schema());
        let course_schema = Schema::new(vec![Column { name: "code".to_string(), data_type: DataType::String }]);
        catalog.relations.push(Relation {
            obj_id: 2,
            name: "course".to_string(),
            kind: SegmentKind::Table,
            extents: vec![Extent::new(2, 3)],
            schema: course_schema.clone(),
        });
        catalog.references.push(Reference {
            obj_id: 10,
            table: student_id,
            attr: "name".to_string(),
            referenced_table: 2,
            referenced_attr: "code".to_string(),
            action: ReferentialAction::Restrict,
        });

        let mut referenced = std::collections::HashMap::new();
        referenced.insert("course".to_string(), (course_schema, vec![Row::new(vec![Value::String("cs101".to_string())])]));

        let row = Row::new(vec![Value::Int(1), Value::String("nope".to_string()), Value::Int(20)]);
        let err = check_references(&catalog, "student", &student_schema(), &row, &referenced).unwrap_err();
        assert!(matches!(err, Error::ConstraintViolation(_)));
    }

    #[test]
    fn can_install_unique_detects_existing_duplicates() {
        let rows = vec![
            Row::new(vec![Value::Int(1), Value::String("a".to_string()), Value::Int(20)]),
            Row::new(vec![Value::Int(1), Value::String("b".to_string()), Value::Int(21)]),
        ];
        assert!(!can_install_unique(&student_schema(), &rows, &["id".to_string()]).unwrap());
    }

    #[test]
    fn can_install_not_null_passes_when_no_existing_null() {
        let rows = vec![Row::new(vec![Value::Int(1), Value::String("a".to_string()), Value::Int(20)])];
        assert!(can_install_not_null(&student_schema(), &rows, "name").unwrap());
    }

    #[test]
    fn cascade_delete_effect_collects_matching_dependents() {
        let (mut catalog, student_id) = catalog_with_relation("student", student_schema());
        let enrollment_schema =
            Schema::new(vec![Column { name: "student_id".to_string(), data_type: DataType::Int }]);
        catalog.references.push(Reference {
            obj_id: 10,
            table: 2,
            attr: "student_id".to_string(),
            referenced_table: student_id,
            referenced_attr: "id".to_string(),
            action: ReferentialAction::Cascade,
        });

        let dependents = vec![
            (TuplePointer::new(5, 0), Row::new(vec![Value::Int(1)])),
            (TuplePointer::new(5, 1), Row::new(vec![Value::Int(2)])),
        ];
        let effect = referential_delete_effect(&catalog, "student", "id", &Value::Int(1), &enrollment_schema, &dependents).unwrap();
        match effect {
            CascadeEffect::Cascade(ptrs) => assert_eq!(ptrs, vec![TuplePointer::new(5, 0)]),
            _ => panic!("expected cascade effect"),
        }
    }
}
