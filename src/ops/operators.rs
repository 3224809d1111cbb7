//! Relational operators (§4.7): selection, projection, sorting, the set
//! operators, joins, and aggregation. Each takes whole materialized row
//! vectors rather than a pull-based iterator chain, mirroring how the rest
//! of this engine favors simple, eagerly-materialized structures over lazy
//! combinators. Every operator logs its shape on entry so a slow query can
//! be diagnosed from the trace log alone.

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::ops::expr::{self, Evaluator};
use crate::types::{Column, DataType, Row, Schema, Value};

/// Keeps only the rows for which `predicate` evaluates true.
pub fn select(schema: &Schema, rows: &[Row], predicate: &Evaluator) -> Result<Vec<Row>> {
    tracing::debug!(input_rows = rows.len(), "selection");
    let mut out = Vec::new();
    for row in rows {
        if predicate.eval_predicate(row, schema)? {
            out.push(row.clone());
        }
    }
    tracing::debug!(output_rows = out.len(), "selection complete");
    Ok(out)
}

/// Restricts every row to the named attributes, in the given order.
pub fn project(schema: &Schema, rows: &[Row], attrs: &[String]) -> Result<(Schema, Vec<Row>)> {
    tracing::debug!(input_rows = rows.len(), attrs = ?attrs, "projection");
    let out_schema = schema.restrict(attrs)?;
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(row.project(schema, attrs)?);
    }
    Ok((out_schema, out))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

/// A single ORDER BY key: an attribute position plus direction.
#[derive(Debug, Clone, Copy)]
pub struct SortKey {
    pub column: usize,
    pub direction: SortDirection,
}

/// Sorts rows by materializing them into a `Vec` and sorting in place —
/// there is no external merge sort here, since a table is expected to fit in
/// memory once selected and projected down (§4.7's Non-goals).
pub fn sort(rows: &[Row], keys: &[SortKey]) -> Result<Vec<Row>> {
    tracing::debug!(input_rows = rows.len(), keys = keys.len(), "sort");
    let mut out = rows.to_vec();
    let mut sort_err: Option<Error> = None;
    out.sort_by(|a, b| {
        if sort_err.is_some() {
            return Ordering::Equal;
        }
        for key in keys {
            let (Some(av), Some(bv)) = (a.get(key.column), b.get(key.column)) else {
                sort_err = Some(Error::SchemaViolation("sort key out of range".to_string()));
                return Ordering::Equal;
            };
            let ordering = match (av.is_null(), bv.is_null()) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Less,
                (false, true) => Ordering::Greater,
                (false, false) => match expr::compare(av, bv) {
                    Ok(o) => o,
                    Err(e) => {
                        sort_err = Some(e);
                        Ordering::Equal
                    }
                },
            };
            let ordering = if key.direction == SortDirection::Descending { ordering.reverse() } else { ordering };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
    if let Some(e) = sort_err {
        return Err(e);
    }
    Ok(out)
}

fn row_key(row: &Row) -> Vec<String> {
    row.values.iter().map(|v| format!("{:?}", v)).collect()
}

/// UNION, INTERSECT, and EXCEPT, implemented as a sort-merge over the
/// stringified row keys (§4.7: set operators require matching schemas and
/// operate on sorted input).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOp {
    Union,
    Intersect,
    Except,
}

pub fn set_operation(schema: &Schema, left: &[Row], right: &[Row], op: SetOp) -> Result<Vec<Row>> {
    tracing::debug!(left_rows = left.len(), right_rows = right.len(), op = ?op, "set operation");
    let left_keys: Vec<SortKey> =
        (0..schema.len()).map(|i| SortKey { column: i, direction: SortDirection::Ascending }).collect();
    let left_sorted = sort(left, &left_keys)?;
    let right_sorted = sort(right, &left_keys)?;

    let mut out = Vec::new();
    let mut li = 0;
    let mut ri = 0;
    while li < left_sorted.len() || ri < right_sorted.len() {
        let lk = left_sorted.get(li).map(row_key);
        let rk = right_sorted.get(ri).map(row_key);
        match (lk, rk) {
            (Some(l), Some(r)) if l == r => {
                if matches!(op, SetOp::Union | SetOp::Intersect) {
                    out.push(left_sorted[li].clone());
                }
                li += 1;
                ri += 1;
            }
            (Some(l), Some(r)) if l < r => {
                if matches!(op, SetOp::Union | SetOp::Except) {
                    out.push(left_sorted[li].clone());
                }
                li += 1;
            }
            (Some(_), Some(_)) => {
                if op == SetOp::Union {
                    out.push(right_sorted[ri].clone());
                }
                ri += 1;
            }
            (Some(_), None) => {
                if matches!(op, SetOp::Union | SetOp::Except) {
                    out.push(left_sorted[li].clone());
                }
                li += 1;
            }
            (None, Some(_)) => {
                if op == SetOp::Union {
                    out.push(right_sorted[ri].clone());
                }
                ri += 1;
            }
            (None, None) => break,
        }
    }
    Ok(out)
}

fn concat_schema(left: &Schema, right: &Schema) -> Schema {
    let mut columns = left.columns.clone();
    columns.extend(right.columns.clone());
    Schema::new(columns)
}

fn concat_row(left: &Row, right: &Row) -> Row {
    let mut values = left.values.clone();
    values.extend(right.values.clone());
    Row::new(values)
}

/// Every combination of a left row and a right row, with no filtering.
pub fn cartesian_product(
    left_schema: &Schema,
    left: &[Row],
    right_schema: &Schema,
    right: &[Row],
) -> (Schema, Vec<Row>) {
    tracing::debug!(left_rows = left.len(), right_rows = right.len(), "cartesian product");
    let schema = concat_schema(left_schema, right_schema);
    let mut out = Vec::with_capacity(left.len() * right.len());
    for l in left {
        for r in right {
            out.push(concat_row(l, r));
        }
    }
    (schema, out)
}

/// Joins on equality of every attribute name shared between the two
/// schemas, keeping one copy of each shared column.
pub fn natural_join(left_schema: &Schema, left: &[Row], right_schema: &Schema, right: &[Row]) -> Result<(Schema, Vec<Row>)> {
    let shared: Vec<String> = left_schema
        .columns
        .iter()
        .filter(|c| right_schema.position_of(&c.name).is_some())
        .map(|c| c.name.clone())
        .collect();
    tracing::debug!(left_rows = left.len(), right_rows = right.len(), shared = ?shared, "natural join");

    let right_only: Vec<String> = right_schema
        .columns
        .iter()
        .filter(|c| left_schema.position_of(&c.name).is_none())
        .map(|c| c.name.clone())
        .collect();

    let mut out_columns = left_schema.columns.clone();
    for name in &right_only {
        let idx = right_schema.position_of(name).unwrap();
        out_columns.push(right_schema.columns[idx].clone());
    }
    let out_schema = Schema::new(out_columns);

    let mut out = Vec::new();
    for l in left {
        for r in right {
            let mut matches_all = true;
            for name in &shared {
                let li = left_schema.position_of(name).unwrap();
                let ri = right_schema.position_of(name).unwrap();
                if expr::compare(&l.values[li], &r.values[ri])? != Ordering::Equal {
                    matches_all = false;
                    break;
                }
            }
            if matches_all {
                let mut values = l.values.clone();
                for name in &right_only {
                    let ri = right_schema.position_of(name).unwrap();
                    values.push(r.values[ri].clone());
                }
                out.push(Row::new(values));
            }
        }
    }
    Ok((out_schema, out))
}

/// Joins on an arbitrary predicate evaluated against the concatenated row.
pub fn theta_join(left_schema: &Schema, left: &[Row], right_schema: &Schema, right: &[Row], predicate: &Evaluator) -> Result<(Schema, Vec<Row>)> {
    tracing::debug!(left_rows = left.len(), right_rows = right.len(), "theta join");
    let schema = concat_schema(left_schema, right_schema);
    let mut out = Vec::new();
    for l in left {
        for r in right {
            let combined = concat_row(l, r);
            if predicate.eval_predicate(&combined, &schema)? {
                out.push(combined);
            }
        }
    }
    Ok((schema, out))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFn {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

/// One aggregate to compute, over a named attribute (ignored for `Count(*)`).
#[derive(Debug, Clone)]
pub struct Aggregate {
    pub func: AggregateFn,
    pub attr: Option<String>,
    pub alias: String,
}

/// Groups rows by `group_by` attributes and computes the requested
/// aggregates within each group, via an accumulator map keyed by the
/// stringified group values — the same approach the engine uses for
/// deduplicating rows in the set operators.
pub fn aggregate(schema: &Schema, rows: &[Row], group_by: &[String], aggregates: &[Aggregate]) -> Result<(Schema, Vec<Row>)> {
    tracing::debug!(input_rows = rows.len(), groups = ?group_by, aggregates = aggregates.len(), "aggregation");

    let group_idxs: Vec<usize> = group_by
        .iter()
        .map(|name| schema.position_of(name).ok_or_else(|| Error::SchemaViolation(format!("unknown attribute: {}", name))))
        .collect::<Result<_>>()?;

    let mut out_columns: Vec<Column> = group_by
        .iter()
        .map(|name| schema.columns[schema.position_of(name).unwrap()].clone())
        .collect();
    for agg in aggregates {
        let data_type = match agg.func {
            AggregateFn::Count => DataType::Int,
            AggregateFn::Avg => DataType::Float,
            _ => match &agg.attr {
                Some(name) => schema.columns[schema
                    .position_of(name)
                    .ok_or_else(|| Error::SchemaViolation(format!("unknown attribute: {}", name)))?]
                .data_type,
                None => DataType::Int,
            },
        };
        out_columns.push(Column { name: agg.alias.clone(), data_type });
    }
    let out_schema = Schema::new(out_columns);

    struct Acc {
        key_values: Vec<Value>,
        count: i64,
        sums: Vec<f64>,
        counts: Vec<i64>,
        mins: Vec<Option<Value>>,
        maxs: Vec<Option<Value>>,
    }

    let mut groups: HashMap<Vec<String>, Acc> = HashMap::new();
    let mut order: Vec<Vec<String>> = Vec::new();

    for row in rows {
        let key_values: Vec<Value> = group_idxs.iter().map(|&i| row.values[i].clone()).collect();
        let key: Vec<String> = key_values.iter().map(|v| format!("{:?}", v)).collect();

        let entry = groups.entry(key.clone()).or_insert_with(|| {
            order.push(key.clone());
            Acc {
                key_values: key_values.clone(),
                count: 0,
                sums: vec![0.0; aggregates.len()],
                counts: vec![0; aggregates.len()],
                mins: vec![None; aggregates.len()],
                maxs: vec![None; aggregates.len()],
            }
        });
        entry.count += 1;

        for (i, agg) in aggregates.iter().enumerate() {
            if agg.func == AggregateFn::Count {
                entry.counts[i] += 1;
                continue;
            }
            let attr = agg
                .attr
                .as_ref()
                .ok_or_else(|| Error::InvalidArgument(format!("{:?} requires an attribute", agg.func)))?;
            let idx = schema
                .position_of(attr)
                .ok_or_else(|| Error::SchemaViolation(format!("unknown attribute: {}", attr)))?;
            let value = &row.values[idx];
            if value.is_null() {
                continue;
            }
            entry.counts[i] += 1;
            match agg.func {
                AggregateFn::Sum | AggregateFn::Avg => {
                    let n = value
                        .as_f64()
                        .ok_or_else(|| Error::SchemaViolation(format!("{:?} requires a numeric attribute", agg.func)))?;
                    entry.sums[i] += n;
                }
                AggregateFn::Min => {
                    let replace = match &entry.mins[i] {
                        None => true,
                        Some(current) => expr::compare(value, current)? == Ordering::Less,
                    };
                    if replace {
                        entry.mins[i] = Some(value.clone());
                    }
                }
                AggregateFn::Max => {
                    let replace = match &entry.maxs[i] {
                        None => true,
                        Some(current) => expr::compare(value, current)? == Ordering::Greater,
                    };
                    if replace {
                        entry.maxs[i] = Some(value.clone());
                    }
                }
                AggregateFn::Count => unreachable!("handled above"),
            }
        }
    }

    let mut out = Vec::with_capacity(order.len());
    for key in &order {
        let acc = &groups[key];
        let mut values = acc.key_values.clone();
        for (i, agg) in aggregates.iter().enumerate() {
            let value = match agg.func {
                AggregateFn::Count => Value::Int(acc.counts[i]),
                AggregateFn::Sum => Value::Float(acc.sums[i]),
                AggregateFn::Avg => {
                    if acc.counts[i] == 0 {
                        Value::Null
                    } else {
                        Value::Float(acc.sums[i] / acc.counts[i] as f64)
                    }
                }
                AggregateFn::Min => acc.mins[i].clone().unwrap_or(Value::Null),
                AggregateFn::Max => acc.maxs[i].clone().unwrap_or(Value::Null),
            };
            values.push(value);
        }
        out.push(Row::new(values));
    }
    tracing::debug!(output_rows = out.len(), "aggregation complete");
    Ok((out_schema, out))
}

/// Removes duplicate rows, used after projections and by the set operators'
/// callers when DISTINCT is requested explicitly.
pub fn distinct(rows: &[Row]) -> Vec<Row> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for row in rows {
        if seen.insert(row_key(row)) {
            out.push(row.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::expr::{Operator, PostfixToken};
    use crate::types::{Column, DataType};

    fn student_schema() -> Schema {
        Schema::new(vec![
            Column { name: "id".to_string(), data_type: DataType::Int },
            Column { name: "name".to_string(), data_type: DataType::String },
            Column { name: "age".to_string(), data_type: DataType::Int },
        ])
    }

    fn students() -> Vec<Row> {
        vec![
            Row::new(vec![Value::Int(1), Value::String("alice".to_string()), Value::Int(20)]),
            Row::new(vec![Value::Int(2), Value::String("bob".to_string()), Value::Int(22)]),
            Row::new(vec![Value::Int(3), Value::String("carol".to_string()), Value::Int(22)]),
        ]
    }

    #[test]
    fn select_filters_rows_matching_predicate() {
        let tokens = vec![
            PostfixToken::AttributeRef("age".to_string()),
            PostfixToken::Literal(Value::Int(22)),
            PostfixToken::Operator(Operator::Eq),
        ];
        let predicate = Evaluator::compile(&tokens).unwrap();
        let out = select(&student_schema(), &students(), &predicate).unwrap();
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn project_restricts_and_reorders_columns() {
        let (schema, rows) = project(&student_schema(), &students(), &["name".to_string(), "id".to_string()]).unwrap();
        assert_eq!(schema.columns[0].name, "name");
        assert_eq!(rows[0].values[0], Value::String("alice".to_string()));
    }

    #[test]
    fn sort_orders_by_key_then_direction() {
        let out = sort(
            &students(),
            &[SortKey { column: 2, direction: SortDirection::Descending }, SortKey { column: 1, direction: SortDirection::Ascending }],
        )
        .unwrap();
        assert_eq!(out[0].values[1], Value::String("bob".to_string()));
        assert_eq!(out[1].values[1], Value::String("carol".to_string()));
    }

    #[test]
    fn set_union_deduplicates_matching_rows() {
        let schema = student_schema();
        let a = vec![students()[0].clone(), students()[1].clone()];
        let b = vec![students()[1].clone(), students()[2].clone()];
        let out = set_operation(&schema, &a, &b, SetOp::Union).unwrap();
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn set_intersect_keeps_only_shared_rows() {
        let schema = student_schema();
        let a = vec![students()[0].clone(), students()[1].clone()];
        let b = vec![students()[1].clone(), students()[2].clone()];
        let out = set_operation(&schema, &a, &b, SetOp::Intersect).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].values[0], Value::Int(2));
    }

    #[test]
    fn cartesian_product_has_left_times_right_rows() {
        let left = vec![Row::new(vec![Value::Int(1)])];
        let right = vec![Row::new(vec![Value::Int(10)]), Row::new(vec![Value::Int(20)])];
        let left_schema = Schema::new(vec![Column { name: "a".to_string(), data_type: DataType::Int }]);
        let right_schema = Schema::new(vec![Column { name: "b".to_string(), data_type: DataType::Int }]);
        let (schema, rows) = cartesian_product(&left_schema, &left, &right_schema, &right);
        assert_eq!(rows.len(), 2);
        assert_eq!(schema.columns.len(), 2);
    }

    #[test]
    fn natural_join_matches_on_shared_attribute_name() {
        let enrollments_schema = Schema::new(vec![
            Column { name: "id".to_string(), data_type: DataType::Int },
            Column { name: "course".to_string(), data_type: DataType::String },
        ]);
        let enrollments = vec![
            Row::new(vec![Value::Int(1), Value::String("math".to_string())]),
            Row::new(vec![Value::Int(4), Value::String("art".to_string())]),
        ];
        let (schema, rows) = natural_join(&student_schema(), &students(), &enrollments_schema, &enrollments).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(schema.columns.len(), 4);
    }

    #[test]
    fn aggregation_groups_and_computes_count_and_avg() {
        let aggs = vec![
            Aggregate { func: AggregateFn::Count, attr: None, alias: "n".to_string() },
            Aggregate { func: AggregateFn::Avg, attr: Some("age".to_string()), alias: "avg_age".to_string() },
        ];
        let (schema, rows) = aggregate(&student_schema(), &students(), &["age".to_string()], &aggs).unwrap();
        assert_eq!(schema.columns.len(), 3);
        let by_age: HashMap<i64, (i64, f64)> = rows
            .iter()
            .map(|r| {
                let age = r.values[0].as_i64().unwrap();
                let n = r.values[1].as_i64().unwrap();
                let avg = r.values[2].as_f64().unwrap();
                (age, (n, avg))
            })
            .collect();
        assert_eq!(by_age[&22], (2, 22.0));
        assert_eq!(by_age[&20], (1, 20.0));
    }

    #[test]
    fn distinct_removes_duplicate_rows() {
        let rows = vec![students()[0].clone(), students()[0].clone(), students()[1].clone()];
        assert_eq!(distinct(&rows).len(), 2);
    }
}
