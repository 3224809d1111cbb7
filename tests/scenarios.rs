mod common;

use common::open_engine;
use flintbase::ops::expr::{Operator, PostfixToken};
use flintbase::storage::catalog::CheckOp;
use flintbase::types::{Column, DataType, Schema, Value};
use flintbase::Error;

fn student_schema() -> Schema {
    Schema::new(vec![
        Column { name: "firstname".to_string(), data_type: DataType::String },
        Column { name: "year".to_string(), data_type: DataType::Int },
        Column { name: "weight".to_string(), data_type: DataType::Float },
    ])
}

/// S2: selection with AND/OR over mixed types.
#[test]
fn selection_with_and_or_over_mixed_types() {
    let (engine, _dir) = open_engine("s2-and-or");
    engine.create_table("student", student_schema()).unwrap();
    engine.insert("student", vec![Value::String("a".to_string()), Value::Int(2012), Value::Float(100.0)]).unwrap();
    engine.insert("student", vec![Value::String("b".to_string()), Value::Int(2011), Value::Float(200.0)]).unwrap();
    engine.insert("student", vec![Value::String("c".to_string()), Value::Int(2005), Value::Float(90.0)]).unwrap();
    engine.insert("student", vec![Value::String("d".to_string()), Value::Int(2001), Value::Float(110.0)]).unwrap();

    let or_tokens = vec![
        PostfixToken::AttributeRef("year".to_string()),
        PostfixToken::Literal(Value::Int(2012)),
        PostfixToken::Operator(Operator::Eq),
        PostfixToken::AttributeRef("year".to_string()),
        PostfixToken::Literal(Value::Int(2011)),
        PostfixToken::Operator(Operator::Eq),
        PostfixToken::Operator(Operator::Or),
    ];
    let (_, rows) = engine.select("student", &[], &or_tokens).unwrap();
    assert_eq!(rows.len(), 2);

    let and_tokens = vec![
        PostfixToken::AttributeRef("year".to_string()),
        PostfixToken::Literal(Value::Int(2000)),
        PostfixToken::Operator(Operator::Gt),
        PostfixToken::AttributeRef("weight".to_string()),
        PostfixToken::Literal(Value::Float(105.5)),
        PostfixToken::Operator(Operator::Le),
        PostfixToken::Operator(Operator::And),
    ];
    let (_, rows) = engine.select("student", &[], &and_tokens).unwrap();
    assert_eq!(rows.len(), 2);
    let names: Vec<&str> = rows.iter().map(|r| r.values[0].as_str().unwrap()).collect();
    assert!(names.contains(&"a"));
    assert!(names.contains(&"c"));
}

/// S3: LIKE is case-sensitive, ILIKE is not.
#[test]
fn like_is_case_sensitive_ilike_is_not() {
    let (engine, _dir) = open_engine("s3-like-ilike");
    let schema = Schema::new(vec![Column { name: "firstname".to_string(), data_type: DataType::String }]);
    engine.create_table("student", schema).unwrap();
    engine.insert("student", vec![Value::String("Ana".to_string())]).unwrap();
    engine.insert("student", vec![Value::String("ana".to_string())]).unwrap();
    engine.insert("student", vec![Value::String("Marko".to_string())]).unwrap();

    let like_tokens = vec![
        PostfixToken::AttributeRef("firstname".to_string()),
        PostfixToken::Literal(Value::String("a%".to_string())),
        PostfixToken::Operator(Operator::Like),
    ];
    let (_, rows) = engine.select("student", &[], &like_tokens).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].values[0], Value::String("ana".to_string()));

    let ilike_tokens = vec![
        PostfixToken::AttributeRef("firstname".to_string()),
        PostfixToken::Literal(Value::String("a%".to_string())),
        PostfixToken::Operator(Operator::ILike),
    ];
    let (_, rows) = engine.select("student", &[], &ilike_tokens).unwrap();
    assert_eq!(rows.len(), 2);
}

/// S4: installing NOT NULL rejects a subsequent null insert, leaving the
/// catalog and table state untouched.
#[test]
fn not_null_constraint_rejects_null_insert() {
    let (engine, _dir) = open_engine("s4-not-null");
    engine.create_table("student", student_schema()).unwrap();
    engine.add_not_null_constraint("student", "firstname", "nn_student_firstname").unwrap();

    let err = engine.insert("student", vec![Value::Null, Value::Int(2000), Value::Float(80.0)]).unwrap_err();
    assert!(matches!(err, Error::ConstraintViolation(_)));

    let (_, rows) = engine.select("student", &[], &[]).unwrap();
    assert!(rows.is_empty());
}

/// S5: adding UNIQUE over a column that already has duplicates is rejected,
/// and the constraint is not installed.
#[test]
fn unique_install_rejects_existing_duplicates() {
    let (engine, _dir) = open_engine("s5-unique-duplicates");
    let schema = Schema::new(vec![Column { name: "manager".to_string(), data_type: DataType::String }]);
    engine.create_table("employee", schema).unwrap();
    engine.insert("employee", vec![Value::String("Hutinski".to_string())]).unwrap();
    engine.insert("employee", vec![Value::String("Hutinski".to_string())]).unwrap();

    let err = engine.add_unique_constraint("employee", &["manager".to_string()], "uq_employee_manager").unwrap_err();
    assert!(matches!(err, Error::ConstraintViolation(_)));

    // A second insert of a duplicate value still succeeds: the constraint
    // never got installed.
    engine.insert("employee", vec![Value::String("Hutinski".to_string())]).unwrap();
    let (_, rows) = engine.select("employee", &[], &[]).unwrap();
    assert_eq!(rows.len(), 3);
}

/// S6: repeating an identical SELECT with no intervening write returns the
/// same result from the cache; a write in between invalidates it.
#[test]
fn repeated_select_hits_cache_until_invalidated_by_a_write() {
    let (engine, _dir) = open_engine("s6-select-cache");
    engine.create_table("student", student_schema()).unwrap();
    engine.insert("student", vec![Value::String("a".to_string()), Value::Int(2005), Value::Float(80.0)]).unwrap();
    engine.insert("student", vec![Value::String("b".to_string()), Value::Int(2010), Value::Float(90.0)]).unwrap();

    let tokens = vec![
        PostfixToken::AttributeRef("year".to_string()),
        PostfixToken::Literal(Value::Int(2008)),
        PostfixToken::Operator(Operator::Lt),
    ];
    let projection = vec!["firstname".to_string(), "year".to_string()];

    let (schema1, rows1) = engine.select("student", &projection, &tokens).unwrap();
    let (schema2, rows2) = engine.select("student", &projection, &tokens).unwrap();
    assert_eq!(schema1, schema2);
    assert_eq!(rows1, rows2);
    assert_eq!(rows1.len(), 1);

    engine.insert("student", vec![Value::String("c".to_string()), Value::Int(2001), Value::Float(70.0)]).unwrap();
    let (_, rows3) = engine.select("student", &projection, &tokens).unwrap();
    assert_eq!(rows3.len(), 2);
}

/// CHECK constraint installation validates existing rows the same way
/// NOT NULL and UNIQUE do.
#[test]
fn check_constraint_rejects_existing_violations() {
    let (engine, _dir) = open_engine("check-constraint");
    engine.create_table("student", student_schema()).unwrap();
    engine.insert("student", vec![Value::String("a".to_string()), Value::Int(1990), Value::Float(80.0)]).unwrap();

    let err = engine
        .add_check_constraint("student", "year", CheckOp::Ge, Value::Int(2000), "chk_student_year")
        .unwrap_err();
    assert!(matches!(err, Error::ConstraintViolation(_)));
}
