//! Expression evaluator (§4.7). Predicates and projections arrive as a
//! postfix token stream — attribute references, literals, and operators — and
//! are materialized once into an AST before being evaluated per row, so
//! arity checks and pattern compilation happen a single time rather than on
//! every row.
//!
//! Two places where this evaluator's semantics were redesigned away from the
//! three-valued, division-errors-out style the source used: logical and
//! comparison operators collapse `Null` operands to `false` rather than
//! propagating a null result, and arithmetic division/modulo by zero yields
//! `0` rather than failing the query.

use regex::Regex;

use crate::error::{Error, Result};
use crate::types::{Row, Schema, Value};

/// One element of the postfix token stream callers supply.
#[derive(Debug, Clone)]
pub enum PostfixToken {
    AttributeRef(String),
    Literal(Value),
    /// The right-hand operand of `IN` / `=ANY` / `=ALL` and friends.
    LiteralList(Vec<Value>),
    Operator(Operator),
}

/// Every operator the evaluator understands. Each has a fixed arity, checked
/// once while the token stream is materialized into an AST.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    And,
    Or,
    Not,
    In,
    AnyEq,
    AnyNe,
    AnyLt,
    AnyGt,
    AnyLe,
    AnyGe,
    AllEq,
    AllNe,
    AllLt,
    AllGt,
    AllLe,
    AllGe,
    Between,
    Like,
    NotLike,
    ILike,
    NotILike,
    SimilarTo,
    RegexMatch,
    RegexNotMatch,
    RegexIMatch,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
}

impl Operator {
    fn arity(self) -> usize {
        match self {
            Operator::Not => 1,
            Operator::Between => 3,
            _ => 2,
        }
    }
}

/// The materialized expression tree. Pattern operators carry their
/// already-compiled `Regex` so row evaluation never recompiles one.
#[derive(Debug, Clone)]
enum Expr {
    Attr(String),
    Literal(Value),
    LiteralList(Vec<Value>),
    Not(Box<Expr>),
    Binary(Operator, Box<Expr>, Box<Expr>),
    Between(Box<Expr>, Box<Expr>, Box<Expr>),
    Pattern(PatternKind, Box<Expr>, Regex),
}

#[derive(Debug, Clone, Copy)]
enum PatternKind {
    Like,
    NotLike,
    RegexMatch,
    RegexNotMatch,
}

/// A compiled predicate or scalar expression, ready to evaluate against many
/// rows sharing one schema.
pub struct Evaluator {
    root: Expr,
}

impl Evaluator {
    /// Materializes a postfix token stream into an AST, compiling any
    /// pattern-operator literals into regexes exactly once.
    pub fn compile(tokens: &[PostfixToken]) -> Result<Evaluator> {
        let mut stack: Vec<Expr> = Vec::new();
        for token in tokens {
            match token {
                PostfixToken::AttributeRef(name) => stack.push(Expr::Attr(name.clone())),
                PostfixToken::Literal(value) => stack.push(Expr::Literal(value.clone())),
                PostfixToken::LiteralList(values) => stack.push(Expr::LiteralList(values.clone())),
                PostfixToken::Operator(op) => {
                    let node = Self::reduce(*op, &mut stack)?;
                    stack.push(node);
                }
            }
        }
        if stack.len() != 1 {
            return Err(Error::InvalidArgument(format!(
                "malformed expression: {} operand(s) left on the stack",
                stack.len()
            )));
        }
        Ok(Evaluator { root: stack.pop().unwrap() })
    }

    fn reduce(op: Operator, stack: &mut Vec<Expr>) -> Result<Expr> {
        let arity = op.arity();
        if stack.len() < arity {
            return Err(Error::InvalidArgument(format!(
                "operator {:?} needs {} operand(s), found {}",
                op,
                arity,
                stack.len()
            )));
        }

        if op == Operator::Not {
            let operand = stack.pop().unwrap();
            return Ok(Expr::Not(Box::new(operand)));
        }

        if op == Operator::Between {
            let hi = stack.pop().unwrap();
            let lo = stack.pop().unwrap();
            let value = stack.pop().unwrap();
            return Ok(Expr::Between(Box::new(value), Box::new(lo), Box::new(hi)));
        }

        if matches!(
            op,
            Operator::Like | Operator::NotLike | Operator::ILike | Operator::NotILike | Operator::SimilarTo
                | Operator::RegexMatch | Operator::RegexNotMatch | Operator::RegexIMatch
        ) {
            let pattern = stack.pop().unwrap();
            let value = stack.pop().unwrap();
            let pattern_literal = match &pattern {
                Expr::Literal(Value::String(s)) => s.clone(),
                _ => {
                    return Err(Error::InvalidArgument(
                        "pattern operators require a literal string pattern".to_string(),
                    ))
                }
            };
            let (kind, regex) = Self::compile_pattern(op, &pattern_literal)?;
            return Ok(Expr::Pattern(kind, Box::new(value), regex));
        }

        let right = stack.pop().unwrap();
        let left = stack.pop().unwrap();
        Ok(Expr::Binary(op, Box::new(left), Box::new(right)))
    }

    /// Translates the four pattern dialects into one `regex` crate pattern.
    /// `LIKE`/`ILIKE` rewrite SQL wildcards (`%`, `_`) into an anchored
    /// regex, escaping everything else literally. `SIMILAR TO` and the
    /// POSIX `~` family are already regex-shaped and are anchored (`SIMILAR
    /// TO`) or left unanchored (`~`, substring match) as-is.
    fn compile_pattern(op: Operator, pattern: &str) -> Result<(PatternKind, Regex)> {
        let (kind, source, case_insensitive) = match op {
            Operator::Like => (PatternKind::Like, Self::like_to_regex(pattern), false),
            Operator::NotLike => (PatternKind::NotLike, Self::like_to_regex(pattern), false),
            Operator::ILike => (PatternKind::Like, Self::like_to_regex(pattern), true),
            Operator::NotILike => (PatternKind::NotLike, Self::like_to_regex(pattern), true),
            Operator::SimilarTo => (PatternKind::Like, format!("^(?:{})$", pattern), false),
            Operator::RegexMatch => (PatternKind::RegexMatch, pattern.to_string(), false),
            Operator::RegexNotMatch => (PatternKind::RegexNotMatch, pattern.to_string(), false),
            Operator::RegexIMatch => (PatternKind::RegexMatch, pattern.to_string(), true),
            _ => unreachable!("compile_pattern only called for pattern operators"),
        };
        let source = if case_insensitive { format!("(?i){}", source) } else { source };
        let regex = Regex::new(&source)
            .map_err(|e| Error::InvalidArgument(format!("invalid pattern '{}': {}", pattern, e)))?;
        Ok((kind, regex))
    }

    /// `%` matches any run of characters, `_` matches exactly one; everything
    /// else is escaped literally and the whole thing is anchored, since LIKE
    /// matches the full string.
    fn like_to_regex(pattern: &str) -> String {
        let mut out = String::from("^");
        for ch in pattern.chars() {
            match ch {
                '%' => out.push_str(".*"),
                '_' => out.push('.'),
                other => out.push_str(&regex::escape(&other.to_string())),
            }
        }
        out.push('$');
        out
    }

    /// Evaluates the compiled expression as a boolean predicate.
    pub fn eval_predicate(&self, row: &Row, schema: &Schema) -> Result<bool> {
        match self.eval_value(row, schema)? {
            Value::Bool(b) => Ok(b),
            Value::Null => Ok(false),
            other => Err(Error::SchemaViolation(format!("expression did not evaluate to a boolean: {:?}", other))),
        }
    }

    /// Evaluates the compiled expression to a `Value`, for use where the
    /// expression computes a scalar rather than a predicate (e.g. a CHECK
    /// constraint's operand).
    pub fn eval_value(&self, row: &Row, schema: &Schema) -> Result<Value> {
        Self::eval_node(&self.root, row, schema)
    }

    fn eval_node(node: &Expr, row: &Row, schema: &Schema) -> Result<Value> {
        match node {
            Expr::Attr(name) => {
                let idx = schema
                    .position_of(name)
                    .ok_or_else(|| Error::SchemaViolation(format!("unknown attribute: {}", name)))?;
                row.get(idx)
                    .cloned()
                    .ok_or_else(|| Error::SchemaViolation(format!("row is missing attribute: {}", name)))
            }
            Expr::Literal(value) => Ok(value.clone()),
            Expr::LiteralList(_) => {
                Err(Error::InvalidArgument("a literal list cannot be evaluated on its own".to_string()))
            }
            Expr::Not(inner) => {
                let value = Self::eval_node(inner, row, schema)?;
                match value {
                    Value::Bool(b) => Ok(Value::Bool(!b)),
                    Value::Null => Ok(Value::Bool(true)),
                    other => Err(Error::SchemaViolation(format!("NOT requires a boolean operand, got {:?}", other))),
                }
            }
            Expr::Binary(op, left, right) => Self::eval_binary(*op, left, right, row, schema),
            Expr::Between(value, lo, hi) => {
                let value = Self::eval_node(value, row, schema)?;
                let lo = Self::eval_node(lo, row, schema)?;
                let hi = Self::eval_node(hi, row, schema)?;
                if value.is_null() || lo.is_null() || hi.is_null() {
                    return Ok(Value::Bool(false));
                }
                let ge_lo = compare(&value, &lo)? != std::cmp::Ordering::Less;
                let le_hi = compare(&value, &hi)? != std::cmp::Ordering::Greater;
                Ok(Value::Bool(ge_lo && le_hi))
            }
            Expr::Pattern(kind, value, regex) => {
                let value = Self::eval_node(value, row, schema)?;
                let text = match &value {
                    Value::String(s) => s.as_str(),
                    Value::Null => return Ok(Value::Bool(false)),
                    other => return Err(Error::SchemaViolation(format!("pattern operand must be a string, got {:?}", other))),
                };
                let matched = regex.is_match(text);
                let result = match kind {
                    PatternKind::Like => matched,
                    PatternKind::NotLike => !matched,
                    PatternKind::RegexMatch => matched,
                    PatternKind::RegexNotMatch => !matched,
                };
                Ok(Value::Bool(result))
            }
        }
    }

    fn eval_binary(op: Operator, left: &Expr, right: &Expr, row: &Row, schema: &Schema) -> Result<Value> {
        // `And`/`Or` short-circuit before evaluating the other side, matching
        // the source's structure, but collapse a null operand to `false`
        // rather than propagating `Null` (§4.7's two-valued-logic decision).
        if op == Operator::And {
            let l = Self::eval_bool(left, row, schema)?;
            if !l {
                return Ok(Value::Bool(false));
            }
            return Ok(Value::Bool(Self::eval_bool(right, row, schema)?));
        }
        if op == Operator::Or {
            let l = Self::eval_bool(left, row, schema)?;
            if l {
                return Ok(Value::Bool(true));
            }
            return Ok(Value::Bool(Self::eval_bool(right, row, schema)?));
        }

        let lval = Self::eval_node(left, row, schema)?;

        if matches!(
            op,
            Operator::In | Operator::AnyEq | Operator::AnyNe | Operator::AnyLt | Operator::AnyGt | Operator::AnyLe
                | Operator::AnyGe | Operator::AllEq | Operator::AllNe | Operator::AllLt | Operator::AllGt
                | Operator::AllLe | Operator::AllGe
        ) {
            let list = match right {
                Expr::LiteralList(values) => values,
                _ => return Err(Error::InvalidArgument(format!("{:?} requires a literal list operand", op))),
            };
            return Self::eval_set_op(op, &lval, list);
        }

        let rval = Self::eval_node(right, row, schema)?;

        match op {
            Operator::Eq | Operator::Ne | Operator::Lt | Operator::Gt | Operator::Le | Operator::Ge => {
                Self::eval_comparison(op, &lval, &rval)
            }
            Operator::Add | Operator::Sub | Operator::Mul | Operator::Div | Operator::Mod | Operator::Pow => {
                Self::eval_arithmetic(op, &lval, &rval)
            }
            _ => unreachable!("and/or/in/any/all/pattern handled above"),
        }
    }

    fn eval_bool(node: &Expr, row: &Row, schema: &Schema) -> Result<bool> {
        match Self::eval_node(node, row, schema)? {
            Value::Bool(b) => Ok(b),
            Value::Null => Ok(false),
            other => Err(Error::SchemaViolation(format!("logical operator requires a boolean operand, got {:?}", other))),
        }
    }

    fn eval_comparison(op: Operator, left: &Value, right: &Value) -> Result<Value> {
        if left.is_null() || right.is_null() {
            return Ok(Value::Bool(false));
        }
        let ordering = compare(left, right)?;
        let result = match op {
            Operator::Eq => ordering == std::cmp::Ordering::Equal,
            Operator::Ne => ordering != std::cmp::Ordering::Equal,
            Operator::Lt => ordering == std::cmp::Ordering::Less,
            Operator::Gt => ordering == std::cmp::Ordering::Greater,
            Operator::Le => ordering != std::cmp::Ordering::Greater,
            Operator::Ge => ordering != std::cmp::Ordering::Less,
            _ => unreachable!("eval_comparison only called for comparison operators"),
        };
        Ok(Value::Bool(result))
    }

    fn eval_set_op(op: Operator, value: &Value, list: &[Value]) -> Result<Value> {
        if value.is_null() {
            return Ok(Value::Bool(false));
        }
        if op == Operator::In {
            for candidate in list {
                if !candidate.is_null() && compare(value, candidate)? == std::cmp::Ordering::Equal {
                    return Ok(Value::Bool(true));
                }
            }
            return Ok(Value::Bool(false));
        }

        let (quantifier_all, cmp_kind) = match op {
            Operator::AnyEq => (false, Operator::Eq),
            Operator::AnyNe => (false, Operator::Ne),
            Operator::AnyLt => (false, Operator::Lt),
            Operator::AnyGt => (false, Operator::Gt),
            Operator::AnyLe => (false, Operator::Le),
            Operator::AnyGe => (false, Operator::Ge),
            Operator::AllEq => (true, Operator::Eq),
            Operator::AllNe => (true, Operator::Ne),
            Operator::AllLt => (true, Operator::Lt),
            Operator::AllGt => (true, Operator::Gt),
            Operator::AllLe => (true, Operator::Le),
            Operator::AllGe => (true, Operator::Ge),
            _ => unreachable!("eval_set_op only called for IN/ANY/ALL"),
        };

        if list.is_empty() {
            // ANY over an empty list is vacuously false; ALL is vacuously true.
            return Ok(Value::Bool(quantifier_all));
        }

        if quantifier_all {
            for candidate in list {
                let matched = matches!(Self::eval_comparison(cmp_kind, value, candidate)?, Value::Bool(true));
                if !matched {
                    return Ok(Value::Bool(false));
                }
            }
            Ok(Value::Bool(true))
        } else {
            for candidate in list {
                let matched = matches!(Self::eval_comparison(cmp_kind, value, candidate)?, Value::Bool(true));
                if matched {
                    return Ok(Value::Bool(true));
                }
            }
            Ok(Value::Bool(false))
        }
    }

    /// Int op Int stays Int; a mix of Int and Float promotes the Int side to
    /// Float; anything else is a schema violation. Division and modulo by
    /// zero yield `0` rather than failing the expression.
    fn eval_arithmetic(op: Operator, left: &Value, right: &Value) -> Result<Value> {
        if left.is_null() || right.is_null() {
            return Ok(Value::Null);
        }
        match (left, right) {
            (Value::Int(a), Value::Int(b)) => {
                let a = *a;
                let b = *b;
                let result = match op {
                    Operator::Add => a.wrapping_add(b),
                    Operator::Sub => a.wrapping_sub(b),
                    Operator::Mul => a.wrapping_mul(b),
                    Operator::Div => if b == 0 { 0 } else { a.wrapping_div(b) },
                    Operator::Mod => if b == 0 { 0 } else { a.wrapping_rem(b) },
                    Operator::Pow => return Ok(Value::Float((a as f64).powf(b as f64))),
                    _ => unreachable!("eval_arithmetic only called for arithmetic operators"),
                };
                Ok(Value::Int(result))
            }
            (Value::Int(_), Value::Float(_)) | (Value::Float(_), Value::Int(_)) | (Value::Float(_), Value::Float(_)) => {
                let a = left.as_f64().unwrap();
                let b = right.as_f64().unwrap();
                let result = match op {
                    Operator::Add => a + b,
                    Operator::Sub => a - b,
                    Operator::Mul => a * b,
                    Operator::Div => if b == 0.0 { 0.0 } else { a / b },
                    Operator::Mod => if b == 0.0 { 0.0 } else { a % b },
                    Operator::Pow => a.powf(b),
                    _ => unreachable!("eval_arithmetic only called for arithmetic operators"),
                };
                Ok(Value::Float(result))
            }
            (a, b) => Err(Error::SchemaViolation(format!(
                "arithmetic operator requires numeric operands, got {:?} and {:?}",
                a, b
            ))),
        }
    }
}

/// Orders two non-null values of compatible kinds. Int/Float compare
/// numerically after promotion; String/Bool compare directly; anything else
/// is a schema violation.
pub(crate) fn compare(left: &Value, right: &Value) -> Result<std::cmp::Ordering> {
    match (left, right) {
        (Value::Int(a), Value::Int(b)) => Ok(a.cmp(b)),
        (Value::Int(_), Value::Float(_)) | (Value::Float(_), Value::Int(_)) | (Value::Float(_), Value::Float(_)) => {
            let a = left.as_f64().unwrap();
            let b = right.as_f64().unwrap();
            a.partial_cmp(&b).ok_or_else(|| Error::SchemaViolation("NaN is not orderable".to_string()))
        }
        (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Ok(a.cmp(b)),
        (a, b) => Err(Error::SchemaViolation(format!("cannot compare {:?} and {:?}", a, b))),
    }
}
