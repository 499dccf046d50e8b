//! Filter interpreter over JSON entities.
//!
//! Evaluates a [`FilterExpr`] against a `serde_json::Value` object, plus the
//! ordering comparator and projection used by the table-controller query
//! pipeline. String-typed member values coerce to timestamps when compared
//! against datetime constants.

use std::cmp::Ordering;

use chrono::{DateTime, Datelike, FixedOffset, Timelike};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::{Map, Value};

use super::filter::{ComparisonOp, Constant, FilterExpr, FunctionKind, LogicalOp};
use super::OrderBy;
use crate::entity::parse_timestamp;
use crate::errors::{Error, Result};

/// Evaluate a filter against an entity.
pub fn matches(filter: &FilterExpr, entity: &Value) -> Result<bool> {
    expect_bool(&evaluate(filter, entity)?)
}

/// Compare two entities under an ordering clause list. Unordered pairs
/// (mixed types, nulls) compare equal so callers can add their own
/// tiebreak.
pub fn compare_entities(a: &Value, b: &Value, order: &[OrderBy]) -> Ordering {
    for clause in order {
        let left = member_value(a, &clause.path);
        let right = member_value(b, &clause.path);
        let ordering = partial_order(&left, &right).unwrap_or(Ordering::Equal);
        let ordering = if clause.ascending {
            ordering
        } else {
            ordering.reverse()
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

/// Project an entity down to the selected top-level fields.
pub fn project(value: &Value, selection: &[String]) -> Value {
    if selection.is_empty() {
        return value.clone();
    }
    let Some(object) = value.as_object() else {
        return value.clone();
    };
    let mut projected = Map::new();
    for field in selection {
        let key = field.split('.').next().unwrap_or(field);
        if let Some(entry) = object.get(key) {
            projected.insert(key.to_string(), entry.clone());
        }
    }
    Value::Object(projected)
}

#[derive(Debug, Clone, PartialEq)]
enum EvalValue {
    Null,
    Bool(bool),
    Int(i64),
    Double(f64),
    Decimal(Decimal),
    Str(String),
    DateTime(DateTime<FixedOffset>),
}

fn evaluate(expr: &FilterExpr, entity: &Value) -> Result<EvalValue> {
    match expr {
        FilterExpr::Member(path) => Ok(member_value(entity, path)),
        FilterExpr::Constant(constant) => Ok(constant_value(constant)),
        FilterExpr::Logical { op, left, right } => {
            let left = expect_bool(&evaluate(left, entity)?)?;
            // No short-circuit: both sides must be well-typed.
            let right = expect_bool(&evaluate(right, entity)?)?;
            Ok(EvalValue::Bool(match op {
                LogicalOp::And => left && right,
                LogicalOp::Or => left || right,
            }))
        }
        FilterExpr::Not(operand) => {
            let value = expect_bool(&evaluate(operand, entity)?)?;
            Ok(EvalValue::Bool(!value))
        }
        FilterExpr::Comparison { op, left, right } => {
            let left = evaluate(left, entity)?;
            let right = evaluate(right, entity)?;
            Ok(EvalValue::Bool(compare(*op, &left, &right)))
        }
        FilterExpr::Function { function, args } => {
            let args = args
                .iter()
                .map(|arg| evaluate(arg, entity))
                .collect::<Result<Vec<_>>>()?;
            apply_function(*function, &args)
        }
        FilterExpr::In { member, values } => {
            let needle = member_value(entity, member);
            let found = values
                .iter()
                .any(|value| compare(ComparisonOp::Eq, &needle, &constant_value(value)));
            Ok(EvalValue::Bool(found))
        }
    }
}

fn member_value(entity: &Value, path: &str) -> EvalValue {
    let mut current = entity;
    for segment in path.split('.') {
        match current.get(segment) {
            Some(next) => current = next,
            None => return EvalValue::Null,
        }
    }
    match current {
        Value::Null => EvalValue::Null,
        Value::Bool(value) => EvalValue::Bool(*value),
        Value::Number(number) => match number.as_i64() {
            Some(value) => EvalValue::Int(value),
            None => EvalValue::Double(number.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(value) => EvalValue::Str(value.clone()),
        Value::Array(_) | Value::Object(_) => EvalValue::Null,
    }
}

fn constant_value(constant: &Constant) -> EvalValue {
    match constant {
        Constant::Null => EvalValue::Null,
        Constant::Bool(value) => EvalValue::Bool(*value),
        Constant::Int(value) => EvalValue::Int(*value),
        Constant::Float(value) => EvalValue::Double(f64::from(*value)),
        Constant::Double(value) => EvalValue::Double(*value),
        Constant::Decimal(value) => EvalValue::Decimal(*value),
        Constant::String(value) => EvalValue::Str(value.clone()),
        Constant::DateTime(value) => EvalValue::DateTime(*value),
    }
}

fn expect_bool(value: &EvalValue) -> Result<bool> {
    match value {
        EvalValue::Bool(value) => Ok(*value),
        EvalValue::Null => Ok(false),
        other => Err(Error::Validation(format!(
            "filter expression expected a boolean, got {other:?}"
        ))),
    }
}

fn compare(op: ComparisonOp, left: &EvalValue, right: &EvalValue) -> bool {
    match op {
        ComparisonOp::Eq => equals(left, right),
        ComparisonOp::Ne => !equals(left, right),
        ComparisonOp::Lt => matches!(partial_order(left, right), Some(Ordering::Less)),
        ComparisonOp::Le => matches!(
            partial_order(left, right),
            Some(Ordering::Less | Ordering::Equal)
        ),
        ComparisonOp::Gt => matches!(partial_order(left, right), Some(Ordering::Greater)),
        ComparisonOp::Ge => matches!(
            partial_order(left, right),
            Some(Ordering::Greater | Ordering::Equal)
        ),
    }
}

fn equals(left: &EvalValue, right: &EvalValue) -> bool {
    match (left, right) {
        (EvalValue::Null, EvalValue::Null) => true,
        (EvalValue::Null, _) | (_, EvalValue::Null) => false,
        _ => partial_order(left, right) == Some(Ordering::Equal),
    }
}

/// Ordering across compatible types; `None` when the pair is unordered.
fn partial_order(left: &EvalValue, right: &EvalValue) -> Option<Ordering> {
    use EvalValue::*;
    match (left, right) {
        (Bool(a), Bool(b)) => Some(a.cmp(b)),
        (Int(a), Int(b)) => Some(a.cmp(b)),
        (Int(a), Double(b)) => (*a as f64).partial_cmp(b),
        (Double(a), Int(b)) => a.partial_cmp(&(*b as f64)),
        (Double(a), Double(b)) => a.partial_cmp(b),
        (Decimal(a), Decimal(b)) => Some(a.cmp(b)),
        (Decimal(a), Int(b)) => Some(a.cmp(&rust_decimal::Decimal::from(*b))),
        (Int(a), Decimal(b)) => Some(rust_decimal::Decimal::from(*a).cmp(b)),
        (Decimal(a), Double(b)) => a.to_f64().and_then(|a| a.partial_cmp(b)),
        (Double(a), Decimal(b)) => b.to_f64().and_then(|b| a.partial_cmp(&b)),
        (Str(a), Str(b)) => Some(a.cmp(b)),
        (DateTime(a), DateTime(b)) => Some(a.cmp(b)),
        (Str(a), DateTime(b)) => parse_timestamp(a).ok().map(|a| a.cmp(b)),
        (DateTime(a), Str(b)) => parse_timestamp(b).ok().map(|b| a.cmp(&b)),
        _ => None,
    }
}

fn apply_function(function: FunctionKind, args: &[EvalValue]) -> Result<EvalValue> {
    use FunctionKind::*;
    let value = match function {
        StartsWith => EvalValue::Bool(string_arg(args, 0)?.starts_with(&string_arg(args, 1)?)),
        EndsWith => EvalValue::Bool(string_arg(args, 0)?.ends_with(&string_arg(args, 1)?)),
        Contains => EvalValue::Bool(string_arg(args, 0)?.contains(&string_arg(args, 1)?)),
        IndexOf => {
            let haystack = string_arg(args, 0)?;
            let needle = string_arg(args, 1)?;
            let index = haystack
                .find(&needle)
                .map(|offset| haystack[..offset].chars().count() as i64)
                .unwrap_or(-1);
            EvalValue::Int(index)
        }
        Substring => {
            let text = string_arg(args, 0)?;
            let start = int_arg(args, 1)?.max(0) as usize;
            let chars = text.chars().skip(start);
            let taken: String = match args.get(2) {
                Some(_) => chars.take(int_arg(args, 2)?.max(0) as usize).collect(),
                None => chars.collect(),
            };
            EvalValue::Str(taken)
        }
        ToLower => EvalValue::Str(string_arg(args, 0)?.to_lowercase()),
        ToUpper => EvalValue::Str(string_arg(args, 0)?.to_uppercase()),
        Trim => EvalValue::Str(string_arg(args, 0)?.trim().to_string()),
        Concat => EvalValue::Str(format!("{}{}", string_arg(args, 0)?, string_arg(args, 1)?)),
        Length => EvalValue::Int(string_arg(args, 0)?.chars().count() as i64),
        Floor | Ceiling | Round => {
            let arg = args.first().ok_or_else(|| {
                Error::Validation(format!("{} requires an argument", function.name()))
            })?;
            return numeric_function(function, arg);
        }
        Year | Month | Day | Hour | Minute | Second => {
            let value = datetime_arg(args, 0)?;
            let part = match function {
                Year => i64::from(value.year()),
                Month => i64::from(value.month()),
                Day => i64::from(value.day()),
                Hour => i64::from(value.hour()),
                Minute => i64::from(value.minute()),
                Second => i64::from(value.second()),
                _ => unreachable!(),
            };
            EvalValue::Int(part)
        }
    };
    Ok(value)
}

fn numeric_function(function: FunctionKind, arg: &EvalValue) -> Result<EvalValue> {
    let value = match (function, arg) {
        (_, EvalValue::Int(value)) => EvalValue::Int(*value),
        (FunctionKind::Floor, EvalValue::Double(value)) => EvalValue::Double(value.floor()),
        (FunctionKind::Ceiling, EvalValue::Double(value)) => EvalValue::Double(value.ceil()),
        (FunctionKind::Round, EvalValue::Double(value)) => EvalValue::Double(value.round()),
        (FunctionKind::Floor, EvalValue::Decimal(value)) => EvalValue::Decimal(value.floor()),
        (FunctionKind::Ceiling, EvalValue::Decimal(value)) => EvalValue::Decimal(value.ceil()),
        (FunctionKind::Round, EvalValue::Decimal(value)) => EvalValue::Decimal(value.round()),
        _ => {
            return Err(Error::Validation(format!(
                "{} requires a numeric argument",
                function.name()
            )))
        }
    };
    Ok(value)
}

fn string_arg(args: &[EvalValue], index: usize) -> Result<String> {
    match args.get(index) {
        Some(EvalValue::Str(value)) => Ok(value.clone()),
        Some(EvalValue::Null) => Ok(String::new()),
        other => Err(Error::Validation(format!(
            "expected a string argument, got {other:?}"
        ))),
    }
}

fn int_arg(args: &[EvalValue], index: usize) -> Result<i64> {
    match args.get(index) {
        Some(EvalValue::Int(value)) => Ok(*value),
        other => Err(Error::Validation(format!(
            "expected an integer argument, got {other:?}"
        ))),
    }
}

fn datetime_arg(args: &[EvalValue], index: usize) -> Result<DateTime<FixedOffset>> {
    match args.get(index) {
        Some(EvalValue::DateTime(value)) => Ok(*value),
        Some(EvalValue::Str(value)) => parse_timestamp(value),
        other => Err(Error::Validation(format!(
            "expected a datetime argument, got {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::QueryDescription;
    use serde_json::json;

    fn movie() -> Value {
        json!({
            "id": "m1",
            "title": "The Matrix",
            "rating": 4,
            "price": 3.5,
            "deleted": false,
            "updatedAt": "2024-06-01T12:30:45.123Z",
            "metadata": { "studio": "wb" }
        })
    }

    fn eval(filter: &str) -> bool {
        let expr = QueryDescription::parse_filter(filter).unwrap();
        matches(&expr, &movie()).unwrap()
    }

    #[test]
    fn comparisons_and_logic() {
        assert!(eval("rating eq 4"));
        assert!(eval("rating ge 4 and price lt 4.0"));
        assert!(eval("rating gt 5 or title eq 'The Matrix'"));
        assert!(eval("not (deleted eq true)"));
        assert!(eval("not deleted"));
        assert!(!eval("rating ne 4"));
    }

    #[test]
    fn null_and_missing_members() {
        assert!(eval("missing eq null"));
        assert!(!eval("missing eq 4"));
        assert!(!eval("missing gt 4"));
        assert!(eval("title ne null"));
    }

    #[test]
    fn nested_member_access() {
        assert!(eval("metadata.studio eq 'wb'"));
        assert!(!eval("metadata.country eq 'us'"));
    }

    #[test]
    fn string_functions() {
        assert!(eval("startswith(title,'The')"));
        assert!(eval("endswith(title,'Matrix')"));
        assert!(eval("contains(tolower(title),'matrix')"));
        assert!(eval("indexof(title,'Matrix') eq 4"));
        assert!(eval("substring(title,4) eq 'Matrix'"));
        assert!(eval("substring(title,4,3) eq 'Mat'"));
        assert!(eval("length(title) eq 10"));
        assert!(eval("concat(title,'!') eq 'The Matrix!'"));
        assert!(eval("trim(title) eq title"));
        assert!(eval("toupper(title) eq 'THE MATRIX'"));
    }

    #[test]
    fn numeric_and_date_functions() {
        assert!(eval("floor(price) eq 3.0"));
        assert!(eval("ceiling(price) eq 4.0"));
        assert!(eval("round(price) eq 4.0"));
        assert!(eval("year(updatedAt) eq 2024"));
        assert!(eval("month(updatedAt) eq 6"));
        assert!(eval("day(updatedAt) eq 1"));
        assert!(eval("hour(updatedAt) eq 12"));
        assert!(eval("minute(updatedAt) eq 30"));
        assert!(eval("second(updatedAt) eq 45"));
    }

    #[test]
    fn datetime_member_coercion() {
        assert!(eval("updatedAt gt 2024-01-01T00:00:00.000Z"));
        assert!(!eval("updatedAt gt 2024-12-01T00:00:00.000Z"));
    }

    #[test]
    fn in_membership() {
        assert!(eval("rating in (3, 4, 5)"));
        assert!(!eval("rating in (1, 2)"));
        assert!(eval("title in ('The Matrix', 'Speed')"));
    }

    #[test]
    fn non_boolean_filters_error() {
        let expr = QueryDescription::parse_filter("title").unwrap();
        assert!(matches(&expr, &movie()).is_err());
    }

    #[test]
    fn ordering_comparator() {
        let a = json!({"rating": 1, "title": "b"});
        let b = json!({"rating": 2, "title": "a"});
        let by_rating = [OrderBy::ascending("rating")];
        assert_eq!(compare_entities(&a, &b, &by_rating), Ordering::Less);

        let by_title_desc = [OrderBy::descending("title")];
        assert_eq!(compare_entities(&a, &b, &by_title_desc), Ordering::Less);

        let by_missing = [OrderBy::ascending("absent")];
        assert_eq!(compare_entities(&a, &b, &by_missing), Ordering::Equal);
    }

    #[test]
    fn projection_keeps_selected_fields() {
        let projected = project(&movie(), &["id".into(), "title".into(), "absent".into()]);
        assert_eq!(projected, json!({"id": "m1", "title": "The Matrix"}));

        let untouched = project(&movie(), &[]);
        assert_eq!(untouched, movie());
    }
}
