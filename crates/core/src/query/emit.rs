//! OData v4 query-string emitter.
//!
//! Normalization rules (the parser accepts the wider forms, the emitter
//! always produces these):
//! - integer constants are emitted without the `L` suffix;
//! - doubles always carry a decimal point or exponent;
//! - datetime constants are emitted in the canonical wire form;
//! - member paths are lowerCamelCase;
//! - parentheses appear only where required by precedence, and a
//!   right-nested chain of the same connective keeps its parentheses.

use super::filter::{lower_camel_path, Constant, FilterExpr, LogicalOp};
use super::QueryDescription;
use crate::entity::format_timestamp;

pub(super) fn emit_query(query: &QueryDescription) -> String {
    let mut pairs: Vec<(String, String)> = Vec::new();

    if query.request_total_count {
        pairs.push(("$count".into(), "true".into()));
    }
    if let Some(filter) = &query.filter {
        pairs.push(("$filter".into(), emit_filter(filter)));
    }
    if !query.order_by.is_empty() {
        let clauses = query
            .order_by
            .iter()
            .map(|order| {
                let path = lower_camel_path(&order.path);
                if order.ascending {
                    path
                } else {
                    format!("{path} desc")
                }
            })
            .collect::<Vec<_>>()
            .join(",");
        pairs.push(("$orderby".into(), clauses));
    }
    if !query.selection.is_empty() {
        let fields = query
            .selection
            .iter()
            .map(|field| lower_camel_path(field))
            .collect::<Vec<_>>()
            .join(",");
        pairs.push(("$select".into(), fields));
    }
    if let Some(skip) = query.skip {
        pairs.push(("$skip".into(), skip.to_string()));
    }
    if let Some(top) = query.top {
        pairs.push(("$top".into(), top.to_string()));
    }
    if query.include_deleted {
        pairs.push(("__includedeleted".into(), "true".into()));
    }
    for (key, value) in &query.parameters {
        pairs.push((key.clone(), value.clone()));
    }

    pairs
        .into_iter()
        .map(|(key, value)| format!("{key}={}", urlencoding::encode(&value)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Render a filter expression in OData text form.
pub(super) fn emit_filter(expr: &FilterExpr) -> String {
    let mut out = String::new();
    write_expr(&mut out, expr);
    out
}

fn write_expr(out: &mut String, expr: &FilterExpr) {
    match expr {
        FilterExpr::Logical { op, left, right } => {
            let precedence = expr.precedence();
            write_child(out, left, precedence, false);
            out.push(' ');
            out.push_str(match op {
                LogicalOp::And => "and",
                LogicalOp::Or => "or",
            });
            out.push(' ');
            write_child(out, right, precedence, true);
        }
        FilterExpr::Comparison { op, left, right } => {
            write_child(out, left, 5, false);
            out.push(' ');
            out.push_str(op.keyword());
            out.push(' ');
            write_child(out, right, 5, false);
        }
        FilterExpr::Not(operand) => {
            out.push_str("not ");
            write_child(out, operand, expr.precedence(), false);
        }
        FilterExpr::Member(path) => out.push_str(&lower_camel_path(path)),
        FilterExpr::Constant(constant) => out.push_str(&emit_constant(constant)),
        FilterExpr::Function { function, args } => {
            out.push_str(function.name());
            out.push('(');
            for (index, arg) in args.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_expr(out, arg);
            }
            out.push(')');
        }
        FilterExpr::In { member, values } => {
            out.push_str(&lower_camel_path(member));
            out.push_str(" in (");
            for (index, value) in values.iter().enumerate() {
                if index > 0 {
                    out.push_str(", ");
                }
                out.push_str(&emit_constant(value));
            }
            out.push(')');
        }
    }
}

/// Parenthesize a child whose binding is looser than its parent requires.
/// `strict` additionally parenthesizes an equal-precedence right child so
/// the parsed tree shape is preserved.
fn write_child(out: &mut String, child: &FilterExpr, parent_precedence: u8, strict: bool) {
    let needs_parens = if strict {
        child.precedence() <= parent_precedence
    } else {
        child.precedence() < parent_precedence
    };
    if needs_parens {
        out.push('(');
        write_expr(out, child);
        out.push(')');
    } else {
        write_expr(out, child);
    }
}

fn emit_constant(constant: &Constant) -> String {
    match constant {
        Constant::Null => "null".to_string(),
        Constant::Bool(value) => value.to_string(),
        Constant::Int(value) => value.to_string(),
        Constant::Float(value) => format!("{value:?}f"),
        Constant::Double(value) => format!("{value:?}"),
        Constant::Decimal(value) => format!("{value}M"),
        Constant::String(value) => format!("'{}'", value.replace('\'', "''")),
        Constant::DateTime(value) => format_timestamp(value),
    }
}
