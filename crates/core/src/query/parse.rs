//! OData v4 query-string and filter parser.

use std::borrow::Cow;

use super::filter::{lower_camel_path, ComparisonOp, Constant, FilterExpr, FunctionKind};
use super::{OrderBy, QueryDescription};
use crate::errors::{Error, Result};

pub(super) fn parse_query_string(query: &str) -> Result<QueryDescription> {
    let query = query.strip_prefix('?').unwrap_or(query);
    let mut description = QueryDescription::new();

    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (raw_key, raw_value) = pair.split_once('=').unwrap_or((pair, ""));
        let key = decode(raw_key)?.to_ascii_lowercase();
        let value = decode(raw_value)?;

        match key.as_str() {
            "$filter" => description.filter = Some(parse_filter(&value)?),
            "$orderby" => description.order_by = parse_order_by(&value)?,
            "$select" => {
                description.selection = value
                    .split(',')
                    .map(|field| lower_camel_path(field.trim()))
                    .filter(|field| !field.is_empty())
                    .collect();
            }
            "$skip" => description.skip = Some(parse_unsigned("$skip", &value)?),
            "$top" => description.top = Some(parse_unsigned("$top", &value)?),
            "$count" => description.request_total_count = parse_bool("$count", &value)?,
            "__includedeleted" => {
                description.include_deleted = parse_bool("__includedeleted", &value)?
            }
            _ if key.starts_with('$') => {
                return Err(Error::Validation(format!(
                    "unknown query option '{key}'"
                )))
            }
            _ if key.starts_with("__") => {
                return Err(Error::Validation(format!(
                    "reserved query parameter '{key}'"
                )))
            }
            _ => {
                description.parameters.insert(key, value);
            }
        }
    }

    Ok(description)
}

fn decode(raw: &str) -> Result<String> {
    match urlencoding::decode(raw) {
        Ok(Cow::Borrowed(s)) => Ok(s.to_string()),
        Ok(Cow::Owned(s)) => Ok(s),
        Err(err) => Err(Error::Validation(format!(
            "malformed percent-encoding in '{raw}': {err}"
        ))),
    }
}

fn parse_unsigned(option: &str, value: &str) -> Result<u64> {
    value
        .parse::<u64>()
        .map_err(|_| Error::Validation(format!("{option} requires a non-negative integer")))
}

fn parse_bool(option: &str, value: &str) -> Result<bool> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(Error::Validation(format!(
            "{option} requires 'true' or 'false'"
        ))),
    }
}

fn parse_order_by(value: &str) -> Result<Vec<OrderBy>> {
    let mut clauses = Vec::new();
    for clause in value.split(',') {
        let mut words = clause.split_whitespace();
        let path = words
            .next()
            .ok_or_else(|| Error::Validation("empty $orderby clause".into()))?;
        let ascending = match words.next() {
            None | Some("asc") => true,
            Some("desc") => false,
            Some(other) => {
                return Err(Error::Validation(format!(
                    "unknown ordering direction '{other}'"
                )))
            }
        };
        if words.next().is_some() {
            return Err(Error::Validation(format!(
                "malformed $orderby clause '{clause}'"
            )));
        }
        clauses.push(OrderBy {
            path: lower_camel_path(path),
            ascending,
        });
    }
    Ok(clauses)
}

// ---------------------------------------------------------------------------
// Filter lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Number(String),
    DateTime(String),
    LParen,
    RParen,
    Comma,
}

fn lex(text: &str) -> Result<Vec<(Token, usize)>> {
    let bytes = text.as_bytes();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        let byte = bytes[pos];
        match byte {
            b' ' | b'\t' | b'\r' | b'\n' => pos += 1,
            b'(' => {
                tokens.push((Token::LParen, pos));
                pos += 1;
            }
            b')' => {
                tokens.push((Token::RParen, pos));
                pos += 1;
            }
            b',' => {
                tokens.push((Token::Comma, pos));
                pos += 1;
            }
            b'\'' => {
                let start = pos;
                let (literal, consumed) = lex_string(&text[pos..])
                    .ok_or_else(|| Error::syntax(start, "unterminated string literal"))?;
                tokens.push((Token::Str(literal), start));
                pos += consumed;
            }
            b'A'..=b'Z' | b'a'..=b'z' | b'_' => {
                let start = pos;
                while pos < bytes.len()
                    && (bytes[pos].is_ascii_alphanumeric() || matches!(bytes[pos], b'_' | b'.'))
                {
                    pos += 1;
                }
                tokens.push((Token::Ident(text[start..pos].to_string()), start));
            }
            b'0'..=b'9' | b'-' => {
                let start = pos;
                if byte != b'-' && is_datetime_start(&bytes[pos..]) {
                    while pos < bytes.len()
                        && (bytes[pos].is_ascii_digit()
                            || matches!(bytes[pos], b'T' | b't' | b'Z' | b'z' | b':' | b'.' | b'+' | b'-'))
                    {
                        pos += 1;
                    }
                    tokens.push((Token::DateTime(text[start..pos].to_string()), start));
                } else {
                    pos += 1; // sign or first digit
                    while pos < bytes.len()
                        && (bytes[pos].is_ascii_digit() || bytes[pos] == b'.')
                    {
                        pos += 1;
                    }
                    if pos < bytes.len() && matches!(bytes[pos], b'e' | b'E') {
                        pos += 1;
                        if pos < bytes.len() && matches!(bytes[pos], b'+' | b'-') {
                            pos += 1;
                        }
                        while pos < bytes.len() && bytes[pos].is_ascii_digit() {
                            pos += 1;
                        }
                    }
                    if pos < bytes.len() && matches!(bytes[pos], b'L' | b'l' | b'f' | b'F' | b'M' | b'm')
                    {
                        pos += 1;
                    }
                    tokens.push((Token::Number(text[start..pos].to_string()), start));
                }
            }
            _ => {
                let found = text[pos..].chars().next().unwrap_or('?');
                return Err(Error::syntax(
                    pos,
                    format!("unexpected character '{found}'"),
                ));
            }
        }
    }

    Ok(tokens)
}

/// A datetime literal begins with exactly four digits followed by `-`.
fn is_datetime_start(bytes: &[u8]) -> bool {
    bytes.len() > 4
        && bytes[..4].iter().all(u8::is_ascii_digit)
        && bytes[4] == b'-'
}

/// Lex a single-quoted string with `''` escaping; returns the unescaped
/// text and the number of bytes consumed, or None when unterminated.
fn lex_string(text: &str) -> Option<(String, usize)> {
    debug_assert!(text.starts_with('\''));
    let mut literal = String::new();
    let mut chars = text.char_indices().skip(1).peekable();

    while let Some((index, ch)) = chars.next() {
        if ch != '\'' {
            literal.push(ch);
            continue;
        }
        match chars.peek() {
            Some((_, '\'')) => {
                literal.push('\'');
                chars.next();
            }
            Some((next_index, _)) => return Some((literal, *next_index)),
            None => return Some((literal, index + 1)),
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Filter parser (precedence climbing)
// ---------------------------------------------------------------------------

pub(super) fn parse_filter(text: &str) -> Result<FilterExpr> {
    let tokens = lex(text)?;
    let mut parser = FilterParser {
        tokens,
        index: 0,
        end: text.len(),
    };
    let expr = parser.parse_or()?;
    if let Some((_, pos)) = parser.peek() {
        return Err(Error::syntax(pos, "unexpected trailing input"));
    }
    Ok(expr)
}

struct FilterParser {
    tokens: Vec<(Token, usize)>,
    index: usize,
    end: usize,
}

impl FilterParser {
    fn peek(&self) -> Option<(&Token, usize)> {
        self.tokens.get(self.index).map(|(token, pos)| (token, *pos))
    }

    fn next(&mut self) -> Option<(Token, usize)> {
        let item = self.tokens.get(self.index).cloned();
        if item.is_some() {
            self.index += 1;
        }
        item
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some((Token::Ident(word), _)) if word == keyword)
    }

    fn expect(&mut self, expected: Token, what: &str) -> Result<()> {
        match self.next() {
            Some((token, _)) if token == expected => Ok(()),
            Some((_, pos)) => Err(Error::syntax(pos, format!("expected {what}"))),
            None => Err(Error::syntax(self.end, format!("expected {what}"))),
        }
    }

    fn parse_or(&mut self) -> Result<FilterExpr> {
        let mut left = self.parse_and()?;
        while self.peek_keyword("or") {
            self.next();
            let right = self.parse_and()?;
            left = FilterExpr::or(left, right);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<FilterExpr> {
        let mut left = self.parse_comparison()?;
        while self.peek_keyword("and") {
            self.next();
            let right = self.parse_comparison()?;
            left = FilterExpr::and(left, right);
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<FilterExpr> {
        let left = self.parse_unary()?;

        if let Some((Token::Ident(word), pos)) = self.peek() {
            if let Some(op) = ComparisonOp::from_keyword(word) {
                self.next();
                let right = self.parse_unary()?;
                return Ok(FilterExpr::compare(op, left, right));
            }
            if word == "in" {
                let FilterExpr::Member(member) = left else {
                    return Err(Error::syntax(pos, "'in' requires a member on the left"));
                };
                self.next();
                self.expect(Token::LParen, "'(' after 'in'")?;
                let mut values = vec![self.parse_in_constant()?];
                while matches!(self.peek(), Some((Token::Comma, _))) {
                    self.next();
                    values.push(self.parse_in_constant()?);
                }
                self.expect(Token::RParen, "')' closing 'in' list")?;
                return Ok(FilterExpr::In { member, values });
            }
        }

        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<FilterExpr> {
        if self.peek_keyword("not") {
            self.next();
            let operand = self.parse_unary()?;
            return Ok(FilterExpr::not(operand));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<FilterExpr> {
        match self.next() {
            Some((Token::LParen, _)) => {
                let expr = self.parse_or()?;
                self.expect(Token::RParen, "')'")?;
                Ok(expr)
            }
            Some((Token::Str(value), _)) => Ok(FilterExpr::Constant(Constant::String(value))),
            Some((Token::Number(text), pos)) => {
                Ok(FilterExpr::Constant(parse_number(&text, pos)?))
            }
            Some((Token::DateTime(text), pos)) => {
                let value = crate::entity::parse_timestamp(&text)
                    .map_err(|err| Error::syntax(pos, format!("bad datetime literal: {err}")))?;
                Ok(FilterExpr::Constant(Constant::DateTime(value)))
            }
            Some((Token::Ident(word), pos)) => match word.as_str() {
                "true" => Ok(FilterExpr::Constant(Constant::Bool(true))),
                "false" => Ok(FilterExpr::Constant(Constant::Bool(false))),
                "null" => Ok(FilterExpr::Constant(Constant::Null)),
                _ => {
                    if matches!(self.peek(), Some((Token::LParen, _))) {
                        self.parse_function(&word, pos)
                    } else {
                        Ok(FilterExpr::Member(lower_camel_path(&word)))
                    }
                }
            },
            Some((token, pos)) => {
                Err(Error::syntax(pos, format!("unexpected token {token:?}")))
            }
            None => Err(Error::syntax(self.end, "unexpected end of filter")),
        }
    }

    fn parse_function(&mut self, name: &str, pos: usize) -> Result<FilterExpr> {
        let function = FunctionKind::from_name(name).ok_or_else(|| {
            Error::Validation(format!(
                "function '{name}' cannot be evaluated by the service"
            ))
        })?;
        self.expect(Token::LParen, "'('")?;

        let mut args = Vec::new();
        if !matches!(self.peek(), Some((Token::RParen, _))) {
            args.push(self.parse_or()?);
            while matches!(self.peek(), Some((Token::Comma, _))) {
                self.next();
                args.push(self.parse_or()?);
            }
        }
        self.expect(Token::RParen, "')'")?;

        let (min, max) = function.arity();
        if args.len() < min || args.len() > max {
            return Err(Error::syntax(
                pos,
                format!("{name} takes {min}..={max} arguments, got {}", args.len()),
            ));
        }
        Ok(FilterExpr::Function { function, args })
    }

    fn parse_in_constant(&mut self) -> Result<Constant> {
        match self.next() {
            Some((Token::Str(value), _)) => Ok(Constant::String(value)),
            Some((Token::Number(text), pos)) => parse_number(&text, pos),
            Some((Token::DateTime(text), pos)) => crate::entity::parse_timestamp(&text)
                .map(Constant::DateTime)
                .map_err(|err| Error::syntax(pos, format!("bad datetime literal: {err}"))),
            Some((Token::Ident(word), pos)) => match word.as_str() {
                "true" => Ok(Constant::Bool(true)),
                "false" => Ok(Constant::Bool(false)),
                "null" => Ok(Constant::Null),
                _ => Err(Error::syntax(pos, "'in' lists accept only constants")),
            },
            Some((_, pos)) => Err(Error::syntax(pos, "'in' lists accept only constants")),
            None => Err(Error::syntax(self.end, "unexpected end of 'in' list")),
        }
    }
}

fn parse_number(text: &str, pos: usize) -> Result<Constant> {
    let bad = |message: String| Error::syntax(pos, message);

    if let Some(body) = text.strip_suffix(['L', 'l']) {
        return body
            .parse::<i64>()
            .map(Constant::Int)
            .map_err(|_| bad(format!("bad integer literal '{text}'")));
    }
    if let Some(body) = text.strip_suffix(['f', 'F']) {
        return body
            .parse::<f32>()
            .map(Constant::Float)
            .map_err(|_| bad(format!("bad float literal '{text}'")));
    }
    if let Some(body) = text.strip_suffix(['M', 'm']) {
        return body
            .parse()
            .map(Constant::Decimal)
            .map_err(|_| bad(format!("bad decimal literal '{text}'")));
    }
    if text.contains(['.', 'e', 'E']) {
        return text
            .parse::<f64>()
            .map(Constant::Double)
            .map_err(|_| bad(format!("bad numeric literal '{text}'")));
    }
    text.parse::<i64>()
        .map(Constant::Int)
        .map_err(|_| bad(format!("bad integer literal '{text}'")))
}
