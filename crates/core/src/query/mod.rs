//! Query descriptions and their OData v4 wire codec.
//!
//! A [`QueryDescription`] is the language-neutral form of a table query:
//! an optional filter expression tree, ordering, projection, paging, and
//! user-defined parameters. [`QueryDescription::to_query_string`] emits the
//! OData form and [`QueryDescription::parse`] reads it back; the two
//! round-trip under the normalization documented on the emitter.

mod emit;
mod eval;
mod filter;
mod parse;

use std::collections::BTreeMap;

use crate::errors::{Error, Result};

pub use eval::{compare_entities, matches, project};
pub use filter::{ComparisonOp, Constant, FilterExpr, FunctionKind, LogicalOp};

/// A single ordering clause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub path: String,
    pub ascending: bool,
}

impl OrderBy {
    pub fn ascending(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ascending: true,
        }
    }

    pub fn descending(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ascending: false,
        }
    }
}

/// The language-neutral description of a table query.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueryDescription {
    pub filter: Option<FilterExpr>,
    pub order_by: Vec<OrderBy>,
    pub selection: Vec<String>,
    pub skip: Option<u64>,
    pub top: Option<u64>,
    pub request_total_count: bool,
    pub include_deleted: bool,
    pub parameters: BTreeMap<String, String>,
}

impl QueryDescription {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the filter expression.
    pub fn with_filter(mut self, filter: FilterExpr) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Append an ordering clause.
    pub fn with_order_by(mut self, order: OrderBy) -> Self {
        self.order_by.push(order);
        self
    }

    /// Restrict the projection to the named fields.
    pub fn with_selection<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.selection = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_skip(mut self, skip: u64) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn with_top(mut self, top: u64) -> Self {
        self.top = Some(top);
        self
    }

    pub fn with_total_count(mut self, request: bool) -> Self {
        self.request_total_count = request;
        self
    }

    pub fn with_deleted_included(mut self, include: bool) -> Self {
        self.include_deleted = include;
        self
    }

    /// Add a user-defined query parameter.
    ///
    /// Keys are stored lowercased; keys beginning with `$` or `__` are
    /// reserved for the protocol and rejected.
    pub fn add_parameter(&mut self, key: &str, value: impl Into<String>) -> Result<()> {
        let key = key.to_ascii_lowercase();
        if key.is_empty() || key.starts_with('$') || key.starts_with("__") {
            return Err(Error::Validation(format!(
                "user query parameter key '{key}' is reserved"
            )));
        }
        self.parameters.insert(key, value.into());
        Ok(())
    }

    /// Emit the OData v4 query string for this description.
    pub fn to_query_string(&self) -> String {
        emit::emit_query(self)
    }

    /// Parse an OData v4 query string.
    ///
    /// Tolerates absent options; rejects unknown `$`-prefixed options and
    /// reserved `__`-prefixed parameters other than `__includedeleted`.
    pub fn parse(query: &str) -> Result<Self> {
        parse::parse_query_string(query)
    }

    /// Parse a standalone `$filter` expression.
    pub fn parse_filter(text: &str) -> Result<FilterExpr> {
        parse::parse_filter(text)
    }
}
