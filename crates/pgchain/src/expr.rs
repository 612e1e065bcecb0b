//! Filter expression tree for WHERE/ON/HAVING conditions.
//!
//! Supports AND/OR/NOT grouping, comparison operators, column-to-column
//! conditions (join `ON` clauses), templates with `?` placeholders, raw SQL
//! fragments, and `EXISTS` sub-queries. `Filter::build` appends to the
//! composition pass's shared [`SqlWriter`], so `$n` indices are assigned
//! globally and never need adjusting.

use crate::compose::SqlWriter;
use crate::error::ChainResult;
use crate::ident::ColumnRef;
use crate::state::QueryState;
use serde_json::Value;

/// Expression node for building WHERE/ON clauses.
#[derive(Clone, Debug)]
pub enum Filter {
    /// AND group: all conditions must be true.
    And(Vec<Filter>),

    /// OR group: at least one condition must be true.
    Or(Vec<Filter>),

    /// NOT: negate the inner expression.
    Not(Box<Filter>),

    /// Simple comparison: column op $n
    Compare {
        column: ColumnRef,
        op: &'static str,
        value: Value,
    },

    /// Column-to-column comparison: left op right
    ColumnPair {
        left: ColumnRef,
        op: &'static str,
        right: ColumnRef,
    },

    /// NULL check: column IS NULL or column IS NOT NULL
    NullCheck { column: ColumnRef, is_null: bool },

    /// IN list: column IN ($1, $2, ...) or column NOT IN (...)
    InList {
        column: ColumnRef,
        values: Vec<Value>,
        negated: bool,
    },

    /// BETWEEN: column BETWEEN $n AND $m
    Between {
        column: ColumnRef,
        from: Value,
        to: Value,
        negated: bool,
    },

    /// Template with `?` placeholders that get replaced with `$n`.
    Template { sql: String, params: Vec<Value> },

    /// Raw SQL fragment without parameters.
    Raw(String),

    /// EXISTS / NOT EXISTS sub-query predicate.
    Exists {
        query: Box<QueryState>,
        negated: bool,
    },

    /// Always true (used for empty NOT IN lists).
    True,

    /// Always false (used for empty IN lists).
    False,
}

impl Filter {
    pub fn and(filters: Vec<Filter>) -> Self {
        Filter::And(filters)
    }

    pub fn or(filters: Vec<Filter>) -> Self {
        Filter::Or(filters)
    }

    pub fn not(filter: Filter) -> Self {
        Filter::Not(Box::new(filter))
    }

    pub fn eq(column: &str, value: impl Into<Value>) -> Self {
        Filter::Compare {
            column: ColumnRef::parse(column),
            op: "=",
            value: value.into(),
        }
    }

    pub fn ne(column: &str, value: impl Into<Value>) -> Self {
        Filter::Compare {
            column: ColumnRef::parse(column),
            op: "<>",
            value: value.into(),
        }
    }

    pub fn gt(column: &str, value: impl Into<Value>) -> Self {
        Filter::Compare {
            column: ColumnRef::parse(column),
            op: ">",
            value: value.into(),
        }
    }

    pub fn gte(column: &str, value: impl Into<Value>) -> Self {
        Filter::Compare {
            column: ColumnRef::parse(column),
            op: ">=",
            value: value.into(),
        }
    }

    pub fn lt(column: &str, value: impl Into<Value>) -> Self {
        Filter::Compare {
            column: ColumnRef::parse(column),
            op: "<",
            value: value.into(),
        }
    }

    pub fn lte(column: &str, value: impl Into<Value>) -> Self {
        Filter::Compare {
            column: ColumnRef::parse(column),
            op: "<=",
            value: value.into(),
        }
    }

    pub fn like(column: &str, pattern: impl Into<Value>) -> Self {
        Filter::Compare {
            column: ColumnRef::parse(column),
            op: "LIKE",
            value: pattern.into(),
        }
    }

    pub fn ilike(column: &str, pattern: impl Into<Value>) -> Self {
        Filter::Compare {
            column: ColumnRef::parse(column),
            op: "ILIKE",
            value: pattern.into(),
        }
    }

    /// Column-to-column equality, the common join condition.
    pub fn col_eq(left: &str, right: &str) -> Self {
        Filter::ColumnPair {
            left: ColumnRef::parse(left),
            op: "=",
            right: ColumnRef::parse(right),
        }
    }

    /// Column-to-column comparison with an explicit operator.
    pub fn col_cmp(left: &str, op: &'static str, right: &str) -> Self {
        Filter::ColumnPair {
            left: ColumnRef::parse(left),
            op,
            right: ColumnRef::parse(right),
        }
    }

    pub fn is_null(column: &str) -> Self {
        Filter::NullCheck {
            column: ColumnRef::parse(column),
            is_null: true,
        }
    }

    pub fn is_not_null(column: &str) -> Self {
        Filter::NullCheck {
            column: ColumnRef::parse(column),
            is_null: false,
        }
    }

    pub fn in_list(column: &str, values: Vec<Value>) -> Self {
        if values.is_empty() {
            return Filter::False;
        }
        Filter::InList {
            column: ColumnRef::parse(column),
            values,
            negated: false,
        }
    }

    pub fn not_in(column: &str, values: Vec<Value>) -> Self {
        if values.is_empty() {
            return Filter::True;
        }
        Filter::InList {
            column: ColumnRef::parse(column),
            values,
            negated: true,
        }
    }

    pub fn between(column: &str, from: impl Into<Value>, to: impl Into<Value>) -> Self {
        Filter::Between {
            column: ColumnRef::parse(column),
            from: from.into(),
            to: to.into(),
            negated: false,
        }
    }

    /// Template condition with `?` placeholders, e.g. `"a = ? OR b = ?"`.
    pub fn template(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Filter::Template {
            sql: sql.into(),
            params,
        }
    }

    pub fn raw(sql: impl Into<String>) -> Self {
        Filter::Raw(sql.into())
    }

    pub fn exists(query: QueryState) -> Self {
        Filter::Exists {
            query: Box::new(query),
            negated: false,
        }
    }

    pub fn not_exists(query: QueryState) -> Self {
        Filter::Exists {
            query: Box::new(query),
            negated: true,
        }
    }

    /// Check if this expression is empty (contains no conditions).
    pub fn is_empty(&self) -> bool {
        match self {
            Filter::And(fs) | Filter::Or(fs) => fs.is_empty() || fs.iter().all(|f| f.is_empty()),
            Filter::Not(inner) => inner.is_empty(),
            _ => false,
        }
    }

    /// Whether the expression binds any runtime parameter values.
    ///
    /// Join deduplication is purely syntactic: a condition carrying bound
    /// values has no static signature and is never deduplicated.
    pub fn has_params(&self) -> bool {
        match self {
            Filter::And(fs) | Filter::Or(fs) => fs.iter().any(Filter::has_params),
            Filter::Not(inner) => inner.has_params(),
            Filter::Compare { .. }
            | Filter::InList { .. }
            | Filter::Between { .. }
            | Filter::Exists { .. } => true,
            Filter::Template { params, .. } => !params.is_empty(),
            Filter::ColumnPair { .. }
            | Filter::NullCheck { .. }
            | Filter::Raw(_)
            | Filter::True
            | Filter::False => false,
        }
    }

    /// Build the SQL fragment, binding parameters into the shared writer.
    ///
    /// `default_table` qualifies bare column references.
    pub(crate) fn build(&self, w: &mut SqlWriter, default_table: &str) -> ChainResult<()> {
        match self {
            Filter::And(fs) => {
                let mut first = true;
                for f in fs.iter().filter(|f| !f.is_empty()) {
                    if !first {
                        w.push(" AND ");
                    }
                    first = false;
                    let wrap = matches!(f, Filter::Or(_));
                    if wrap {
                        w.push("(");
                    }
                    f.build(w, default_table)?;
                    if wrap {
                        w.push(")");
                    }
                }
            }
            Filter::Or(fs) => {
                let mut first = true;
                for f in fs.iter().filter(|f| !f.is_empty()) {
                    if !first {
                        w.push(" OR ");
                    }
                    first = false;
                    let wrap = matches!(f, Filter::And(_));
                    if wrap {
                        w.push("(");
                    }
                    f.build(w, default_table)?;
                    if wrap {
                        w.push(")");
                    }
                }
            }
            Filter::Not(inner) => {
                if !inner.is_empty() {
                    w.push("NOT (");
                    inner.build(w, default_table)?;
                    w.push(")");
                }
            }
            Filter::Compare { column, op, value } => {
                w.push_column(column, default_table);
                w.push(" ");
                w.push(op);
                w.push(" ");
                w.bind(value.clone());
            }
            Filter::ColumnPair { left, op, right } => {
                w.push_column(left, default_table);
                w.push(" ");
                w.push(op);
                w.push(" ");
                w.push_column(right, default_table);
            }
            Filter::NullCheck { column, is_null } => {
                w.push_column(column, default_table);
                w.push(if *is_null { " IS NULL" } else { " IS NOT NULL" });
            }
            Filter::InList {
                column,
                values,
                negated,
            } => {
                w.push_column(column, default_table);
                w.push(if *negated { " NOT IN (" } else { " IN (" });
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        w.push(", ");
                    }
                    w.bind(v.clone());
                }
                w.push(")");
            }
            Filter::Between {
                column,
                from,
                to,
                negated,
            } => {
                w.push_column(column, default_table);
                w.push(if *negated { " NOT BETWEEN " } else { " BETWEEN " });
                w.bind(from.clone());
                w.push(" AND ");
                w.bind(to.clone());
            }
            Filter::Template { sql, params } => {
                let mut idx = 0;
                for ch in sql.chars() {
                    if ch == '?' && idx < params.len() {
                        w.bind(params[idx].clone());
                        idx += 1;
                    } else {
                        w.push_char(ch);
                    }
                }
            }
            Filter::Raw(sql) => w.push(sql),
            Filter::Exists { query, negated } => {
                if *negated {
                    w.push("NOT ");
                }
                w.push("EXISTS (");
                crate::compose::select::write_select(query, w)?;
                w.push(")");
            }
            Filter::True => w.push("1=1"),
            Filter::False => w.push("1=0"),
        }
        Ok(())
    }
}

/// Build a WHERE-clause body from an AND-composed filter list.
pub(crate) fn write_filters(
    filters: &[Filter],
    w: &mut SqlWriter,
    default_table: &str,
) -> ChainResult<()> {
    Filter::And(filters.to_vec()).build(w, default_table)
}
