//! Join descriptors and the join resolver.
//!
//! Resolving a join computes the target's projected shape (what columns the
//! join contributes), its column parsers, and whether the join must be
//! `JOIN LATERAL` (required whenever the joined sub-query references columns
//! of the outer query). Structurally identical static joins are
//! deduplicated; a condition carrying bound parameter values never is.

use crate::compose::{select::write_select, SqlWriter};
use crate::error::ChainResult;
use crate::expr::Filter;
use crate::ident::ColumnRef;
use crate::schema::{ColumnDef, DecodeFn, Shape, TableSchema};
use crate::state::{OrderItem, QueryState, SelectItem};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Join kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
    Right,
    Full,
}

impl JoinKind {
    pub(crate) fn sql(self) -> &'static str {
        match self {
            JoinKind::Inner => "JOIN",
            JoinKind::Left => "LEFT JOIN",
            JoinKind::Right => "RIGHT JOIN",
            JoinKind::Full => "FULL JOIN",
        }
    }
}

/// What a join points at.
#[derive(Clone, Debug)]
pub enum JoinTarget {
    Table(TableSchema),
    /// A CTE declared on the same query.
    Cte(String),
    SubQuery(Box<QueryState>),
}

impl JoinTarget {
    /// Default alias for the target.
    pub(crate) fn default_alias(&self) -> &str {
        match self {
            JoinTarget::Table(schema) => &schema.table,
            JoinTarget::Cte(name) => name,
            JoinTarget::SubQuery(state) => state.table_alias(),
        }
    }

    /// Identity component of the dedup signature. Sub-query targets are
    /// identified by compiled SQL text and only when parameter-free.
    fn identity(&self) -> Option<String> {
        match self {
            JoinTarget::Table(schema) => Some(format!("t:{}", schema.table)),
            JoinTarget::Cte(name) => Some(format!("c:{name}")),
            JoinTarget::SubQuery(state) => {
                let mut w = SqlWriter::new();
                write_select(state, &mut w).ok()?;
                let (sql, params) = w.finish_parts();
                if params.is_empty() {
                    Some(format!("q:{sql}"))
                } else {
                    None
                }
            }
        }
    }
}

/// One join of a query descriptor.
#[derive(Clone, Debug)]
pub struct Join {
    pub kind: JoinKind,
    pub target: JoinTarget,
    pub alias: String,
    /// Static `ON` conditions; bare columns refer to the joined side.
    pub on: Vec<Filter>,
    pub lateral: bool,
    /// Inner-join semantics: a `none`-sentinel target collapses the host.
    pub required: bool,
}

impl Join {
    /// Syntactic dedup key: `None` when the join cannot be deduplicated
    /// (its condition or target binds runtime values). Two joins that are
    /// semantically identical but spelled differently produce different
    /// signatures and are kept as duplicates, by design.
    pub(crate) fn static_signature(&self) -> Option<String> {
        if self.on.iter().any(Filter::has_params) {
            return None;
        }
        let identity = self.target.identity()?;
        let mut w = SqlWriter::new();
        crate::expr::write_filters(&self.on, &mut w, &self.alias).ok()?;
        let (on_sql, _) = w.finish_parts();
        Some(format!(
            "{}|{}|{}|{}",
            self.kind.sql(),
            self.alias,
            identity,
            on_sql
        ))
    }

    /// Render `JOIN [LATERAL] target AS alias ON ...` into the writer.
    pub(crate) fn write_sql(&self, w: &mut SqlWriter) -> ChainResult<()> {
        w.push(" ");
        w.push(self.kind.sql());
        if self.lateral {
            w.push(" LATERAL");
        }
        w.push(" ");
        match &self.target {
            JoinTarget::Table(schema) => {
                w.push_quoted(&schema.table);
                if self.alias != schema.table {
                    w.push(" ");
                    w.push_quoted(&self.alias);
                }
            }
            JoinTarget::Cte(name) => {
                w.push_quoted(name);
                if self.alias != *name {
                    w.push(" ");
                    w.push_quoted(&self.alias);
                }
            }
            JoinTarget::SubQuery(state) => {
                w.push("(");
                write_select(state, w)?;
                w.push(") ");
                w.push_quoted(&self.alias);
            }
        }
        if self.on.is_empty() {
            // A lateral sub-query correlates through its own WHERE clause.
            w.push(" ON true");
        } else {
            w.push(" ON ");
            crate::expr::write_filters(&self.on, w, &self.alias)?;
        }
        Ok(())
    }
}

/// The resolved projection of a join target: output shape, column parsers,
/// and computed-column SQL carried over from the target's select list.
pub(crate) struct ResolvedJoin {
    pub shape: Arc<Shape>,
    pub parsers: BTreeMap<String, DecodeFn>,
    pub computeds: BTreeMap<String, String>,
}

/// Compute the projected shape of a join target: an explicit select narrows
/// the shape to the selected items with qualification stripped; otherwise
/// the full table shape is used.
pub(crate) fn resolve_target(target: &JoinTarget) -> ResolvedJoin {
    match target {
        JoinTarget::Table(schema) => {
            let parsers = schema
                .shape
                .iter()
                .filter_map(|c| c.decode.clone().map(|d| (c.name.clone(), d)))
                .collect();
            ResolvedJoin {
                shape: schema.shape.clone(),
                parsers,
                computeds: BTreeMap::new(),
            }
        }
        JoinTarget::Cte(_) => ResolvedJoin {
            shape: Arc::new(Shape::default()),
            parsers: BTreeMap::new(),
            computeds: BTreeMap::new(),
        },
        JoinTarget::SubQuery(state) => resolve_subquery(state),
    }
}

fn resolve_subquery(state: &QueryState) -> ResolvedJoin {
    if state.select.is_empty() {
        let parsers = state
            .schema
            .shape
            .iter()
            .filter_map(|c| c.decode.clone().map(|d| (c.name.clone(), d)))
            .collect();
        return ResolvedJoin {
            shape: state.schema.shape.clone(),
            parsers,
            computeds: BTreeMap::new(),
        };
    }

    let mut columns = Vec::new();
    let mut parsers = BTreeMap::new();
    let mut computeds = BTreeMap::new();
    for item in state.select.iter() {
        match item {
            SelectItem::Star => {
                for col in state.schema.shape.star_columns() {
                    if let Some(p) = state.parser_for(&col.name) {
                        parsers.insert(col.name.clone(), p);
                    }
                    columns.push(col.clone());
                }
            }
            SelectItem::Column(cref) => {
                let name = cref.field_name().to_string();
                let def = state
                    .schema
                    .shape
                    .get(&name)
                    .cloned()
                    .unwrap_or_else(|| ColumnDef::new(name.clone()));
                if let Some(p) = state.parser_for(&name) {
                    parsers.insert(name, p);
                }
                columns.push(def);
            }
            SelectItem::TableStar(alias) => {
                columns.push(ColumnDef::new(alias.clone()));
            }
            SelectItem::Expr { alias, sql } => {
                computeds.insert(alias.clone(), sql.clone());
                columns.push(ColumnDef::new(alias.clone()));
            }
            SelectItem::SubQuery { alias, .. } => {
                columns.push(ColumnDef::new(alias.clone()));
            }
        }
    }
    ResolvedJoin {
        shape: Arc::new(Shape::new(columns)),
        parsers,
        computeds,
    }
}

/// Decide plain join vs. lateral join: lateral is required exactly when the
/// sub-query references a column qualified by a table that is not one of its
/// own (its table alias, its joins, its CTEs).
pub(crate) fn needs_lateral(state: &QueryState) -> bool {
    let mut own: Vec<&str> = vec![state.table_alias()];
    own.extend(state.joins.iter().map(|j| j.alias.as_str()));
    own.extend(state.with.iter().map(|c| c.name.as_str()));

    let foreign = |cref: &ColumnRef| match &cref.table {
        Some(t) => !own.contains(&t.as_str()),
        None => false,
    };

    fn filter_refs<'a>(filter: &'a Filter, out: &mut Vec<&'a ColumnRef>) {
        match filter {
            Filter::And(fs) | Filter::Or(fs) => {
                for f in fs {
                    filter_refs(f, out);
                }
            }
            Filter::Not(inner) => filter_refs(inner, out),
            Filter::Compare { column, .. }
            | Filter::NullCheck { column, .. }
            | Filter::InList { column, .. }
            | Filter::Between { column, .. } => out.push(column),
            Filter::ColumnPair { left, right, .. } => {
                out.push(left);
                out.push(right);
            }
            _ => {}
        }
    }

    let mut refs = Vec::new();
    for f in state.filters.iter() {
        filter_refs(f, &mut refs);
    }
    for o in state.order.iter() {
        if let OrderItem::Column { column, .. } = o {
            refs.push(column);
        }
    }
    for item in state.select.iter() {
        if let SelectItem::Column(cref) = item {
            refs.push(cref);
        }
    }
    refs.into_iter().any(foreign)
}

/// Render the `USING` entry for a joined delete.
pub(crate) fn write_using(join: &Join, w: &mut SqlWriter) -> ChainResult<()> {
    match &join.target {
        JoinTarget::Table(schema) => {
            w.push_quoted(&schema.table);
            if join.alias != schema.table {
                w.push(" ");
                w.push_quoted(&join.alias);
            }
        }
        JoinTarget::Cte(name) => {
            w.push_quoted(name);
            if join.alias != *name {
                w.push(" ");
                w.push_quoted(&join.alias);
            }
        }
        JoinTarget::SubQuery(state) => {
            w.push("(");
            write_select(state, w)?;
            w.push(") ");
            w.push_quoted(&join.alias);
        }
    }
    Ok(())
}
