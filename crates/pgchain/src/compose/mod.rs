//! SQL composition: QueryState -> statement text plus positional parameters.
//!
//! One [`SqlWriter`] is threaded through a whole composition pass, so `$n`
//! placeholders are assigned in emission order and stay correct across CTEs,
//! joins, and sub-queries. Mutating sub-queries nested inside a statement are
//! hoisted into leading CTEs (one SQL statement, so the nested mutations and
//! the host succeed or fail together), and hook-relevant rows of those CTEs
//! are smuggled out through a synthetic trailing column managed by
//! [`CteHookChannel`].

pub(crate) mod delete;
pub(crate) mod insert;
pub(crate) mod select;
pub(crate) mod update;

use crate::error::{ChainError, ChainResult};
use crate::expr::Filter;
use crate::ident::{push_quoted, ColumnRef};
use crate::state::{ColumnValue, Payload, QueryKind, QueryState, SelectItem};
use crate::value::ParamList;
use serde_json::Value;

/// Bound-parameter budget of one statement: the Postgres extended-query
/// protocol carries the parameter count as a 16-bit integer.
pub const MAX_BIND_PARAMS: usize = 65_535;

/// A compiled statement: SQL text plus positional parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct Statement {
    pub text: String,
    pub params: Vec<Value>,
}

/// Shared writer for one composition pass.
#[derive(Default)]
pub(crate) struct SqlWriter {
    sql: String,
    params: ParamList,
}

impl SqlWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, s: &str) {
        self.sql.push_str(s);
    }

    pub fn push_char(&mut self, c: char) {
        self.sql.push(c);
    }

    pub fn push_quoted(&mut self, name: &str) {
        push_quoted(&mut self.sql, name);
    }

    pub fn push_column(&mut self, column: &ColumnRef, default_table: &str) {
        column.write_sql(&mut self.sql, default_table);
    }

    /// Bind a parameter and write its `$n` placeholder.
    pub fn bind(&mut self, value: Value) -> usize {
        let idx = self.params.push(value);
        self.sql.push('$');
        self.sql.push_str(&idx.to_string());
        idx
    }

    pub fn finish(self) -> Statement {
        Statement {
            text: self.sql,
            params: self.params.into_values(),
        }
    }

    pub fn finish_parts(self) -> (String, Vec<Value>) {
        (self.sql, self.params.into_values())
    }
}

/// The hook-data smuggling protocol for one hoisted mutating CTE.
///
/// Encode side: [`CteHookChannel::write_select_item`] appends the synthetic
/// trailing output column aggregating the CTE's rows as a JSON array.
/// Decode side: [`CteHookChannel::extract`] removes that field from the host
/// statement's first result row and yields the raw nested rows. The pipeline
/// parses them with the nested mutation's own parsers and dispatches its
/// after-hooks.
#[derive(Clone)]
pub struct CteHookChannel {
    pub cte_name: String,
    pub column: String,
    pub(crate) state: QueryState,
}

impl CteHookChannel {
    pub(crate) fn new(cte_name: &str, state: QueryState) -> Self {
        Self {
            cte_name: cte_name.to_string(),
            column: format!("__hook_rows__{cte_name}"),
            state,
        }
    }

    /// Append `(SELECT COALESCE(json_agg(row_to_json("t".*)), '[]') FROM
    /// "cte" "t") AS "__hook_rows__cte"` to the host's output list.
    pub(crate) fn write_select_item(&self, w: &mut SqlWriter) {
        w.push("(SELECT COALESCE(json_agg(row_to_json(\"t\".*)), '[]') FROM ");
        w.push_quoted(&self.cte_name);
        w.push(" \"t\") AS ");
        w.push_quoted(&self.column);
    }

    /// Strip the synthetic column out of a statement result and return the
    /// smuggled rows. The column is removed from the field list and from
    /// every row, so callers never see it. A host statement that produced no
    /// rows yields no channel data. A present but malformed field is a
    /// protocol violation.
    pub fn extract(&self, output: &mut crate::adapter::QueryOutput) -> ChainResult<Vec<Value>> {
        let Some(index) = output.fields.iter().position(|f| f == &self.column) else {
            return Err(ChainError::internal(format!(
                "hook channel column '{}' missing from result",
                self.column
            )));
        };
        output.fields.remove(index);
        let mut smuggled = None;
        for (i, row) in output.rows.iter_mut().enumerate() {
            if index < row.len() {
                let value = row.remove(index);
                if i == 0 {
                    smuggled = Some(value);
                }
            }
        }
        match smuggled {
            Some(Value::Array(rows)) => Ok(rows),
            None => Ok(Vec::new()),
            Some(other) => Err(ChainError::internal(format!(
                "hook channel column '{}' is not an array: {other}",
                self.column
            ))),
        }
    }
}

impl std::fmt::Debug for CteHookChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CteHookChannel")
            .field("cte_name", &self.cte_name)
            .field("column", &self.column)
            .finish()
    }
}

/// One hoisted mutating sub-statement.
pub(crate) struct Hoist {
    pub name: String,
    pub state: QueryState,
    /// Column the host reads from the CTE at the use site.
    pub value_column: String,
    /// Whether the mutation has after-hooks and needs a smuggling channel.
    pub channel: bool,
}

/// The hoists of one statement, consumed in traversal order: collection and
/// rendering walk the same effective structures, so the n-th mutating
/// sub-query encountered while rendering is the n-th hoist collected.
pub(crate) struct HoistPlan {
    hoists: Vec<Hoist>,
    cursor: usize,
}

impl HoistPlan {
    pub fn build<'a>(
        state: &QueryState,
        subs: impl Iterator<Item = &'a QueryState>,
    ) -> ChainResult<Self> {
        let mut hoists: Vec<Hoist> = Vec::new();
        for sub in subs {
            let mut name = sub.schema.table.clone();
            let taken = |n: &str| {
                state.with.iter().any(|c| c.name == n)
                    || hoists.iter().any(|h| h.name == n)
            };
            let mut i = 2;
            while taken(&name) {
                name = format!("{}{}", sub.schema.table, i);
                i += 1;
            }
            let channel = sub.hooks.has_after(sub.kind) || sub.hooks.has_after_commit(sub.kind);
            hoists.push(Hoist {
                name,
                value_column: mutation_value_column(sub)?,
                state: sub.clone(),
                channel,
            });
        }
        Ok(Self { hoists, cursor: 0 })
    }

    pub fn empty() -> Self {
        Self {
            hoists: Vec::new(),
            cursor: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.hoists.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Hoist> {
        self.hoists.iter()
    }

    /// The next hoist in traversal order; rendering calls this exactly once
    /// per mutating sub-query it encounters.
    pub fn take_next(&mut self) -> ChainResult<&Hoist> {
        let hoist = self.hoists.get(self.cursor).ok_or_else(|| {
            ChainError::internal("mutating sub-query was not hoisted into a CTE")
        })?;
        self.cursor += 1;
        Ok(hoist)
    }

    pub fn channels(&self) -> Vec<CteHookChannel> {
        self.hoists
            .iter()
            .filter(|h| h.channel)
            .map(|h| CteHookChannel::new(&h.name, h.state.clone()))
            .collect()
    }
}

/// One compiled statement plus the hook channels it carries.
pub(crate) struct ComposedStatement {
    pub statement: Statement,
    pub channels: Vec<CteHookChannel>,
}

/// The full compilation of a query descriptor. More than one statement means
/// a parameter-limited insert batch that must run inside one transaction.
pub(crate) struct Composed {
    pub statements: Vec<ComposedStatement>,
    /// An empty update degraded to a read; no after-update hooks fire from
    /// a plain read's rows unless rows actually changed.
    pub degraded_to_select: bool,
}

impl std::fmt::Debug for Composed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Composed")
            .field(
                "statements",
                &self
                    .statements
                    .iter()
                    .map(|s| &s.statement)
                    .collect::<Vec<_>>(),
            )
            .field("degraded_to_select", &self.degraded_to_select)
            .finish()
    }
}

/// Compile a query descriptor. Composing twice from the same state yields
/// the same statements.
pub(crate) fn compose(state: &QueryState) -> ChainResult<Composed> {
    validate_nesting(state, 0)?;
    match state.kind {
        QueryKind::Select => {
            let stmt = compose_select_statement(state)?;
            Ok(Composed {
                statements: vec![stmt],
                degraded_to_select: false,
            })
        }
        QueryKind::Insert => insert::compose_insert(state),
        QueryKind::Update => update::compose_update(state),
        QueryKind::Delete => delete::compose_delete(state),
    }
}

fn compose_select_statement(state: &QueryState) -> ChainResult<ComposedStatement> {
    let subs: Vec<&QueryState> = state
        .select
        .iter()
        .filter_map(|item| match item {
            SelectItem::SubQuery { query, .. } if query.kind != QueryKind::Select => {
                Some(query.as_ref())
            }
            _ => None,
        })
        .collect();
    let mut plan = HoistPlan::build(state, subs.into_iter())?;
    let mut w = SqlWriter::new();
    write_with_clause(state, &plan, &mut w)?;
    select::write_select_full(state, &mut w, Some(&mut plan))?;
    Ok(ComposedStatement {
        statement: w.finish(),
        channels: plan.channels(),
    })
}

/// Emit `WITH name AS (...), ...` for user CTEs and hoisted mutations, in
/// that order.
pub(crate) fn write_with_clause(
    state: &QueryState,
    plan: &HoistPlan,
    w: &mut SqlWriter,
) -> ChainResult<()> {
    if state.with.is_empty() && plan.is_empty() {
        return Ok(());
    }
    w.push("WITH ");
    let mut first = true;
    for cte in state.with.iter() {
        if !first {
            w.push(", ");
        }
        first = false;
        w.push_quoted(&cte.name);
        w.push(" AS (");
        if cte.query.kind == QueryKind::Select {
            select::write_select(&cte.query, w)?;
        } else {
            write_mutation_body(&cte.query, w)?;
        }
        w.push(")");
    }
    for hoist in plan.iter() {
        if !first {
            w.push(", ");
        }
        first = false;
        w.push_quoted(&hoist.name);
        w.push(" AS (");
        write_mutation_body(&hoist.state, w)?;
        w.push(")");
    }
    w.push(" ");
    Ok(())
}

/// Render a mutation as a CTE body, forcing `RETURNING *` so both the host's
/// use site and the hook channel can read its rows. Hoisting does not nest:
/// a mutating sub-query inside a hoisted mutation is rejected up front by
/// [`validate_nesting`].
fn write_mutation_body(state: &QueryState, w: &mut SqlWriter) -> ChainResult<()> {
    match state.kind {
        QueryKind::Insert => {
            let Some(payload) = state.payload.as_deref() else {
                return Err(ChainError::internal("insert payload not set"));
            };
            let Payload::Insert(p) = payload else {
                return Err(ChainError::internal("insert payload kind mismatch"));
            };
            insert::write_insert_body(state, p, &p.rows, w, None, true)
        }
        QueryKind::Update => update::write_update_hoisted(state, w),
        QueryKind::Delete => delete::write_delete_body(state, w, true),
        QueryKind::Select => Err(ChainError::internal("select is not a mutation")),
    }
}

/// The single output column the host statement reads from a hoisted
/// mutation: its value projection, else its first selected column, else the
/// table's primary key.
pub(crate) fn mutation_value_column(state: &QueryState) -> ChainResult<String> {
    if let Some(col) = &state.value_column {
        return Ok(col.name.clone());
    }
    for item in state.select.iter() {
        match item {
            SelectItem::Column(cref) => return Ok(cref.field_name().to_string()),
            SelectItem::Expr { alias, .. } => return Ok(alias.clone()),
            _ => {}
        }
    }
    if let Some(pk) = state.schema.shape.primary_key() {
        return Ok(pk.name.clone());
    }
    Err(ChainError::internal(format!(
        "nested mutation on '{}' must select a single column or have a primary key",
        state.schema.table
    )))
}

/// WHERE clause shared by select/update/delete bodies; bare columns are
/// qualified with `default_table` (the select alias, or the plain table
/// name for mutations, which declare no alias).
pub(crate) fn write_where(
    state: &QueryState,
    w: &mut SqlWriter,
    extra: &[Filter],
    default_table: &str,
) -> ChainResult<()> {
    let and_empty = state.filters.iter().all(Filter::is_empty);
    if (state.filters.is_empty() || and_empty) && extra.is_empty() {
        return Ok(());
    }
    w.push(" WHERE ");
    let mut all: Vec<Filter> = state.filters.as_ref().clone();
    all.extend(extra.iter().cloned());
    crate::expr::write_filters(&all, w, default_table)
}

/// RETURNING clause of a mutation: the select list rendered bare, `*` when
/// nothing was selected, plus any synthetic hook-channel columns.
pub(crate) fn write_returning(
    state: &QueryState,
    w: &mut SqlWriter,
    plan: &HoistPlan,
) -> ChainResult<()> {
    let channels: Vec<&Hoist> = plan.iter().filter(|h| h.channel).collect();
    if state.return_type == crate::state::ReturnType::Void && channels.is_empty() {
        return Ok(());
    }
    w.push(" RETURNING ");
    if state.select.is_empty() {
        w.push("*");
    } else {
        let mut first = true;
        for item in state.select.iter() {
            if !first {
                w.push(", ");
            }
            first = false;
            match item {
                SelectItem::Star => w.push("*"),
                SelectItem::Column(cref) => cref.write_bare(&mut w.sql),
                SelectItem::Expr { alias, sql } => {
                    w.push(sql);
                    w.push(" AS ");
                    w.push_quoted(alias);
                }
                SelectItem::TableStar(_) | SelectItem::SubQuery { .. } => {
                    return Err(ChainError::internal(
                        "joined projections cannot be returned from a mutation",
                    ));
                }
            }
        }
    }
    for hoist in channels {
        w.push(", ");
        CteHookChannel::new(&hoist.name, hoist.state.clone()).write_select_item(w);
    }
    Ok(())
}

/// Encode a plain value through the column's encoder when one is declared.
pub(crate) fn encode_value(
    state: &QueryState,
    column: &str,
    value: Value,
) -> ChainResult<Value> {
    match state.schema.shape.get(column).and_then(|c| c.encode.clone()) {
        Some(encode) => encode(value).map_err(|e| match e {
            ChainError::Encode { .. } => e,
            other => ChainError::encode(column, other.to_string()),
        }),
        None => Ok(value),
    }
}

/// Render one mutation payload value. Raw SQL and sub-query values bypass
/// encoding; hoisted mutations are referenced through their CTE.
pub(crate) fn write_column_value(
    state: &QueryState,
    column: &str,
    value: &ColumnValue,
    w: &mut SqlWriter,
    plan: &mut Option<&mut HoistPlan>,
) -> ChainResult<()> {
    match value {
        ColumnValue::Value(v) => {
            let encoded = encode_value(state, column, v.clone())?;
            w.bind(encoded);
            Ok(())
        }
        ColumnValue::Raw(sql) => {
            w.push(sql);
            Ok(())
        }
        ColumnValue::Default => {
            w.push("DEFAULT");
            Ok(())
        }
        ColumnValue::SubQuery(sub) if sub.kind == QueryKind::Select => {
            w.push("(");
            select::write_select(sub, w)?;
            w.push(")");
            Ok(())
        }
        ColumnValue::SubQuery(_) => {
            let Some(plan) = plan.as_mut() else {
                return Err(ChainError::internal(
                    "mutating sub-queries cannot nest inside another hoisted mutation",
                ));
            };
            let hoist = plan.take_next()?;
            w.push("(SELECT ");
            w.push_quoted(&hoist.value_column);
            w.push(" FROM ");
            w.push_quoted(&hoist.name);
            w.push(" LIMIT 1)");
            Ok(())
        }
    }
}

/// Reject mutating sub-queries anywhere below statement top level; hoisting
/// lifts them into CTEs of the outermost statement only.
fn validate_nesting(state: &QueryState, depth: usize) -> ChainResult<()> {
    for item in state.select.iter() {
        if let SelectItem::SubQuery { query, .. } = item {
            if query.kind != QueryKind::Select {
                if depth > 0 {
                    return Err(ChainError::internal(
                        "a mutating sub-query must appear at statement top level",
                    ));
                }
                validate_nesting(query, depth + 1)?;
            } else {
                validate_nesting(query, depth + 1)?;
            }
        }
    }
    for filter in state.filters.iter() {
        validate_filter_nesting(filter, depth)?;
    }
    if let Some(payload) = state.payload.as_deref() {
        let check = |cv: &ColumnValue| -> ChainResult<()> {
            if let ColumnValue::SubQuery(sub) = cv {
                if sub.kind != QueryKind::Select && depth > 0 {
                    return Err(ChainError::internal(
                        "a mutating sub-query must appear at statement top level",
                    ));
                }
                validate_nesting(sub, depth + 1)?;
            }
            Ok(())
        };
        match payload {
            Payload::Insert(p) => {
                for row in &p.rows {
                    for cv in row {
                        check(cv)?;
                    }
                }
            }
            Payload::Update(p) => {
                for patch in &p.patches {
                    if let crate::state::UpdatePatch::Set(sets) = patch {
                        for (_, cv) in sets {
                            check(cv)?;
                        }
                    }
                }
            }
            Payload::Delete { .. } => {}
        }
    }
    Ok(())
}

fn validate_filter_nesting(filter: &Filter, depth: usize) -> ChainResult<()> {
    match filter {
        Filter::And(fs) | Filter::Or(fs) => {
            for f in fs {
                validate_filter_nesting(f, depth)?;
            }
            Ok(())
        }
        Filter::Not(inner) => validate_filter_nesting(inner, depth),
        Filter::Exists { query, .. } => {
            if query.kind != QueryKind::Select {
                return Err(ChainError::internal(
                    "EXISTS requires a select sub-query",
                ));
            }
            validate_nesting(query, depth + 1)
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::QueryOutput;
    use crate::schema::TableSchema;
    use serde_json::json;

    #[test]
    fn hook_channel_encode_decode_pair() {
        let state = QueryState::new(TableSchema::new("orders"));
        let channel = CteHookChannel::new("orders", state);

        let mut w = SqlWriter::new();
        channel.write_select_item(&mut w);
        let (sql, params) = w.finish_parts();
        assert_eq!(
            sql,
            "(SELECT COALESCE(json_agg(row_to_json(\"t\".*)), '[]') FROM \"orders\" \"t\") AS \"__hook_rows__orders\""
        );
        assert!(params.is_empty());

        let mut output = QueryOutput {
            fields: vec!["id".to_string(), "__hook_rows__orders".to_string()],
            rows: vec![vec![json!(1), json!([{"id": 7}])]],
            row_count: 1,
        };
        let rows = channel.extract(&mut output).unwrap();
        assert_eq!(rows, vec![json!({"id": 7})]);
        // The synthetic column is gone from the visible result.
        assert_eq!(output.fields, vec!["id".to_string()]);
        assert_eq!(output.rows, vec![vec![json!(1)]]);
    }

    #[test]
    fn hook_channel_with_no_host_rows_yields_nothing() {
        let state = QueryState::new(TableSchema::new("orders"));
        let channel = CteHookChannel::new("orders", state);
        let mut output = QueryOutput {
            fields: vec!["__hook_rows__orders".to_string()],
            rows: vec![],
            row_count: 0,
        };
        assert!(channel.extract(&mut output).unwrap().is_empty());
    }

    #[test]
    fn missing_channel_column_is_a_protocol_violation() {
        let state = QueryState::new(TableSchema::new("orders"));
        let channel = CteHookChannel::new("orders", state);
        let mut output = QueryOutput {
            fields: vec!["id".to_string()],
            rows: vec![vec![json!(1)]],
            row_count: 1,
        };
        assert!(channel.extract(&mut output).is_err());
    }
}
