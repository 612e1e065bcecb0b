//! SELECT statement composition.

use crate::compose::{HoistPlan, SqlWriter};
use crate::error::{ChainError, ChainResult};
use crate::joins::needs_lateral;
use crate::state::{OrderItem, QueryKind, QueryState, ReturnType, SelectItem};
use serde_json::Value;

/// Render a select query into the writer (sub-query and CTE position: no
/// hoisting, the state has been validated to contain no nested mutations).
pub(crate) fn write_select(state: &QueryState, w: &mut SqlWriter) -> ChainResult<()> {
    write_select_full(state, w, None)
}

/// The single output field of a sub-query used as a scalar: its value
/// projection, else the first selected column or alias.
pub(crate) fn output_field(state: &QueryState) -> Option<String> {
    if let Some(col) = &state.value_column {
        return Some(col.name.clone());
    }
    for item in state.select.iter() {
        match item {
            SelectItem::Column(cref) => return Some(cref.field_name().to_string()),
            SelectItem::Expr { alias, .. } => return Some(alias.clone()),
            SelectItem::SubQuery { alias, .. } => return Some(alias.clone()),
            _ => {}
        }
    }
    None
}

/// A value-returning lateral sub-query shared by its use sites.
struct LateralValue {
    /// Dedup key: compiled text plus parameter values.
    key: (String, Vec<Value>),
    alias: String,
    field: String,
    /// Index of the first select item carrying this sub-query.
    item: usize,
}

/// Whether a sub-query select item is a value projection that must join
/// laterally (it references the outer row).
fn is_lateral_value(query: &QueryState) -> bool {
    query.kind == QueryKind::Select
        && matches!(
            query.return_type,
            ReturnType::Value | ReturnType::ValueOrThrow
        )
        && needs_lateral(query)
        && output_field(query).is_some()
}

/// Group value sub-queries that must join laterally, deduplicating by
/// compiled SQL: identical sub-queries share one `JOIN LATERAL` and every
/// use site references its aliased output.
fn plan_lateral_values(state: &QueryState) -> ChainResult<Vec<LateralValue>> {
    let mut laterals: Vec<LateralValue> = Vec::new();
    for (i, item) in state.select.iter().enumerate() {
        let SelectItem::SubQuery { query, .. } = item else {
            continue;
        };
        if !is_lateral_value(query) {
            continue;
        }
        let Some(field) = output_field(query) else {
            continue;
        };
        let mut probe = SqlWriter::new();
        write_select(query, &mut probe)?;
        let key = probe.finish_parts();
        if laterals.iter().any(|l| l.key == key) {
            continue;
        }
        let alias = format!("v{}", laterals.len() + 1);
        laterals.push(LateralValue {
            key,
            alias: state.free_alias(&alias),
            field,
            item: i,
        });
    }
    Ok(laterals)
}

/// Full select composition. `plan` is present only at statement top level,
/// where mutating sub-selects have been hoisted into CTEs.
pub(crate) fn write_select_full(
    state: &QueryState,
    w: &mut SqlWriter,
    mut plan: Option<&mut HoistPlan>,
) -> ChainResult<()> {
    let laterals = plan_lateral_values(state)?;

    w.push("SELECT ");
    if state.select.is_empty() {
        write_star(state, w);
    } else {
        let mut first = true;
        for (i, item) in state.select.iter().enumerate() {
            if !first {
                w.push(", ");
            }
            first = false;
            write_select_item(state, i, item, &laterals, w, &mut plan)?;
        }
    }
    if let Some(plan_ref) = plan.as_deref() {
        for channel in plan_ref.channels() {
            w.push(", ");
            channel.write_select_item(w);
        }
    }

    w.push(" FROM ");
    w.push_quoted(&state.schema.table);
    if let Some(alias) = &state.alias {
        if alias != &state.schema.table {
            w.push(" ");
            w.push_quoted(alias);
        }
    }

    for join in state.joins.iter() {
        join.write_sql(w)?;
    }
    for lateral in &laterals {
        let SelectItem::SubQuery { query, .. } = &state.select[lateral.item] else {
            unreachable!("lateral plan points at a sub-query item");
        };
        w.push(" LEFT JOIN LATERAL (");
        write_select(query, w)?;
        w.push(") ");
        w.push_quoted(&lateral.alias);
        w.push(" ON true");
    }

    super::write_where(state, w, &[], state.table_alias())?;

    if !state.group.is_empty() {
        w.push(" GROUP BY ");
        let mut first = true;
        for g in state.group.iter() {
            if !first {
                w.push(", ");
            }
            first = false;
            w.push_column(g, state.table_alias());
        }
    }

    if !state.order.is_empty() {
        w.push(" ORDER BY ");
        let mut first = true;
        for o in state.order.iter() {
            if !first {
                w.push(", ");
            }
            first = false;
            match o {
                OrderItem::Column { column, desc } => {
                    w.push_column(column, state.table_alias());
                    if *desc {
                        w.push(" DESC");
                    }
                }
                OrderItem::Raw(sql) => w.push(sql),
            }
        }
    }

    if let Some(limit) = state.limit {
        w.push(&format!(" LIMIT {limit}"));
    }
    if let Some(offset) = state.offset {
        w.push(&format!(" OFFSET {offset}"));
    }

    Ok(())
}

/// Expand `*`: the table's columns minus explicit-select ones, qualified by
/// the current alias; a schema-less table falls back to `"alias".*`.
fn write_star(state: &QueryState, w: &mut SqlWriter) {
    if state.schema.shape.is_empty() {
        w.push_quoted(state.table_alias());
        w.push(".*");
        return;
    }
    let mut first = true;
    for col in state.schema.shape.star_columns() {
        if !first {
            w.push(", ");
        }
        first = false;
        w.push_quoted(state.table_alias());
        w.push(".");
        w.push_quoted(&col.name);
    }
    if first {
        // Every column is explicit-select.
        w.push_quoted(state.table_alias());
        w.push(".*");
    }
}

fn write_select_item(
    state: &QueryState,
    index: usize,
    item: &SelectItem,
    laterals: &[LateralValue],
    w: &mut SqlWriter,
    plan: &mut Option<&mut HoistPlan>,
) -> ChainResult<()> {
    match item {
        SelectItem::Star => {
            write_star(state, w);
            Ok(())
        }
        SelectItem::Column(cref) => {
            w.push_column(cref, state.table_alias());
            Ok(())
        }
        SelectItem::TableStar(alias) => {
            match state.joined_shapes.get(alias) {
                Some(shape) if !shape.is_empty() => {
                    w.push("json_build_object(");
                    let mut first = true;
                    for col in shape.iter() {
                        if !first {
                            w.push(", ");
                        }
                        first = false;
                        w.push("'");
                        w.push(&col.name.replace('\'', "''"));
                        w.push("', ");
                        w.push_quoted(alias);
                        w.push(".");
                        w.push_quoted(&col.name);
                    }
                    w.push(")");
                }
                _ => {
                    // Shape unknown (CTE join): fall back to whole-row JSON.
                    w.push("row_to_json(");
                    w.push_quoted(alias);
                    w.push(".*)");
                }
            }
            w.push(" AS ");
            w.push_quoted(alias);
            Ok(())
        }
        SelectItem::Expr { alias, sql } => {
            w.push(sql);
            w.push(" AS ");
            w.push_quoted(alias);
            Ok(())
        }
        SelectItem::SubQuery { alias, query } => {
            if query.kind != QueryKind::Select {
                let Some(plan) = plan.as_mut() else {
                    return Err(ChainError::internal(
                        "a mutating sub-query must appear at statement top level",
                    ));
                };
                let hoist = plan.take_next()?;
                write_cte_projection(query.return_type, &hoist.name, &hoist.value_column, w);
                w.push(" AS ");
                w.push_quoted(alias);
                return Ok(());
            }
            if is_lateral_value(query) {
                if let Some(lateral) = laterals
                    .iter()
                    .find(|l| lateral_matches(l, index, query))
                {
                    w.push_quoted(&lateral.alias);
                    w.push(".");
                    w.push_quoted(&lateral.field);
                    w.push(" AS ");
                    w.push_quoted(alias);
                    return Ok(());
                }
            }
            write_subquery_projection(state, query, w)?;
            w.push(" AS ");
            w.push_quoted(alias);
            Ok(())
        }
    }
}

fn lateral_matches(lateral: &LateralValue, index: usize, query: &QueryState) -> bool {
    if lateral.item == index {
        return true;
    }
    // Later use sites match by compiled text.
    let mut probe = SqlWriter::new();
    if write_select(query, &mut probe).is_err() {
        return false;
    }
    probe.finish_parts() == lateral.key
}

/// Projection of an inline select sub-query, shaped by its return type.
fn write_subquery_projection(
    state: &QueryState,
    query: &QueryState,
    w: &mut SqlWriter,
) -> ChainResult<()> {
    match query.return_type {
        ReturnType::All | ReturnType::Rows => {
            w.push("(SELECT COALESCE(json_agg(row_to_json(\"t\".*)), ");
            write_coalesce_fallback(state, w);
            w.push(") FROM (");
            write_select(query, w)?;
            w.push(") \"t\")");
            Ok(())
        }
        ReturnType::Pluck => {
            let field = output_field(query).ok_or_else(|| {
                ChainError::internal("pluck sub-query must select a column")
            })?;
            w.push("(SELECT COALESCE(json_agg(\"t\".");
            w.push_quoted(&field);
            w.push("), ");
            write_coalesce_fallback(state, w);
            w.push(") FROM (");
            write_select(query, w)?;
            w.push(") \"t\")");
            Ok(())
        }
        ReturnType::One | ReturnType::OneOrThrow => {
            w.push("(SELECT row_to_json(\"t\".*) FROM (");
            write_select(query, w)?;
            w.push(") \"t\")");
            Ok(())
        }
        ReturnType::Value | ReturnType::ValueOrThrow | ReturnType::Void => {
            w.push("(");
            write_select(query, w)?;
            w.push(")");
            Ok(())
        }
    }
}

fn write_coalesce_fallback(state: &QueryState, w: &mut SqlWriter) {
    match &state.coalesce_value {
        Some(value) => {
            w.bind(value.clone());
        }
        None => w.push("'[]'"),
    }
}

/// Projection of a hoisted mutating sub-query, read back from its CTE.
fn write_cte_projection(
    return_type: ReturnType,
    cte: &str,
    value_column: &str,
    w: &mut SqlWriter,
) {
    match return_type {
        ReturnType::All | ReturnType::Rows => {
            w.push("(SELECT COALESCE(json_agg(row_to_json(\"t\".*)), '[]') FROM ");
            w.push_quoted(cte);
            w.push(" \"t\")");
        }
        ReturnType::Pluck => {
            w.push("(SELECT COALESCE(json_agg(\"t\".");
            w.push_quoted(value_column);
            w.push("), '[]') FROM ");
            w.push_quoted(cte);
            w.push(" \"t\")");
        }
        ReturnType::One | ReturnType::OneOrThrow => {
            w.push("(SELECT row_to_json(\"t\".*) FROM ");
            w.push_quoted(cte);
            w.push(" \"t\" LIMIT 1)");
        }
        ReturnType::Value | ReturnType::ValueOrThrow | ReturnType::Void => {
            w.push("(SELECT ");
            w.push_quoted(value_column);
            w.push(" FROM ");
            w.push_quoted(cte);
            w.push(" LIMIT 1)");
        }
    }
}
