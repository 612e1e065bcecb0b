//! UPDATE statement composition.

use crate::compose::{
    write_column_value, write_returning, write_where, write_with_clause, Composed,
    ComposedStatement, HoistPlan, SqlWriter,
};
use crate::error::{ChainError, ChainResult};
use crate::state::{
    ColumnValue, Payload, QueryKind, QueryState, UpdatePatch, UpdatePayload,
};

/// The merged effect of all accumulated patches: plain assignments (later
/// patches override earlier ones per column) and arithmetic steps, plus the
/// shape's auto-updated columns unless explicitly set.
pub(crate) struct EffectiveUpdate {
    pub sets: Vec<(String, ColumnValue)>,
    pub steps: Vec<(String, i64)>,
}

fn effective_update(state: &QueryState, payload: &UpdatePayload) -> EffectiveUpdate {
    let mut sets: Vec<(String, ColumnValue)> = Vec::new();
    let mut steps: Vec<(String, i64)> = Vec::new();
    for patch in &payload.patches {
        match patch {
            UpdatePatch::Set(list) => {
                for (col, value) in list {
                    match sets.iter_mut().find(|(c, _)| c == col) {
                        Some(existing) => existing.1 = value.clone(),
                        None => sets.push((col.clone(), value.clone())),
                    }
                }
            }
            UpdatePatch::Step { column, amount } => steps.push((column.clone(), *amount)),
        }
    }
    for col in state.schema.shape.auto_update_columns() {
        let already = sets.iter().any(|(c, _)| c == &col.name)
            || steps.iter().any(|(c, _)| c == &col.name);
        if !already {
            let factory = col.auto_update.as_ref().expect("auto_update column");
            sets.push((col.name.clone(), ColumnValue::Value(factory())));
        }
    }
    EffectiveUpdate { sets, steps }
}

fn guard_scope(state: &QueryState, all_rows: bool) -> ChainResult<()> {
    if state.filters.is_empty() && !all_rows {
        return Err(ChainError::internal(
            "update requires a where clause; use all_rows() to update every row",
        ));
    }
    Ok(())
}

pub(crate) fn compose_update(state: &QueryState) -> ChainResult<Composed> {
    let Some(Payload::Update(payload)) = state.payload.as_deref() else {
        return Err(ChainError::internal("update payload not set"));
    };
    guard_scope(state, payload.all_rows)?;

    let eff = effective_update(state, payload);
    if eff.sets.is_empty() && eff.steps.is_empty() {
        // Nothing to write: degrade to a read so no UPDATE hits the
        // database. Row count comes from the rows the read matches.
        let mut read = state.clone();
        read.kind = QueryKind::Select;
        read.payload = None;
        let mut composed = super::compose(&read)?;
        composed.degraded_to_select = true;
        return Ok(composed);
    }

    let subs = eff.sets.iter().filter_map(|(_, cv)| match cv {
        ColumnValue::SubQuery(sub) if sub.kind != QueryKind::Select => Some(sub.as_ref()),
        _ => None,
    });
    let mut plan = HoistPlan::build(state, subs)?;
    let mut w = SqlWriter::new();
    write_with_clause(state, &plan, &mut w)?;
    write_update_body(state, &eff, &mut w, Some(&mut plan), false)?;
    Ok(Composed {
        statements: vec![ComposedStatement {
            statement: w.finish(),
            channels: plan.channels(),
        }],
        degraded_to_select: false,
    })
}

/// Render an update as a hoisted CTE body (`RETURNING *`, no nested hoists).
pub(crate) fn write_update_hoisted(state: &QueryState, w: &mut SqlWriter) -> ChainResult<()> {
    let Some(Payload::Update(payload)) = state.payload.as_deref() else {
        return Err(ChainError::internal("update payload not set"));
    };
    guard_scope(state, payload.all_rows)?;
    let eff = effective_update(state, payload);
    if eff.sets.is_empty() && eff.steps.is_empty() {
        return Err(ChainError::internal(
            "a nested update must carry at least one assignment",
        ));
    }
    write_update_body(state, &eff, w, None, true)
}

/// Render `UPDATE "table" SET ... WHERE ... [RETURNING ...]`. SET columns
/// are bare; WHERE columns are qualified with the table name.
pub(crate) fn write_update_body(
    state: &QueryState,
    eff: &EffectiveUpdate,
    w: &mut SqlWriter,
    mut plan: Option<&mut HoistPlan>,
    returning_all: bool,
) -> ChainResult<()> {
    w.push("UPDATE ");
    w.push_quoted(&state.schema.table);
    w.push(" SET ");
    let mut first = true;
    for (col, value) in &eff.sets {
        if !first {
            w.push(", ");
        }
        first = false;
        w.push_quoted(col);
        w.push(" = ");
        write_column_value(state, col, value, w, &mut plan)?;
    }
    for (col, amount) in &eff.steps {
        if !first {
            w.push(", ");
        }
        first = false;
        w.push_quoted(col);
        w.push(" = ");
        w.push_quoted(col);
        if *amount >= 0 {
            w.push(&format!(" + {amount}"));
        } else {
            w.push(&format!(" - {}", amount.unsigned_abs()));
        }
    }

    write_where(state, w, &[], &state.schema.table)?;

    if returning_all {
        w.push(" RETURNING *");
    } else {
        let empty = HoistPlan::empty();
        let plan_ref: &HoistPlan = match plan.as_ref() {
            Some(p) => p,
            None => &empty,
        };
        write_returning(state, w, plan_ref)?;
    }
    Ok(())
}
