//! INSERT statement composition, including parameter-limited batching.

use crate::compose::{
    write_column_value, write_returning, write_with_clause, Composed, ComposedStatement,
    HoistPlan, SqlWriter, MAX_BIND_PARAMS,
};
use crate::error::{ChainError, ChainResult};
use crate::state::{ColumnValue, ConflictAction, InsertPayload, Payload, QueryKind, QueryState};

/// Mutating sub-queries of a row set, in traversal order (row-major, then
/// on-conflict assignments).
fn mutation_subs<'a>(
    payload: &'a InsertPayload,
    rows: &'a [Vec<ColumnValue>],
) -> impl Iterator<Item = &'a QueryState> {
    let row_subs = rows.iter().flatten();
    let conflict_subs = payload
        .on_conflict
        .iter()
        .flat_map(|oc| match &oc.action {
            ConflictAction::Set(sets) => sets.iter().map(|(_, v)| v).collect::<Vec<_>>(),
            _ => Vec::new(),
        });
    row_subs.chain(conflict_subs).filter_map(|cv| match cv {
        ColumnValue::SubQuery(sub) if sub.kind != QueryKind::Select => Some(sub.as_ref()),
        _ => None,
    })
}

pub(crate) fn compose_insert(state: &QueryState) -> ChainResult<Composed> {
    let Some(Payload::Insert(payload)) = state.payload.as_deref() else {
        return Err(ChainError::internal("insert payload not set"));
    };
    if payload.rows.is_empty() {
        return Err(ChainError::internal("insert requires at least one row"));
    }
    for row in &payload.rows {
        if row.len() != payload.columns.len() {
            return Err(ChainError::internal(format!(
                "insert row has {} values for {} columns",
                row.len(),
                payload.columns.len()
            )));
        }
    }

    // Postgres caps bound parameters per statement; oversized row sets are
    // split into independently valid statements that the pipeline runs
    // inside one transaction.
    let cols = payload.columns.len();
    let rows_per_statement = if cols == 0 {
        payload.rows.len()
    } else {
        (MAX_BIND_PARAMS / cols).max(1)
    };
    let chunks: Vec<&[Vec<ColumnValue>]> =
        if cols != 0 && payload.rows.len() * cols > MAX_BIND_PARAMS {
            payload.rows.chunks(rows_per_statement).collect()
        } else {
            vec![&payload.rows[..]]
        };

    let mut statements = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        let mut plan = HoistPlan::build(state, mutation_subs(payload, chunk))?;
        let mut w = SqlWriter::new();
        write_with_clause(state, &plan, &mut w)?;
        write_insert_body(state, payload, chunk, &mut w, Some(&mut plan), false)?;
        statements.push(ComposedStatement {
            statement: w.finish(),
            channels: plan.channels(),
        });
    }
    Ok(Composed {
        statements,
        degraded_to_select: false,
    })
}

/// Render `INSERT INTO ... VALUES ... [ON CONFLICT ...] [RETURNING ...]`.
pub(crate) fn write_insert_body(
    state: &QueryState,
    payload: &InsertPayload,
    rows: &[Vec<ColumnValue>],
    w: &mut SqlWriter,
    mut plan: Option<&mut HoistPlan>,
    returning_all: bool,
) -> ChainResult<()> {
    w.push("INSERT INTO ");
    w.push_quoted(&state.schema.table);

    if payload.columns.is_empty() {
        w.push(" DEFAULT VALUES");
    } else {
        w.push("(");
        for (i, col) in payload.columns.iter().enumerate() {
            if i > 0 {
                w.push(", ");
            }
            w.push_quoted(col);
        }
        w.push(") VALUES ");
        for (r, row) in rows.iter().enumerate() {
            if r > 0 {
                w.push(", ");
            }
            w.push("(");
            for (c, value) in row.iter().enumerate() {
                if c > 0 {
                    w.push(", ");
                }
                write_column_value(state, &payload.columns[c], value, w, &mut plan)?;
            }
            w.push(")");
        }
    }

    if let Some(conflict) = &payload.on_conflict {
        w.push(" ON CONFLICT");
        if let Some(target) = &conflict.target {
            w.push(" (");
            for (i, col) in target.iter().enumerate() {
                if i > 0 {
                    w.push(", ");
                }
                w.push_quoted(col);
            }
            w.push(")");
        }
        match &conflict.action {
            ConflictAction::DoNothing => w.push(" DO NOTHING"),
            ConflictAction::Merge { columns } => {
                let target: &[String] = conflict.target.as_deref().unwrap_or(&[]);
                let merged: Vec<&String> = match columns {
                    Some(cols) => cols.iter().collect(),
                    // Default merge set: every inserted column that is not
                    // part of the conflict target.
                    None => payload
                        .columns
                        .iter()
                        .filter(|c| !target.contains(c))
                        .collect(),
                };
                if merged.is_empty() {
                    w.push(" DO NOTHING");
                } else {
                    w.push(" DO UPDATE SET ");
                    for (i, col) in merged.iter().enumerate() {
                        if i > 0 {
                            w.push(", ");
                        }
                        w.push_quoted(col);
                        w.push(" = EXCLUDED.");
                        w.push_quoted(col);
                    }
                }
            }
            ConflictAction::Set(sets) => {
                w.push(" DO UPDATE SET ");
                for (i, (col, value)) in sets.iter().enumerate() {
                    if i > 0 {
                        w.push(", ");
                    }
                    w.push_quoted(col);
                    w.push(" = ");
                    write_column_value(state, col, value, w, &mut plan)?;
                }
            }
        }
    }

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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnDef, TableSchema};
    use crate::state::{OnConflict, ReturnType};
    use serde_json::json;

    fn users() -> TableSchema {
        TableSchema::new("users")
            .column(ColumnDef::new("id").primary_key())
            .column(ColumnDef::new("username"))
            .column(ColumnDef::new("email"))
    }

    fn insert_state(columns: &[&str], rows: Vec<Vec<ColumnValue>>) -> QueryState {
        let mut state = QueryState::new(users());
        state.kind = QueryKind::Insert;
        state.return_type = ReturnType::Void;
        state.payload = Some(std::sync::Arc::new(Payload::Insert(InsertPayload {
            columns: columns.iter().map(|s| s.to_string()).collect(),
            rows,
            on_conflict: None,
            user_columns: columns.iter().map(|s| s.to_string()).collect(),
        })));
        state
    }

    fn sql_of(state: &QueryState) -> Vec<crate::compose::Statement> {
        compose_insert(state)
            .unwrap()
            .statements
            .into_iter()
            .map(|s| s.statement)
            .collect()
    }

    #[test]
    fn simple_insert() {
        let state = insert_state(
            &["username", "email"],
            vec![vec![
                ColumnValue::Value(json!("alice")),
                ColumnValue::Value(json!("alice@example.com")),
            ]],
        );
        let stmts = sql_of(&state);
        assert_eq!(stmts.len(), 1);
        assert_eq!(
            stmts[0].text,
            "INSERT INTO \"users\"(\"username\", \"email\") VALUES ($1, $2)"
        );
        assert_eq!(stmts[0].params, vec![json!("alice"), json!("alice@example.com")]);
    }

    #[test]
    fn multi_row_values() {
        let state = insert_state(
            &["username"],
            vec![
                vec![ColumnValue::Value(json!("a"))],
                vec![ColumnValue::Value(json!("b"))],
            ],
        );
        let stmts = sql_of(&state);
        assert_eq!(
            stmts[0].text,
            "INSERT INTO \"users\"(\"username\") VALUES ($1), ($2)"
        );
    }

    #[test]
    fn raw_value_bypasses_binding() {
        let state = insert_state(
            &["username", "email"],
            vec![vec![
                ColumnValue::Value(json!("a")),
                ColumnValue::Raw("lower('X')".to_string()),
            ]],
        );
        let stmts = sql_of(&state);
        assert_eq!(
            stmts[0].text,
            "INSERT INTO \"users\"(\"username\", \"email\") VALUES ($1, lower('X'))"
        );
        assert_eq!(stmts[0].params.len(), 1);
    }

    #[test]
    fn encoder_applies_to_plain_values() {
        let schema = TableSchema::new("t").column(
            ColumnDef::new("x").encode_with(|v| Ok(json!(v.as_i64().unwrap() * 2))),
        );
        let mut state = QueryState::new(schema);
        state.kind = QueryKind::Insert;
        state.return_type = ReturnType::Void;
        state.payload = Some(std::sync::Arc::new(Payload::Insert(InsertPayload {
            columns: vec!["x".to_string()],
            rows: vec![vec![ColumnValue::Value(json!(21))]],
            on_conflict: None,
            user_columns: vec!["x".to_string()],
        })));
        let stmts = sql_of(&state);
        assert_eq!(stmts[0].params, vec![json!(42)]);
    }

    #[test]
    fn on_conflict_do_nothing() {
        let mut state = insert_state(
            &["username"],
            vec![vec![ColumnValue::Value(json!("alice"))]],
        );
        if let Payload::Insert(p) = state.payload_mut() {
            p.on_conflict = Some(OnConflict {
                target: Some(vec!["username".to_string()]),
                action: ConflictAction::DoNothing,
            });
        }
        let stmts = sql_of(&state);
        assert_eq!(
            stmts[0].text,
            "INSERT INTO \"users\"(\"username\") VALUES ($1) ON CONFLICT (\"username\") DO NOTHING"
        );
    }

    #[test]
    fn on_conflict_merge_defaults_to_non_target_columns() {
        let mut state = insert_state(
            &["username", "email"],
            vec![vec![
                ColumnValue::Value(json!("alice")),
                ColumnValue::Value(json!("a@x.com")),
            ]],
        );
        if let Payload::Insert(p) = state.payload_mut() {
            p.on_conflict = Some(OnConflict {
                target: Some(vec!["username".to_string()]),
                action: ConflictAction::Merge { columns: None },
            });
        }
        let stmts = sql_of(&state);
        assert!(stmts[0]
            .text
            .ends_with("ON CONFLICT (\"username\") DO UPDATE SET \"email\" = EXCLUDED.\"email\""));
    }

    #[test]
    fn returning_star_for_row_results() {
        let mut state = insert_state(
            &["username"],
            vec![vec![ColumnValue::Value(json!("alice"))]],
        );
        state.return_type = ReturnType::OneOrThrow;
        let stmts = sql_of(&state);
        assert!(stmts[0].text.ends_with(" RETURNING *"));
    }

    #[test]
    fn oversized_batch_splits_into_multiple_statements() {
        let rows: Vec<Vec<ColumnValue>> = (0..((MAX_BIND_PARAMS / 2) + 1))
            .map(|i| {
                vec![
                    ColumnValue::Value(json!(i)),
                    ColumnValue::Value(json!(format!("u{i}"))),
                ]
            })
            .collect();
        let state = insert_state(&["id", "username"], rows);
        let stmts = sql_of(&state);
        assert_eq!(stmts.len(), 2);
        // Every statement stays inside the parameter budget.
        assert!(stmts.iter().all(|s| s.params.len() <= MAX_BIND_PARAMS));
        let total: usize = stmts.iter().map(|s| s.params.len()).sum();
        assert_eq!(total, (MAX_BIND_PARAMS / 2 + 1) * 2);
    }

    #[test]
    fn default_values_form() {
        let state = insert_state(&[], vec![vec![]]);
        let stmts = sql_of(&state);
        assert_eq!(stmts[0].text, "INSERT INTO \"users\" DEFAULT VALUES");
    }
}
